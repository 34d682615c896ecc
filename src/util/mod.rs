//! Utility Functions Module
//!
//! Small helpers shared by the network and IO layers: the vendor-range enum
//! generator used for octet-coded protocol fields, and the octet trace used
//! when logging packets that were dropped.
//!
//! # Example
//!
//! ```
//! use bacnet_netstack::util::octet_trace;
//!
//! let trace = octet_trace(&[0x01, 0x20, 0xFF, 0xFF, 0x00], "  ");
//! assert_eq!(trace, "     0  0120ffff 00\n");
//! ```

#[cfg(not(feature = "std"))]
use alloc::{format, string::String, vec::Vec};

mod enum_macros;

#[doc(hidden)]
pub use pastey;

/// Octets shown per trace line
const TRACE_WIDTH: usize = 16;

/// Render a PDU as trace lines: the decimal offset of the line's first octet,
/// then up to sixteen octets in hex, grouped by four.
pub fn octet_trace(data: &[u8], prefix: &str) -> String {
    let mut trace = String::new();
    for (line, chunk) in data.chunks(TRACE_WIDTH).enumerate() {
        let groups: Vec<String> = chunk.chunks(4).map(hex::encode).collect();
        trace.push_str(&format!(
            "{}{:>4}  {}\n",
            prefix,
            line * TRACE_WIDTH,
            groups.join(" ")
        ));
    }
    trace
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::generate_vendor_enum! {
        /// Test codes
        Code {
            Zero = 0x00,
            One = 0x01,
        },
        u8,
        0x80..=0xFF
    }

    #[test]
    fn test_vendor_enum_ranges() {
        assert_eq!(Code::from(0u8), Code::Zero);
        assert!(Code::from(0xC0u8).is_proprietary());
        assert!(matches!(Code::from(0x10u8), Code::Reserved(_)));
        assert_eq!(u8::from(Code::from(0xC0u8)), 0xC0);
        assert_eq!(format!("{}", Code::One), "One");
    }

    #[test]
    fn test_octet_trace_wraps_lines() {
        let data: Vec<u8> = (0u8..20).collect();
        let trace = octet_trace(&data, "");
        let lines: Vec<&str> = trace.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "   0  00010203 04050607 08090a0b 0c0d0e0f");
        assert_eq!(lines[1], "  16  10111213");
        assert!(octet_trace(&[], "  ").is_empty());
    }
}
