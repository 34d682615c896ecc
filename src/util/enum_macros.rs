/// Generates an enum for an octet-coded protocol field where a block of values
/// is handed out to vendors.
///
/// Named variants map to their standard code. Any other value inside
/// `$vendor_range` decodes to `Proprietary`, and everything else decodes to
/// `Reserved`, so decoding never fails and re-encoding is lossless.
///
/// # Example
///
/// ```rust
/// use bacnet_netstack::generate_vendor_enum;
///
/// generate_vendor_enum! {
///     /// Frame kinds
///     FrameKind {
///         Hello = 0x00,
///         Goodbye = 0x01,
///     },
///     u8,
///     0x80..=0xFF
/// }
///
/// assert_eq!(FrameKind::from(0x01u8), FrameKind::Goodbye);
/// assert!(FrameKind::from(0x90u8).is_proprietary());
/// assert_eq!(u8::from(FrameKind::from(0x42u8)), 0x42);
/// assert_eq!(format!("{}", FrameKind::from(0x42u8)), "Reserved(66)");
/// ```
///
/// The generated type derives `Debug`, `Clone`, `Copy`, `PartialEq`, `Eq`
/// and `Hash`, implements `Display`, and converts both ways with `$unit`.
#[macro_export]
macro_rules! generate_vendor_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:literal,)+ }, $unit:ident, $vendor_range:expr) => {
        $crate::util::pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                Proprietary( [<$name Code>] ),
                Reserved( [<$name Code>] ),
            }

            /// Raw code carried by a non-standard value.
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Code>] { value: $unit }

            impl [<$name Code>] {
                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl $name {
                /// True when the value falls in the vendor block.
                pub fn is_proprietary(&self) -> bool {
                    matches!(self, $name::Proprietary(_))
                }
            }

            impl core::fmt::Display for $name {
                fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                    match self {
                        $($name::$variant => f.write_str(stringify!($variant)),)*
                        $name::Proprietary(code) => write!(f, "Proprietary({})", code.value()),
                        $name::Reserved(code) => write!(f, "Reserved({})", code.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Proprietary(code) | $name::Reserved(code) => code.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($vendor_range).contains(&v) => {
                            $name::Proprietary([<$name Code>] { value: v })
                        }
                        v => $name::Reserved([<$name Code>] { value: v }),
                    }
                }
            }
        }
    };
}
