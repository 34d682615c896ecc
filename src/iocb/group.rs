//! Waiting on several IOCBs at once

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use super::{IoArgs, IoError, IoValue, Iocb, IocbRef, IocbState};

/// An IOCB that completes once every member IOCB is done.
///
/// An empty group is already complete. Adding a member makes it pending
/// again.
#[derive(Debug, Clone)]
pub struct IoGroup {
    iocb: IocbRef,
    members: Arc<Mutex<Vec<IocbRef>>>,
}

impl Default for IoGroup {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(members: &Mutex<Vec<IocbRef>>) -> MutexGuard<'_, Vec<IocbRef>> {
    members.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IoGroup {
    pub fn new() -> Self {
        let iocb = Iocb::new(IoArgs::new());
        iocb.set_state(IocbState::Completed);
        iocb.set_done();
        Self {
            iocb,
            members: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The group's own IOCB; wait on this or add callbacks to it.
    pub fn iocb(&self) -> &IocbRef {
        &self.iocb
    }

    pub fn members(&self) -> Vec<IocbRef> {
        lock(&self.members).clone()
    }

    pub fn add(&self, member: &IocbRef) {
        lock(&self.members).push(member.clone());
        self.iocb.set_state(IocbState::Pending);
        self.iocb.clear_done();

        let group = self.iocb.clone();
        let members = self.members.clone();
        member.add_callback(move |_| {
            if group.state() != IocbState::Pending {
                return;
            }
            let all_done = lock(&members).iter().all(|member| member.is_done());
            if all_done {
                debug!("group IOCB {} complete", group.id());
                if group.finish(Ok(IoValue::Null)) {
                    group.trigger();
                }
            }
        });
    }

    /// Abort the group and every member, done or not.
    pub fn abort(&self, err: IoError) {
        self.iocb.set_state(IocbState::Aborted);
        self.iocb.set_error(err.clone());

        for member in self.members() {
            member.abort(err.clone());
        }
        self.iocb.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_group_is_complete() {
        let group = IoGroup::new();
        assert_eq!(group.iocb().state(), IocbState::Completed);
        assert!(group.iocb().wait(Some(std::time::Duration::ZERO)));
    }

    #[test]
    fn test_completes_after_last_member() {
        let group = IoGroup::new();
        let a = Iocb::new(IoArgs::new());
        let b = Iocb::new(IoArgs::new());
        group.add(&a);
        group.add(&b);
        assert_eq!(group.iocb().state(), IocbState::Pending);
        assert!(!group.iocb().is_done());

        a.complete(IoValue::from(1));
        assert!(!group.iocb().is_done());

        b.abort(IoError::Timeout);
        assert!(group.iocb().is_done());
        assert_eq!(group.iocb().state(), IocbState::Completed);
        assert_eq!(group.members().len(), 2);
    }

    #[test]
    fn test_group_callback_fires_once() {
        let group = IoGroup::new();
        let members: Vec<IocbRef> = (0..3).map(|_| Iocb::new(IoArgs::new())).collect();
        for member in &members {
            group.add(member);
        }

        let fired = Arc::new(Mutex::new(0));
        let f = fired.clone();
        group.iocb().add_callback(move |_| *f.lock().unwrap() += 1);

        for member in &members {
            member.complete(IoValue::Null);
        }
        assert_eq!(*fired.lock().unwrap(), 1);
    }

    #[test]
    fn test_abort_reaches_members() {
        let group = IoGroup::new();
        let done = Iocb::new(IoArgs::new());
        let open = Iocb::new(IoArgs::new());
        group.add(&done);
        group.add(&open);
        done.complete(IoValue::Null);

        group.abort(IoError::Aborted("cancel".into()));
        assert_eq!(group.iocb().state(), IocbState::Aborted);
        assert_eq!(group.iocb().error(), Some(IoError::Aborted("cancel".into())));
        assert_eq!(open.state(), IocbState::Aborted);
        // already terminal, stays completed
        assert_eq!(done.state(), IocbState::Completed);
        assert!(group.iocb().is_done());
    }
}
