use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use crate::heap::ObjectReference;
use crate::vm::{VMError, VMResult};

#[derive(Debug, Clone, Copy)]
struct Monitor {
    owner: u64,
    count: usize,
}

/// Reentrant object monitors shared by every thread of a process.
#[derive(Default)]
pub struct LockTable {
    monitors: Mutex<FxHashMap<ObjectReference, Monitor>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the monitor of `obj` for `thread`. Returns false on contention.
    pub fn try_acquire(&self, obj: ObjectReference, thread: u64) -> bool {
        let mut monitors = self.monitors.lock();
        let monitor = monitors.entry(obj).or_insert(Monitor { owner: thread, count: 0 });
        if monitor.owner != thread {
            return false;
        }
        monitor.count += 1;
        true
    }

    /// Drop one acquisition of `obj` by `thread`.
    pub fn release(&self, obj: ObjectReference, thread: u64) -> VMResult<()> {
        let mut monitors = self.monitors.lock();
        match monitors.get_mut(&obj) {
            Some(monitor) if monitor.owner == thread => {
                monitor.count -= 1;
                if monitor.count == 0 {
                    monitors.remove(&obj);
                }
                Ok(())
            }
            _ => Err(VMError::LockNotHeld(obj)),
        }
    }

    pub fn owner(&self, obj: ObjectReference) -> Option<u64> {
        self.monitors.lock().get(&obj).map(|monitor| monitor.owner)
    }

    /// Number of acquisitions currently held by `thread`.
    pub fn held_by(&self, thread: u64) -> usize {
        self.monitors
            .lock()
            .values()
            .filter(|monitor| monitor.owner == thread)
            .map(|monitor| monitor.count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reentrant_acquire() {
        let locks = LockTable::new();
        let obj = ObjectReference::new(1, 1);
        assert!(locks.try_acquire(obj, 1));
        assert!(locks.try_acquire(obj, 1));
        assert_eq!(locks.held_by(1), 2);
        assert!(!locks.try_acquire(obj, 2));

        locks.release(obj, 1).unwrap();
        assert_eq!(locks.owner(obj), Some(1));
        locks.release(obj, 1).unwrap();
        assert_eq!(locks.owner(obj), None);
        assert!(locks.try_acquire(obj, 2));
    }

    #[test]
    fn test_release_not_held() {
        let locks = LockTable::new();
        let obj = ObjectReference::new(1, 1);
        assert!(matches!(locks.release(obj, 1), Err(VMError::LockNotHeld(_))));
        locks.try_acquire(obj, 1);
        assert!(matches!(locks.release(obj, 2), Err(VMError::LockNotHeld(_))));
        assert_eq!(locks.held_by(1), 1);
    }
}
