//! Callback registry: per-reason sets plus the time-ordered deadline set.
//!
//! This module owns the bookkeeping only. Dispatch lives on the runtime,
//! which pops or snapshots entries under a short borrow and invokes the
//! foreign function with no borrow held, so callbacks are free to mutate the
//! registry mid-pass.

use std::collections::{BTreeSet, HashMap};
use std::ffi::c_char;

use crate::ffi::CbRoutine;
use crate::handle::{Handle, VarRef};
use crate::schema::values::{CbReason, ValueFormat};

/// Copy of one registration, owned by the registry.
#[derive(Debug)]
pub(crate) struct Callback {
    pub reason: CbReason,
    pub routine: CbRoutine,
    pub user_data: *mut c_char,
    /// Object handle echoed back in the delivered data block.
    pub obj: Option<Handle>,
    /// Resolved value target, bound at registration for value-change.
    pub target: Option<(VarRef, usize)>,
    /// Format the delivered value should be rendered in, when asked for.
    pub value_format: Option<ValueFormat>,
    /// Whether the registration carried a non-suppressed time struct.
    pub wants_time: bool,
    /// Last observed storage bytes, exactly one element stride.
    pub shadow: Vec<u8>,
    /// Absolute deadline, after-delay only.
    pub deadline: Option<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct CallbackRegistry {
    next_id: u64,
    live: HashMap<u64, Callback>,
    by_reason: HashMap<CbReason, BTreeSet<u64>>,
    /// (absolute time, callback id); the id tie-break keeps equal deadlines
    /// in registration order.
    deadlines: BTreeSet<(u64, u64)>,
}

impl CallbackRegistry {
    pub(crate) fn register(&mut self, callback: Callback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        if let Some(deadline) = callback.deadline {
            self.deadlines.insert((deadline, id));
        } else {
            self.by_reason.entry(callback.reason).or_default().insert(id);
        }
        self.live.insert(id, callback);
        id
    }

    /// Drop a registration. Unknown ids are a no-op.
    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let Some(callback) = self.live.remove(&id) else {
            return false;
        };
        if let Some(deadline) = callback.deadline {
            self.deadlines.remove(&(deadline, id));
        } else if let Some(set) = self.by_reason.get_mut(&callback.reason) {
            set.remove(&id);
        }
        true
    }

    pub(crate) fn get(&self, id: u64) -> Option<&Callback> {
        self.live.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u64) -> Option<&mut Callback> {
        self.live.get_mut(&id)
    }

    /// Earliest pending deadline.
    pub(crate) fn next_deadline(&self) -> Option<u64> {
        self.deadlines.first().map(|&(time, _)| time)
    }

    /// Pop the earliest entry due at `now`, removing its registration. The
    /// pop-then-invoke shape is what keeps a dispatch pass well-defined when
    /// the invoked callback mutates the registry.
    pub(crate) fn pop_due(&mut self, now: u64) -> Option<Callback> {
        let &(time, id) = self.deadlines.first()?;
        if time > now {
            return None;
        }
        self.deadlines.pop_first();
        self.live.remove(&id)
    }

    /// Ids registered under `reason`, snapshotted so the caller can walk them
    /// while callbacks add or remove registrations.
    pub(crate) fn snapshot(&self, reason: CbReason) -> Vec<u64> {
        self.by_reason
            .get(&reason)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
fn test_callback(reason: CbReason, deadline: Option<u64>) -> Callback {
    Callback {
        reason,
        routine: test_routine,
        user_data: std::ptr::null_mut(),
        obj: None,
        target: None,
        value_format: None,
        wants_time: false,
        shadow: Vec::new(),
        deadline,
    }
}

#[cfg(test)]
extern "C" fn test_routine(_data: *mut crate::ffi::CbData) -> i32 {
    0
}

#[test]
fn test_deadlines_ordered_and_stable() {
    let mut reg = CallbackRegistry::default();
    let a = reg.register(test_callback(CbReason::AfterDelay, Some(20)));
    let b = reg.register(test_callback(CbReason::AfterDelay, Some(10)));
    let c = reg.register(test_callback(CbReason::AfterDelay, Some(10)));
    assert_eq!(reg.next_deadline(), Some(10));

    assert!(reg.pop_due(5).is_none());
    // Equal deadlines drain in registration order.
    let first = reg.pop_due(15).unwrap();
    assert_eq!(first.deadline, Some(10));
    assert!(reg.get(b).is_none());
    assert!(reg.get(c).is_some());
    reg.pop_due(15).unwrap();
    assert!(reg.pop_due(15).is_none());
    assert_eq!(reg.next_deadline(), Some(20));
    reg.pop_due(20).unwrap();
    assert!(reg.get(a).is_none());
    assert_eq!(reg.next_deadline(), None);
}

#[test]
fn test_remove_is_idempotent() {
    let mut reg = CallbackRegistry::default();
    let id = reg.register(test_callback(CbReason::StartOfSimulation, None));
    assert_eq!(reg.snapshot(CbReason::StartOfSimulation), vec![id]);
    assert!(reg.remove(id));
    assert!(!reg.remove(id));
    assert!(reg.snapshot(CbReason::StartOfSimulation).is_empty());

    let timed = reg.register(test_callback(CbReason::AfterDelay, Some(7)));
    assert!(reg.remove(timed));
    assert_eq!(reg.next_deadline(), None);
    assert!(!reg.remove(timed));
}
