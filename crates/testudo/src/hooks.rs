//! Lifecycle hook dispatch.
//!
//! The registry fans run events out to observers (statistics, reporting,
//! user callbacks) without the runner knowing what they do. Callbacks for a
//! given kind fire in registration order.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::context::CaseResult;

/// The lifecycle points a callback can attach to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum HookKind {
    Assert,
    SignalAbort,
    SignalSegfault,
    BeforeTest,
    AfterTest,
    BeforeSuite,
    AfterSuite,
    LeakInfo,
}

pub const HOOK_KINDS: [HookKind; 8] = [
    HookKind::Assert,
    HookKind::SignalAbort,
    HookKind::SignalSegfault,
    HookKind::BeforeTest,
    HookKind::AfterTest,
    HookKind::BeforeSuite,
    HookKind::AfterSuite,
    HookKind::LeakInfo,
];

impl HookKind {
    fn index(self) -> usize {
        self as usize
    }
}

/// Which kinds a registration covers: one, or all of them at once.
#[derive(Clone, Copy, Debug)]
pub enum HookSelector {
    One(HookKind),
    All,
}

impl From<HookKind> for HookSelector {
    fn from(kind: HookKind) -> Self {
        HookSelector::One(kind)
    }
}

/// Payload of one hook firing.
#[derive(Debug)]
pub enum HookEvent<'a> {
    Assert {
        passed: bool,
        kind: &'a str,
        condition: &'a str,
        file: &'a str,
        function: &'a str,
        line: u32,
    },
    SignalAbort {
        suite: &'a str,
        case: &'a str,
        signal: i32,
    },
    SignalSegfault {
        suite: &'a str,
        case: &'a str,
        signal: i32,
    },
    BeforeTest {
        suite: &'a str,
        case: &'a str,
    },
    AfterTest {
        suite: &'a str,
        case: &'a str,
        result: CaseResult,
    },
    BeforeSuite {
        suite: &'a str,
    },
    AfterSuite {
        suite: &'a str,
        passed: bool,
    },
    LeakInfo {
        suite: &'a str,
        case: &'a str,
        leaked_bytes: usize,
        entries: usize,
    },
}

impl HookEvent<'_> {
    pub fn kind(&self) -> HookKind {
        match self {
            HookEvent::Assert { .. } => HookKind::Assert,
            HookEvent::SignalAbort { .. } => HookKind::SignalAbort,
            HookEvent::SignalSegfault { .. } => HookKind::SignalSegfault,
            HookEvent::BeforeTest { .. } => HookKind::BeforeTest,
            HookEvent::AfterTest { .. } => HookKind::AfterTest,
            HookEvent::BeforeSuite { .. } => HookKind::BeforeSuite,
            HookEvent::AfterSuite { .. } => HookKind::AfterSuite,
            HookEvent::LeakInfo { .. } => HookKind::LeakInfo,
        }
    }
}

/// Handle identifying one registration, across every kind it covers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct HookId(u64);

type Callback = Rc<RefCell<dyn FnMut(&HookEvent<'_>)>>;

/// Per-kind callback lists. Owned by the [`TestContext`](crate::TestContext)
/// and, like the rest of the registry, single-threaded.
#[derive(Default)]
pub struct HookRegistry {
    slots: [Vec<(HookId, Callback)>; 8],
    next_id: u64,
}

impl HookRegistry {
    /// Registers `callback` for the selected kind(s) and returns a handle
    /// that removes every covered kind at once.
    pub fn register<F>(&mut self, selector: impl Into<HookSelector>, callback: F) -> HookId
    where
        F: FnMut(&HookEvent<'_>) + 'static,
    {
        let id = HookId(self.next_id);
        self.next_id += 1;
        let callback: Callback = Rc::new(RefCell::new(callback));
        match selector.into() {
            HookSelector::One(kind) => {
                self.slots[kind.index()].push((id, callback));
            }
            HookSelector::All => {
                for slot in &mut self.slots {
                    slot.push((id, callback.clone()));
                }
            }
        }
        id
    }

    /// Removes a registration. Returns `false` for an unknown handle.
    pub fn unregister(&mut self, id: HookId) -> bool {
        let mut removed = false;
        for slot in &mut self.slots {
            let before = slot.len();
            slot.retain(|(registered, _)| *registered != id);
            removed |= slot.len() != before;
        }
        if !removed {
            warn!(handle = id.0, "unregistering unknown hook handle");
        }
        removed
    }

    /// Calls every callback registered for the event's kind, in registration
    /// order. A callback that fires an event reaching itself again is skipped
    /// on the nested call.
    pub fn fire(&self, event: &HookEvent<'_>) {
        for (id, callback) in &self.slots[event.kind().index()] {
            match callback.try_borrow_mut() {
                Ok(mut callback) => callback(event),
                Err(_) => warn!(handle = id.0, "hook re-entered from its own callback"),
            }
        }
    }

    pub fn registered(&self, kind: HookKind) -> usize {
        self.slots[kind.index()].len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn before_test_event() -> HookEvent<'static> {
        HookEvent::BeforeTest {
            suite: "suite",
            case: "case",
        }
    }

    #[test]
    fn callbacks_fire_in_registration_order() {
        let mut registry = HookRegistry::default();
        let order = Rc::new(RefCell::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            registry.register(HookKind::BeforeTest, move |_| {
                order.borrow_mut().push(label);
            });
        }

        registry.fire(&before_test_event());
        assert_eq!(*order.borrow(), vec!["first", "second", "third"]);
    }

    #[test]
    fn wildcard_covers_every_kind() {
        let mut registry = HookRegistry::default();
        let hits = Rc::new(RefCell::new(Vec::new()));
        let sink = hits.clone();
        let id = registry.register(HookSelector::All, move |event| {
            sink.borrow_mut().push(event.kind());
        });

        for kind in HOOK_KINDS {
            assert_eq!(registry.registered(kind), 1);
        }

        registry.fire(&before_test_event());
        registry.fire(&HookEvent::AfterSuite {
            suite: "suite",
            passed: true,
        });
        assert_eq!(*hits.borrow(), vec![HookKind::BeforeTest, HookKind::AfterSuite]);

        assert!(registry.unregister(id));
        for kind in HOOK_KINDS {
            assert_eq!(registry.registered(kind), 0);
        }
    }

    #[test]
    fn events_only_reach_their_own_kind() {
        let mut registry = HookRegistry::default();
        let count = Rc::new(RefCell::new(0));
        let sink = count.clone();
        registry.register(HookKind::AfterTest, move |_| {
            *sink.borrow_mut() += 1;
        });

        registry.fire(&before_test_event());
        assert_eq!(*count.borrow(), 0);

        registry.fire(&HookEvent::AfterTest {
            suite: "suite",
            case: "case",
            result: CaseResult::Passed,
        });
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn unregister_rejects_unknown_and_stale_handles() {
        let mut registry = HookRegistry::default();
        let id = registry.register(HookKind::Assert, |_| {});
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
    }

    #[test]
    fn reentrant_callback_is_skipped_not_recursed() {
        let mut registry = HookRegistry::default();
        let count = Rc::new(RefCell::new(0u32));

        // The callback cannot reach the registry to re-fire, so re-entry is
        // simulated by firing while the callback's RefCell is borrowed.
        let sink = count.clone();
        let probe: Callback = Rc::new(RefCell::new(move |_: &HookEvent<'_>| {
            *sink.borrow_mut() += 1;
        }));
        registry.slots[HookKind::BeforeTest.index()].push((HookId(99), probe.clone()));

        let _held = probe.borrow_mut();
        registry.fire(&before_test_event());
        assert_eq!(*count.borrow(), 0);
    }
}
