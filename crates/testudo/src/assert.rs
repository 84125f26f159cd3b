//! Assertion entry point and the `check!` macro family.
//!
//! Failed checks never panic or abort. They mark the active case as failed,
//! log the condition with a backtrace of the call site, and let the body run
//! on, so one run reports every broken expectation instead of the first.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use testudo_trace::Backtrace;
use tracing::{Level, error, warn};

use crate::hooks::{HookEvent, HookRegistry};

struct ActiveCase {
    hooks: *const HookRegistry,
    failed: Rc<Cell<bool>>,
}

thread_local! {
    static ACTIVE: RefCell<Option<ActiveCase>> = const { RefCell::new(None) };
}

/// Marks a case as running on this thread until dropped.
pub(crate) struct ActiveCaseGuard {
    failed: Rc<Cell<bool>>,
}

impl ActiveCaseGuard {
    pub(crate) fn failed(&self) -> bool {
        self.failed.get()
    }
}

impl Drop for ActiveCaseGuard {
    fn drop(&mut self) {
        ACTIVE.with(|slot| slot.borrow_mut().take());
    }
}

/// Routes checks on this thread to `hooks` for the guard's lifetime. The
/// registry must stay live (and unmoved) until the guard drops.
pub(crate) fn install(hooks: &HookRegistry) -> ActiveCaseGuard {
    let failed = Rc::new(Cell::new(false));
    ACTIVE.with(|slot| {
        *slot.borrow_mut() = Some(ActiveCase {
            hooks: hooks as *const HookRegistry,
            failed: failed.clone(),
        });
    });
    ActiveCaseGuard { failed }
}

/// Records one evaluated check. Returns `passed` so call sites can branch
/// on the verdict. Called through the `check!` macros rather than directly.
pub fn assert_that(
    passed: bool,
    kind: &str,
    condition: &str,
    file: &str,
    function: &str,
    line: u32,
    detail: Option<fmt::Arguments<'_>>,
) -> bool {
    // Copy what the event needs out of the slot before firing, so a hook
    // that runs a check of its own does not hit a second borrow.
    let active = ACTIVE.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|case| (case.hooks, case.failed.clone()))
    });

    let Some((hooks, failed)) = active else {
        if !passed {
            warn!(kind, condition, file, line, "check failed outside a running case");
        }
        return passed;
    };

    // SAFETY: the pointer was installed by the runner, which keeps the
    // registry borrowed on this thread until the guard drops.
    let hooks = unsafe { &*hooks };
    hooks.fire(&HookEvent::Assert {
        passed,
        kind,
        condition,
        file,
        function,
        line,
    });

    if !passed {
        failed.set(true);
        match detail {
            Some(args) => error!(kind, condition, file, function, line, "check failed: {args}"),
            None => error!(kind, condition, file, function, line, "check failed"),
        }
        Backtrace::capture(1, 32).dump_to_log(Level::ERROR);
    }
    passed
}

/// Checks that a condition holds. An optional trailing format string is
/// logged alongside the condition when it does not.
#[macro_export]
macro_rules! check {
    ($cond:expr $(,)?) => {
        $crate::assert::assert_that(
            $cond,
            "check",
            stringify!($cond),
            file!(),
            module_path!(),
            line!(),
            None,
        )
    };
    ($cond:expr, $($detail:tt)+) => {
        $crate::assert::assert_that(
            $cond,
            "check",
            stringify!($cond),
            file!(),
            module_path!(),
            line!(),
            Some(format_args!($($detail)+)),
        )
    };
}

/// Checks that a condition does not hold.
#[macro_export]
macro_rules! check_false {
    ($cond:expr $(,)?) => {
        $crate::assert::assert_that(
            !$cond,
            "check_false",
            stringify!($cond),
            file!(),
            module_path!(),
            line!(),
            None,
        )
    };
    ($cond:expr, $($detail:tt)+) => {
        $crate::assert::assert_that(
            !$cond,
            "check_false",
            stringify!($cond),
            file!(),
            module_path!(),
            line!(),
            Some(format_args!($($detail)+)),
        )
    };
}

/// Checks two values for equality, logging both sides on failure.
#[macro_export]
macro_rules! check_eq {
    ($left:expr, $right:expr $(,)?) => {{
        let (left, right) = (&$left, &$right);
        $crate::assert::assert_that(
            left == right,
            "check_eq",
            stringify!($left == $right),
            file!(),
            module_path!(),
            line!(),
            Some(format_args!("left: {:?}, right: {:?}", left, right)),
        )
    }};
}

/// Checks two values for inequality, logging both sides on failure.
#[macro_export]
macro_rules! check_ne {
    ($left:expr, $right:expr $(,)?) => {{
        let (left, right) = (&$left, &$right);
        $crate::assert::assert_that(
            left != right,
            "check_ne",
            stringify!($left != $right),
            file!(),
            module_path!(),
            line!(),
            Some(format_args!("left: {:?}, right: {:?}", left, right)),
        )
    }};
}
