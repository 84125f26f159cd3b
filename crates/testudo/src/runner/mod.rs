//! Case execution.
//!
//! One case run walks the full lifecycle: `BeforeTest`, setup, body, cleanup,
//! leak accounting, `AfterTest`. The body phases execute inside an isolated
//! context so that a segfault or abort folds back into a result for the case
//! instead of taking the whole run down.

use std::any::Any;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use parking_lot::Mutex;
use testudo_trace::Backtrace;
use tracing::{Level, error, info, warn};

use crate::assert;
use crate::config::RunConfig;
use crate::context::{CaseData, CaseResult, CaseSpec, SetupOutcome, TestCase};
use crate::hooks::{HookEvent, HookRegistry};

#[cfg(all(target_os = "linux", target_env = "gnu"))]
mod linux;
#[cfg(all(target_os = "linux", target_env = "gnu"))]
use linux as platform;

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
mod fallback;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
use fallback as platform;

/// What came back from the isolated context.
pub(crate) enum IsolationOutcome {
    /// The body ran to completion (which includes caught panics).
    Completed,
    /// A trapped signal cut the body short.
    Fault(FaultReport),
}

pub(crate) struct FaultReport {
    pub(crate) result: CaseResult,
    pub(crate) signal_name: &'static str,
    pub(crate) signal: i32,
    /// Raw return addresses captured by the handler, innermost first.
    pub(crate) frames: Vec<usize>,
}

/// The isolation machinery itself failed; the case cannot be judged.
#[derive(Debug)]
pub(crate) enum IsolationError {
    StackAllocation(io::Error),
    SignalStack(io::Error),
    ContextCapture,
    ContextSwitch,
}

impl fmt::Display for IsolationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationError::StackAllocation(error) => {
                write!(f, "case stack allocation failed: {error}")
            }
            IsolationError::SignalStack(error) => {
                write!(f, "signal stack installation failed: {error}")
            }
            IsolationError::ContextCapture => f.write_str("context capture failed"),
            IsolationError::ContextSwitch => f.write_str("context switch failed"),
        }
    }
}

impl std::error::Error for IsolationError {}

/// Serializes case execution process-wide. The signal dispositions, the trap
/// state, and the alternate stack are shared resources.
static RUN_GATE: Mutex<()> = Mutex::new(());

/// How the body phases ended when no signal interfered.
#[derive(Clone, Copy, PartialEq, Eq)]
enum BodyVerdict {
    Completed,
    SetupFailed,
    Panicked,
}

pub(crate) fn run_case(
    suite: &str,
    case: &mut TestCase,
    hooks: &HookRegistry,
    config: &RunConfig,
) -> CaseResult {
    let _gate = RUN_GATE.lock();
    let name = case.name().to_owned();

    info!(suite, case = %name, "case starting");
    hooks.fire(&HookEvent::BeforeTest { suite, case: &name });

    // The assert guard goes in before the leak watch so that neither its
    // allocations nor the watch bookkeeping end up in the case's table.
    let guard = assert::install(hooks);
    let watch = config.leak_watch.then(testudo_leakwatch::simple_watch);

    let spec = &mut case.spec;
    let mut verdict = BodyVerdict::Completed;
    let isolation = isolate(config, &mut || {
        verdict = execute_phases(spec);
    });

    let leaks = watch.map(|(id, table)| {
        testudo_leakwatch::unregister(id);
        table
    });
    let check_failed = guard.failed();
    drop(guard);

    let mut result = match isolation {
        Err(error) => {
            error!(suite, case = %name, %error, "could not isolate the case body");
            CaseResult::InternalError
        }
        Ok(IsolationOutcome::Fault(report)) => {
            handle_fault(suite, &name, &report, hooks, config);
            report.result
        }
        Ok(IsolationOutcome::Completed) => match verdict {
            BodyVerdict::Completed => CaseResult::Passed,
            BodyVerdict::SetupFailed | BodyVerdict::Panicked => CaseResult::Failed,
        },
    };
    if check_failed && result == CaseResult::Passed {
        result = CaseResult::Failed;
    }

    if let Some(table) = &leaks {
        let leaked_bytes = table.leaked_bytes();
        let entries = table.len();
        hooks.fire(&HookEvent::LeakInfo {
            suite,
            case: &name,
            leaked_bytes,
            entries,
        });
        if leaked_bytes > 0 && result.passed() {
            warn!(suite, case = %name, leaked_bytes, entries, "case leaked memory");
            testudo_leakwatch::dump_leaks(table, Level::WARN);
        }
    }

    hooks.fire(&HookEvent::AfterTest {
        suite,
        case: &name,
        result,
    });
    match result {
        CaseResult::Passed => info!(suite, case = %name, "case passed"),
        CaseResult::SegFault | CaseResult::Aborted => {}
        other => warn!(suite, case = %name, result = %other, "case failed"),
    }
    result
}

fn handle_fault(
    suite: &str,
    case: &str,
    report: &FaultReport,
    hooks: &HookRegistry,
    config: &RunConfig,
) {
    if report.result == CaseResult::Aborted {
        warn!(suite, case, signal = report.signal_name, "case terminated by signal");
    } else {
        error!(suite, case, signal = report.signal_name, "case terminated by signal");
    }
    let trace = Backtrace::from_raw(&report.frames);
    trace.dump_to_log(Level::ERROR);

    match report.result {
        CaseResult::Aborted => hooks.fire(&HookEvent::SignalAbort {
            suite,
            case,
            signal: report.signal,
        }),
        CaseResult::SegFault => hooks.fire(&HookEvent::SignalSegfault {
            suite,
            case,
            signal: report.signal,
        }),
        _ => {}
    }

    if let Some(dir) = &config.core_dir {
        write_crash_artifact(dir, suite, case, report, &trace);
    }
}

/// Runs the body phases under the platform's signal trap. With trapping
/// disabled the phases run inline and a fatal signal ends the process.
fn isolate(
    config: &RunConfig,
    body: &mut dyn FnMut(),
) -> Result<IsolationOutcome, IsolationError> {
    if !config.trap_signals {
        body();
        return Ok(IsolationOutcome::Completed);
    }
    platform::execute(config.stack_size, body)
}

/// Setup, body, cleanup. Panics are caught here, inside the isolated
/// context, so unwinding never crosses the context boundary.
fn execute_phases(spec: &mut CaseSpec) -> BodyVerdict {
    match catch_unwind(AssertUnwindSafe(|| phases_inner(spec))) {
        Ok(verdict) => verdict,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            error!(reason, "case panicked");
            BodyVerdict::Panicked
        }
    }
}

fn phases_inner(spec: &mut CaseSpec) -> BodyVerdict {
    let mut data: Option<CaseData> = None;
    if let Some(setup) = spec.setup.as_mut() {
        match setup() {
            SetupOutcome::Ready(produced) => data = produced,
            SetupOutcome::Failed => return BodyVerdict::SetupFailed,
            SetupOutcome::FailedDirty(produced) => {
                if let Some(cleanup) = spec.cleanup.as_mut() {
                    cleanup(Some(produced));
                }
                return BodyVerdict::SetupFailed;
            }
        }
    }
    (spec.body)(data.as_deref_mut());
    if let Some(cleanup) = spec.cleanup.as_mut() {
        cleanup(data.take());
    }
    BodyVerdict::Completed
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn write_crash_artifact(
    dir: &Path,
    suite: &str,
    case: &str,
    report: &FaultReport,
    trace: &Backtrace,
) {
    let path = dir.join(format!("core.{suite}.{case}"));
    let written = File::create(&path).and_then(|mut file| {
        writeln!(file, "signal: {} ({})", report.signal_name, report.signal)?;
        writeln!(file, "suite: {suite}")?;
        writeln!(file, "case: {case}")?;
        writeln!(file, "stack:")?;
        trace.dump_to_writer(&mut file)
    });
    match written {
        Ok(()) => info!(path = %path.display(), "crash report written"),
        Err(error) => warn!(path = %path.display(), %error, "could not write crash report"),
    }
}
