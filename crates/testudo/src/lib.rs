//! A unit-testing harness that survives its own test cases.
//!
//! Cases run inside an isolated execution context: a segfault, a stray
//! abort, or a stack overflow in one case is trapped, turned into that
//! case's result with a symbolized backtrace, and the run moves on to the
//! next case. Checks record failures without panicking, an allocation watch
//! can report what a case leaked and where it was allocated, and every
//! lifecycle step is published through hooks that reporting and statistics
//! subscribe to like any other observer.
//!
//! A test binary registers suites of cases and hands control to the
//! command-line front end:
//!
//! ```no_run
//! use std::process::ExitCode;
//!
//! use testudo::{CaseSpec, TestContext};
//!
//! fn main() -> ExitCode {
//!     let mut ctx = TestContext::with_defaults();
//!     ctx.add_case(
//!         "math",
//!         "add",
//!         CaseSpec::simple(|| {
//!             testudo::check_eq!(2 + 2, 4);
//!         }),
//!     )
//!     .expect("valid names");
//!     testudo::cli::run_main(ctx)
//! }
//! ```
//!
//! Leak tracking additionally needs the watching allocator installed in the
//! binary:
//!
//! ```no_run
//! use testudo::leakwatch::WatchAllocator;
//!
//! #[global_allocator]
//! static ALLOC: WatchAllocator<std::alloc::System> = WatchAllocator::system();
//! ```

pub mod assert;
pub mod cli;
mod config;
mod context;
mod hooks;
mod report;
mod runner;
mod stats;

pub use config::{DEFAULT_STACK_SIZE, RunConfig};
pub use context::{
    CaseData, CaseResult, CaseSpec, RegistryError, SetupOutcome, TestCase, TestContext, TestSuite,
};
pub use hooks::{HOOK_KINDS, HookEvent, HookId, HookKind, HookRegistry, HookSelector};
pub use report::{KeyValueReport, TextReport, Verbosity};
pub use stats::{
    CaseStats, LevelTally, MessageTallyLayer, RunStatistics, StatisticsCollector, SuiteStats,
};

pub use cli::{run_main, run_main_with_args};

pub use testudo_leakwatch as leakwatch;
pub use testudo_trace as trace;
pub use testudo_trace::Backtrace;
