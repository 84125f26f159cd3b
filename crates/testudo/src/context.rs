//! Test registry: suites, cases, and the run entry points.

use std::any::Any;
use std::fmt;

use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::hooks::{HookEvent, HookRegistry};
use crate::runner;

/// Outcome of a single case run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub enum CaseResult {
    #[default]
    NotRun,
    Passed,
    Failed,
    Aborted,
    SegFault,
    InternalError,
}

impl CaseResult {
    pub fn passed(self) -> bool {
        matches!(self, CaseResult::Passed)
    }

    pub fn label(self) -> &'static str {
        match self {
            CaseResult::NotRun => "not run",
            CaseResult::Passed => "passed",
            CaseResult::Failed => "failed",
            CaseResult::Aborted => "aborted",
            CaseResult::SegFault => "segmentation fault",
            CaseResult::InternalError => "internal error",
        }
    }
}

impl fmt::Display for CaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-case context handed from setup to body to cleanup. The body borrows
/// it as `&mut dyn Any`; cleanup takes it by value and drops it.
pub type CaseData = Box<dyn Any>;

/// What a setup callback produced.
pub enum SetupOutcome {
    /// Setup succeeded; the body runs with this context.
    Ready(Option<CaseData>),
    /// Setup failed before producing anything. The body and cleanup both
    /// stay unrun and the case is marked failed.
    Failed,
    /// Setup failed but already built state that needs tearing down. The
    /// body stays unrun, cleanup receives the data, the case is failed.
    FailedDirty(CaseData),
}

/// The callables making up one case. Setup and cleanup are optional.
pub struct CaseSpec {
    pub(crate) setup: Option<Box<dyn FnMut() -> SetupOutcome>>,
    pub(crate) body: Box<dyn FnMut(Option<&mut dyn Any>)>,
    pub(crate) cleanup: Option<Box<dyn FnMut(Option<CaseData>)>>,
}

impl CaseSpec {
    pub fn new(body: impl FnMut(Option<&mut dyn Any>) + 'static) -> Self {
        CaseSpec {
            setup: None,
            body: Box::new(body),
            cleanup: None,
        }
    }

    /// A body that does not care about per-case context.
    pub fn simple(mut body: impl FnMut() + 'static) -> Self {
        CaseSpec::new(move |_| body())
    }

    pub fn with_setup(mut self, setup: impl FnMut() -> SetupOutcome + 'static) -> Self {
        self.setup = Some(Box::new(setup));
        self
    }

    pub fn with_cleanup(mut self, cleanup: impl FnMut(Option<CaseData>) + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }
}

pub struct TestCase {
    name: String,
    pub(crate) spec: CaseSpec,
    result: CaseResult,
}

impl TestCase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn result(&self) -> CaseResult {
        self.result
    }
}

pub struct TestSuite {
    name: String,
    cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn case(&self, name: &str) -> Option<&TestCase> {
        self.cases.iter().find(|case| case.name == name)
    }
}

/// Registration and lookup failures. Reported as values so a bad name can
/// never take the process down.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RegistryError {
    InvalidName { name: String },
    UnknownSuite { suite: String },
    UnknownCase { suite: String, case: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::InvalidName { name } => {
                write!(f, "invalid test name {name:?}: must be non-empty, '.' and '=' are reserved")
            }
            RegistryError::UnknownSuite { suite } => write!(f, "no such suite: {suite}"),
            RegistryError::UnknownCase { suite, case } => {
                write!(f, "no such case: {suite}.{case}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['.', '='])
}

/// Owns the registered suites, the hook registry, and the run configuration.
#[derive(Default)]
pub struct TestContext {
    suites: Vec<TestSuite>,
    hooks: HookRegistry,
    config: RunConfig,
}

impl TestContext {
    pub fn new(config: RunConfig) -> Self {
        TestContext {
            suites: Vec::new(),
            hooks: HookRegistry::default(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        TestContext::new(RunConfig::default())
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RunConfig {
        &mut self.config
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    pub fn suites(&self) -> &[TestSuite] {
        &self.suites
    }

    pub fn suite(&self, name: &str) -> Option<&TestSuite> {
        self.suites.iter().find(|suite| suite.name == name)
    }

    /// Registers a case, creating its suite on first use. Registering the
    /// same `suite.case` pair again replaces the callables in place.
    pub fn add_case(
        &mut self,
        suite: &str,
        case: &str,
        spec: CaseSpec,
    ) -> Result<(), RegistryError> {
        for name in [suite, case] {
            if !valid_name(name) {
                return Err(RegistryError::InvalidName {
                    name: name.to_owned(),
                });
            }
        }

        let suite_index = match self.suites.iter().position(|s| s.name == suite) {
            Some(index) => index,
            None => {
                self.suites.push(TestSuite {
                    name: suite.to_owned(),
                    cases: Vec::new(),
                });
                self.suites.len() - 1
            }
        };
        let cases = &mut self.suites[suite_index].cases;

        if let Some(existing) = cases.iter_mut().find(|c| c.name == case) {
            warn!(suite, case, "case already registered, replacing its callables");
            existing.spec = spec;
            existing.result = CaseResult::NotRun;
        } else {
            debug!(suite, case, "case registered");
            cases.push(TestCase {
                name: case.to_owned(),
                spec,
                result: CaseResult::NotRun,
            });
        }
        Ok(())
    }

    /// Runs every registered suite. `true` when all of them passed.
    pub fn run_all(&mut self) -> bool {
        let mut passed = true;
        for index in 0..self.suites.len() {
            passed &= self.run_suite_at(index);
        }
        passed
    }

    /// Runs one suite by name. `Ok(true)` when all of its cases passed.
    pub fn run_suite(&mut self, suite: &str) -> Result<bool, RegistryError> {
        let index = self
            .suites
            .iter()
            .position(|s| s.name == suite)
            .ok_or_else(|| RegistryError::UnknownSuite {
                suite: suite.to_owned(),
            })?;
        Ok(self.run_suite_at(index))
    }

    /// Runs a single case by name.
    pub fn run_case(&mut self, suite: &str, case: &str) -> Result<CaseResult, RegistryError> {
        let suite_index = self
            .suites
            .iter()
            .position(|s| s.name == suite)
            .ok_or_else(|| RegistryError::UnknownSuite {
                suite: suite.to_owned(),
            })?;
        let case_index = self.suites[suite_index]
            .cases
            .iter()
            .position(|c| c.name == case)
            .ok_or_else(|| RegistryError::UnknownCase {
                suite: suite.to_owned(),
                case: case.to_owned(),
            })?;
        Ok(self.run_case_at(suite_index, case_index))
    }

    fn run_suite_at(&mut self, suite_index: usize) -> bool {
        let suite_name = self.suites[suite_index].name.clone();
        self.hooks.fire(&HookEvent::BeforeSuite { suite: &suite_name });

        let mut passed = true;
        for case_index in 0..self.suites[suite_index].cases.len() {
            passed &= self.run_case_at(suite_index, case_index).passed();
        }

        self.hooks.fire(&HookEvent::AfterSuite {
            suite: &suite_name,
            passed,
        });
        if passed {
            debug!(suite = %suite_name, "suite finished, all cases passed");
        } else {
            warn!(suite = %suite_name, "suite finished with failures");
        }
        passed
    }

    fn run_case_at(&mut self, suite_index: usize, case_index: usize) -> CaseResult {
        let TestContext {
            suites,
            hooks,
            config,
        } = self;
        let suite = &mut suites[suite_index];
        let suite_name = suite.name.clone();
        let case = &mut suite.cases[case_index];
        let result = runner::run_case(&suite_name, case, hooks, config);
        case.result = result;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    fn inline_context() -> TestContext {
        let mut config = RunConfig::default();
        config.trap_signals = false;
        TestContext::new(config)
    }

    #[test]
    fn replacing_a_case_keeps_the_count_and_swaps_the_body() {
        let mut ctx = inline_context();
        let first = Rc::new(Cell::new(false));
        let second = Rc::new(Cell::new(false));

        let hit = first.clone();
        ctx.add_case("math", "add", CaseSpec::simple(move || hit.set(true)))
            .expect("valid names");
        let hit = second.clone();
        ctx.add_case("math", "add", CaseSpec::simple(move || hit.set(true)))
            .expect("valid names");

        assert_eq!(ctx.suite("math").expect("registered").cases().len(), 1);
        assert!(ctx.run_all());
        assert!(!first.get());
        assert!(second.get());
    }

    #[test]
    fn reserved_characters_are_rejected() {
        let mut ctx = inline_context();
        for (suite, case) in [("a.b", "ok"), ("ok", "a=b"), ("", "ok"), ("ok", "")] {
            let err = ctx
                .add_case(suite, case, CaseSpec::simple(|| {}))
                .expect_err("name must be rejected");
            assert!(matches!(err, RegistryError::InvalidName { .. }));
        }
        assert!(ctx.suites().is_empty());
    }

    #[test]
    fn lookups_by_unknown_name_fail_as_values() {
        let mut ctx = inline_context();
        ctx.add_case("math", "add", CaseSpec::simple(|| {}))
            .expect("valid names");

        assert_eq!(
            ctx.run_suite("physics"),
            Err(RegistryError::UnknownSuite {
                suite: "physics".to_owned()
            })
        );
        assert_eq!(
            ctx.run_case("math", "subtract"),
            Err(RegistryError::UnknownCase {
                suite: "math".to_owned(),
                case: "subtract".to_owned()
            })
        );
    }

    #[test]
    fn run_all_aggregates_across_suites() {
        let mut ctx = inline_context();
        ctx.add_case("math", "add", CaseSpec::simple(|| {}))
            .expect("valid names");
        ctx.add_case(
            "math",
            "overflow",
            CaseSpec::simple(|| panic!("forced failure")),
        )
        .expect("valid names");
        ctx.add_case("strings", "concat", CaseSpec::simple(|| {}))
            .expect("valid names");

        assert!(!ctx.run_all());
        let math = ctx.suite("math").expect("registered");
        assert_eq!(math.case("add").expect("registered").result(), CaseResult::Passed);
        assert_eq!(
            math.case("overflow").expect("registered").result(),
            CaseResult::Failed
        );
        assert!(ctx.run_suite("strings").expect("registered"));
    }

    #[test]
    fn setup_failure_skips_body_and_cleanup() {
        let mut ctx = inline_context();
        let body_ran = Rc::new(Cell::new(false));
        let cleanup_ran = Rc::new(Cell::new(false));

        let body_hit = body_ran.clone();
        let cleanup_hit = cleanup_ran.clone();
        ctx.add_case(
            "lifecycle",
            "bad_setup",
            CaseSpec::new(move |_| body_hit.set(true))
                .with_setup(|| SetupOutcome::Failed)
                .with_cleanup(move |_| cleanup_hit.set(true)),
        )
        .expect("valid names");

        assert_eq!(
            ctx.run_case("lifecycle", "bad_setup").expect("registered"),
            CaseResult::Failed
        );
        assert!(!body_ran.get());
        assert!(!cleanup_ran.get());
    }

    #[test]
    fn dirty_setup_failure_still_reaches_cleanup() {
        let mut ctx = inline_context();
        let observed = Rc::new(Cell::new(0u32));

        let sink = observed.clone();
        ctx.add_case(
            "lifecycle",
            "dirty_setup",
            CaseSpec::new(|_| {})
                .with_setup(|| SetupOutcome::FailedDirty(Box::new(7u32)))
                .with_cleanup(move |data| {
                    let data = data.expect("setup produced data");
                    sink.set(*data.downcast::<u32>().expect("u32 payload"));
                }),
        )
        .expect("valid names");

        assert_eq!(
            ctx.run_case("lifecycle", "dirty_setup").expect("registered"),
            CaseResult::Failed
        );
        assert_eq!(observed.get(), 7);
    }

    #[test]
    fn context_flows_from_setup_through_body_to_cleanup() {
        let mut ctx = inline_context();
        let final_value = Rc::new(Cell::new(0u32));

        let sink = final_value.clone();
        ctx.add_case(
            "lifecycle",
            "threaded_context",
            CaseSpec::new(|data| {
                let data = data.expect("setup produced data");
                let value = data.downcast_mut::<u32>().expect("u32 payload");
                *value += 1;
            })
            .with_setup(|| SetupOutcome::Ready(Some(Box::new(41u32))))
            .with_cleanup(move |data| {
                let data = data.expect("setup produced data");
                sink.set(*data.downcast::<u32>().expect("u32 payload"));
            }),
        )
        .expect("valid names");

        assert_eq!(
            ctx.run_case("lifecycle", "threaded_context")
                .expect("registered"),
            CaseResult::Passed
        );
        assert_eq!(final_value.get(), 42);
    }
}
