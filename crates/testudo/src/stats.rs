//! Run statistics, collected entirely through the hook registry.
//!
//! The collector subscribes to every hook kind and keeps tallies per suite
//! and per case; nothing in the runner knows it exists. Log message counts
//! work the same way, as a `tracing` layer that sits below any filtering.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{Level, Subscriber, warn};
use tracing_subscriber::layer::{Context, Layer};

use crate::context::CaseResult;
use crate::hooks::{HookEvent, HookId, HookRegistry, HookSelector};

/// Snapshot of one finished (or in-flight) run.
#[derive(Clone, Debug)]
pub struct RunStatistics {
    pub suites: Vec<SuiteStats>,
    pub passed: usize,
    pub failed: usize,
    pub segfaults: usize,
}

#[derive(Clone, Debug)]
pub struct SuiteStats {
    pub name: String,
    pub passed: bool,
    pub cases: Vec<CaseStats>,
    pub asserts_passed: usize,
    pub asserts_total: usize,
    pub elapsed: Duration,
}

#[derive(Clone, Debug)]
pub struct CaseStats {
    pub name: String,
    pub result: CaseResult,
    pub asserts_passed: usize,
    pub asserts_total: usize,
    pub leaked_bytes: usize,
    pub elapsed: Duration,
}

struct CaseTally {
    name: String,
    result: CaseResult,
    asserts_passed: usize,
    asserts_total: usize,
    leaked_bytes: usize,
    started: Instant,
    elapsed: Option<Duration>,
}

struct SuiteTally {
    name: String,
    cases: Vec<CaseTally>,
    asserts_passed: usize,
    asserts_total: usize,
    passed: Option<bool>,
    started: Instant,
    elapsed: Option<Duration>,
}

#[derive(Default)]
struct Inner {
    suites: Vec<SuiteTally>,
    current_suite: Option<usize>,
    current_case: Option<usize>,
}

impl Inner {
    fn record(&mut self, event: &HookEvent<'_>) {
        match *event {
            HookEvent::BeforeSuite { suite } => {
                let index = self.ensure_suite(suite);
                self.suites[index].started = Instant::now();
                self.suites[index].elapsed = None;
                self.current_suite = Some(index);
            }
            HookEvent::AfterSuite { suite, passed } => {
                let Some(index) = self.current_suite.take() else {
                    warn!(suite, "suite completion without a matching start");
                    return;
                };
                let tally = &mut self.suites[index];
                if tally.name != suite {
                    warn!(suite, current = %tally.name, "suite completion does not match the running suite");
                    return;
                }
                tally.passed = Some(passed);
                tally.elapsed = Some(tally.started.elapsed());
            }
            HookEvent::BeforeTest { suite, case } => {
                // Direct case runs arrive without a BeforeSuite.
                let suite_index = match self.current_suite {
                    Some(index) if self.suites[index].name == suite => index,
                    _ => self.ensure_suite(suite),
                };
                let cases = &mut self.suites[suite_index].cases;
                let case_index = match cases.iter().position(|c| c.name == case) {
                    Some(index) => index,
                    None => {
                        cases.push(CaseTally {
                            name: case.to_owned(),
                            result: CaseResult::NotRun,
                            asserts_passed: 0,
                            asserts_total: 0,
                            leaked_bytes: 0,
                            started: Instant::now(),
                            elapsed: None,
                        });
                        cases.len() - 1
                    }
                };
                let tally = &mut cases[case_index];
                tally.result = CaseResult::NotRun;
                tally.asserts_passed = 0;
                tally.asserts_total = 0;
                tally.leaked_bytes = 0;
                tally.started = Instant::now();
                tally.elapsed = None;
                self.current_suite = Some(suite_index);
                self.current_case = Some(case_index);
            }
            HookEvent::AfterTest { suite, case, result } => {
                let Some((suite_index, case_index)) = self.current() else {
                    warn!(suite, case, "case completion without a matching start");
                    return;
                };
                let tally = &mut self.suites[suite_index].cases[case_index];
                if tally.name != case {
                    warn!(suite, case, current = %tally.name, "case completion does not match the running case");
                    return;
                }
                tally.result = result;
                tally.elapsed = Some(tally.started.elapsed());
                self.current_case = None;
            }
            HookEvent::Assert { passed, .. } => {
                // Checks count for the running case and its suite, like the
                // per-case verdicts roll up into the suite verdict.
                let Some((suite_index, case_index)) = self.current() else {
                    return;
                };
                let suite = &mut self.suites[suite_index];
                suite.asserts_total += 1;
                let case = &mut suite.cases[case_index];
                case.asserts_total += 1;
                if passed {
                    suite.asserts_passed += 1;
                    case.asserts_passed += 1;
                }
            }
            HookEvent::LeakInfo { leaked_bytes, .. } => {
                let Some((suite_index, case_index)) = self.current() else {
                    return;
                };
                self.suites[suite_index].cases[case_index].leaked_bytes = leaked_bytes;
            }
            HookEvent::SignalAbort { .. } | HookEvent::SignalSegfault { .. } => {}
        }
    }

    fn current(&self) -> Option<(usize, usize)> {
        Some((self.current_suite?, self.current_case?))
    }

    fn ensure_suite(&mut self, name: &str) -> usize {
        match self.suites.iter().position(|s| s.name == name) {
            Some(index) => index,
            None => {
                self.suites.push(SuiteTally {
                    name: name.to_owned(),
                    cases: Vec::new(),
                    asserts_passed: 0,
                    asserts_total: 0,
                    passed: None,
                    started: Instant::now(),
                    elapsed: None,
                });
                self.suites.len() - 1
            }
        }
    }

    fn snapshot(&self) -> RunStatistics {
        let mut passed = 0;
        let mut failed = 0;
        let mut segfaults = 0;
        let suites = self
            .suites
            .iter()
            .map(|suite| {
                let cases: Vec<CaseStats> = suite
                    .cases
                    .iter()
                    .map(|case| {
                        match case.result {
                            CaseResult::Passed => passed += 1,
                            CaseResult::Failed
                            | CaseResult::Aborted
                            | CaseResult::InternalError => failed += 1,
                            CaseResult::SegFault => {
                                failed += 1;
                                segfaults += 1;
                            }
                            CaseResult::NotRun => {}
                        }
                        CaseStats {
                            name: case.name.clone(),
                            result: case.result,
                            asserts_passed: case.asserts_passed,
                            asserts_total: case.asserts_total,
                            leaked_bytes: case.leaked_bytes,
                            elapsed: case.elapsed.unwrap_or(Duration::ZERO),
                        }
                    })
                    .collect();
                SuiteStats {
                    name: suite.name.clone(),
                    passed: suite
                        .passed
                        .unwrap_or_else(|| cases.iter().all(|c| c.result.passed())),
                    asserts_passed: suite.asserts_passed,
                    asserts_total: suite.asserts_total,
                    elapsed: suite
                        .elapsed
                        .unwrap_or_else(|| cases.iter().map(|c| c.elapsed).sum()),
                    cases,
                }
            })
            .collect();
        RunStatistics {
            suites,
            passed,
            failed,
            segfaults,
        }
    }
}

/// Tallies per suite and per case, fed by a wildcard hook registration.
pub struct StatisticsCollector {
    inner: Rc<RefCell<Inner>>,
    hook: HookId,
}

impl StatisticsCollector {
    pub fn install(hooks: &mut HookRegistry) -> StatisticsCollector {
        let inner = Rc::new(RefCell::new(Inner::default()));
        let sink = inner.clone();
        let hook = hooks.register(HookSelector::All, move |event| {
            sink.borrow_mut().record(event);
        });
        StatisticsCollector { inner, hook }
    }

    pub fn snapshot(&self) -> RunStatistics {
        self.inner.borrow().snapshot()
    }

    pub fn detach(self, hooks: &mut HookRegistry) -> RunStatistics {
        hooks.unregister(self.hook);
        self.inner.borrow().snapshot()
    }
}

const LEVELS: [(Level, &str); 5] = [
    (Level::ERROR, "error"),
    (Level::WARN, "warning"),
    (Level::INFO, "info"),
    (Level::DEBUG, "debug"),
    (Level::TRACE, "trace"),
];

/// Per-level message counters, shared between the layer and the reports.
#[derive(Clone, Default)]
pub struct LevelTally {
    counts: Arc<[AtomicU64; 5]>,
}

impl LevelTally {
    fn index(level: Level) -> usize {
        LEVELS
            .iter()
            .position(|(known, _)| *known == level)
            .unwrap_or(LEVELS.len() - 1)
    }

    pub fn record(&self, level: Level) {
        self.counts[Self::index(level)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, level: Level) -> u64 {
        self.counts[Self::index(level)].load(Ordering::Relaxed)
    }

    /// `(name, count)` rows in severity order, ready for a report.
    pub fn rows(&self) -> [(&'static str, u64); 5] {
        let mut rows = [("", 0); 5];
        for (index, (level, name)) in LEVELS.iter().enumerate() {
            rows[index] = (*name, self.count(*level));
        }
        rows
    }
}

/// Counts every event that reaches the subscriber, whatever the fmt layer's
/// filter lets through. Registered unfiltered for the run's whole lifetime.
pub struct MessageTallyLayer {
    tally: LevelTally,
}

impl MessageTallyLayer {
    pub fn new(tally: LevelTally) -> MessageTallyLayer {
        MessageTallyLayer { tally }
    }
}

impl<S: Subscriber> Layer<S> for MessageTallyLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.tally.record(*event.metadata().level());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(hooks: &HookRegistry, events: &[HookEvent<'_>]) {
        for event in events {
            hooks.fire(event);
        }
    }

    #[test]
    fn a_full_suite_run_is_tallied() {
        let mut hooks = HookRegistry::default();
        let collector = StatisticsCollector::install(&mut hooks);

        drive(
            &hooks,
            &[
                HookEvent::BeforeSuite { suite: "math" },
                HookEvent::BeforeTest { suite: "math", case: "add" },
                HookEvent::Assert {
                    passed: true,
                    kind: "check",
                    condition: "1 + 1 == 2",
                    file: "math.rs",
                    function: "math::add",
                    line: 10,
                },
                HookEvent::Assert {
                    passed: false,
                    kind: "check",
                    condition: "1 + 1 == 3",
                    file: "math.rs",
                    function: "math::add",
                    line: 11,
                },
                HookEvent::LeakInfo {
                    suite: "math",
                    case: "add",
                    leaked_bytes: 128,
                    entries: 1,
                },
                HookEvent::AfterTest {
                    suite: "math",
                    case: "add",
                    result: CaseResult::Failed,
                },
                HookEvent::BeforeTest { suite: "math", case: "sub" },
                HookEvent::Assert {
                    passed: true,
                    kind: "check",
                    condition: "2 - 1 == 1",
                    file: "math.rs",
                    function: "math::sub",
                    line: 20,
                },
                HookEvent::AfterTest {
                    suite: "math",
                    case: "sub",
                    result: CaseResult::Passed,
                },
                HookEvent::AfterSuite { suite: "math", passed: false },
            ],
        );

        let stats = collector.detach(&mut hooks);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.segfaults, 0);
        assert_eq!(stats.suites.len(), 1);

        let suite = &stats.suites[0];
        assert_eq!(suite.name, "math");
        assert!(!suite.passed);
        assert_eq!(suite.asserts_passed, 2);
        assert_eq!(suite.asserts_total, 3);

        let add = &suite.cases[0];
        assert_eq!(add.result, CaseResult::Failed);
        assert_eq!((add.asserts_passed, add.asserts_total), (1, 2));
        assert_eq!(add.leaked_bytes, 128);
        let sub = &suite.cases[1];
        assert_eq!(sub.result, CaseResult::Passed);
        assert_eq!((sub.asserts_passed, sub.asserts_total), (1, 1));
    }

    #[test]
    fn segfaults_count_as_failures_too() {
        let mut hooks = HookRegistry::default();
        let collector = StatisticsCollector::install(&mut hooks);

        drive(
            &hooks,
            &[
                HookEvent::BeforeSuite { suite: "signal" },
                HookEvent::BeforeTest { suite: "signal", case: "boom" },
                HookEvent::SignalSegfault {
                    suite: "signal",
                    case: "boom",
                    signal: 11,
                },
                HookEvent::AfterTest {
                    suite: "signal",
                    case: "boom",
                    result: CaseResult::SegFault,
                },
                HookEvent::AfterSuite { suite: "signal", passed: false },
            ],
        );

        let stats = collector.snapshot();
        assert_eq!(stats.passed, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.segfaults, 1);
        assert_eq!(stats.suites[0].cases[0].result, CaseResult::SegFault);
    }

    #[test]
    fn direct_case_runs_synthesize_their_suite() {
        let mut hooks = HookRegistry::default();
        let collector = StatisticsCollector::install(&mut hooks);

        drive(
            &hooks,
            &[
                HookEvent::BeforeTest { suite: "solo", case: "only" },
                HookEvent::AfterTest {
                    suite: "solo",
                    case: "only",
                    result: CaseResult::Passed,
                },
            ],
        );

        let stats = collector.snapshot();
        assert_eq!(stats.suites.len(), 1);
        assert_eq!(stats.suites[0].name, "solo");
        // No AfterSuite payload: the verdict derives from the cases.
        assert!(stats.suites[0].passed);
    }

    #[test]
    fn mismatched_completions_are_dropped() {
        let mut hooks = HookRegistry::default();
        let collector = StatisticsCollector::install(&mut hooks);

        drive(
            &hooks,
            &[
                HookEvent::AfterTest {
                    suite: "ghost",
                    case: "nobody",
                    result: CaseResult::Passed,
                },
                HookEvent::AfterSuite { suite: "ghost", passed: true },
            ],
        );

        let stats = collector.snapshot();
        assert!(stats.suites.is_empty());
        assert_eq!(stats.passed, 0);
    }

    #[test]
    fn rerunning_a_case_resets_its_tallies() {
        let mut hooks = HookRegistry::default();
        let collector = StatisticsCollector::install(&mut hooks);

        for result in [CaseResult::Failed, CaseResult::Passed] {
            drive(
                &hooks,
                &[
                    HookEvent::BeforeTest { suite: "retry", case: "flaky" },
                    HookEvent::Assert {
                        passed: result.passed(),
                        kind: "check",
                        condition: "works()",
                        file: "retry.rs",
                        function: "retry::flaky",
                        line: 5,
                    },
                    HookEvent::AfterTest { suite: "retry", case: "flaky", result },
                ],
            );
        }

        let stats = collector.snapshot();
        let case = &stats.suites[0].cases[0];
        assert_eq!(case.result, CaseResult::Passed);
        assert_eq!((case.asserts_passed, case.asserts_total), (1, 1));
        // The suite keeps the run-wide assert tally.
        assert_eq!(stats.suites[0].asserts_total, 2);
    }

    #[test]
    fn level_tally_counts_per_severity() {
        let tally = LevelTally::default();
        tally.record(Level::ERROR);
        tally.record(Level::WARN);
        tally.record(Level::WARN);
        assert_eq!(tally.count(Level::ERROR), 1);
        assert_eq!(tally.count(Level::WARN), 2);
        assert_eq!(tally.count(Level::INFO), 0);

        let rows = tally.rows();
        assert_eq!(rows[0], ("error", 1));
        assert_eq!(rows[1], ("warning", 2));
        assert_eq!(rows[4], ("trace", 0));
    }
}
