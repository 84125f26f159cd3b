//! End-of-run reporting: a human text report and a machine key=value form.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use crate::context::CaseResult;
use crate::stats::{CaseStats, LevelTally, RunStatistics, SuiteStats};

/// How much of the run the text report shows. Each step includes everything
/// below it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum Verbosity {
    /// Nothing at all.
    None,
    /// The one-line pass/fail summary.
    #[default]
    Summary,
    /// Plus one line per suite.
    Suites,
    /// Plus one line per case.
    Full,
    /// Plus the per-level log message counts.
    Verbose,
}

impl Verbosity {
    fn name(self) -> &'static str {
        match self {
            Verbosity::None => "none",
            Verbosity::Summary => "summary",
            Verbosity::Suites => "suites",
            Verbosity::Full => "full",
            Verbosity::Verbose => "verbose",
        }
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Verbosity, String> {
        match s {
            "none" => Ok(Verbosity::None),
            "summary" => Ok(Verbosity::Summary),
            "suites" => Ok(Verbosity::Suites),
            "full" => Ok(Verbosity::Full),
            "verbose" => Ok(Verbosity::Verbose),
            other => Err(format!(
                "unknown verbosity {other:?}, expected none, summary, suites, full or verbose"
            )),
        }
    }
}

const RESET: &str = "\x1b[0m";
const BOLD_GREEN: &str = "\x1b[1;32m";
const BOLD_RED: &str = "\x1b[1;31m";
const MAGENTA: &str = "\x1b[35m";
const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const WHITE_ON_RED: &str = "\x1b[41m\x1b[1;37m";

fn short_label(result: CaseResult) -> &'static str {
    match result {
        CaseResult::NotRun => "not run",
        CaseResult::Passed => "passed",
        CaseResult::Failed => "failed",
        CaseResult::Aborted => "aborted",
        CaseResult::SegFault => "segfault",
        CaseResult::InternalError => "internal error",
    }
}

/// The human-readable report.
pub struct TextReport {
    pub verbosity: Verbosity,
    pub color: bool,
    /// Limits the suite and case listing to one suite.
    pub suite_filter: Option<String>,
    /// Enables the `Messages received:` section at [`Verbosity::Verbose`].
    pub message_tally: Option<LevelTally>,
    /// When set, fatal-signal cases show the path of their crash report.
    pub core_dir: Option<PathBuf>,
}

impl TextReport {
    pub fn render(&self, stats: &RunStatistics, out: &mut dyn io::Write) -> io::Result<()> {
        if self.verbosity == Verbosity::None {
            return Ok(());
        }
        self.summary_line(stats, out)?;
        if self.verbosity >= Verbosity::Suites {
            for suite in &stats.suites {
                if let Some(filter) = &self.suite_filter
                    && filter != &suite.name
                {
                    continue;
                }
                self.suite_line(suite, out)?;
                if self.verbosity >= Verbosity::Full {
                    for case in &suite.cases {
                        self.case_line(&suite.name, case, out)?;
                    }
                    writeln!(out)?;
                }
            }
        }
        if self.verbosity >= Verbosity::Verbose
            && let Some(tally) = &self.message_tally
        {
            writeln!(out, "Messages received:")?;
            for (name, count) in tally.rows() {
                writeln!(out, "    {name:<25} {count:>10}")?;
            }
        }
        Ok(())
    }

    fn summary_line(&self, stats: &RunStatistics, out: &mut dyn io::Write) -> io::Result<()> {
        if self.color {
            write!(
                out,
                "Summary: {BOLD_GREEN}passed: {}{RESET}; {BOLD_RED}failed: {}{RESET}",
                stats.passed, stats.failed
            )?;
            if stats.segfaults > 0 {
                write!(
                    out,
                    "; {WHITE_ON_RED}segmentation faults: {}{RESET}",
                    stats.segfaults
                )?;
            }
            writeln!(out)
        } else {
            writeln!(
                out,
                "Summary: passed: {}; failed: {}; segmentation faults: {}",
                stats.passed, stats.failed, stats.segfaults
            )
        }
    }

    fn suite_line(&self, suite: &SuiteStats, out: &mut dyn io::Write) -> io::Result<()> {
        let verdict = if suite.passed { "passed" } else { "failed" };
        if self.color {
            let tone = if suite.passed { GREEN } else { RED };
            write!(
                out,
                "Suite   {MAGENTA}{:<30}{RESET} {tone}{verdict}{RESET}",
                suite.name
            )?;
        } else {
            write!(out, "Suite   {:<30} {verdict}", suite.name)?;
        }
        if self.verbosity >= Verbosity::Verbose {
            write!(
                out,
                " assertions passed: {}/{}",
                suite.asserts_passed, suite.asserts_total
            )?;
        }
        writeln!(out)
    }

    fn case_line(&self, suite: &str, case: &CaseStats, out: &mut dyn io::Write) -> io::Result<()> {
        let verdict = short_label(case.result);
        let fatal = matches!(
            case.result,
            CaseResult::SegFault | CaseResult::Aborted | CaseResult::InternalError
        );
        if self.color {
            let tone = if case.result.passed() {
                GREEN
            } else if fatal {
                WHITE_ON_RED
            } else {
                RED
            };
            write!(out, "   Case {:<33} {tone}{verdict}{RESET}", case.name)?;
        } else {
            write!(out, "   Case {:<33} {verdict}", case.name)?;
        }
        if let Some(dir) = &self.core_dir
            && matches!(case.result, CaseResult::SegFault | CaseResult::Aborted)
        {
            let path = dir.join(format!("core.{suite}.{}", case.name));
            write!(out, " (core: {})", path.display())?;
        }
        if self.verbosity >= Verbosity::Verbose {
            write!(
                out,
                " assertions passed: {}/{}",
                case.asserts_passed, case.asserts_total
            )?;
        }
        writeln!(out)
    }
}

fn result_token(result: CaseResult) -> &'static str {
    match result {
        CaseResult::NotRun => "notrun",
        CaseResult::Passed => "passed",
        CaseResult::Failed => "failed",
        CaseResult::Aborted => "aborted",
        CaseResult::SegFault => "segfault",
        CaseResult::InternalError => "internal",
    }
}

/// One `key=value` pair per line, for scripts and CI plumbing. Suite and
/// case names cannot contain `.` or `=`, which keeps the keys parseable.
pub struct KeyValueReport {
    pub message_tally: Option<LevelTally>,
}

impl KeyValueReport {
    pub fn render(&self, stats: &RunStatistics, out: &mut dyn io::Write) -> io::Result<()> {
        writeln!(out, "summary.passed={}", stats.passed)?;
        writeln!(out, "summary.failed={}", stats.failed)?;
        writeln!(out, "summary.segfault={}", stats.segfaults)?;
        for suite in &stats.suites {
            let s = &suite.name;
            writeln!(out, "suite.{s}.result={}", u8::from(suite.passed))?;
            writeln!(out, "suite.{s}.asserts.passed={}", suite.asserts_passed)?;
            writeln!(out, "suite.{s}.asserts.total={}", suite.asserts_total)?;
            writeln!(out, "suite.{s}.time={:.6}", suite.elapsed.as_secs_f64())?;
            for case in &suite.cases {
                let c = &case.name;
                writeln!(
                    out,
                    "suite.{s}.test.{c}.result={}",
                    result_token(case.result)
                )?;
                writeln!(
                    out,
                    "suite.{s}.test.{c}.asserts.passed={}",
                    case.asserts_passed
                )?;
                writeln!(
                    out,
                    "suite.{s}.test.{c}.asserts.total={}",
                    case.asserts_total
                )?;
                writeln!(
                    out,
                    "suite.{s}.test.{c}.time={:.6}",
                    case.elapsed.as_secs_f64()
                )?;
                writeln!(out, "suite.{s}.test.{c}.leaked={}", case.leaked_bytes)?;
            }
        }
        if let Some(tally) = &self.message_tally {
            for (name, count) in tally.rows() {
                writeln!(out, "message.{name}={count}")?;
            }
        }
        Ok(())
    }
}
