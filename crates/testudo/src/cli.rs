//! The test-binary command line.
//!
//! A test binary registers its cases and hands the context to [`run_main`],
//! which owns argument parsing, subscriber setup, the run itself, and the
//! reports. Log output and the text report go to stderr; stdout stays free
//! for whatever the cases print.

use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::config::RunConfig;
use crate::context::TestContext;
use crate::report::{KeyValueReport, TextReport, Verbosity};
use crate::stats::{LevelTally, MessageTallyLayer, StatisticsCollector};

#[derive(Parser, Debug)]
#[command(version, about = "Runs the test cases registered by this binary")]
pub struct RunnerArgs {
    /// Colorize log output and the text report.
    #[arg(short = 'c', long = "fancy-log")]
    pub fancy_log: bool,

    /// Suppress log output entirely.
    #[arg(short = 's', long)]
    pub silent: bool,

    /// Log level when RUST_LOG is not set.
    #[arg(short = 'v', long = "log-level", default_value = "warn", value_name = "LEVEL")]
    pub log_level: String,

    /// Text report detail: none, summary, suites, full or verbose.
    #[arg(short = 'R', long, default_value = "summary", value_name = "DETAIL")]
    pub results: Verbosity,

    /// Track allocations per case and report leaks.
    #[arg(long)]
    pub leakwatch: bool,

    /// Run case bodies inline, without the signal trap.
    #[arg(long = "no-sighandle", hide = true)]
    pub no_sighandle: bool,

    /// Run (and report) a single suite.
    #[arg(long, value_name = "NAME")]
    pub suite: Option<String>,

    /// Write a key=value report to this file.
    #[arg(long, value_name = "PATH")]
    pub report_file: Option<PathBuf>,

    /// Write a report per trapped signal into this directory.
    #[arg(long, value_name = "PATH")]
    pub core_dir: Option<PathBuf>,
}

fn apply_overrides(args: &RunnerArgs, config: &mut RunConfig) {
    if args.leakwatch {
        config.leak_watch = true;
    }
    if args.no_sighandle {
        config.trap_signals = false;
    }
    if let Some(dir) = &args.core_dir {
        config.core_dir = Some(dir.clone());
    }
}

/// Parses the command line, runs the registered cases, reports, and maps
/// the overall verdict to the exit code.
pub fn run_main(ctx: TestContext) -> ExitCode {
    run_main_with_args(ctx, std::env::args_os())
}

/// [`run_main`] with a caller-supplied argument list, for binaries that
/// filter or extend their command line before handing it over.
pub fn run_main_with_args<I, T>(mut ctx: TestContext, args: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args = RunnerArgs::parse_from(args);

    let tally = LevelTally::default();
    let fmt_layer = (!args.silent).then(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
        fmt::layer()
            .with_ansi(args.fancy_log)
            .with_writer(io::stderr)
            .with_filter(filter)
    });
    // The tally layer sits below any filtering so it sees every message.
    let _ = tracing_subscriber::registry()
        .with(MessageTallyLayer::new(tally.clone()))
        .with(fmt_layer)
        .try_init();

    apply_overrides(&args, ctx.config_mut());
    let collector = StatisticsCollector::install(ctx.hooks_mut());

    let passed = match &args.suite {
        Some(suite) => match ctx.run_suite(suite) {
            Ok(passed) => passed,
            Err(error) => {
                error!(%error, "cannot run the requested suite");
                false
            }
        },
        None => ctx.run_all(),
    };

    let stats = collector.detach(ctx.hooks_mut());

    let report = TextReport {
        verbosity: args.results,
        color: args.fancy_log,
        suite_filter: args.suite.clone(),
        message_tally: Some(tally.clone()),
        core_dir: ctx.config().core_dir.clone(),
    };
    if let Err(error) = report.render(&stats, &mut io::stderr().lock()) {
        warn!(%error, "could not write the text report");
    }

    if let Some(path) = &args.report_file {
        let kv = KeyValueReport {
            message_tally: Some(tally),
        };
        let written = File::create(path).and_then(|mut file| kv.render(&stats, &mut file));
        if let Err(error) = written {
            warn!(path = %path.display(), %error, "could not write the report file");
        }
    }

    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_quiet_run() {
        let args = RunnerArgs::try_parse_from(["testudo"]).expect("no arguments is valid");
        assert!(!args.fancy_log);
        assert!(!args.silent);
        assert_eq!(args.log_level, "warn");
        assert_eq!(args.results, Verbosity::Summary);
        assert!(!args.leakwatch);
        assert!(!args.no_sighandle);
        assert_eq!(args.suite, None);
        assert_eq!(args.report_file, None);
        assert_eq!(args.core_dir, None);
    }

    #[test]
    fn every_flag_parses() {
        let args = RunnerArgs::try_parse_from([
            "testudo",
            "-c",
            "-s",
            "-v",
            "debug",
            "-R",
            "full",
            "--leakwatch",
            "--no-sighandle",
            "--suite",
            "math",
            "--report-file",
            "report.txt",
            "--core-dir",
            "/tmp/crashes",
        ])
        .expect("all flags are valid");
        assert!(args.fancy_log);
        assert!(args.silent);
        assert_eq!(args.log_level, "debug");
        assert_eq!(args.results, Verbosity::Full);
        assert!(args.leakwatch);
        assert!(args.no_sighandle);
        assert_eq!(args.suite.as_deref(), Some("math"));
        assert_eq!(args.report_file, Some(PathBuf::from("report.txt")));
        assert_eq!(args.core_dir, Some(PathBuf::from("/tmp/crashes")));
    }

    #[test]
    fn bogus_verbosity_is_rejected() {
        assert!(RunnerArgs::try_parse_from(["testudo", "-R", "loud"]).is_err());
    }

    #[test]
    fn overrides_flow_into_the_config() {
        let args = RunnerArgs::try_parse_from([
            "testudo",
            "--leakwatch",
            "--no-sighandle",
            "--core-dir",
            "/tmp/crashes",
        ])
        .expect("valid flags");
        let mut config = RunConfig::default();
        apply_overrides(&args, &mut config);
        assert!(config.leak_watch);
        assert!(!config.trap_signals);
        assert_eq!(config.core_dir, Some(PathBuf::from("/tmp/crashes")));

        // Absent flags leave the configuration alone.
        let args = RunnerArgs::try_parse_from(["testudo"]).expect("no arguments is valid");
        let mut config = RunConfig::default();
        config.leak_watch = true;
        apply_overrides(&args, &mut config);
        assert!(config.leak_watch);
        assert!(config.trap_signals);
    }
}
