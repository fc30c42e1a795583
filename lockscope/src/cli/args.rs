//! CLI argument definitions

use crate::collection::CollectorConfig;
use crate::domain::ConfigError;
use crate::profiling::ContextOptions;
use clap::{Parser, Subcommand};
use lockscope_common::{DEFAULT_EXPECTED_PER_SECOND, DEFAULT_GRAB_INTERVAL_US, DEFAULT_MAX_PENDING_SAMPLES};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "lockscope",
    version,
    about = "Sampling mutex contention profiler",
    after_help = "\
EXAMPLES:
    lockscope demo                               20 threads, profile to contention.prof
    lockscope demo --threads 8 --hold-ms 5       Heavier contention on fewer threads
    lockscope report contention.prof             Top contention sites (binary from the profile)
    lockscope report out.prof --binary ./app     Symbolize against an explicit binary"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run threads contending on one profiled mutex and write a profile
    Demo(DemoArgs),
    /// Symbolize a contention profile and rank its call sites
    Report(ReportArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct DemoArgs {
    /// Threads contending on the mutex
    #[arg(long, default_value_t = 20)]
    pub threads: usize,

    /// Lock acquisitions per thread
    #[arg(long, default_value_t = 100)]
    pub iterations: usize,

    /// Time each acquisition holds the lock
    #[arg(long, default_value_t = 1)]
    pub hold_ms: u64,

    /// Profile output file
    #[arg(short, long, value_name = "FILE", default_value = "contention.prof")]
    pub output: PathBuf,

    /// Collector grab interval
    #[arg(long, default_value_t = DEFAULT_GRAB_INTERVAL_US / 1000)]
    pub grab_interval_ms: u64,

    /// Samples allowed in flight before new ones are dropped
    #[arg(long, default_value_t = DEFAULT_MAX_PENDING_SAMPLES)]
    pub max_pending: usize,

    /// Target sampled contentions per second
    #[arg(long, default_value_t = DEFAULT_EXPECTED_PER_SECOND)]
    pub expected_per_second: usize,

    /// Write run statistics as JSON
    #[arg(long, value_name = "FILE")]
    pub stats: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl DemoArgs {
    /// Validated context configuration from the flags.
    pub fn context_options(&self) -> Result<ContextOptions, ConfigError> {
        if self.expected_per_second == 0 {
            return Err(ConfigError::ZeroExpectedRate);
        }
        Ok(ContextOptions {
            collector: CollectorConfig::new(Duration::from_millis(self.grab_interval_ms), self.max_pending)?,
            expected_per_second: self.expected_per_second,
        })
    }

    #[must_use]
    pub fn hold(&self) -> Duration {
        Duration::from_millis(self.hold_ms)
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct ReportArgs {
    /// Profile written by `lockscope demo` or `ContentionContext::stop_profiler`
    #[arg(value_name = "PROFILE")]
    pub profile: PathBuf,

    /// Binary for symbol resolution (default: executable recorded in the profile)
    #[arg(short, long)]
    pub binary: Option<PathBuf>,

    /// Number of sites to show
    #[arg(long, default_value_t = 10)]
    pub top: usize,

    /// Print the full report as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_demo_defaults() {
        let args = Args::parse_from(["lockscope", "demo"]);
        let Command::Demo(demo) = args.command else { panic!("expected demo") };
        assert_eq!(demo.threads, 20);
        assert_eq!(demo.output, PathBuf::from("contention.prof"));
        let options = demo.context_options().unwrap();
        assert_eq!(options, ContextOptions::default());
    }

    #[test]
    fn test_invalid_demo_config_is_rejected() {
        let args = Args::parse_from(["lockscope", "demo", "--grab-interval-ms", "0"]);
        let Command::Demo(demo) = args.command else { panic!("expected demo") };
        assert_eq!(demo.context_options().unwrap_err(), ConfigError::ZeroGrabInterval);

        let args = Args::parse_from(["lockscope", "demo", "--expected-per-second", "0"]);
        let Command::Demo(demo) = args.command else { panic!("expected demo") };
        assert_eq!(demo.context_options().unwrap_err(), ConfigError::ZeroExpectedRate);
    }

    #[test]
    fn test_report_args() {
        let args = Args::parse_from(["lockscope", "report", "c.prof", "--binary", "./app", "--top", "3"]);
        let Command::Report(report) = args.command else { panic!("expected report") };
        assert_eq!(report.profile, PathBuf::from("c.prof"));
        assert_eq!(report.binary, Some(PathBuf::from("./app")));
        assert_eq!(report.top, 3);
        assert!(!report.json);
    }
}
