use std::path::PathBuf;

/// Default size of the per-case stack. Matches the usual thread stack so a
/// case can recurse as deeply as it could outside the harness.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Run-wide behavior switches, owned by [`TestContext`](crate::TestContext).
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Trap fatal signals and run each case on a dedicated stack. Disabling
    /// this runs cases inline; a crashing case then takes the process down.
    pub trap_signals: bool,
    /// Track heap activity per case and report leaks. Requires the binary to
    /// install [`WatchAllocator`](testudo_leakwatch::WatchAllocator).
    pub leak_watch: bool,
    /// Size of the dedicated per-case stack, rounded up to whole pages.
    pub stack_size: usize,
    /// Directory receiving a `core.<suite>.<case>` artifact for every case
    /// that dies on a signal. `None` writes no artifacts.
    pub core_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            trap_signals: true,
            leak_watch: false,
            stack_size: DEFAULT_STACK_SIZE,
            core_dir: None,
        }
    }
}
