//! Backtrace capture and symbolization for the test framework.
//!
//! A [`Backtrace`] is an immutable, cheaply clonable sequence of raw return
//! addresses, innermost first. Capture walks the frame-pointer chain so the
//! buffer variants stay allocation-free and callable from a signal handler;
//! resolving an address into names and source locations happens lazily, per
//! entry, against the dynamic loader and the module's debug info.
//!
//! ```no_run
//! let trace = testudo_trace::Backtrace::capture(0, 32);
//! trace.dump_to_log(tracing::Level::WARN);
//! ```

mod lines;
mod resolve;
mod walk;

pub use resolve::{BacktraceEntry, SourceLocation};
pub use walk::{
    MAX_DEPTH, collect_into, collect_return_addresses, frame_pointers_usable, walk_frame_chain,
};

use std::fmt;
use std::io;
use std::sync::Arc;

use tracing::warn;

#[doc(hidden)]
pub use tracing as __tracing;

/// Default capture depth for callers without a tighter bound.
pub const DEFAULT_DEPTH: usize = 256;

/// Emits a `tracing` event at a level chosen at runtime.
///
/// The stock event macros want a const level; dispatching here keeps
/// dynamic-priority output (leak reports, trace dumps) on the normal
/// subscriber path.
#[macro_export]
macro_rules! emit_at {
    ($level:expr, $($arg:tt)+) => {{
        let level: $crate::__tracing::Level = $level;
        if level == $crate::__tracing::Level::ERROR {
            $crate::__tracing::error!($($arg)+)
        } else if level == $crate::__tracing::Level::WARN {
            $crate::__tracing::warn!($($arg)+)
        } else if level == $crate::__tracing::Level::INFO {
            $crate::__tracing::info!($($arg)+)
        } else if level == $crate::__tracing::Level::DEBUG {
            $crate::__tracing::debug!($($arg)+)
        } else {
            $crate::__tracing::trace!($($arg)+)
        }
    }};
}

/// An immutable, shareable capture of raw return addresses.
///
/// Clones share the same frame payload; the capture is read-only for its
/// whole life, so one trace can sit in a leak-table entry, a log line, and
/// the runner's fault record at the same time.
#[derive(Clone)]
pub struct Backtrace {
    frames: Arc<[usize]>,
}

impl Backtrace {
    /// Captures the current call chain. Frame 0 is the caller of `capture`;
    /// `skip` drops additional frames from there, `max_depth` bounds the
    /// result (clamped to [`MAX_DEPTH`]).
    ///
    /// Never fails: if the walk sees nothing the trace comes back empty and
    /// a warning is logged, because capture usually runs while reporting
    /// some other error.
    #[inline(never)]
    pub fn capture(skip: usize, max_depth: usize) -> Backtrace {
        let depth = max_depth.min(MAX_DEPTH);
        if depth == 0 {
            return Backtrace::empty();
        }
        walk::frame_pointers_usable();
        // One extra frame covers this function itself.
        let ips = walk::collect_return_addresses(skip + 1, depth);
        if ips.is_empty() {
            warn!(skip, "stack walk produced no frames");
        }
        Backtrace { frames: ips.into() }
    }

    /// Wraps addresses collected elsewhere, e.g. a signal handler's buffer.
    pub fn from_raw(ips: &[usize]) -> Backtrace {
        Backtrace { frames: ips.into() }
    }

    pub fn empty() -> Backtrace {
        Backtrace {
            frames: Vec::new().into(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The raw return addresses, innermost first.
    pub fn frames(&self) -> &[usize] {
        &self.frames
    }

    /// Resolves one frame. Out-of-range indexes return `None`; addresses
    /// nothing can place resolve to the invalid-frame sentinel.
    pub fn resolve(&self, index: usize) -> Option<BacktraceEntry> {
        self.frames.get(index).map(|&ip| resolve::resolve_ip(ip))
    }

    pub fn resolve_all(&self) -> Vec<BacktraceEntry> {
        self.frames
            .iter()
            .map(|&ip| resolve::resolve_ip(ip))
            .collect()
    }

    /// Comma-joined function names, `???` where resolution failed. Compact
    /// enough to ride along as a log field.
    pub fn function_summary(&self) -> String {
        let entries = self.resolve_all();
        entries
            .iter()
            .map(|entry| entry.function.as_deref().unwrap_or("???"))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Logs every frame as one structured event at `level`.
    pub fn dump_to_log(&self, level: tracing::Level) {
        for (index, entry) in self.resolve_all().into_iter().enumerate() {
            emit_at!(
                level,
                frame = index,
                ip = format_args!("{:#x}", entry.ip),
                location = %entry,
                "stack frame"
            );
        }
    }

    /// Writes every frame as one line, resolved.
    pub fn dump_to_writer(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        for (index, entry) in self.resolve_all().into_iter().enumerate() {
            writeln!(writer, "  #{index:<2} {entry}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backtrace({} frames)", self.frames.len())
    }
}
