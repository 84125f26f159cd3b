//! Signal trapping and the one-shot case context, glibc flavor.
//!
//! The case body runs on its own `mmap`ed stack behind a `swapcontext`
//! switch. A clean body returns through `uc_link`; a trapped signal jumps
//! back through `setcontext` from the handler, which also restores the
//! signal mask the suite stack was saved with, so the next case can trap the
//! same signal again. The handler itself only reads the fault registers,
//! walks the case stack into a static buffer, and leaves. No allocation, no
//! locks, no formatting.

use std::cell::{Cell, UnsafeCell};
use std::io;
use std::mem::MaybeUninit;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use testudo_trace::walk_frame_chain;
use tracing::{debug, error};

use super::{FaultReport, IsolationError, IsolationOutcome};
use crate::context::CaseResult;

/// Frames the handler can record; deeper chains are cut off.
const FAULT_TRACE_DEPTH: usize = 128;

const SIGNAL_STACK_SIZE: usize = 64 * 1024;

const TRAPPED_SIGNALS: [libc::c_int; 3] = [libc::SIGSEGV, libc::SIGBUS, libc::SIGABRT];

/// Shared between `execute` and the signal handler. The run gate serializes
/// case execution and the trapped signals are delivered synchronously to the
/// faulting thread, so all access is effectively single-threaded; relaxed
/// atomics are enough.
struct TrapState {
    armed: AtomicBool,
    signal: AtomicI32,
    frame_count: AtomicUsize,
    frames: UnsafeCell<[usize; FAULT_TRACE_DEPTH]>,
    /// Filled by `swapcontext` on the way into the case context.
    resume: UnsafeCell<MaybeUninit<libc::ucontext_t>>,
    stack_low: AtomicUsize,
    stack_high: AtomicUsize,
}

// SAFETY: see the struct docs; the run gate keeps the cells single-threaded.
unsafe impl Sync for TrapState {}

static TRAP: TrapState = TrapState {
    armed: AtomicBool::new(false),
    signal: AtomicI32::new(0),
    frame_count: AtomicUsize::new(0),
    frames: UnsafeCell::new([0; FAULT_TRACE_DEPTH]),
    resume: UnsafeCell::new(MaybeUninit::uninit()),
    stack_low: AtomicUsize::new(0),
    stack_high: AtomicUsize::new(0),
};

/// Address of a `*mut dyn FnMut()` sitting on the suite stack. `makecontext`
/// only passes integer arguments portably, so the trampoline picks the body
/// up from here instead.
static CASE_BODY: AtomicUsize = AtomicUsize::new(0);

/// Set by the first failed handler installation so the error logs once.
static TRAP_INSTALL_FAILED: AtomicBool = AtomicBool::new(false);

pub(super) fn execute(
    stack_size: usize,
    body: &mut dyn FnMut(),
) -> Result<IsolationOutcome, IsolationError> {
    ensure_signal_stack()?;
    let stack = CaseStack::allocate(stack_size)?;
    let _trap = match install_trap() {
        Ok(guard) => guard,
        Err(error) => {
            if !TRAP_INSTALL_FAILED.swap(true, Ordering::Relaxed) {
                error!(%error, "cannot install the signal trap, cases run unprotected");
            }
            body();
            return Ok(IsolationOutcome::Completed);
        }
    };

    let (low, high) = stack.bounds();
    TRAP.stack_low.store(low, Ordering::Relaxed);
    TRAP.stack_high.store(high, Ordering::Relaxed);

    // SAFETY: the contexts and the body pointer live on this frame, which
    // stays suspended while the case context runs; the run gate keeps the
    // static state ours alone.
    unsafe {
        let resume = TRAP.resume.get();
        let mut case_ctx: libc::ucontext_t = std::mem::zeroed();
        if libc::getcontext(&mut case_ctx) != 0 {
            return Err(IsolationError::ContextCapture);
        }
        case_ctx.uc_stack = libc::stack_t {
            ss_sp: stack.usable_base as *mut libc::c_void,
            ss_flags: 0,
            ss_size: stack.usable,
        };
        case_ctx.uc_link = (*resume).as_mut_ptr();

        let mut body_ptr: *mut (dyn FnMut() + '_) = body;
        CASE_BODY.store(&raw mut body_ptr as usize, Ordering::Relaxed);

        libc::makecontext(&mut case_ctx, trampoline, 0);

        TRAP.armed.store(true, Ordering::Relaxed);
        let rc = libc::swapcontext((*resume).as_mut_ptr(), &case_ctx);
        TRAP.armed.store(false, Ordering::Relaxed);
        CASE_BODY.store(0, Ordering::Relaxed);
        if rc != 0 {
            TRAP.signal.store(0, Ordering::Relaxed);
            return Err(IsolationError::ContextSwitch);
        }
    }

    let signal = TRAP.signal.swap(0, Ordering::Relaxed);
    if signal == 0 {
        return Ok(IsolationOutcome::Completed);
    }

    let count = TRAP
        .frame_count
        .load(Ordering::Relaxed)
        .min(FAULT_TRACE_DEPTH);
    // SAFETY: the handler finished with the buffer before it jumped back.
    let frames =
        testudo_leakwatch::unwatched(|| unsafe { (&(*TRAP.frames.get()))[..count].to_vec() });
    let (result, signal_name) = classify(signal);
    Ok(IsolationOutcome::Fault(FaultReport {
        result,
        signal_name,
        signal,
        frames,
    }))
}

/// Entry point of the case context.
extern "C" fn trampoline() {
    let slot = CASE_BODY.swap(0, Ordering::Relaxed);
    if slot == 0 {
        return;
    }
    let body_ptr = slot as *mut *mut (dyn FnMut() + 'static);
    // SAFETY: `execute` parked this pointer for exactly this call and its
    // frame outlives the case context.
    let body = unsafe { &mut **body_ptr };

    // Unwinding off the bottom of a `makecontext` frame is undefined; a
    // panic that made it this far (the phases catch their own) becomes an
    // abort, which the trap turns into a result.
    if catch_unwind(AssertUnwindSafe(body)).is_err() {
        std::process::abort();
    }
}

extern "C" fn trap_handler(
    sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    if !TRAP.armed.swap(false, Ordering::Relaxed) {
        // Not ours, or a second fault inside the handler: fall back to the
        // default disposition so the process dies with a real core dump.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
        return;
    }

    let (ip, fp) = fault_registers(ctx);
    let low = TRAP.stack_low.load(Ordering::Relaxed);
    let high = TRAP.stack_high.load(Ordering::Relaxed);

    // SAFETY: exclusive access per the TrapState contract; the bounded walk
    // never reads outside the case stack.
    unsafe {
        let frames = &mut *TRAP.frames.get();
        let mut count = 0;
        if ip != 0 {
            frames[0] = ip;
            count = 1;
        }
        count += walk_frame_chain(fp, &mut frames[count..], Some((low, high)));
        TRAP.frame_count.store(count, Ordering::Relaxed);
        TRAP.signal.store(sig, Ordering::Relaxed);

        // Back to the suite stack. Unlike a longjmp this also restores the
        // signal mask `swapcontext` saved, so `sig` is deliverable again.
        libc::setcontext((*TRAP.resume.get()).as_ptr());
    }
    // setcontext only returns on failure, and then nothing here is safe.
    std::process::abort();
}

fn classify(signal: i32) -> (CaseResult, &'static str) {
    match signal {
        libc::SIGSEGV => (CaseResult::SegFault, "SIGSEGV"),
        libc::SIGBUS => (CaseResult::SegFault, "SIGBUS"),
        libc::SIGABRT => (CaseResult::Aborted, "SIGABRT"),
        _ => (CaseResult::InternalError, "unexpected signal"),
    }
}

#[cfg(target_arch = "x86_64")]
fn fault_registers(ctx: *mut libc::c_void) -> (usize, usize) {
    if ctx.is_null() {
        return (0, 0);
    }
    // SAFETY: with SA_SIGINFO the third handler argument is the ucontext_t
    // of the interrupted thread.
    unsafe {
        let ctx = &*(ctx as *const libc::ucontext_t);
        let ip = ctx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
        let fp = ctx.uc_mcontext.gregs[libc::REG_RBP as usize] as usize;
        (ip, fp)
    }
}

#[cfg(target_arch = "aarch64")]
fn fault_registers(ctx: *mut libc::c_void) -> (usize, usize) {
    if ctx.is_null() {
        return (0, 0);
    }
    // SAFETY: with SA_SIGINFO the third handler argument is the ucontext_t
    // of the interrupted thread.
    unsafe {
        let ctx = &*(ctx as *const libc::ucontext_t);
        (ctx.uc_mcontext.pc as usize, ctx.uc_mcontext.regs[29] as usize)
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn fault_registers(_ctx: *mut libc::c_void) -> (usize, usize) {
    (0, 0)
}

/// Saved dispositions for the trapped signals; restored on drop. A partial
/// install restores only the handlers it got in.
struct TrapGuard {
    saved: [(libc::c_int, libc::sigaction); 3],
    installed: usize,
}

fn install_trap() -> io::Result<TrapGuard> {
    // SAFETY: standard sigaction installation; the previous actions are
    // saved and the guard puts them back.
    unsafe {
        let mut guard = TrapGuard {
            saved: std::mem::zeroed(),
            installed: 0,
        };
        for &sig in &TRAPPED_SIGNALS {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = trap_handler as *const () as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            libc::sigemptyset(&mut sa.sa_mask);
            let mut old: libc::sigaction = std::mem::zeroed();
            if libc::sigaction(sig, &sa, &mut old) != 0 {
                return Err(io::Error::last_os_error());
            }
            guard.saved[guard.installed] = (sig, old);
            guard.installed += 1;
        }
        Ok(guard)
    }
}

impl Drop for TrapGuard {
    fn drop(&mut self) {
        for (sig, old) in self.saved[..self.installed].iter().rev() {
            // SAFETY: restoring the action captured at installation.
            unsafe {
                libc::sigaction(*sig, old, std::ptr::null_mut());
            }
        }
    }
}

/// The case body's stack: an anonymous mapping with a `PROT_NONE` guard
/// region below it, so running off the end faults cleanly instead of
/// trampling whatever the kernel placed next door.
struct CaseStack {
    base: *mut libc::c_void,
    total: usize,
    usable_base: *mut u8,
    usable: usize,
}

impl CaseStack {
    fn allocate(requested: usize) -> Result<CaseStack, IsolationError> {
        let page = page_size();
        // Sixteen guard pages: large stack frames can step over a single
        // page without touching it.
        let guard = 16 * page;
        let usable = requested.max(page).next_multiple_of(page);
        let total = usable + guard;
        // SAFETY: fresh anonymous mapping; the guard is carved out of it.
        unsafe {
            let base = libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(IsolationError::StackAllocation(io::Error::last_os_error()));
            }
            if libc::mprotect(base, guard, libc::PROT_NONE) != 0 {
                let error = io::Error::last_os_error();
                libc::munmap(base, total);
                return Err(IsolationError::StackAllocation(error));
            }
            Ok(CaseStack {
                base,
                total,
                usable_base: (base as *mut u8).add(guard),
                usable,
            })
        }
    }

    fn bounds(&self) -> (usize, usize) {
        let low = self.usable_base as usize;
        (low, low + self.usable)
    }
}

impl Drop for CaseStack {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact mapping from `allocate`.
        if unsafe { libc::munmap(self.base, self.total) } != 0 {
            debug!(error = %io::Error::last_os_error(), "case stack unmap failed");
        }
    }
}

fn page_size() -> usize {
    // SAFETY: plain sysconf query.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 { raw as usize } else { 4096 }
}

thread_local! {
    static SIGNAL_STACK_READY: Cell<bool> = const { Cell::new(false) };
}

/// Installs a per-thread alternate stack so the handler has somewhere to run
/// when the fault is a stack overflow. The buffer stays installed for the
/// thread's whole life.
fn ensure_signal_stack() -> Result<(), IsolationError> {
    if SIGNAL_STACK_READY.with(Cell::get) {
        return Ok(());
    }
    let stack = testudo_leakwatch::unwatched(|| {
        Box::leak(vec![0u8; SIGNAL_STACK_SIZE].into_boxed_slice())
    });
    let descriptor = libc::stack_t {
        ss_sp: stack.as_mut_ptr() as *mut libc::c_void,
        ss_flags: 0,
        ss_size: SIGNAL_STACK_SIZE,
    };
    // SAFETY: the leaked buffer outlives every handler run on this thread.
    if unsafe { libc::sigaltstack(&descriptor, std::ptr::null_mut()) } != 0 {
        return Err(IsolationError::SignalStack(io::Error::last_os_error()));
    }
    SIGNAL_STACK_READY.with(|ready| ready.set(true));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(stack_size: usize, body: &mut dyn FnMut()) -> IsolationOutcome {
        execute(stack_size, body).expect("isolation machinery works")
    }

    #[test]
    fn clean_bodies_come_back_completed() {
        let _gate = super::super::RUN_GATE.lock();
        let mut hits = 0;
        let outcome = run(256 * 1024, &mut || hits += 1);
        assert!(matches!(outcome, IsolationOutcome::Completed));
        assert_eq!(hits, 1);

        // The same thread can go again.
        let outcome = run(256 * 1024, &mut || hits += 1);
        assert!(matches!(outcome, IsolationOutcome::Completed));
        assert_eq!(hits, 2);
    }

    #[test]
    fn null_write_is_trapped_and_classified() {
        let _gate = super::super::RUN_GATE.lock();
        let outcome = run(256 * 1024, &mut || {
            // SAFETY: not safe at all; that is the point.
            unsafe { std::ptr::null_mut::<u8>().write_volatile(1) };
        });
        let IsolationOutcome::Fault(report) = outcome else {
            panic!("expected a fault");
        };
        assert_eq!(report.result, CaseResult::SegFault);
        assert_eq!(report.signal_name, "SIGSEGV");
        assert_eq!(report.signal, libc::SIGSEGV);
        assert!(!report.frames.is_empty());
    }

    #[test]
    fn abort_is_trapped_and_classified() {
        let _gate = super::super::RUN_GATE.lock();
        let outcome = run(256 * 1024, &mut || std::process::abort());
        let IsolationOutcome::Fault(report) = outcome else {
            panic!("expected a fault");
        };
        assert_eq!(report.result, CaseResult::Aborted);
        assert_eq!(report.signal_name, "SIGABRT");
    }

    #[test]
    fn faults_keep_later_runs_working() {
        let _gate = super::super::RUN_GATE.lock();
        for _ in 0..3 {
            let outcome = run(256 * 1024, &mut || {
                // SAFETY: deliberate wild write.
                unsafe { std::ptr::null_mut::<u8>().write_volatile(1) };
            });
            assert!(matches!(outcome, IsolationOutcome::Fault(_)));

            let mut ran = false;
            let outcome = run(256 * 1024, &mut || ran = true);
            assert!(matches!(outcome, IsolationOutcome::Completed));
            assert!(ran);
        }
    }
}
