use crate::hook::RestoreCounts;
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Display for TeardownReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} restored, {} skipped, {} failed",
            self.restored, self.skipped, self.failed
        )
    }
}

/// Lets exactly one caller run teardown and remembers its outcome for the
/// others. Lock-free and allocation-free.
#[derive(Debug, Default)]
pub struct TeardownGate {
    started: AtomicBool,
    finished: AtomicBool,
    restored: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
}

impl TeardownGate {
    pub const fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            restored: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Runs `restore` unless a teardown already ran. A restore that found the
    /// engine busy reopens the gate so a later call can retry.
    pub fn run<F: FnOnce() -> RestoreCounts>(&self, restore: F) -> TeardownReport {
        if self.started.swap(true, Ordering::AcqRel) {
            return self.report();
        }

        let counts = restore();

        if counts.busy {
            self.started.store(false, Ordering::Release);
            return TeardownReport::default();
        }

        self.restored.store(counts.restored, Ordering::Relaxed);
        self.skipped.store(counts.skipped, Ordering::Relaxed);
        self.failed.store(counts.failed, Ordering::Relaxed);
        self.finished.store(true, Ordering::Release);

        self.report()
    }

    /// The outcome of the teardown that ran; empty while it is in progress.
    pub fn report(&self) -> TeardownReport {
        if !self.finished.load(Ordering::Acquire) {
            return TeardownReport::default();
        }

        TeardownReport {
            restored: self.restored.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

mod system {
    use std::ffi::c_int;

    unsafe extern "C" {
        pub fn atexit(callback: extern "C" fn()) -> c_int;
    }
}

/// Registers `callback` to run on normal process exit.
pub fn at_exit(callback: extern "C" fn()) -> std::io::Result<()> {
    match unsafe { system::atexit(callback) } {
        0 => Ok(()),
        _ => Err(std::io::Error::other("atexit registration failed")),
    }
}
