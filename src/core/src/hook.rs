//! Installs and removes interception points.
//!
//! A patch is a short plan of word writes. Installation saves what each word
//! held, applies the plan in order and rolls back on any failure, so a
//! target is either fully patched or untouched. Restoring first checks that
//! every word still holds what the engine wrote and only then writes the
//! saved words back in reverse order.

mod memory;

use crate::art::{self, ArtLayout};
use crate::error::{Error, Result};
use crate::resolver::{HandleKind, SymbolHandle};
use log::{debug, info, warn};
use memory::{Protection, Width};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Patch {
    /// Point a dispatch slot at `replacement`.
    Slot { replacement: usize },
    /// Rebind a Java method to the JNI function `replacement`, entered
    /// through the runtime's generic JNI `trampoline`.
    ArtMethod { replacement: usize, trampoline: usize },
}

#[derive(Debug)]
struct SavedWord {
    addr: usize,
    width: Width,
    original: u64,
    written: u64,
    protection: Protection,
}

/// One installed interception point and everything needed to undo it.
pub struct HookRecord {
    handle: SymbolHandle,
    words: Vec<SavedWord>,
    original: usize,
    /// Clone of the patched `ArtMethod`, kept for the life of the process.
    _backup: Option<Box<[usize]>>,
    installed: AtomicBool,
}

impl std::fmt::Debug for HookRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRecord")
            .field("handle", &self.handle)
            .field("words", &self.words.len())
            .field("original", &format_args!("{:#x}", self.original))
            .field("installed", &self.is_installed())
            .finish()
    }
}

/// Why a restore left a record alone. Carries no heap data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RestoreFailure {
    Foreign { addr: usize, expected: u64, found: u64 },
    Protect(nix::errno::Errno),
}

impl HookRecord {
    pub fn handle(&self) -> &SymbolHandle {
        &self.handle
    }

    /// The preserved path to the original: the previous slot value, or the
    /// address of the backup `ArtMethod` (usable as a `jmethodID`).
    pub fn original(&self) -> usize {
        self.original
    }

    /// The original slot value as a callable.
    ///
    /// # Safety
    /// `F` must be a function pointer type matching the patched slot.
    pub unsafe fn original_fn<F: Copy>(&self) -> F {
        assert_eq!(size_of::<F>(), size_of::<usize>());
        unsafe { std::mem::transmute_copy(&self.original) }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    fn target(&self) -> String {
        self.handle.descriptor().to_string()
    }

    /// Undoes the patch without allocating or logging. Either every word is
    /// back to its original or, on failure, every word still holds what the
    /// engine wrote, so a later call can retry.
    pub(crate) fn restore_words(&self) -> std::result::Result<bool, RestoreFailure> {
        if !self.is_installed() {
            return Ok(false);
        }

        for word in &self.words {
            let found = unsafe { memory::load(word.addr, word.width) };
            if found != word.written {
                return Err(RestoreFailure::Foreign {
                    addr: word.addr,
                    expected: word.written,
                    found,
                });
            }
        }

        for (index, word) in self.words.iter().enumerate() {
            if let Err(errno) = word.protection.unlock() {
                relock(&self.words[..index]);
                return Err(RestoreFailure::Protect(errno));
            }
        }

        for (index, word) in self.words.iter().enumerate().rev() {
            let swapped = unsafe { memory::compare_exchange(word.addr, word.width, word.written, word.original) };

            if let Err(found) = swapped {
                // back to fully hooked, in install order
                for done in &self.words[index + 1..] {
                    let _ = unsafe { memory::compare_exchange(done.addr, done.width, done.original, done.written) };
                }

                relock(&self.words);
                return Err(RestoreFailure::Foreign {
                    addr: word.addr,
                    expected: word.written,
                    found,
                });
            }
        }

        relock(&self.words);
        self.installed.store(false, Ordering::Release);
        Ok(true)
    }
}

fn relock(words: &[SavedWord]) {
    for word in words {
        word.protection.relock();
    }
}

#[derive(Debug, Clone)]
pub enum InstallOutcome {
    Installed(Arc<HookRecord>),
    /// The handle was already hooked; nothing was written.
    AlreadyInstalled(Arc<HookRecord>),
}

impl InstallOutcome {
    pub fn record(&self) -> &Arc<HookRecord> {
        match self {
            InstallOutcome::Installed(record) | InstallOutcome::AlreadyInstalled(record) => record,
        }
    }

    pub fn into_record(self) -> Arc<HookRecord> {
        match self {
            InstallOutcome::Installed(record) | InstallOutcome::AlreadyInstalled(record) => record,
        }
    }
}

/// Counts from a restore pass over every record.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RestoreCounts {
    pub restored: usize,
    pub skipped: usize,
    pub failed: usize,
    /// An install was in flight or a lock was held elsewhere; a later pass
    /// has to finish the job.
    pub busy: bool,
}

#[derive(Default)]
pub struct HookEngine {
    /// Install order; restored in reverse.
    records: Mutex<Vec<Arc<HookRecord>>>,
    /// Patched address to the id of the handle owning it.
    patched: Mutex<HashMap<usize, u32>>,
    /// Set for good by teardown; refuses further installs.
    closed: AtomicBool,
    in_flight: AtomicUsize,
}

struct Plan {
    writes: Vec<(usize, Width, u64)>,
    original: usize,
    backup: Option<Box<[usize]>>,
}

impl HookEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `patch` on `handle`. Serialised per handle; a second install
    /// of an installed handle writes nothing.
    pub fn install(&self, handle: &SymbolHandle, patch: Patch) -> Result<InstallOutcome> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = scopeguard::guard((), |_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let mut slot = handle.record().lock();

        if self.is_closed() {
            return Err(Error::installation(handle.descriptor(), "engine closed by teardown"));
        }

        if let Some(record) = slot.as_ref().filter(|record| record.is_installed()) {
            debug!("{} already hooked", handle.descriptor());
            return Ok(InstallOutcome::AlreadyInstalled(record.clone()));
        }

        let target = handle.descriptor().to_string();

        if let Some(owner) = self.patched.lock().get(&handle.address())
            && *owner != handle.id()
        {
            return Err(Error::installation(target, format!("address already hooked by handle {owner}")));
        }

        let record = panic::catch_unwind(AssertUnwindSafe(|| self.apply(handle, patch)))
            .map_err(|_| Error::installation(&target, "panicked while patching"))??;

        let record = Arc::new(record);

        self.patched.lock().insert(handle.address(), handle.id());
        self.records.lock().push(record.clone());
        *slot = Some(record.clone());

        info!("hooked {target}");
        Ok(InstallOutcome::Installed(record))
    }

    /// Puts the target back exactly as it was before [`install`](Self::install).
    /// Refuses with `StateCorruptionRisk` if another layer re-patched it.
    pub fn restore(&self, record: &HookRecord) -> Result<()> {
        let _slot = record.handle.record().lock();

        match record.restore_words() {
            Ok(restored) => {
                if restored {
                    self.patched.lock().remove(&record.handle.address());
                    info!("restored {}", record.target());
                }
                Ok(())
            }
            Err(RestoreFailure::Foreign { addr, expected, found }) => Err(Error::StateCorruptionRisk {
                target: record.target(),
                address: addr,
                expected,
                found,
            }),
            Err(RestoreFailure::Protect(errno)) => Err(Error::installation(
                record.target(),
                format!("cannot unprotect for restore: {errno}"),
            )),
        }
    }

    /// Refuses every later install. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the engine and restores everything in reverse install order.
    /// Takes no blocking lock, allocates nothing and logs nothing. An
    /// install still in flight or a record locked elsewhere makes the pass
    /// `busy`; repeating it picks up what was left.
    pub fn restore_all(&self) -> RestoreCounts {
        let mut counts = RestoreCounts::default();

        self.close();
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            counts.busy = true;
        }

        let Some(records) = try_lock_bounded(&self.records) else {
            counts.busy = true;
            return counts;
        };

        for record in records.iter().rev() {
            let Some(_slot) = try_lock_bounded(record.handle.record()) else {
                counts.busy = true;
                continue;
            };

            match record.restore_words() {
                Ok(true) => counts.restored += 1,
                Ok(false) => counts.skipped += 1,
                Err(_) => counts.failed += 1,
            }
        }

        if let Some(mut patched) = self.patched.try_lock() {
            patched.retain(|_, id| {
                records
                    .iter()
                    .any(|record| record.handle.id() == *id && record.is_installed())
            });
        }

        counts
    }

    pub fn records(&self) -> Vec<Arc<HookRecord>> {
        self.records.lock().clone()
    }

    fn apply(&self, handle: &SymbolHandle, patch: Patch) -> Result<HookRecord> {
        let target = handle.descriptor().to_string();
        let plan = match (handle.kind(), patch) {
            (_, Patch::Slot { replacement: 0 }) | (_, Patch::ArtMethod { replacement: 0, .. }) => {
                return Err(Error::installation(target, "null replacement"));
            }
            (_, Patch::ArtMethod { trampoline: 0, .. }) => {
                return Err(Error::installation(target, "no JNI trampoline"));
            }
            (HandleKind::Slot, Patch::Slot { replacement }) => Self::plan_slot(&target, handle.address(), replacement)?,
            (HandleKind::ArtMethod(layout), Patch::ArtMethod { replacement, trampoline }) => {
                Self::plan_art_method(&target, handle.address(), layout, replacement, trampoline)?
            }
            (kind, patch) => {
                return Err(Error::installation(target, format!("{patch:?} does not fit a {kind:?} target")));
            }
        };

        let mut words = Vec::with_capacity(plan.writes.len());
        for (addr, width, value) in plan.writes {
            let protection = Protection::probe(&target, addr, width)?;
            let original = unsafe { memory::load(addr, width) };

            words.push(SavedWord {
                addr,
                width,
                original,
                written: value,
                protection,
            });
        }

        for (index, word) in words.iter().enumerate() {
            let outcome = word
                .protection
                .with_writable(|| unsafe { memory::compare_exchange(word.addr, word.width, word.original, word.written) });

            let failure = match outcome {
                Ok(Ok(_)) => continue,
                Ok(Err(found)) => format!("{:#x} changed underneath to {found:#x}", word.addr),
                Err(errno) => format!("cannot make {:#x} writable: {errno}", word.addr),
            };

            Self::roll_back(&words[..index]);
            return Err(Error::installation(target, failure));
        }

        Ok(HookRecord {
            handle: handle.clone(),
            words,
            original: plan.original,
            _backup: plan.backup,
            installed: AtomicBool::new(true),
        })
    }

    fn roll_back(applied: &[SavedWord]) {
        for word in applied.iter().rev() {
            let undone = word.protection.with_writable(|| unsafe {
                memory::compare_exchange(word.addr, word.width, word.written, word.original)
            });

            if !matches!(undone, Ok(Ok(_))) {
                warn!("rollback of {:#x} failed: {undone:?}", word.addr);
            }
        }
    }

    fn plan_slot(target: &str, addr: usize, replacement: usize) -> Result<Plan> {
        Protection::probe(target, addr, Width::Word)?;

        Ok(Plan {
            writes: vec![(addr, Width::Word, replacement as u64)],
            original: unsafe { memory::load(addr, Width::Word) } as usize,
            backup: None,
        })
    }

    fn plan_art_method(
        target: &str,
        method: usize,
        layout: ArtLayout,
        replacement: usize,
        trampoline: usize,
    ) -> Result<Plan> {
        let flags_addr = method + art::ACCESS_FLAGS_OFFSET;
        Protection::probe(target, flags_addr, Width::U32)?;
        Protection::probe(target, method + layout.entry_point_offset(), Width::Word)?;

        let flags = unsafe { memory::load(flags_addr, Width::U32) } as u32;
        if flags & art::ACC_NATIVE != 0 {
            return Err(Error::installation(target, "method is already native"));
        }

        let mut backup = vec![0usize; layout.size() / size_of::<usize>()].into_boxed_slice();
        unsafe {
            ptr::copy_nonoverlapping(method as *const u8, backup.as_mut_ptr() as *mut u8, layout.size());
            let backup_flags = (backup.as_mut_ptr() as *mut u8).add(art::ACCESS_FLAGS_OFFSET) as *mut u32;
            backup_flags.write(art::backup_flags(flags));
        }

        Ok(Plan {
            writes: vec![
                (method + layout.data_offset(), Width::Word, replacement as u64),
                (flags_addr, Width::U32, art::native_flags(flags) as u64),
                (method + layout.entry_point_offset(), Width::Word, trampoline as u64),
            ],
            original: backup.as_ptr() as usize,
            backup: Some(backup),
        })
    }
}

fn try_lock_bounded<T>(mutex: &Mutex<T>) -> Option<parking_lot::MutexGuard<'_, T>> {
    for _ in 0..1024 {
        if let Some(guard) = mutex.try_lock() {
            return Some(guard);
        }
        std::hint::spin_loop();
    }
    None
}

#[cfg(test)]
mod tests;
