//! Word-sized patching of live memory.
//!
//! Every write is one aligned atomic store, so a concurrent reader sees
//! either the old or the new word. Nothing here allocates once a
//! [`Protection`] has been computed, which keeps the restore path usable
//! from exit handlers.

use crate::error::{Error, Result};
use crate::maps;
use log::debug;
use mockgps_misc::debug_on;
use nix::errno::Errno;
use nix::sys::mman::{ProtFlags, mprotect};
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Width {
    U32,
    Word,
}

impl Width {
    pub fn len(self) -> usize {
        match self {
            Width::U32 => size_of::<u32>(),
            Width::Word => size_of::<usize>(),
        }
    }
}

/// Protection of the pages under a target, captured before patching. At
/// install time pages that were writable need no `mprotect` round trip; by
/// restore time the capture may be stale, so restore always goes through
/// [`unlock`](Self::unlock).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Protection {
    page: usize,
    len: usize,
    prot: ProtFlags,
}

impl Protection {
    /// Checks that `[addr, addr + width)` is aligned, mapped and readable.
    pub fn probe(target: &str, addr: usize, width: Width) -> Result<Self> {
        if addr == 0 || addr % width.len() != 0 {
            return Err(Error::installation(target, format!("misaligned target {addr:#x}")));
        }

        let region = maps::region_of(addr, width.len())?
            .ok_or_else(|| Error::installation(target, format!("{addr:#x} is not mapped")))?;

        if debug_on!("maps") {
            debug!("{target}: {addr:#x} in {region:x?}");
        }

        if !region.readable() {
            return Err(Error::installation(target, format!("{addr:#x} is not readable")));
        }

        let page_size = procfs::page_size() as usize;
        let page = addr & !(page_size - 1);
        let end = (addr + width.len()).next_multiple_of(page_size);

        Ok(Self {
            page,
            len: end - page,
            prot: region.prot,
        })
    }

    fn writable(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_WRITE)
    }

    fn set(&self, prot: ProtFlags) -> nix::Result<()> {
        let page = NonNull::new(self.page as *mut c_void).ok_or(Errno::EFAULT)?;
        unsafe { mprotect(page, self.len, prot) }
    }

    /// Makes the pages writable whatever their protection is now.
    pub fn unlock(&self) -> nix::Result<()> {
        self.set(self.prot | ProtFlags::PROT_WRITE)
    }

    /// Puts the captured protection back after [`unlock`](Self::unlock).
    pub fn relock(&self) {
        let _ = self.set(self.prot);
    }

    /// Runs `f` with the pages writable, putting the captured protection back
    /// afterwards.
    pub fn with_writable<R, F: FnOnce() -> R>(&self, f: F) -> nix::Result<R> {
        if self.writable() {
            return Ok(f());
        }

        self.set(self.prot | ProtFlags::PROT_WRITE)?;
        let _restore = scopeguard::guard((), |_| {
            let _ = self.set(self.prot);
        });

        Ok(f())
    }
}

/// # Safety
/// `addr` must be aligned for `width` and readable.
pub unsafe fn load(addr: usize, width: Width) -> u64 {
    unsafe {
        match width {
            Width::U32 => (*(addr as *const AtomicU32)).load(Ordering::Acquire) as u64,
            Width::Word => (*(addr as *const AtomicUsize)).load(Ordering::Acquire) as u64,
        }
    }
}

/// Swaps `current` for `new`; on mismatch returns what the slot holds.
///
/// # Safety
/// `addr` must be aligned for `width` and writable.
pub unsafe fn compare_exchange(addr: usize, width: Width, current: u64, new: u64) -> std::result::Result<u64, u64> {
    unsafe {
        match width {
            Width::U32 => (*(addr as *const AtomicU32))
                .compare_exchange(current as u32, new as u32, Ordering::AcqRel, Ordering::Acquire)
                .map(u64::from)
                .map_err(u64::from),
            Width::Word => (*(addr as *const AtomicUsize))
                .compare_exchange(current as usize, new as usize, Ordering::AcqRel, Ordering::Acquire)
                .map(|it| it as u64)
                .map_err(|it| it as u64),
        }
    }
}
