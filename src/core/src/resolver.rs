mod elf;
mod native;

pub use elf::ElfImage;
pub use native::ProcessLookup;

use crate::art::ArtLayout;
use crate::error::{Error, Result};
use crate::hook::HookRecord;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// What to look for. Names and signatures only, never offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SymbolDescriptor {
    /// A symbol of a shared library. `slot_offset` selects a pointer slot
    /// inside the symbol, e.g. one entry of a vtable.
    Native {
        library: String,
        symbol: String,
        slot_offset: usize,
    },
    /// A Java method, in JNI notation (`android/location/Location`, `()D`).
    Managed {
        class: String,
        method: String,
        signature: String,
        is_static: bool,
    },
}

impl SymbolDescriptor {
    pub fn native<L: Into<String>, S: Into<String>>(library: L, symbol: S) -> Self {
        SymbolDescriptor::Native {
            library: library.into(),
            symbol: symbol.into(),
            slot_offset: 0,
        }
    }

    pub fn managed<C, M, S>(class: C, method: M, signature: S) -> Self
    where
        C: Into<String>,
        M: Into<String>,
        S: Into<String>,
    {
        SymbolDescriptor::Managed {
            class: class.into(),
            method: method.into(),
            signature: signature.into(),
            is_static: false,
        }
    }

    pub fn with_slot_offset(mut self, offset: usize) -> Self {
        if let SymbolDescriptor::Native { slot_offset, .. } = &mut self {
            *slot_offset = offset;
        }
        self
    }

    pub fn library(&self) -> Option<&str> {
        match self {
            SymbolDescriptor::Native { library, .. } => Some(library),
            SymbolDescriptor::Managed { .. } => None,
        }
    }
}

impl Display for SymbolDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SymbolDescriptor::Native {
                library,
                symbol,
                slot_offset: 0,
            } => write!(f, "{library}!{symbol}"),
            SymbolDescriptor::Native {
                library,
                symbol,
                slot_offset,
            } => write!(f, "{library}!{symbol}+{slot_offset:#x}"),
            SymbolDescriptor::Managed {
                class,
                method,
                signature,
                ..
            } => write!(f, "{class}.{method}{signature}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Abi {
    Arm64,
    Arm,
    X86_64,
    X86,
}

impl Abi {
    pub const fn current() -> Self {
        if cfg!(target_arch = "aarch64") {
            Abi::Arm64
        } else if cfg!(target_arch = "arm") {
            Abi::Arm
        } else if cfg!(target_arch = "x86") {
            Abi::X86
        } else {
            Abi::X86_64
        }
    }
}

/// How the engine has to patch the target a handle designates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleKind {
    /// A pointer-sized dispatch slot.
    Slot,
    /// An `ArtMethod` with the given layout.
    ArtMethod(ArtLayout),
}

struct HandleInner {
    id: u32,
    descriptor: SymbolDescriptor,
    address: usize,
    abi: Abi,
    kind: HandleKind,
    record: Mutex<Option<Arc<HookRecord>>>,
}

/// A resolved interception point of this process. Cheap to clone; clones
/// share the install lock.
#[derive(Clone)]
pub struct SymbolHandle(Arc<HandleInner>);

impl SymbolHandle {
    fn new(id: u32, descriptor: SymbolDescriptor, address: usize, kind: HandleKind) -> Self {
        Self(Arc::new(HandleInner {
            id,
            descriptor,
            address,
            abi: Abi::current(),
            kind,
            record: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> u32 {
        self.0.id
    }

    pub fn descriptor(&self) -> &SymbolDescriptor {
        &self.0.descriptor
    }

    pub fn abi(&self) -> Abi {
        self.0.abi
    }

    pub fn kind(&self) -> HandleKind {
        self.0.kind
    }

    pub(crate) fn address(&self) -> usize {
        self.0.address
    }

    /// Held for the whole of an install; holds the record once installed.
    pub(crate) fn record(&self) -> &Mutex<Option<Arc<HookRecord>>> {
        &self.0.record
    }
}

impl fmt::Debug for SymbolHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolHandle")
            .field("id", &self.0.id)
            .field("descriptor", &self.0.descriptor.to_string())
            .field("abi", &self.0.abi)
            .field("kind", &self.0.kind)
            .finish()
    }
}

impl PartialEq for SymbolHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SymbolHandle {}

/// Finds native symbols in this process.
pub trait NativeLookup: Send + Sync {
    fn is_loaded(&self, library: &str) -> bool;

    fn lookup(&self, library: &str, symbol: &str) -> Option<usize>;
}

impl<T: NativeLookup + ?Sized> NativeLookup for Box<T> {
    fn is_loaded(&self, library: &str) -> bool {
        (**self).is_loaded(library)
    }

    fn lookup(&self, library: &str, symbol: &str) -> Option<usize> {
        (**self).lookup(library, symbol)
    }
}

/// Finds Java methods; returns the `ArtMethod` address (a `jmethodID`).
pub trait MethodLookup {
    fn lookup_method(&self, class: &str, method: &str, signature: &str, is_static: bool) -> Option<usize>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempts: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempts.min(16))
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub enum Resolution {
    Resolved(SymbolHandle),
    /// The library is not mapped yet; retried on load notification or backoff.
    Deferred,
    Failed(Error),
}

impl Resolution {
    pub fn handle(self) -> Option<SymbolHandle> {
        match self {
            Resolution::Resolved(handle) => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeferredProgress {
    pub resolved: Vec<SymbolHandle>,
    pub failed: Vec<Error>,
}

impl DeferredProgress {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.failed.is_empty()
    }
}

/// Handle ids are unique across resolvers so the engine can tell apart two
/// handles aimed at one address.
static NEXT_HANDLE_ID: AtomicU32 = AtomicU32::new(1);

struct Pending {
    descriptor: SymbolDescriptor,
    attempts: u32,
    due: Instant,
}

pub struct SymbolResolver<N = ProcessLookup> {
    native: N,
    art_layout: ArtLayout,
    policy: RetryPolicy,
    resolved: Mutex<HashMap<SymbolDescriptor, SymbolHandle>>,
    pending: Mutex<Vec<Pending>>,
}

impl<N: NativeLookup> SymbolResolver<N> {
    pub fn new(native: N) -> Self {
        Self {
            native,
            art_layout: ArtLayout::default(),
            policy: RetryPolicy::default(),
            resolved: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_art_layout(mut self, layout: ArtLayout) -> Self {
        self.art_layout = layout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn art_layout(&self) -> ArtLayout {
        self.art_layout
    }

    /// Resolves one descriptor. Managed descriptors need `methods`; native
    /// ones whose library is not mapped yet are parked.
    pub fn resolve(&self, descriptor: &SymbolDescriptor, methods: Option<&dyn MethodLookup>) -> Resolution {
        if let Some(handle) = self.resolved.lock().get(descriptor) {
            return Resolution::Resolved(handle.clone());
        }

        let resolution = match descriptor {
            SymbolDescriptor::Native { library, .. } if !self.native.is_loaded(library) => {
                self.park(descriptor, Instant::now());
                return Resolution::Deferred;
            }
            SymbolDescriptor::Native { .. } => self.resolve_native(descriptor),
            SymbolDescriptor::Managed {
                class,
                method,
                signature,
                is_static,
            } => match methods {
                None => Err(Error::resolution(descriptor, "no method lookup available")),
                Some(methods) => methods
                    .lookup_method(class, method, signature, *is_static)
                    .filter(|&address| address != 0)
                    .map(|address| self.handle(descriptor, address, HandleKind::ArtMethod(self.art_layout)))
                    .ok_or_else(|| Error::resolution(descriptor, "no such method")),
            },
        };

        match resolution {
            Ok(handle) => Resolution::Resolved(handle),
            Err(err) => {
                debug!("{err}");
                Resolution::Failed(err)
            }
        }
    }

    /// Plain address of a native symbol, for values the engine needs but
    /// never patches.
    pub fn resolve_address(&self, descriptor: &SymbolDescriptor) -> Result<usize> {
        match descriptor {
            SymbolDescriptor::Native {
                library,
                symbol,
                slot_offset,
            } => self
                .native
                .lookup(library, symbol)
                .map(|address| address + slot_offset)
                .ok_or_else(|| Error::resolution(descriptor, "symbol not found")),
            SymbolDescriptor::Managed { .. } => Err(Error::resolution(descriptor, "not a native symbol")),
        }
    }

    /// Retries every parked descriptor of `library` right away.
    pub fn notify_library_loaded(&self, library: &str) -> DeferredProgress {
        let now = Instant::now();
        self.drain(|pending| pending.descriptor.library() == Some(library), now, false)
    }

    /// Retries parked descriptors whose backoff elapsed.
    pub fn poll_deferred(&self, now: Instant) -> DeferredProgress {
        self.drain(|pending| pending.due <= now, now, true)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn drain<F>(&self, mut ready: F, now: Instant, count_attempt: bool) -> DeferredProgress
    where
        F: FnMut(&Pending) -> bool,
    {
        let mut progress = DeferredProgress::default();
        let mut pending = self.pending.lock();

        pending.retain_mut(|entry| {
            if !ready(entry) {
                return true;
            }

            let library = entry.descriptor.library().unwrap_or_default();
            if self.native.is_loaded(library) {
                match self.resolve_native(&entry.descriptor) {
                    Ok(handle) => {
                        info!("deferred symbol resolved: {}", entry.descriptor);
                        progress.resolved.push(handle);
                    }
                    Err(err) => progress.failed.push(err),
                }
                return false;
            }

            if count_attempt {
                entry.attempts += 1;
            }

            if entry.attempts >= self.policy.max_attempts {
                warn!("giving up on {}: library never loaded", entry.descriptor);
                progress
                    .failed
                    .push(Error::resolution(&entry.descriptor, "library never loaded"));
                return false;
            }

            entry.due = now + self.policy.delay(entry.attempts);
            true
        });

        progress
    }

    fn park(&self, descriptor: &SymbolDescriptor, now: Instant) {
        let mut pending = self.pending.lock();

        if pending.iter().any(|entry| entry.descriptor == *descriptor) {
            return;
        }

        debug!("deferring {descriptor}: library not loaded");
        pending.push(Pending {
            descriptor: descriptor.clone(),
            attempts: 0,
            due: now + self.policy.delay(0),
        });
    }

    fn resolve_native(&self, descriptor: &SymbolDescriptor) -> Result<SymbolHandle> {
        let address = self.resolve_address(descriptor)?;
        Ok(self.handle(descriptor, address, HandleKind::Slot))
    }

    fn handle(&self, descriptor: &SymbolDescriptor, address: usize, kind: HandleKind) -> SymbolHandle {
        self.resolved
            .lock()
            .entry(descriptor.clone())
            .or_insert_with(|| {
                let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
                SymbolHandle::new(id, descriptor.clone(), address, kind)
            })
            .clone()
    }
}

#[cfg(test)]
mod tests;
