use super::*;
use crate::resolver::{MethodLookup, NativeLookup, SymbolDescriptor, SymbolResolver};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use std::ffi::c_void;
use std::fs::File;
use std::io::Write;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::thread;

type Getter = extern "C" fn(i32) -> i32;

extern "C" fn real_latitude(x: i32) -> i32 {
    x * 2
}

extern "C" fn fake_latitude(_: i32) -> i32 {
    4242
}

/// Every symbol of every "library" resolves to one fixed address.
struct At(usize);

impl NativeLookup for At {
    fn is_loaded(&self, _: &str) -> bool {
        true
    }

    fn lookup(&self, _: &str, _: &str) -> Option<usize> {
        Some(self.0)
    }
}

impl MethodLookup for At {
    fn lookup_method(&self, _: &str, _: &str, _: &str, _: bool) -> Option<usize> {
        Some(self.0)
    }
}

struct Table {
    slot: Box<AtomicUsize>,
}

impl Table {
    fn new() -> Self {
        Self {
            slot: Box::new(AtomicUsize::new(real_latitude as Getter as usize)),
        }
    }

    fn addr(&self) -> usize {
        &*self.slot as *const AtomicUsize as usize
    }

    fn call(&self, x: i32) -> i32 {
        let getter: Getter = unsafe { std::mem::transmute(self.slot.load(Ordering::Acquire)) };
        getter(x)
    }

    fn handle(&self, symbol: &str) -> SymbolHandle {
        SymbolResolver::new(At(self.addr()))
            .resolve(&SymbolDescriptor::native("libfake.so", symbol), None)
            .handle()
            .unwrap()
    }
}

fn replacement() -> Patch {
    Patch::Slot {
        replacement: fake_latitude as Getter as usize,
    }
}

#[test]
fn slot_hook_redirects_and_keeps_original_callable() {
    let table = Table::new();
    let engine = HookEngine::new();

    let record = engine.install(&table.handle("vtable"), replacement()).unwrap().into_record();

    assert_eq!(table.call(3), 4242);
    let original: Getter = unsafe { record.original_fn() };
    assert_eq!(original(3), 6);
}

#[test]
fn install_is_idempotent() {
    let table = Table::new();
    let engine = HookEngine::new();
    let handle = table.handle("vtable");

    let first = engine.install(&handle, replacement()).unwrap();
    let second = engine.install(&handle, replacement()).unwrap();

    assert!(matches!(first, InstallOutcome::Installed(_)));
    assert!(matches!(second, InstallOutcome::AlreadyInstalled(_)));
    assert!(Arc::ptr_eq(first.record(), second.record()));
    assert_eq!(engine.records().len(), 1);

    // the saved original is still the real function, not our replacement
    assert_eq!(second.record().original(), real_latitude as Getter as usize);
}

#[test]
fn concurrent_installs_patch_once() {
    let table = Table::new();
    let engine = HookEngine::new();
    let handle = table.handle("vtable");

    let outcomes: Vec<_> = thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| engine.install(&handle, replacement()).unwrap()))
            .collect();

        workers.into_iter().map(|worker| worker.join().unwrap()).collect()
    });

    let installed = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, InstallOutcome::Installed(_)))
        .count();

    assert_eq!(installed, 1);
    assert_eq!(engine.records().len(), 1);
}

#[test]
fn restore_is_bit_exact() {
    let table = Table::new();
    let before = table.slot.load(Ordering::Relaxed);
    let engine = HookEngine::new();

    let record = engine.install(&table.handle("vtable"), replacement()).unwrap().into_record();
    engine.restore(&record).unwrap();

    assert_eq!(table.slot.load(Ordering::Relaxed), before);
    assert_eq!(table.call(21), 42);
    assert!(!record.is_installed());

    // restoring twice is harmless
    engine.restore(&record).unwrap();
    assert_eq!(table.slot.load(Ordering::Relaxed), before);
}

#[test]
fn restore_refuses_foreign_patch() {
    let table = Table::new();
    let engine = HookEngine::new();

    let record = engine.install(&table.handle("vtable"), replacement()).unwrap().into_record();
    table.slot.store(0xdead_0000, Ordering::Relaxed);

    let err = engine.restore(&record).unwrap_err();
    assert!(matches!(err, Error::StateCorruptionRisk { found: 0xdead_0000, .. }));
    assert_eq!(table.slot.load(Ordering::Relaxed), 0xdead_0000);
    assert!(record.is_installed());
}

#[test]
fn reinstall_after_restore() {
    let table = Table::new();
    let engine = HookEngine::new();
    let handle = table.handle("vtable");

    let record = engine.install(&handle, replacement()).unwrap().into_record();
    engine.restore(&record).unwrap();

    let again = engine.install(&handle, replacement()).unwrap();
    assert!(matches!(again, InstallOutcome::Installed(_)));
    assert_eq!(table.call(1), 4242);
}

#[test]
fn second_handle_on_same_address_is_rejected() {
    let table = Table::new();
    let engine = HookEngine::new();

    engine.install(&table.handle("vtable"), replacement()).unwrap();
    let err = engine.install(&table.handle("alias"), replacement()).unwrap_err();

    assert!(matches!(err, Error::Installation { .. }));
    assert_eq!(engine.records().len(), 1);
}

#[test]
fn bad_targets_stay_unhooked() {
    let engine = HookEngine::new();

    let unmapped = SymbolResolver::new(At(0x10))
        .resolve(&SymbolDescriptor::native("libfake.so", "nowhere"), None)
        .handle()
        .unwrap();
    assert!(matches!(
        engine.install(&unmapped, replacement()),
        Err(Error::Installation { .. })
    ));

    let table = Table::new();
    let handle = table.handle("vtable");
    assert!(matches!(
        engine.install(&handle, Patch::Slot { replacement: 0 }),
        Err(Error::Installation { .. })
    ));
    assert!(matches!(
        engine.install(
            &handle,
            Patch::ArtMethod {
                replacement: 1,
                trampoline: 1
            }
        ),
        Err(Error::Installation { .. })
    ));

    assert_eq!(table.call(2), 4);
    assert!(engine.records().is_empty());
}

#[repr(C, align(8))]
#[derive(Clone, PartialEq, Debug)]
struct FakeArtMethod([u8; 48]);

impl FakeArtMethod {
    fn new(flags: u32) -> Box<Self> {
        let mut method = Box::new(FakeArtMethod([0x5a; 48]));
        method.0[4..8].copy_from_slice(&flags.to_ne_bytes());
        method
    }

    fn addr(&self) -> usize {
        self as *const _ as usize
    }

    fn flags(&self) -> u32 {
        u32::from_ne_bytes(self.0[4..8].try_into().unwrap())
    }

    fn word(&self, offset: usize) -> usize {
        usize::from_ne_bytes(self.0[offset..offset + size_of::<usize>()].try_into().unwrap())
    }

    fn handle(&self, layout: ArtLayout) -> SymbolHandle {
        art_handle(self.addr(), layout)
    }
}

fn art_handle(method: usize, layout: ArtLayout) -> SymbolHandle {
    let descriptor = SymbolDescriptor::managed("android/location/Location", "getLatitude", "()D");
    let lookup = At(method);

    SymbolResolver::new(At(0))
        .with_art_layout(layout)
        .resolve(&descriptor, Some(&lookup))
        .handle()
        .unwrap()
}

fn slot_handle(slot: usize) -> SymbolHandle {
    SymbolResolver::new(At(slot))
        .resolve(&SymbolDescriptor::native("libfake.so", "vtable"), None)
        .handle()
        .unwrap()
}

/// Private anonymous read-write pages, unmapped on drop.
struct Pages {
    base: NonNull<c_void>,
    len: usize,
}

impl Pages {
    fn page_size() -> usize {
        procfs::page_size() as usize
    }

    fn new(count: usize) -> Self {
        let len = count * Self::page_size();
        let base = unsafe {
            mman::mmap_anonymous(
                None,
                NonZeroUsize::new(len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
            .unwrap()
        };

        Self { base, len }
    }

    fn at(&self, offset: usize) -> usize {
        self.base.as_ptr() as usize + offset
    }

    fn bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(self.at(offset) as *const u8, len) }.to_vec()
    }

    fn protect(&self, page: usize, prot: ProtFlags) {
        let addr = NonNull::new(self.at(page * Self::page_size()) as *mut c_void).unwrap();
        unsafe { mman::mprotect(addr, Self::page_size(), prot).unwrap() };
    }

    /// Swaps `page` for a read-only shared view of a read-only file holding
    /// the same bytes. `mprotect` cannot make such a page writable.
    fn pin_read_only(&self, page: usize) -> tempfile::NamedTempFile {
        let offset = page * Self::page_size();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&self.bytes(offset, Self::page_size())).unwrap();
        file.flush().unwrap();

        let readonly = File::open(file.path()).unwrap();
        unsafe {
            mman::mmap(
                NonZeroUsize::new(self.at(offset)),
                NonZeroUsize::new(Self::page_size()).unwrap(),
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                &readonly,
                0,
            )
            .unwrap()
        };

        file
    }

    /// Undoes [`pin_read_only`](Self::pin_read_only), keeping the contents.
    fn unpin(&self, page: usize) {
        let offset = page * Self::page_size();
        let contents = self.bytes(offset, Self::page_size());

        unsafe {
            mman::mmap_anonymous(
                NonZeroUsize::new(self.at(offset)),
                NonZeroUsize::new(Self::page_size()).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_FIXED,
            )
            .unwrap();
            ptr::copy_nonoverlapping(contents.as_ptr(), self.at(offset) as *mut u8, contents.len());
        }
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        let _ = unsafe { mman::munmap(self.base, self.len) };
    }
}

const JNI_FUNCTION: usize = 0x1111_2220;
const TRAMPOLINE: usize = 0x3333_4440;

fn art_patch() -> Patch {
    Patch::ArtMethod {
        replacement: JNI_FUNCTION,
        trampoline: TRAMPOLINE,
    }
}

#[test]
fn art_method_becomes_native() {
    for layout in [ArtLayout::Compact, ArtLayout::Legacy] {
        let flags = 0x0001 | art::ACC_FAST_INTERPRETER_TO_INTERPRETER_INVOKE;
        let method = FakeArtMethod::new(flags);
        let engine = HookEngine::new();

        let record = engine.install(&method.handle(layout), art_patch()).unwrap().into_record();

        assert_eq!(method.flags(), 0x0001 | art::ACC_NATIVE);
        assert_eq!(method.word(layout.data_offset()), JNI_FUNCTION);
        assert_eq!(method.word(layout.entry_point_offset()), TRAMPOLINE);

        // the backup is the untouched method, marked for the interpreter
        let backup = record.original() as *const u8;
        let backup = unsafe { std::slice::from_raw_parts(backup, layout.size()) };
        assert_eq!(&backup[..4], &method.0[..4]);
        assert_eq!(
            u32::from_ne_bytes(backup[4..8].try_into().unwrap()),
            0x0001 | art::ACC_COMPILE_DONT_BOTHER
        );
        assert!(backup[8..].iter().all(|byte| *byte == 0x5a));
    }
}

#[test]
fn art_method_restore_is_bit_exact() {
    let method = FakeArtMethod::new(0x0001 | art::ACC_FAST_NATIVE);
    let before = method.as_ref().clone();
    let engine = HookEngine::new();

    let record = engine
        .install(&method.handle(ArtLayout::Compact), art_patch())
        .unwrap()
        .into_record();
    assert_ne!(*method, before);

    engine.restore(&record).unwrap();
    assert_eq!(*method, before);
}

#[test]
fn native_methods_are_not_rebound() {
    let method = FakeArtMethod::new(art::ACC_NATIVE);
    let before = method.as_ref().clone();
    let engine = HookEngine::new();

    let err = engine.install(&method.handle(ArtLayout::Compact), art_patch()).unwrap_err();

    assert!(matches!(err, Error::Installation { .. }));
    assert_eq!(*method, before);
}

#[test]
fn restore_all_unwinds_in_reverse() {
    let tables: Vec<_> = (0..3).map(|_| Table::new()).collect();
    let engine = HookEngine::new();

    let records: Vec<_> = tables
        .iter()
        .map(|table| engine.install(&table.handle("vtable"), replacement()).unwrap().into_record())
        .collect();

    // a foreign layer took over the middle slot
    tables[1].slot.store(0xbeef_0000, Ordering::Relaxed);

    let counts = engine.restore_all();
    assert_eq!(
        counts,
        RestoreCounts {
            restored: 2,
            skipped: 0,
            failed: 1,
            busy: false,
        }
    );

    assert_eq!(tables[0].call(5), 10);
    assert_eq!(tables[2].call(5), 10);
    assert!(records[1].is_installed());

    let again = engine.restore_all();
    assert_eq!(again.restored, 0);
    assert_eq!(again.skipped, 2);
    assert_eq!(engine.records().iter().filter(|record| record.is_installed()).count(), 1);
}

#[test]
fn restore_writes_through_page_protected_after_install() {
    let pages = Pages::new(1);
    let slot = pages.at(64);
    unsafe { (slot as *mut usize).write(real_latitude as Getter as usize) };
    let engine = HookEngine::new();

    let record = engine.install(&slot_handle(slot), replacement()).unwrap().into_record();
    assert_eq!(unsafe { memory::load(slot, memory::Width::Word) } as usize, fake_latitude as Getter as usize);

    // e.g. RELRO sealing the page after relocation
    pages.protect(0, ProtFlags::PROT_READ);

    engine.restore(&record).unwrap();
    assert_eq!(unsafe { memory::load(slot, memory::Width::Word) } as usize, real_latitude as Getter as usize);
    assert!(!record.is_installed());
}

#[test]
fn failed_restore_leaves_method_fully_hooked() {
    let layout = ArtLayout::Compact;
    let pages = Pages::new(2);

    // flags and data_ on the first page, entry point on the second
    let method = pages.at(Pages::page_size()) - layout.entry_point_offset();
    unsafe {
        ptr::write_bytes(method as *mut u8, 0x5a, layout.size());
        ((method + art::ACCESS_FLAGS_OFFSET) as *mut u32).write(0x0001);
    }
    let offset = method - pages.at(0);
    let before = pages.bytes(offset, layout.size());

    let engine = HookEngine::new();
    let record = engine.install(&art_handle(method, layout), art_patch()).unwrap().into_record();
    let hooked = pages.bytes(offset, layout.size());
    assert_ne!(hooked, before);

    let _file = pages.pin_read_only(0);

    for _ in 0..2 {
        assert!(matches!(engine.restore(&record), Err(Error::Installation { .. })));
        assert!(record.is_installed());
        assert_eq!(pages.bytes(offset, layout.size()), hooked);
    }

    pages.unpin(0);
    engine.restore(&record).unwrap();
    assert_eq!(pages.bytes(offset, layout.size()), before);
    assert!(!record.is_installed());
}

#[test]
fn restore_all_closes_engine() {
    let table = Table::new();
    let engine = HookEngine::new();

    engine.restore_all();
    assert!(engine.is_closed());

    assert!(matches!(
        engine.install(&table.handle("vtable"), replacement()),
        Err(Error::Installation { .. })
    ));
    assert_eq!(table.call(2), 4);
    assert!(engine.records().is_empty());
}

#[test]
fn locked_record_makes_restore_all_busy() {
    let table = Table::new();
    let engine = HookEngine::new();
    let handle = table.handle("vtable");
    let record = engine.install(&handle, replacement()).unwrap().into_record();

    let held = handle.record().lock();
    let counts = engine.restore_all();
    assert!(counts.busy);
    assert_eq!(counts.restored, 0);
    assert!(record.is_installed());
    drop(held);

    assert_eq!(
        engine.restore_all(),
        RestoreCounts {
            restored: 1,
            ..Default::default()
        }
    );
    assert_eq!(table.call(2), 4);
}
