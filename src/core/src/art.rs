//! Just enough knowledge of `art::ArtMethod` to rebind a Java method to
//! native code.
//!
//! ```text
//! 0x00  GcRoot<Class> declaring_class_
//! 0x04  u32           access_flags_
//! 0x08  u32           dex_code_item_offset_   (legacy layout only)
//!  ...  u32           dex_method_index_
//!  ...  u16           method_index_
//!  ...  u16           hotness_count_ / imt_index_
//!  ...  void*         data_
//!  ...  void*         entry_point_from_quick_compiled_code_
//! ```

use crate::maps;
use log::debug;
use nix::sys::mman::ProtFlags;
use std::mem::size_of;

pub const ACCESS_FLAGS_OFFSET: usize = 4;

pub const ACC_NATIVE: u32 = 0x0000_0100;
pub const ACC_FAST_NATIVE: u32 = 0x0008_0000;
pub const ACC_CRITICAL_NATIVE: u32 = 0x0020_0000;
pub const ACC_COMPILE_DONT_BOTHER: u32 = 0x0200_0000;
pub const ACC_FAST_INTERPRETER_TO_INTERPRETER_INVOKE: u32 = 0x4000_0000;

/// Bits that change meaning once `ACC_NATIVE` is set.
const NATIVE_CONFLICTS: u32 =
    ACC_FAST_INTERPRETER_TO_INTERPRETER_INVOKE | ACC_FAST_NATIVE | ACC_CRITICAL_NATIVE;

const POINTER: usize = size_of::<usize>();

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ArtLayout {
    /// Android 12+: no `dex_code_item_offset_`.
    #[default]
    Compact,
    /// Android 11 and older.
    Legacy,
}

impl ArtLayout {
    pub fn data_offset(self) -> usize {
        match self {
            ArtLayout::Compact => 16,
            ArtLayout::Legacy => 20usize.next_multiple_of(POINTER),
        }
    }

    pub fn entry_point_offset(self) -> usize {
        self.data_offset() + POINTER
    }

    pub fn size(self) -> usize {
        self.entry_point_offset() + POINTER
    }

    /// Infers the layout from a method known to be a regular native method,
    /// whose `data_` and `entry_point_` both point into executable mappings.
    ///
    /// # Safety
    /// `method` must point to a live `ArtMethod` at least as large as the
    /// legacy layout.
    pub unsafe fn from_native_method(method: usize) -> Option<Self> {
        let flags = unsafe { read_u32(method + ACCESS_FLAGS_OFFSET) };
        if flags & ACC_NATIVE == 0 {
            return None;
        }

        [ArtLayout::Compact, ArtLayout::Legacy].into_iter().find(|layout| unsafe {
            is_code(read_usize(method + layout.data_offset()))
                && is_code(read_usize(method + layout.entry_point_offset()))
        })
    }

    /// Infers the layout from the distance between two methods of one class,
    /// which sit next to each other in the class's method array.
    pub fn from_stride(a: usize, b: usize) -> Option<Self> {
        let stride = a.abs_diff(b);

        [ArtLayout::Compact, ArtLayout::Legacy]
            .into_iter()
            .find(|layout| stride == layout.size())
    }

    /// Tries each probe in turn, defaulting to [`ArtLayout::Compact`].
    ///
    /// # Safety
    /// `native` must point to a live native `ArtMethod` if present.
    pub unsafe fn detect(native: Option<usize>, neighbours: &[(usize, usize)]) -> Self {
        if let Some(layout) = native.and_then(|method| unsafe { Self::from_native_method(method) }) {
            debug!("art layout {layout:?} from native method");
            return layout;
        }

        if let Some(layout) = neighbours.iter().find_map(|&(a, b)| Self::from_stride(a, b)) {
            debug!("art layout {layout:?} from method stride");
            return layout;
        }

        debug!("art layout unknown, assuming {:?}", ArtLayout::Compact);
        ArtLayout::Compact
    }
}

/// Access flags of a Java method rebound to a JNI function.
pub fn native_flags(flags: u32) -> u32 {
    (flags | ACC_NATIVE) & !NATIVE_CONFLICTS
}

/// Access flags for the clone that keeps the original body callable. The JIT
/// must leave it alone since nothing links it into the class.
pub fn backup_flags(flags: u32) -> u32 {
    (flags | ACC_COMPILE_DONT_BOTHER) & !(ACC_FAST_INTERPRETER_TO_INTERPRETER_INVOKE | ACC_CRITICAL_NATIVE)
}

/// Whether `flags` describe a method reached through the regular JNI
/// trampoline, i.e. one whose entry point receives `JNIEnv*` and `this`.
pub fn is_regular_native(flags: u32) -> bool {
    flags & ACC_NATIVE != 0 && flags & ACC_CRITICAL_NATIVE == 0
}

/// # Safety
/// `method` must point to a live `ArtMethod`.
pub unsafe fn access_flags(method: usize) -> u32 {
    unsafe { read_u32(method + ACCESS_FLAGS_OFFSET) }
}

/// # Safety
/// `method` must point to a live `ArtMethod` laid out as `layout`.
pub unsafe fn entry_point(method: usize, layout: ArtLayout) -> usize {
    unsafe { read_usize(method + layout.entry_point_offset()) }
}

fn is_code(addr: usize) -> bool {
    addr != 0
        && maps::region_of(addr, 1)
            .ok()
            .flatten()
            .is_some_and(|region| region.prot.contains(ProtFlags::PROT_EXEC))
}

unsafe fn read_u32(addr: usize) -> u32 {
    unsafe { (addr as *const u32).read_volatile() }
}

unsafe fn read_usize(addr: usize) -> usize {
    unsafe { (addr as *const usize).read_volatile() }
}
