use crate::abi::flags::ZygiskOption;
use crate::abi::module::ModuleAbi;
use jni_sys::{JNIEnv, JNINativeMethod};
use nix::libc::{c_char, c_int, dev_t, ino_t};
use std::ffi::c_void;

/// Function table handed to `zygisk_module_entry` by the host.
#[repr(C)]
pub struct ApiTable {
    pub api_impl: *mut c_void,
    pub register_module: unsafe extern "C" fn(*mut ApiTable, *mut ModuleAbi) -> bool,

    pub hook_jni_native_methods: Option<unsafe extern "C" fn(*mut JNIEnv, *const c_char, *mut JNINativeMethod, c_int)>,
    pub plt_hook_register:
        Option<unsafe extern "C" fn(dev_t, ino_t, *const c_char, *mut c_void, *mut *mut c_void)>,
    pub exempt_fd: Option<unsafe extern "C" fn(c_int) -> bool>,
    pub plt_hook_commit: Option<unsafe extern "C" fn() -> bool>,
    pub connect_companion: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    pub set_option: Option<unsafe extern "C" fn(*mut c_void, ZygiskOption)>,
    pub get_module_dir: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    pub get_flags: Option<unsafe extern "C" fn(*mut c_void) -> u32>,
}
