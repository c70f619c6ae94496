//! Module side of the Zygisk API: the host calls `zygisk_module_entry` in
//! every forked process and `zygisk_companion_entry` in its root daemon.

pub mod abi;
mod module;

pub use abi::args::app::AppSpecializeArgs;
pub use abi::args::server::ServerSpecializeArgs;
pub use abi::flags::ZygiskOption;
pub use module::{Api, ZygiskModule};

#[doc(hidden)]
pub use module::{companion_entry, module_entry};

#[macro_export]
macro_rules! register_zygisk_module {
    ($module:ty) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn zygisk_module_entry(
            table: *mut ::std::ffi::c_void,
            env: *mut ::jni_sys::JNIEnv,
        ) {
            unsafe { $crate::module_entry::<$module>(table.cast(), env) }
        }
    };
}

#[macro_export]
macro_rules! register_zygisk_companion {
    ($handler:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn zygisk_companion_entry(client: ::std::ffi::c_int) {
            unsafe { $crate::companion_entry(client, $handler) }
        }
    };
}
