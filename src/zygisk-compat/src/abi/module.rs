use crate::abi::args::app::AppSpecializeArgs;
use crate::abi::args::server::ServerSpecializeArgs;
use nix::libc::c_long;
use std::ffi::c_void;

/// Callbacks this module registers with the host.
#[repr(C)]
pub struct ModuleAbi {
    pub api_version: c_long,
    pub module_impl: *mut c_void,
    pub pre_app_specialize: unsafe extern "C" fn(*mut c_void, *mut AppSpecializeArgs),
    pub post_app_specialize: unsafe extern "C" fn(*mut c_void, *const AppSpecializeArgs),
    pub pre_server_specialize: unsafe extern "C" fn(*mut c_void, *mut ServerSpecializeArgs),
    pub post_server_specialize: unsafe extern "C" fn(*mut c_void, *const ServerSpecializeArgs),
}
