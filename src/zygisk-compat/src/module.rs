use crate::abi::ZYGISK_API_VERSION;
use crate::abi::api::ApiTable;
use crate::abi::args::app::AppSpecializeArgs;
use crate::abi::args::server::ServerSpecializeArgs;
use crate::abi::flags::ZygiskOption;
use crate::abi::module::ModuleAbi;
use jni_sys::JNIEnv;
use log::error;
use nix::libc::c_int;
use std::ffi::c_void;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

/// Handle on the host's API table, valid for the lifetime of the process.
#[derive(Clone, Copy)]
pub struct Api {
    table: &'static ApiTable,
}

unsafe impl Send for Api {}
unsafe impl Sync for Api {}

impl Api {
    unsafe fn new(table: *const ApiTable) -> Option<Self> {
        unsafe { table.as_ref() }.map(|table| Self { table })
    }

    /// Socket to this module's companion running as root in the daemon.
    pub fn connect_companion(&self) -> Option<UnixStream> {
        let connect = self.table.connect_companion?;
        let fd = unsafe { connect(self.table.api_impl) };

        (fd >= 0).then(|| unsafe { UnixStream::from_raw_fd(fd) })
    }

    /// The module's directory under `/data/adb/modules`, opened by the host.
    pub fn get_module_dir(&self) -> Option<OwnedFd> {
        let get = self.table.get_module_dir?;
        let fd = unsafe { get(self.table.api_impl) };

        (fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(fd) })
    }

    pub fn set_option(&self, option: ZygiskOption) {
        if let Some(set) = self.table.set_option {
            unsafe { set(self.table.api_impl, option) }
        }
    }

    /// Keeps `fd` open across specialization; without it zygote closes
    /// every descriptor it does not know about.
    pub fn exempt_fd(&self, fd: RawFd) -> bool {
        match self.table.exempt_fd {
            Some(exempt) => unsafe { exempt(fd as c_int) },
            None => false,
        }
    }
}

/// A module instance, created once per zygote fork.
pub trait ZygiskModule: Sized + 'static {
    fn new(api: Api, env: *mut JNIEnv) -> Self;

    fn pre_app_specialize(&mut self, _args: &mut AppSpecializeArgs) {}

    fn post_app_specialize(&mut self, _args: &AppSpecializeArgs) {}

    fn pre_server_specialize(&mut self, _args: &mut ServerSpecializeArgs) {}

    fn post_server_specialize(&mut self, _args: &ServerSpecializeArgs) {}
}

fn guarded<F: FnOnce()>(callback: &str, f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!("{callback} panicked");
    }
}

unsafe extern "C" fn pre_app<M: ZygiskModule>(this: *mut c_void, args: *mut AppSpecializeArgs) {
    if let (Some(this), Some(args)) = unsafe { (this.cast::<M>().as_mut(), args.as_mut()) } {
        guarded("pre_app_specialize", || this.pre_app_specialize(args));
    }
}

unsafe extern "C" fn post_app<M: ZygiskModule>(this: *mut c_void, args: *const AppSpecializeArgs) {
    if let (Some(this), Some(args)) = unsafe { (this.cast::<M>().as_mut(), args.as_ref()) } {
        guarded("post_app_specialize", || this.post_app_specialize(args));
    }
}

unsafe extern "C" fn pre_server<M: ZygiskModule>(this: *mut c_void, args: *mut ServerSpecializeArgs) {
    if let (Some(this), Some(args)) = unsafe { (this.cast::<M>().as_mut(), args.as_mut()) } {
        guarded("pre_server_specialize", || this.pre_server_specialize(args));
    }
}

unsafe extern "C" fn post_server<M: ZygiskModule>(this: *mut c_void, args: *const ServerSpecializeArgs) {
    if let (Some(this), Some(args)) = unsafe { (this.cast::<M>().as_mut(), args.as_ref()) } {
        guarded("post_server_specialize", || this.post_server_specialize(args));
    }
}

#[doc(hidden)]
pub unsafe fn module_entry<M: ZygiskModule>(table: *mut ApiTable, env: *mut JNIEnv) {
    let Some(api) = (unsafe { Api::new(table) }) else {
        return;
    };

    // the host keeps both pointers for the lifetime of the process
    let abi = Box::leak(Box::new(ModuleAbi {
        api_version: ZYGISK_API_VERSION,
        module_impl: ptr::null_mut(),
        pre_app_specialize: pre_app::<M>,
        post_app_specialize: post_app::<M>,
        pre_server_specialize: pre_server::<M>,
        post_server_specialize: post_server::<M>,
    }));

    if !unsafe { (api.table.register_module)(table, abi) } {
        error!("module registration rejected by host");
        return;
    }

    let mut module = None;
    guarded("module construction", || module = Some(M::new(api, env)));

    if let Some(module) = module {
        abi.module_impl = Box::into_raw(Box::new(module)).cast();
    }
}

#[doc(hidden)]
pub unsafe fn companion_entry(client: c_int, handler: fn(UnixStream)) {
    // the daemon closes `client` once we return
    let client = unsafe { BorrowedFd::borrow_raw(client) };

    match client.try_clone_to_owned() {
        Ok(fd) => guarded("companion", || handler(UnixStream::from(fd))),
        Err(err) => error!("failed to take companion socket: {err}"),
    }
}
