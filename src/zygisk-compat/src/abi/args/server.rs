use jni_sys::{jint, jintArray, jlong};

/// Arguments of `nativeForkSystemServer`.
#[repr(C)]
pub struct ServerSpecializeArgs {
    uid: *mut jint,
    gid: *mut jint,
    gids: *mut jintArray,
    runtime_flags: *mut jint,
    permitted_capabilities: *mut jlong,
    effective_capabilities: *mut jlong,
}

impl ServerSpecializeArgs {
    pub fn uid(&self) -> jint {
        unsafe { *self.uid }
    }
}
