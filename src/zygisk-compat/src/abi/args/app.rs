use jni_sys::{jboolean, jint, jintArray, jobjectArray, jstring};

/// Arguments of `nativeForkAndSpecialize`, as laid out by API v4 hosts.
///
/// Required fields always point at live values; optional ones are null when
/// the platform does not pass them.
#[repr(C)]
pub struct AppSpecializeArgs {
    // required
    uid: *mut jint,
    gid: *mut jint,
    gids: *mut jintArray,
    runtime_flags: *mut jint,
    rlimits: *mut jobjectArray,
    mount_external: *mut jint,
    se_info: *mut jstring,
    nice_name: *mut jstring,
    instruction_set: *mut jstring,
    app_data_dir: *mut jstring,

    // optional
    fds_to_ignore: *mut jintArray,
    is_child_zygote: *mut jboolean,
    is_top_app: *mut jboolean,
    pkg_data_info_list: *mut jobjectArray,
    whitelisted_data_info_list: *mut jobjectArray,
    mount_data_dirs: *mut jboolean,
    mount_storage_dirs: *mut jboolean,
}

impl AppSpecializeArgs {
    pub fn uid(&self) -> jint {
        unsafe { *self.uid }
    }

    pub fn nice_name(&self) -> jstring {
        unsafe { *self.nice_name }
    }

    pub fn app_data_dir(&self) -> jstring {
        unsafe { *self.app_data_dir }
    }

    pub fn is_child_zygote(&self) -> bool {
        unsafe { self.is_child_zygote.as_ref() }.is_some_and(|&it| it != 0)
    }
}
