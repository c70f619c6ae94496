//! Runtime probing that needs a live JVM: method lookup, `ArtMethod`
//! layout and the generic JNI trampoline.

use crate::raw::jni_call;
use jni::JNIEnv;
use jni::objects::{JClass, JMethodID, JObject, JStaticMethodID};
use jni_sys::{JNI_FALSE, JNI_TRUE, jmethodID};
use log::{debug, info, warn};
use mockgps_core::art::{self, ArtLayout};
use mockgps_core::resolver::{MethodLookup, SymbolDescriptor};
use mockgps_core::state::Resolver;

pub const LIBART: &str = "libart.so";
pub const GENERIC_JNI_TRAMPOLINE: &str = "art_quick_generic_jni_trampoline";

/// Regular (non-`@CriticalNative`) native instance methods present on every
/// release, whose entry point is the generic JNI trampoline.
const TRAMPOLINE_PROBES: &[(&str, &str, &str)] = &[
    ("java/lang/String", "intern", "()Ljava/lang/String;"),
    ("java/lang/Thread", "isInterrupted", "()Z"),
    ("java/lang/ref/Reference", "getReferent", "()Ljava/lang/Object;"),
    ("java/lang/Object", "getClass", "()Ljava/lang/Class;"),
];

/// Methods declared next to each other, for the stride probe.
const NEIGHBOUR_PROBES: &[(&str, (&str, &str), (&str, &str))] = &[
    ("java/lang/Thread", ("isInterrupted", "()Z"), ("isAlive", "()Z")),
    (
        "java/lang/Object",
        ("getClass", "()Ljava/lang/Class;"),
        ("hashCode", "()I"),
    ),
];

/// [`MethodLookup`] over JNI on the thread that owns `env`.
pub struct JniMethods {
    env: *mut jni_sys::JNIEnv,
}

impl JniMethods {
    /// # Safety
    /// `env` must be the live `JNIEnv` of the calling thread and outlive this
    /// value.
    pub unsafe fn new(env: *mut jni_sys::JNIEnv) -> Self {
        Self { env }
    }

    fn env(&self) -> Option<JNIEnv<'_>> {
        unsafe { JNIEnv::from_raw(self.env) }.ok()
    }

    /// The `ArtMethod*` behind `id`. Debuggable apps hand out opaque index
    /// ids, so ask `Executable.artMethod` first and fall back to the id
    /// itself only when it looks like a pointer.
    fn art_method(&self, env: &mut JNIEnv, class: &JClass, id: jmethodID, is_static: bool) -> Option<usize> {
        let is_static = if is_static { JNI_TRUE } else { JNI_FALSE };
        let reflected = unsafe { jni_call!(self.env, ToReflectedMethod, class.as_raw(), id, is_static) };

        if !reflected.is_null() {
            let reflected = unsafe { JObject::from_raw(reflected) };
            let field = env.get_field(&reflected, "artMethod", "J").and_then(|it| it.j());
            let _ = env.delete_local_ref(reflected);

            match field {
                Ok(address) if address != 0 => return Some(address as usize),
                _ => clear_exception(env),
            }
        }

        let id = id as usize;
        (id & 1 == 0).then_some(id)
    }
}

fn clear_exception(env: &mut JNIEnv) {
    if env.exception_check().unwrap_or(false) {
        let _ = env.exception_clear();
    }
}

impl MethodLookup for JniMethods {
    fn lookup_method(&self, class: &str, method: &str, signature: &str, is_static: bool) -> Option<usize> {
        let mut env = self.env()?;

        let Ok(class) = env.find_class(class) else {
            clear_exception(&mut env);
            return None;
        };

        let id = if is_static {
            env.get_static_method_id(&class, method, signature)
                .map(JStaticMethodID::into_raw)
        } else {
            env.get_method_id(&class, method, signature)
                .map(JMethodID::into_raw)
        };

        let address = match id {
            Ok(id) => self.art_method(&mut env, &class, id, is_static),
            Err(_) => {
                clear_exception(&mut env);
                None
            }
        };

        let _ = env.delete_local_ref(class);
        address
    }
}

/// Works out how `ArtMethod` is laid out on this runtime.
pub fn probe_layout(methods: &JniMethods) -> ArtLayout {
    let native = methods.lookup_method("java/lang/String", "intern", "()Ljava/lang/String;", false);

    let neighbours: Vec<_> = NEIGHBOUR_PROBES
        .iter()
        .filter_map(|&(class, (a_name, a_sig), (b_name, b_sig))| {
            let a = methods.lookup_method(class, a_name, a_sig, false)?;
            let b = methods.lookup_method(class, b_name, b_sig, false)?;
            Some((a, b))
        })
        .collect();

    let layout = unsafe { ArtLayout::detect(native, &neighbours) };
    info!("ArtMethod layout: {layout:?}, {} bytes", layout.size());

    layout
}

/// Finds the entry point shared by every regular JNI method: first by
/// symbol, then by borrowing it from a known native method.
pub fn find_trampoline(resolver: &Resolver, methods: &JniMethods, layout: ArtLayout) -> Option<usize> {
    let descriptor = SymbolDescriptor::native(LIBART, GENERIC_JNI_TRAMPOLINE);

    match resolver.resolve_address(&descriptor) {
        Ok(address) => {
            info!("JNI trampoline: {address:#x} ({descriptor})");
            return Some(address);
        }
        Err(err) => debug!("{err}"),
    }

    for &(class, name, signature) in TRAMPOLINE_PROBES {
        let Some(method) = methods.lookup_method(class, name, signature, false) else {
            continue;
        };

        let flags = unsafe { art::access_flags(method) };
        if !art::is_regular_native(flags) {
            debug!("{class}.{name} is not a regular native method: {flags:#010x}");
            continue;
        }

        let entry_point = unsafe { art::entry_point(method, layout) };
        if entry_point != 0 {
            info!("JNI trampoline: {entry_point:#x} (from {class}.{name})");
            return Some(entry_point);
        }
    }

    warn!("JNI trampoline not found");
    None
}
