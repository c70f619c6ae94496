/// Calls a raw JNI function through the env's function table.
///
/// Every slot of the table is populated by the runtime.
macro_rules! jni_call {
    ($env: expr, $func: ident $(, $arg: expr)* $(,)?) => {{
        let env: *mut ::jni_sys::JNIEnv = $env;
        ((**env).$func.unwrap_unchecked())(env $(, $arg)*)
    }};
}

pub(crate) use jni_call;
