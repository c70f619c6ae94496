//! Replacement bodies for the `android.location.Location` getters.
//!
//! Each one asks the dispatch table where the call goes: the spoofed fix
//! while spoofing is on, else the original body through the backup method,
//! else the backing field.

use crate::raw::jni_call;
use jni::JNIEnv;
use jni::objects::{GlobalRef, JFieldID};
use jni_sys::{jdouble, jfieldID, jfloat, jlong, jmethodID, jobject, jstring};
use log::{trace, warn};
use mockgps_core::Provider;
use mockgps_core::config::HooksConfig;
use mockgps_core::dispatch::Route;
use mockgps_core::location::{boottime_ns, realtime_ms};
use mockgps_core::state;
use mockgps_misc::debug_on;
use std::ffi::CStr;
use std::ptr;
use std::sync::OnceLock;

pub const LOCATION_CLASS: &str = "android/location/Location";

pub const LATITUDE: usize = 0;
pub const LONGITUDE: usize = 1;
pub const ALTITUDE: usize = 2;
pub const ACCURACY: usize = 3;
pub const SPEED: usize = 4;
pub const BEARING: usize = 5;
pub const TIME: usize = 6;
pub const ELAPSED_REALTIME_NANOS: usize = 7;
pub const PROVIDER: usize = 8;
pub const ENTRY_COUNT: usize = 9;

/// One hooked getter.
#[derive(Debug, Copy, Clone)]
pub struct LocationHook {
    pub index: usize,
    pub method: &'static str,
    pub signature: &'static str,
    /// Backing field read when there is no original body to call.
    pub fields: &'static [(&'static str, &'static str)],
    pub replacement: usize,
    pub enabled: fn(&HooksConfig) -> bool,
}

fn always(_: &HooksConfig) -> bool {
    true
}

fn timestamps(config: &HooksConfig) -> bool {
    config.timestamps
}

fn provider(config: &HooksConfig) -> bool {
    config.provider
}

pub fn location_hooks() -> [LocationHook; ENTRY_COUNT] {
    macro_rules! hook {
        ($index: expr, $method: literal, $signature: literal, $fields: expr, $replacement: expr, $enabled: expr) => {
            LocationHook {
                index: $index,
                method: $method,
                signature: $signature,
                fields: $fields,
                replacement: $replacement as usize,
                enabled: $enabled,
            }
        };
    }

    type Double = extern "system" fn(*mut jni_sys::JNIEnv, jobject) -> jdouble;
    type Float = extern "system" fn(*mut jni_sys::JNIEnv, jobject) -> jfloat;
    type Long = extern "system" fn(*mut jni_sys::JNIEnv, jobject) -> jlong;
    type Object = extern "system" fn(*mut jni_sys::JNIEnv, jobject) -> jstring;

    [
        hook!(LATITUDE, "getLatitude", "()D", &[("mLatitude", "D")], get_latitude as Double, always),
        hook!(LONGITUDE, "getLongitude", "()D", &[("mLongitude", "D")], get_longitude as Double, always),
        hook!(ALTITUDE, "getAltitude", "()D", &[("mAltitude", "D")], get_altitude as Double, always),
        hook!(
            ACCURACY,
            "getAccuracy",
            "()F",
            &[("mHorizontalAccuracyMeters", "F"), ("mAccuracy", "F")],
            get_accuracy as Float,
            always
        ),
        hook!(SPEED, "getSpeed", "()F", &[("mSpeed", "F")], get_speed as Float, always),
        hook!(BEARING, "getBearing", "()F", &[("mBearing", "F")], get_bearing as Float, always),
        hook!(TIME, "getTime", "()J", &[("mTime", "J"), ("mTimeMs", "J")], get_time as Long, timestamps),
        hook!(
            ELAPSED_REALTIME_NANOS,
            "getElapsedRealtimeNanos",
            "()J",
            &[("mElapsedRealtimeNanos", "J")],
            get_elapsed_realtime_nanos as Long,
            timestamps
        ),
        hook!(
            PROVIDER,
            "getProvider",
            "()Ljava/lang/String;",
            &[("mProvider", "Ljava/lang/String;")],
            get_provider as Object,
            provider
        ),
    ]
}

/// `Location` itself plus the backing fields, looked up once before any
/// hook goes live.
struct LocationClass {
    class: GlobalRef,
    fields: [Option<JFieldID>; ENTRY_COUNT],
}

static LOCATION: OnceLock<LocationClass> = OnceLock::new();

/// Caches what the getters need to reach the original values.
pub fn prepare(env: &mut JNIEnv, hooks: &[LocationHook]) -> anyhow::Result<()> {
    let class = env.find_class(LOCATION_CLASS)?;
    let mut fields = [None; ENTRY_COUNT];

    for hook in hooks {
        for &(name, signature) in hook.fields {
            match env.get_field_id(&class, name, signature) {
                Ok(field) => {
                    fields[hook.index] = Some(field);
                    break;
                }
                Err(_) => {
                    let _ = env.exception_clear();
                }
            }
        }

        if fields[hook.index].is_none() {
            warn!("no backing field for Location.{}", hook.method);
        }
    }

    let class = env.new_global_ref(class)?;
    let _ = LOCATION.set(LocationClass { class, fields });

    Ok(())
}

fn route(index: usize) -> Route {
    let route = match state::current() {
        Some(state) => state.interceptor().route(index),
        None => Route::Original(0),
    };

    if debug_on!("trace") {
        trace!("Location entry {index}: {route:?}");
    }

    route
}

fn class() -> Option<(jobject, &'static [Option<JFieldID>; ENTRY_COUNT])> {
    LOCATION
        .get()
        .map(|location| (location.class.as_obj().as_raw(), &location.fields))
}

fn field(index: usize) -> Option<jfieldID> {
    class().and_then(|(_, fields)| fields[index]).map(JFieldID::into_raw)
}

/// Runs the original body, via the backup method or the backing field.
macro_rules! original {
    ($env: expr, $this: expr, $index: expr, $backup: expr, $call: ident, $get: ident, $default: expr) => {
        unsafe {
            match (class(), field($index)) {
                (Some((class, _)), _) if $backup != 0 => {
                    jni_call!($env, $call, $this, class, $backup as jmethodID, ptr::null())
                }
                (_, Some(field)) => jni_call!($env, $get, $this, field),
                _ => $default,
            }
        }
    };
}

macro_rules! getter {
    ($name: ident, $index: expr, $ret: ty, $call: ident, $get: ident, |$fix: ident| $spoof: expr) => {
        extern "system" fn $name(env: *mut jni_sys::JNIEnv, this: jobject) -> $ret {
            match route($index) {
                Route::Spoof($fix) => $spoof,
                Route::Original(backup) => original!(env, this, $index, backup, $call, $get, Default::default()),
            }
        }
    };
}

getter!(get_latitude, LATITUDE, jdouble, CallNonvirtualDoubleMethodA, GetDoubleField, |fix| fix.latitude);
getter!(get_longitude, LONGITUDE, jdouble, CallNonvirtualDoubleMethodA, GetDoubleField, |fix| fix.longitude);
getter!(get_altitude, ALTITUDE, jdouble, CallNonvirtualDoubleMethodA, GetDoubleField, |fix| fix.altitude);
getter!(get_accuracy, ACCURACY, jfloat, CallNonvirtualFloatMethodA, GetFloatField, |fix| fix.accuracy);
getter!(get_speed, SPEED, jfloat, CallNonvirtualFloatMethodA, GetFloatField, |fix| fix.speed);
getter!(get_bearing, BEARING, jfloat, CallNonvirtualFloatMethodA, GetFloatField, |fix| fix.bearing);
getter!(get_time, TIME, jlong, CallNonvirtualLongMethodA, GetLongField, |_fix| realtime_ms() as jlong);
getter!(
    get_elapsed_realtime_nanos,
    ELAPSED_REALTIME_NANOS,
    jlong,
    CallNonvirtualLongMethodA,
    GetLongField,
    |_fix| boottime_ns() as jlong
);

fn provider_name(provider: Provider) -> &'static CStr {
    match provider {
        Provider::Gps => c"gps",
        Provider::Network => c"network",
        Provider::Fused => c"fused",
    }
}

extern "system" fn get_provider(env: *mut jni_sys::JNIEnv, this: jobject) -> jstring {
    match route(PROVIDER) {
        Route::Spoof(fix) => unsafe { jni_call!(env, NewStringUTF, provider_name(fix.provider).as_ptr()) },
        Route::Original(backup) => {
            original!(
                env,
                this,
                PROVIDER,
                backup,
                CallNonvirtualObjectMethodA,
                GetObjectField,
                ptr::null_mut()
            )
        }
    }
}
