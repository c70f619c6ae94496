//! `libmockgps.so`: the Zygisk module that spoofs `android.location.Location`
//! in selected apps, and its root companion.

use log::LevelFilter;
use mockgps_zygisk::{register_zygisk_companion, register_zygisk_module};

mod art;
mod companion;
mod hooks;
mod module;
mod raw;

const MODULE_TAG: &str = "mockgps";
const COMPANION_TAG: &str = "mockgps::companion";

fn init_logger(tag: &str) {
    android_logger::init_once(
        android_logger::Config::default()
            .with_max_level(if cfg!(debug_assertions) {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            })
            .with_tag(tag),
    );
}

register_zygisk_module!(module::MockGps);
register_zygisk_companion!(companion::serve);
