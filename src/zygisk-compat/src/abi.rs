use nix::libc::c_long;

pub mod api;
pub mod args;
pub mod flags;
pub mod module;

/// Table layout this module is built against. Hosts speaking v5 accept it.
pub const ZYGISK_API_VERSION: c_long = 4;
