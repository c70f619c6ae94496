//! Location interception engine loaded into app processes.
//!
//! [`state::ModuleState`] owns one instance of every component; hooked entry
//! points consult it through [`dispatch::Interceptor`].

pub mod art;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hook;
pub mod location;
pub mod maps;
pub mod resolver;
pub mod state;
pub mod store;
pub mod target;
pub mod teardown;

pub use error::{Error, Result};
pub use location::{LocationFix, Provider};
