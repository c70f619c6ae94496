use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range control input; prior state is retained.
    #[error("rejected configuration: {0}")]
    Configuration(String),

    /// A target symbol could not be located; it stays unhooked.
    #[error("cannot resolve {descriptor}: {reason}")]
    Resolution { descriptor: String, reason: String },

    /// Patching failed; treated exactly like a resolution failure.
    #[error("cannot install hook on {target}: {reason}")]
    Installation { target: String, reason: String },

    /// A slot no longer holds what the engine wrote there. Writing anyway could
    /// leave a half-patched target, so the write is refused.
    #[error("refusing to touch {target}: slot at {address:#x} holds {found:#x}, expected {expected:#x}")]
    StateCorruptionRisk {
        target: String,
        address: usize,
        expected: u64,
        found: u64,
    },

    #[error("control channel: {0}")]
    Channel(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn configuration<S: Into<String>>(reason: S) -> Self {
        Error::Configuration(reason.into())
    }

    pub fn resolution<D: ToString, R: ToString>(descriptor: D, reason: R) -> Self {
        Error::Resolution {
            descriptor: descriptor.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn installation<T: ToString, R: ToString>(target: T, reason: R) -> Self {
        Error::Installation {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}
