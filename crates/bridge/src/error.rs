use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Package path is missing, not a file, or not a `.wasm` archive.
    #[error("invalid package '{}': {reason}", path.display())]
    InvalidPackage { path: PathBuf, reason: String },

    /// Entry point cannot be located inside the package.
    #[error("entry point '{entry}' can not be located in package '{}'", path.display())]
    UnresolvableEntryPoint { entry: String, path: PathBuf },

    /// Building the scope, binding the bridge or starting the guest failed.
    #[error("failed to initialize embedded application. entry: '{entry}'; classpath: {classpath:?}")]
    InitializationFailed {
        entry: String,
        classpath: Vec<PathBuf>,
        #[source]
        source: Box<Error>,
    },

    /// Operation is not legal in the current lifecycle or channel setup.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Guest produced a payload that is neither bytes nor text.
    #[error(
        "unsupported payload ({0}); only bytes and text payloads can be passed back to the host, convert on the guest side before emitting"
    )]
    UnsupportedPayload(String),

    /// Configuration value could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Wasmtime engine error (compilation, instantiation, trap, epoch interrupt).
    #[error("wasm error: {0}")]
    Wasm(#[source] anyhow::Error),

    /// Filesystem I/O error (package, artifact cache, thread spawn).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    pub(crate) fn invalid_package(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPackage {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
