//! Locating and probing packages.
//!
//! A package is a single `.wasm` file. Resolution only inspects filesystem
//! metadata; the module format is not looked at until a scope is opened.

use std::path::{Path, PathBuf};

use tracing::debug;
use wasmtime::ExternType;

use crate::{
    error::{Error, Result},
    scope::{IsolationOptions, IsolationScope, Resolution},
};

const PACKAGE_EXTENSION: &str = "wasm";

/// A validated, absolute path to a package file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    path: PathBuf,
}

impl Package {
    /// Resolve `path` to a package.
    ///
    /// # Errors
    /// Returns [`Error::InvalidPackage`] if the path does not exist, is not a
    /// regular file, or does not carry the `.wasm` extension.
    pub fn resolve(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "resolving package");

        let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::invalid_package(absolute, "does not exist"));
            }
            Err(e) => return Err(Error::invalid_package(absolute, e.to_string())),
        };
        if !metadata.is_file() {
            return Err(Error::invalid_package(absolute, "must point to a file"));
        }
        let has_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(PACKAGE_EXTENSION));
        if !has_extension {
            return Err(Error::invalid_package(
                absolute,
                format!("does not point to a .{PACKAGE_EXTENSION} file"),
            ));
        }

        let path = std::fs::canonicalize(path)?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }
}

/// Check that `entry` names a `() -> ()` function exported by the package.
///
/// The package is compiled in a throwaway scope that is never instantiated,
/// so nothing in the guest runs.
///
/// # Errors
/// Returns [`Error::UnresolvableEntryPoint`] if the export is missing or has
/// the wrong shape, and [`Error::InvalidPackage`] if the package does not
/// compile.
pub fn probe_entry_point(package: &Package, entry: &str) -> Result<()> {
    let probe = IsolationScope::open(package, &IsolationOptions::default()).map_err(|e| {
        Error::invalid_package(package.path(), format!("not a loadable module: {e}"))
    })?;

    let resolvable = match probe.resolve(entry) {
        Some(Resolution::Isolated(ExternType::Func(ty))) => {
            ty.params().len() == 0 && ty.results().len() == 0
        }
        _ => false,
    };
    probe.close();

    if resolvable {
        Ok(())
    } else {
        Err(Error::UnresolvableEntryPoint {
            entry: entry.to_string(),
            path: package.path().to_path_buf(),
        })
    }
}
