use std::sync::Arc;

use tracing::info_span;

use crate::{
    error::{Error, Result},
    exchanger::Bridge,
    package::Package,
    scope::{IsolationOptions, IsolationScope, ambient},
};

/// Start `entry` from `package` in a fresh isolation scope and return the
/// bridge to it.
///
/// The scope is current on this thread while the bridge is built and the
/// previous ambient scope is restored afterwards, whatever the outcome.
///
/// # Errors
/// Every failure is reported as [`Error::InitializationFailed`] carrying the
/// entry point, the package path and the underlying cause. The scope is
/// closed before the error is returned.
pub fn create_isolated(
    entry: &str,
    package: &Package,
    options: &IsolationOptions,
) -> Result<Bridge> {
    let span = info_span!("create_isolated", entry, package = %package.path().display());
    let _enter = span.enter();

    let failed = |source: Error| Error::InitializationFailed {
        entry: entry.to_string(),
        classpath: vec![package.path().to_path_buf()],
        source: Box::new(source),
    };

    let scope = Arc::new(IsolationScope::open(package, options).map_err(failed)?);
    let _ambient = ambient::enter(Arc::clone(&scope));

    Bridge::new(entry, Arc::clone(&scope)).map_err(|e| {
        scope.close();
        failed(e)
    })
}
