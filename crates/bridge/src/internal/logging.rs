use tracing::event;

use crate::{TRACE_TARGET_GUEST, scope::ambient};

/// Forward a guest log line to `tracing`. Levels follow the guest ABI:
/// 0 trace, 1 debug, 2 info, 3 warn, anything higher error.
pub fn log(level: i32, message: &str) {
    let scope = ambient::current().map(|scope| scope.id().to_string());
    let scope = scope.as_deref().unwrap_or("-");
    match level {
        i32::MIN..=0 => event!(
            name: "log",
            target: TRACE_TARGET_GUEST,
            tracing::Level::TRACE,
            log.output = message,
            log.scope = scope,
        ),
        1 => event!(
            name: "log",
            target: TRACE_TARGET_GUEST,
            tracing::Level::DEBUG,
            log.output = message,
            log.scope = scope,
        ),
        2 => event!(
            name: "log",
            target: TRACE_TARGET_GUEST,
            tracing::Level::INFO,
            log.output = message,
            log.scope = scope,
        ),
        3 => event!(
            name: "log",
            target: TRACE_TARGET_GUEST,
            tracing::Level::WARN,
            log.output = message,
            log.scope = scope,
        ),
        _ => event!(
            name: "log",
            target: TRACE_TARGET_GUEST,
            tracing::Level::ERROR,
            log.output = message,
            log.scope = scope,
        ),
    }
}
