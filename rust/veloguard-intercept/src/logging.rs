use crate::config::LogLevel;
use crate::error::{InterceptError, Result};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Install the global subscriber once; later calls are no-ops
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn directive(s: String) -> Result<tracing_subscriber::filter::Directive> {
    s.parse()
        .map_err(|e| InterceptError::config(format!("Invalid log directive: {}", e)))
}

fn tracing_level(level: LogLevel) -> Option<Level> {
    match level {
        LogLevel::Silent => None,
        LogLevel::Error => Some(Level::ERROR),
        LogLevel::Warning => Some(Level::WARN),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Debug => Some(Level::DEBUG),
        LogLevel::Trace => Some(Level::TRACE),
    }
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let Some(tracing_level) = tracing_level(level) else {
        return Ok(());
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(directive(format!("veloguard_intercept={}", tracing_level))?)
        .add_directive(directive(format!("veloguard_sniff={}", tracing_level))?)
        .add_directive(directive("tokio=warn".to_string())?);

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    // try_init: the host process may already own the global subscriber
    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!("Logging initialized at level: {:?}", level);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        assert!(init_logging(LogLevel::Debug).is_ok());
        assert!(init_logging(LogLevel::Error).is_ok());
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(tracing_level(LogLevel::Silent), None);
        assert_eq!(tracing_level(LogLevel::Warning), Some(Level::WARN));
        assert_eq!(tracing_level(LogLevel::Trace), Some(Level::TRACE));
    }
}
