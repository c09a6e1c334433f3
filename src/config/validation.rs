use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,

    #[error("event buffer_capacity must be at least 1")]
    ZeroEventBuffer,

    #[error("retry_backoff_ms must be positive")]
    ZeroBackoff,

    #[error("retry_backoff_cap_ms ({cap}) is below retry_backoff_ms ({base})")]
    BackoffCapBelowBase { base: u64, cap: u64 },

    #[error("poll_interval_ms must be positive")]
    ZeroPollInterval,

    #[error("engine command for `{section}` is empty")]
    EmptyEngineCommand { section: &'static str },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    let d = &config.downloads;
    if d.max_concurrent == 0 {
        return Err(ValidationError::ZeroConcurrency);
    }
    if d.retry_backoff_ms == 0 {
        return Err(ValidationError::ZeroBackoff);
    }
    if d.retry_backoff_cap_ms < d.retry_backoff_ms {
        return Err(ValidationError::BackoffCapBelowBase {
            base: d.retry_backoff_ms,
            cap: d.retry_backoff_cap_ms,
        });
    }
    if d.poll_interval_ms == 0 {
        return Err(ValidationError::ZeroPollInterval);
    }
    if config.events.buffer_capacity == 0 {
        return Err(ValidationError::ZeroEventBuffer);
    }
    if config.backends.direct.engine.command.is_empty() {
        return Err(ValidationError::EmptyEngineCommand {
            section: "direct.engine",
        });
    }
    if config.backends.media.command.is_empty() {
        return Err(ValidationError::EmptyEngineCommand { section: "media" });
    }
    if config.backends.torrent.command.is_empty() {
        return Err(ValidationError::EmptyEngineCommand { section: "torrent" });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = Config::default();
        config.downloads.max_concurrent = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroConcurrency)
        ));
    }

    #[test]
    fn test_backoff_cap_below_base_rejected() {
        let mut config = Config::default();
        config.downloads.retry_backoff_ms = 1000;
        config.downloads.retry_backoff_cap_ms = 500;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::BackoffCapBelowBase { .. })
        ));
    }
}
