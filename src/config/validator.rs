//! Configuration validation

use super::*;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &CoordinatorConfig) -> Result<()> {
    validate_session(&config.session)?;
    validate_cache(&config.cache)?;
    validate_locks(&config.locks)?;
    validate_timeouts(&config.timeouts)?;
    Ok(())
}

pub fn validate_session(session: &SessionConfig) -> Result<()> {
    if session.port == 0 {
        anyhow::bail!("session.port must be greater than 0");
    }
    if session.master.trim().is_empty() {
        anyhow::bail!("session.master must not be empty");
    }
    if session.conf_file.trim().is_empty() {
        anyhow::bail!("session.conf_file must not be empty");
    }
    if session.parallel == Some(0) {
        anyhow::bail!("session.parallel must be at least 1 if specified");
    }
    Ok(())
}

pub fn validate_cache(cache: &CacheConfig) -> Result<()> {
    if cache.chunk_size == 0 {
        anyhow::bail!("cache.chunk_size must be greater than 0");
    }
    if cache.chunk_size > crate::distributed::protocol::MAX_FRAME_LEN {
        anyhow::bail!(
            "cache.chunk_size must not exceed the frame limit ({} bytes), got {}",
            crate::distributed::protocol::MAX_FRAME_LEN,
            cache.chunk_size
        );
    }
    if cache.subdir.trim().is_empty() {
        anyhow::bail!("cache.subdir must not be empty");
    }
    Ok(())
}

pub fn validate_locks(locks: &LockConfig) -> Result<()> {
    if locks.cache_template.trim().is_empty() {
        anyhow::bail!("locks.cache_template must not be empty");
    }
    if !locks.package_template.contains("{package}") {
        anyhow::bail!(
            "locks.package_template must contain {{package}}, got '{}'",
            locks.package_template
        );
    }
    for template in [&locks.cache_template, &locks.package_template] {
        if template.contains('/') {
            anyhow::bail!("lock templates name a file inside locks.dir, got '{}'", template);
        }
    }
    Ok(())
}

pub fn validate_timeouts(timeouts: &TimeoutConfig) -> Result<()> {
    let named = [
        ("setup", timeouts.setup),
        ("send", timeouts.send),
        ("collect", timeouts.collect),
        ("ping", timeouts.ping),
        ("request", timeouts.request),
    ];
    for (name, value) in named {
        if value.is_zero() {
            anyhow::bail!("timeouts.{} must be greater than 0", name);
        }
    }
    if timeouts.job == Some(Duration::ZERO) {
        anyhow::bail!("timeouts.job must be greater than 0 if specified");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&CoordinatorConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = CoordinatorConfig::default();
        config.session.port = 0;
        assert!(validate_config(&config).is_err());

        let mut config = CoordinatorConfig::default();
        config.timeouts.collect = Duration::ZERO;
        assert!(validate_config(&config).is_err());

        let mut config = CoordinatorConfig::default();
        config.cache.chunk_size = 0;
        assert!(validate_config(&config).is_err());

        let mut config = CoordinatorConfig::default();
        config.session.parallel = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_lock_templates() {
        let mut config = CoordinatorConfig::default();
        config.locks.package_template = "proof-lock-{user}".to_string();
        assert!(validate_config(&config).is_err());

        let mut config = CoordinatorConfig::default();
        config.locks.cache_template = "../cache-{user}".to_string();
        assert!(validate_config(&config).is_err());
    }
}
