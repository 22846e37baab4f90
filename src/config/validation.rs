use crate::config::types::{Config, CrawlerConfig, OutputConfig, SiteConfig};
use crate::ConfigError;
use url::Url;

/// Slowest pace a run may be configured for (one request per 100 minutes)
pub(crate) const MIN_REQUESTS_PER_MINUTE: f64 = 0.01;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_site_config(&config.site)?;
    validate_output_config(&config.output)?;
    Ok(())
}

/// Validates crawler configuration
pub(crate) fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.start_id < 0 {
        return Err(ConfigError::Validation(format!(
            "start_id must be >= 0, got {}",
            config.start_id
        )));
    }

    if let Some(end_id) = config.end_id {
        if end_id < config.start_id {
            return Err(ConfigError::Validation(format!(
                "end_id ({}) must not be below start_id ({})",
                end_id, config.start_id
            )));
        }
    }

    if !config.requests_per_minute.is_finite()
        || config.requests_per_minute < MIN_REQUESTS_PER_MINUTE
    {
        return Err(ConfigError::Validation(format!(
            "requests_per_minute must be a number >= {}, got {}",
            MIN_REQUESTS_PER_MINUTE, config.requests_per_minute
        )));
    }

    if !(0.0..=1.0).contains(&config.jitter_factor) {
        return Err(ConfigError::Validation(format!(
            "jitter_factor must be between 0.0 and 1.0, got {}",
            config.jitter_factor
        )));
    }

    if config.max_consecutive_not_found < 1 {
        return Err(ConfigError::Validation(
            "max_consecutive_not_found must be >= 1".to_string(),
        ));
    }

    for (name, value) in [
        ("drain_every", config.drain_every),
        ("failure_streak_drain", config.failure_streak_drain),
        ("checkpoint_every", config.checkpoint_every),
    ] {
        if value < 1 {
            return Err(ConfigError::Validation(format!(
                "{} must be >= 1, got {}",
                name, value
            )));
        }
    }

    Ok(())
}

/// Validates site configuration
fn validate_site_config(config: &SiteConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.base_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid base_url: {}", e)))?;

    if url.scheme() != "https" && url.scheme() != "http" {
        return Err(ConfigError::InvalidUrl(format!(
            "base_url must use http or https, got '{}'",
            url.scheme()
        )));
    }

    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "timeout_secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.checkpoint_path.is_empty() {
        return Err(ConfigError::Validation(
            "checkpoint_path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyKind;

    fn crawler() -> CrawlerConfig {
        CrawlerConfig {
            strategy: StrategyKind::ForwardId,
            start_id: 100,
            end_id: Some(200),
            requests_per_minute: 30.0,
            jitter_factor: 0.1,
            max_retries: 3,
            max_consecutive_not_found: 10,
            drain_every: 50,
            failure_streak_drain: 5,
            checkpoint_every: 10,
            resume: true,
        }
    }

    #[test]
    fn test_valid_crawler_config() {
        assert!(validate_crawler_config(&crawler()).is_ok());
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut config = crawler();
        config.end_id = Some(50);
        assert!(validate_crawler_config(&config).is_err());
    }

    #[test]
    fn test_non_positive_rate_rejected() {
        let mut config = crawler();
        config.requests_per_minute = 0.0;
        assert!(validate_crawler_config(&config).is_err());

        config.requests_per_minute = -5.0;
        assert!(validate_crawler_config(&config).is_err());

        config.requests_per_minute = f64::NAN;
        assert!(validate_crawler_config(&config).is_err());
    }

    #[test]
    fn test_vanishing_rate_rejected() {
        let mut config = crawler();
        config.requests_per_minute = 1e-20;
        assert!(validate_crawler_config(&config).is_err());

        config.requests_per_minute = MIN_REQUESTS_PER_MINUTE;
        assert!(validate_crawler_config(&config).is_ok());
    }

    #[test]
    fn test_jitter_out_of_band_rejected() {
        let mut config = crawler();
        config.jitter_factor = 1.5;
        assert!(validate_crawler_config(&config).is_err());
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let mut config = crawler();
        config.checkpoint_every = 0;
        assert!(validate_crawler_config(&config).is_err());

        let mut config = crawler();
        config.drain_every = 0;
        assert!(validate_crawler_config(&config).is_err());
    }

    #[test]
    fn test_site_url_checked() {
        let site = SiteConfig {
            base_url: "not a url".to_string(),
            user_agent: "Harvest/0.3".to_string(),
            cookie: None,
            timeout_secs: 30,
        };
        assert!(matches!(
            validate_site_config(&site),
            Err(ConfigError::InvalidUrl(_))
        ));
    }
}
