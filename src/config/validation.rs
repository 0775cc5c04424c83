use super::ServerConfig;
use crate::core::rate_limit::RateLimitPolicy;

/// Validate the merged configuration
pub fn validate(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_policy("session", &config.session_rate_limit)?;
    validate_policy("sessions", &config.sessions_rate_limit)?;
    validate_policy("negotiate", &config.negotiate_rate_limit)?;

    if config.rate_limit_sweep_interval.is_zero() {
        return Err("Rate limit sweep interval must be greater than zero".into());
    }
    if config.upstream_timeout_seconds == 0 {
        return Err("Upstream timeout must be greater than zero".into());
    }

    validate_base_url(&config.openai_base_url)?;

    if let Some(tls) = &config.tls {
        if tls.cert_path.as_os_str().is_empty() || tls.key_path.as_os_str().is_empty() {
            return Err("TLS requires both a certificate path and a key path".into());
        }
    }

    Ok(())
}

fn validate_policy(name: &str, policy: &RateLimitPolicy) -> Result<(), Box<dyn std::error::Error>> {
    if policy.max_requests == 0 {
        return Err(format!("Rate limit ceiling for '{name}' must be greater than zero").into());
    }
    if policy.window.is_zero() {
        return Err(format!("Rate limit window for '{name}' must be greater than zero").into());
    }
    Ok(())
}

fn validate_base_url(raw: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = url::Url::parse(raw).map_err(|e| format!("Invalid upstream base URL '{raw}': {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("Upstream base URL must use http or https, got '{other}'").into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = ServerConfig::default();
        config.sessions_rate_limit.window = Duration::ZERO;

        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("'sessions'"));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let mut config = ServerConfig::default();
        config.rate_limit_sweep_interval = Duration::ZERO;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let mut config = ServerConfig::default();
        config.openai_base_url = "ftp://example.com".to_string();
        assert!(validate(&config).is_err());

        config.openai_base_url = "not a url".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_tls_path_rejected() {
        let mut config = ServerConfig::default();
        config.tls = Some(TlsConfig {
            cert_path: PathBuf::from("/tmp/cert.pem"),
            key_path: PathBuf::new(),
        });
        assert!(validate(&config).is_err());
    }
}
