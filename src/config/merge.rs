use std::path::PathBuf;
use std::time::Duration;

use super::env::{env_var, parse_env};
use super::yaml::{WindowYaml, YamlConfig};
use super::{ServerConfig, TlsConfig};
use crate::core::rate_limit::RateLimitPolicy;

/// Build the final configuration: defaults, then environment, then YAML.
pub fn merge_config(
    yaml: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();
    apply_env(&mut config)?;
    if let Some(yaml) = yaml {
        apply_yaml(&mut config, yaml);
    }
    Ok(config)
}

fn apply_env(config: &mut ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(host) = env_var("HOST") {
        config.host = host;
    }
    if let Some(port) = parse_env::<u16>("PORT")? {
        config.port = port;
    }

    config.tls = match (env_var("TLS_CERT_PATH"), env_var("TLS_KEY_PATH")) {
        (Some(cert), Some(key)) => Some(TlsConfig {
            cert_path: PathBuf::from(cert),
            key_path: PathBuf::from(key),
        }),
        (None, None) => None,
        _ => return Err("Both TLS_CERT_PATH and TLS_KEY_PATH must be set to enable TLS".into()),
    };

    if let Some(key) = env_var("OPENAI_API_KEY") {
        config.openai_api_key = Some(key);
    }
    if let Some(url) = env_var("OPENAI_BASE_URL") {
        config.openai_base_url = url;
    }
    if let Some(model) = env_var("REALTIME_DEFAULT_MODEL") {
        config.default_model = model;
    }
    if let Some(voice) = env_var("REALTIME_DEFAULT_VOICE") {
        config.default_voice = voice;
    }
    if let Some(timeout) = parse_env::<u64>("UPSTREAM_TIMEOUT_SECONDS")? {
        config.upstream_timeout_seconds = timeout;
    }

    config.cors_allowed_origins = env_var("CORS_ALLOWED_ORIGINS");
    if let Some(rps) = parse_env::<u32>("RATE_LIMIT_REQUESTS_PER_SECOND")? {
        config.rate_limit_requests_per_second = rps;
    }
    if let Some(burst) = parse_env::<u32>("RATE_LIMIT_BURST_SIZE")? {
        config.rate_limit_burst_size = burst;
    }
    if let Some(trusted) = parse_env::<bool>("TRUSTED_PROXY")? {
        config.trust_forwarded_headers = trusted;
    }

    env_window(&mut config.session_rate_limit, "RATE_LIMIT_SESSION")?;
    env_window(&mut config.sessions_rate_limit, "RATE_LIMIT_SESSIONS")?;
    env_window(&mut config.negotiate_rate_limit, "RATE_LIMIT_NEGOTIATE")?;
    if let Some(secs) = parse_env::<u64>("RATE_LIMIT_SWEEP_INTERVAL_SECS")? {
        config.rate_limit_sweep_interval = Duration::from_secs(secs);
    }

    Ok(())
}

fn env_window(
    policy: &mut RateLimitPolicy,
    prefix: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(max) = parse_env::<u32>(&format!("{prefix}_MAX"))? {
        policy.max_requests = max;
    }
    if let Some(secs) = parse_env::<u64>(&format!("{prefix}_WINDOW_SECS"))? {
        policy.window = Duration::from_secs(secs);
    }
    Ok(())
}

fn apply_yaml(config: &mut ServerConfig, yaml: YamlConfig) {
    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if let Some(tls) = server.tls {
            match tls.enabled {
                Some(false) => config.tls = None,
                _ => {
                    if let (Some(cert), Some(key)) = (tls.cert_path, tls.key_path) {
                        config.tls = Some(TlsConfig {
                            cert_path: PathBuf::from(cert),
                            key_path: PathBuf::from(key),
                        });
                    }
                }
            }
        }
    }

    if let Some(upstream) = yaml.upstream {
        if upstream.api_key.is_some() {
            config.openai_api_key = upstream.api_key;
        }
        if let Some(url) = upstream.base_url {
            config.openai_base_url = url;
        }
        if let Some(model) = upstream.default_model {
            config.default_model = model;
        }
        if let Some(voice) = upstream.default_voice {
            config.default_voice = voice;
        }
        if let Some(timeout) = upstream.timeout_seconds {
            config.upstream_timeout_seconds = timeout;
        }
    }

    if let Some(security) = yaml.security {
        if security.cors_allowed_origins.is_some() {
            config.cors_allowed_origins = security.cors_allowed_origins;
        }
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        if let Some(trusted) = security.trusted_proxy {
            config.trust_forwarded_headers = trusted;
        }
    }

    if let Some(limits) = yaml.rate_limits {
        if let Some(secs) = limits.sweep_interval_secs {
            config.rate_limit_sweep_interval = Duration::from_secs(secs);
        }
        yaml_window(&mut config.session_rate_limit, limits.session);
        yaml_window(&mut config.sessions_rate_limit, limits.sessions);
        yaml_window(&mut config.negotiate_rate_limit, limits.negotiate);
    }
}

fn yaml_window(policy: &mut RateLimitPolicy, window: Option<WindowYaml>) {
    let Some(window) = window else {
        return;
    };
    if let Some(max) = window.max_requests {
        policy.max_requests = max;
    }
    if let Some(secs) = window.window_secs {
        policy.window = Duration::from_secs(secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    #[serial]
    fn test_tls_requires_both_paths() {
        super::super::tests::cleanup_env_vars();
        unsafe {
            env::set_var("TLS_CERT_PATH", "/tmp/cert.pem");
        }

        let result = merge_config(None);
        assert!(result.unwrap_err().to_string().contains("TLS_KEY_PATH"));

        super::super::tests::cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_yaml_can_disable_tls_from_env() {
        super::super::tests::cleanup_env_vars();
        unsafe {
            env::set_var("TLS_CERT_PATH", "/tmp/cert.pem");
            env::set_var("TLS_KEY_PATH", "/tmp/key.pem");
        }

        let yaml: YamlConfig = serde_yaml::from_str(
            r#"
server:
  tls:
    enabled: false
"#,
        )
        .unwrap();

        let config = merge_config(Some(yaml)).unwrap();
        assert!(!config.is_tls_enabled());

        super::super::tests::cleanup_env_vars();
    }

    #[test]
    fn test_yaml_window_partial_override() {
        let mut policy = RateLimitPolicy::per_five_minutes(30);
        yaml_window(
            &mut policy,
            Some(WindowYaml {
                max_requests: None,
                window_secs: Some(60),
            }),
        );
        assert_eq!(policy.max_requests, 30);
        assert_eq!(policy.window, Duration::from_secs(60));
    }
}
