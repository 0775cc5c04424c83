use std::env;
use std::str::FromStr;

/// Read an environment variable, treating blank values as unset
pub fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Read and parse an environment variable
///
/// Returns `Ok(None)` when the variable is unset and an error naming the
/// variable when it is set but cannot be parsed.
pub fn parse_env<T>(name: &str) -> Result<Option<T>, Box<dyn std::error::Error>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| format!("Invalid value for {name}: {e}").into()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_var_blank_is_none() {
        unsafe {
            env::set_var("RELAY_TEST_BLANK", "  ");
        }
        assert!(env_var("RELAY_TEST_BLANK").is_none());
        unsafe {
            env::remove_var("RELAY_TEST_BLANK");
        }
    }

    #[test]
    #[serial]
    fn test_parse_env_invalid_number() {
        unsafe {
            env::set_var("RELAY_TEST_PORT", "not-a-port");
        }
        let result = parse_env::<u16>("RELAY_TEST_PORT");
        assert!(result.unwrap_err().to_string().contains("RELAY_TEST_PORT"));
        unsafe {
            env::remove_var("RELAY_TEST_PORT");
        }
    }

    #[test]
    #[serial]
    fn test_parse_env_unset() {
        unsafe {
            env::remove_var("RELAY_TEST_UNSET");
        }
        assert_eq!(parse_env::<u32>("RELAY_TEST_UNSET").unwrap(), None);
    }
}
