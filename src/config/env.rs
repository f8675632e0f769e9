//! Environment variable helpers.

use std::str::FromStr;

use super::ConfigError;

/// Value of `name`, with empty strings treated as unset.
pub(crate) fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parsed value of `name`; a present but unparseable value is an error.
pub(crate) fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_parse() {
        unsafe {
            std::env::set_var("CALLVOX_TEST_PORT", "8080");
            std::env::set_var("CALLVOX_TEST_BAD", "eighty");
            std::env::set_var("CALLVOX_TEST_EMPTY", "  ");
        }

        assert_eq!(env_parse::<u16>("CALLVOX_TEST_PORT").unwrap(), Some(8080));
        assert!(matches!(
            env_parse::<u16>("CALLVOX_TEST_BAD"),
            Err(ConfigError::InvalidEnv { .. })
        ));
        assert_eq!(env_var("CALLVOX_TEST_EMPTY"), None);
        assert_eq!(env_parse::<u16>("CALLVOX_TEST_MISSING").unwrap(), None);

        unsafe {
            std::env::remove_var("CALLVOX_TEST_PORT");
            std::env::remove_var("CALLVOX_TEST_BAD");
            std::env::remove_var("CALLVOX_TEST_EMPTY");
        }
    }
}
