pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the root logger from the default terminal configuration.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Default logging config must parse");

    config.build_logger().expect("Error building root logger")
}

/// Builds the root logger from a sloggers TOML configuration string.
pub fn init_from_toml(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Returns a logger that swallows everything. Used by components constructed
/// without a parent logger, mostly in tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let _ = init();
    }

    #[test]
    fn test_bad_config_is_an_error() {
        assert!(init_from_toml("type = \"nonsense\"").is_err());
    }
}
