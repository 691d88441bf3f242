//! Utility module
//!
//! Logging setup shared by binaries and integration tests.

use tracing::Level;

use crate::core::{Error, Result};

/// Installs a formatting subscriber at the given level
///
/// Fails if another global subscriber is already installed.
pub fn init_logging(level: Level) -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to install logger: {}", e)))
}

/// Parses a level name such as `debug` or `WARN`
pub fn parse_level(name: &str) -> Result<Level> {
    name.trim()
        .parse()
        .map_err(|_| Error::config(format!("Unknown log level: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_level(" WARN ").unwrap(), Level::WARN);
        assert!(parse_level("chatty").is_err());
    }

    #[test]
    fn test_second_install_fails() {
        // the first call may race other tests; the second always finds a subscriber
        let _ = init_logging(Level::DEBUG);
        assert!(init_logging(Level::DEBUG).is_err());
    }
}
