//! Service configuration read from the environment.
//!
//! - `KINMERGE_DB_PATH`: SQLite database file path (default: "kinmerge.db")
//! - `KINMERGE_STORE_TIMEOUT_MS`: bound on every store call (default: 5000)
//! - `KINMERGE_MATCH_THRESHOLD`: minimum surfaced confidence (default: 50)
//! - `KINMERGE_MATCH_WEIGHTS`: `name,birth,gender,generation`
//!   (default: "40,25,15,20")
//!
//! Unset variables fall back to defaults; set but invalid ones are errors.

use std::time::Duration;

use kinmerge_engine::{EngineConfig, MatchWeights};

use crate::error::ServiceError;

pub const DEFAULT_DB_PATH: &str = "kinmerge.db";
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub db_path: String,
    pub store_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            db_path: DEFAULT_DB_PATH.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            engine: EngineConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ServiceError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServiceError> {
        let mut config = ServiceConfig::default();

        if let Some(path) = lookup("KINMERGE_DB_PATH") {
            config.db_path = path;
        }
        if let Some(raw) = lookup("KINMERGE_STORE_TIMEOUT_MS") {
            let ms: u64 = parse("KINMERGE_STORE_TIMEOUT_MS", &raw)?;
            if ms == 0 {
                return Err(ServiceError::Validation(
                    "KINMERGE_STORE_TIMEOUT_MS must be positive".to_string(),
                ));
            }
            config.store_timeout = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("KINMERGE_MATCH_THRESHOLD") {
            let threshold: u8 = parse("KINMERGE_MATCH_THRESHOLD", &raw)?;
            if threshold > 100 {
                return Err(ServiceError::Validation(format!(
                    "KINMERGE_MATCH_THRESHOLD must be at most 100, got {}",
                    threshold
                )));
            }
            config.engine.matcher.threshold = threshold;
        }
        if let Some(raw) = lookup("KINMERGE_MATCH_WEIGHTS") {
            config.engine.matcher.weights = parse_weights(&raw)?;
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ServiceError> {
    raw.trim()
        .parse()
        .map_err(|_| ServiceError::Validation(format!("invalid value for {}: '{}'", key, raw)))
}

/// Parses `name,birth,gender,generation`.
pub fn parse_weights(raw: &str) -> Result<MatchWeights, ServiceError> {
    let parts = raw
        .split(',')
        .map(|part| parse::<u32>("KINMERGE_MATCH_WEIGHTS", part))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [name, birth, gender, generation] => {
            Ok(MatchWeights::new(*name, *birth, *gender, *generation)?)
        }
        _ => Err(ServiceError::Validation(format!(
            "KINMERGE_MATCH_WEIGHTS needs four comma-separated values, got '{}'",
            raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.engine.matcher.threshold, 50);
        assert_eq!(config.store_timeout, Duration::from_secs(5));
    }

    #[test]
    fn reads_every_variable() {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("KINMERGE_DB_PATH", "/tmp/families.db"),
            ("KINMERGE_STORE_TIMEOUT_MS", "250"),
            ("KINMERGE_MATCH_THRESHOLD", "65"),
            ("KINMERGE_MATCH_WEIGHTS", "50, 20, 10, 20"),
        ]))
        .unwrap();
        assert_eq!(config.db_path, "/tmp/families.db");
        assert_eq!(config.store_timeout, Duration::from_millis(250));
        assert_eq!(config.engine.matcher.threshold, 65);
        assert_eq!(config.engine.matcher.weights.name, 50);
        assert_eq!(config.engine.matcher.weights.total(), 100);
    }

    #[test]
    fn rejects_invalid_values() {
        for pairs in [
            [("KINMERGE_STORE_TIMEOUT_MS", "soon")],
            [("KINMERGE_STORE_TIMEOUT_MS", "0")],
            [("KINMERGE_MATCH_THRESHOLD", "101")],
            [("KINMERGE_MATCH_WEIGHTS", "1,2,3")],
            // name + birth below 60% of the total
            [("KINMERGE_MATCH_WEIGHTS", "10,10,40,40")],
        ] {
            let err = ServiceConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{:?}", pairs);
        }
    }
}
