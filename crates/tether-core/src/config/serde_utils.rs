//! Shared serialization/deserialization utilities for configuration
//!
//! Durations are written as plain integers so `tether.toml` stays readable.

/// Helper module for Duration serialization as seconds
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "tether_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize a Duration as seconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds (u64)
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Helper module for Duration serialization as milliseconds
///
/// Used for the short timings (debounce window, backoff steps) where
/// whole seconds are too coarse.
pub mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timings {
        #[serde(with = "duration_secs")]
        ttl: Duration,
        #[serde(with = "duration_millis")]
        debounce: Duration,
    }

    #[test]
    fn test_durations_serialize_as_integers() {
        let timings = Timings {
            ttl: Duration::from_secs(604_800),
            debounce: Duration::from_millis(500),
        };
        let toml = toml::to_string(&timings).unwrap();
        assert!(toml.contains("ttl = 604800"));
        assert!(toml.contains("debounce = 500"));
    }

    #[test]
    fn test_durations_deserialize_from_integers() {
        let timings: Timings = toml::from_str("ttl = 60\ndebounce = 250\n").unwrap();
        assert_eq!(timings.ttl, Duration::from_secs(60));
        assert_eq!(timings.debounce, Duration::from_millis(250));
    }
}
