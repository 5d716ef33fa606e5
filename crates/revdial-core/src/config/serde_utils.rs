//! Serde helpers for configuration files

/// `Duration` as a number of seconds.
///
/// Whole seconds are written as integers; fractions (`ping_wait = 0.5`)
/// are accepted and written as floats so sub-second keepalive tuning
/// survives a save/load cycle.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Secs {
        Whole(u64),
        Fraction(f64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_u64(duration.as_secs())
        } else {
            serializer.serialize_f64(duration.as_secs_f64())
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Secs::deserialize(deserializer)? {
            Secs::Whole(secs) => Ok(Duration::from_secs(secs)),
            Secs::Fraction(secs) => Duration::try_from_secs_f64(secs).map_err(|_| {
                serde::de::Error::custom(format!("invalid duration: {} seconds", secs))
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Tuning {
        #[serde(with = "duration_secs")]
        ping_wait: Duration,
    }

    #[test]
    fn test_whole_seconds_stay_integers() {
        let tuning = Tuning {
            ping_wait: Duration::from_secs(60),
        };
        assert_eq!(serde_json::to_string(&tuning).unwrap(), r#"{"ping_wait":60}"#);
    }

    #[test]
    fn test_fractional_seconds() {
        let tuning: Tuning = toml::from_str("ping_wait = 0.25").unwrap();
        assert_eq!(tuning.ping_wait, Duration::from_millis(250));

        let text = toml::to_string(&tuning).unwrap();
        assert_eq!(toml::from_str::<Tuning>(&text).unwrap(), tuning);
    }

    #[test]
    fn test_negative_rejected() {
        assert!(serde_json::from_str::<Tuning>(r#"{"ping_wait":-1.0}"#).is_err());
    }
}
