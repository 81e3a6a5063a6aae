// Engine configuration, loaded from a TOML file if present, else defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a session's lease lasts without renewal.
    #[serde(with = "duration_secs")]
    pub lease_length: Duration,

    /// Prefix used to derive a transport endpoint name from a session id.
    /// Empty means "use the session id itself as the endpoint name".
    pub multiplex_prefix: String,

    /// Initial backoff for "wait for something that may be lost" loops.
    #[serde(with = "duration_millis")]
    pub backoff_initial: Duration,

    /// Maximum backoff ceiling; doubles from `backoff_initial` until here.
    #[serde(with = "duration_millis")]
    pub backoff_max: Duration,

    /// Upper bound on the termination scanner's poll interval.
    #[serde(with = "duration_millis")]
    pub termination_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_length: Duration::from_secs(30),
            multiplex_prefix: "coord/".to_string(),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_millis(12_800),
            termination_poll_interval: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file, falling back to defaults if the
    /// file does not exist.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| crate::error::Error::Internal(format!("invalid config: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(crate::error::Error::Internal(format!(
                "reading config file: {e}"
            ))),
        }
    }

    /// The endpoint name a given session should be addressed at.
    pub fn endpoint_name(&self, session: &crate::ids::SessionId) -> String {
        if self.multiplex_prefix.is_empty() {
            session.to_string()
        } else {
            format!("{}{}", self.multiplex_prefix, session)
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
