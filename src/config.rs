//! Serde helpers shared by the configuration structs of each component.
//!
//! The structs themselves live next to the code they configure
//! ([`crate::rpc::RpcConfig`], [`crate::dht::DhtConfig`],
//! [`crate::record_store::RecordStoreConfig`], ...). Loading them from a file
//! is left to the embedding application.

/// `Duration` as an integer number of milliseconds.
///
/// ```ignore
/// #[serde(with = "crate::config::duration_ms")]
/// pub timeout: Duration,
/// ```
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }

    pub fn serialize<S>(duration: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_u64(duration.as_millis() as u64)
    }
}
