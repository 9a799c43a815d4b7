//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! settings file only needs the fields it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Root settings for one backplane instance.
///
/// ```json
/// {
///   "applicationName": "chat",
///   "connectionString": "FormatName:DIRECT=OS:queuehost\\private$",
///   "ack": { "timeoutMs": 10000 }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackplaneSettings {
    /// Prefix of every channel name.
    pub application_name: String,
    /// Bus address, passed through to the bus untouched.
    pub connection_string: String,
    /// This server's identity in channel names. Resolved by
    /// [`BackplaneSettings::resolved_server_name`] when unset.
    pub server_name: Option<String>,
    /// Acknowledgment timing.
    pub ack: AckSettings,
    /// Local connection settings.
    pub connection: ConnectionSettings,
}

impl Default for BackplaneSettings {
    fn default() -> Self {
        Self {
            application_name: "hubplane".to_string(),
            connection_string: String::new(),
            server_name: None,
            ack: AckSettings::default(),
            connection: ConnectionSettings::default(),
        }
    }
}

impl BackplaneSettings {
    /// The configured server name, else `HOSTNAME`, else a generated
    /// `server_<uuid>`.
    pub fn resolved_server_name(&self) -> String {
        self.server_name
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| format!("server_{}", Uuid::now_v7().simple()))
    }
}

/// How long a remote group change may wait for its acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AckSettings {
    /// Age after which a pending acknowledgment is cancelled.
    pub timeout_ms: u64,
    /// Period of the sweep that cancels expired acknowledgments.
    pub sweep_interval_ms: u64,
}

impl Default for AckSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl AckSettings {
    /// [`timeout_ms`](Self::timeout_ms) as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// [`sweep_interval_ms`](Self::sweep_interval_ms) as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Local connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// Outbound frames buffered per connection before writes fail.
    pub send_queue_capacity: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            send_queue_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = BackplaneSettings::default();
        assert_eq!(settings.application_name, "hubplane");
        assert!(settings.connection_string.is_empty());
        assert!(settings.server_name.is_none());
        assert_eq!(settings.ack.timeout(), Duration::from_secs(30));
        assert_eq!(settings.ack.sweep_interval(), Duration::from_secs(5));
        assert_eq!(settings.connection.send_queue_capacity, 256);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(BackplaneSettings::default()).unwrap();
        assert_eq!(json["applicationName"], "hubplane");
        assert_eq!(json["ack"]["timeoutMs"], 30_000);
        assert_eq!(json["ack"]["sweepIntervalMs"], 5_000);
        assert_eq!(json["connection"]["sendQueueCapacity"], 256);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: BackplaneSettings =
            serde_json::from_str(r#"{"ack": {"timeoutMs": 500}}"#).unwrap();
        assert_eq!(settings.ack.timeout_ms, 500);
        assert_eq!(settings.ack.sweep_interval_ms, 5_000);
        assert_eq!(settings.application_name, "hubplane");
    }

    #[test]
    fn explicit_server_name_wins() {
        let settings = BackplaneSettings {
            server_name: Some("node-a".into()),
            ..Default::default()
        };
        assert_eq!(settings.resolved_server_name(), "node-a");
    }

    #[test]
    fn resolved_server_name_never_empty() {
        let settings = BackplaneSettings {
            server_name: Some(String::new()),
            ..Default::default()
        };
        assert!(!settings.resolved_server_name().is_empty());
    }
}
