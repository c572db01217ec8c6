//! Control-plane messages exchanged with controlling clients
//!
//! Messages are JSON objects tagged by `type`:
//!
//! | Request | Reply |
//! |---|---|
//! | `PING` | `PONG` with the device profile and enabled optimizations |
//! | `STATUS_REQUEST` | `STATUS_RESPONSE` with connection, device and cache stats |
//! | `ERROR_REPORT` | none, logged |
//! | `FORCE_CACHE_MAINTENANCE` | none, trim and expire run in the background |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slipstream_cache::now_millis;
use tracing::{info, warn};

use crate::device::DeviceProfile;
use crate::orchestrator::FetchOrchestrator;
use crate::registry::ConnectionStats;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<u64>,
    },
    StatusRequest,
    ErrorReport {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        timestamp: Option<u64>,
        #[serde(default)]
        device_profile: Option<Value>,
        #[serde(default)]
        connection_stats: Option<Value>,
    },
    ForceCacheMaintenance,
}

impl ControlMessage {
    /// Wire name of the message type
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "PING",
            Self::StatusRequest => "STATUS_REQUEST",
            Self::ErrorReport { .. } => "ERROR_REPORT",
            Self::ForceCacheMaintenance => "FORCE_CACHE_MAINTENANCE",
        }
    }
}

/// Slow-device behaviours in effect for this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlowDeviceOptimizations {
    /// Registry capacity lowered below the configured default
    pub reduce_concurrent_requests: bool,
    /// Cache-first serving
    pub prefer_cache_over_network: bool,
    /// TTLs stretched for slow devices
    pub extended_stale_while_revalidate: bool,
    /// Cache hits served without background revalidation
    pub skip_background_revalidation: bool,
    /// Fetch timeouts scaled above the configured base
    pub extended_timeouts: bool,
}

impl SlowDeviceOptimizations {
    pub fn for_orchestrator(orchestrator: &FetchOrchestrator) -> Self {
        let class = orchestrator.device_class();
        let config = orchestrator.config();
        let slow = class.is_slow_class();

        Self {
            reduce_concurrent_requests: orchestrator.registry().capacity()
                < config.max_concurrent_connections,
            prefer_cache_over_network: orchestrator.cache().is_some(),
            extended_stale_while_revalidate: slow && orchestrator.cache().is_some(),
            skip_background_revalidation: slow,
            extended_timeouts: class.timeout_multiplier(&config.timeout_multipliers) > 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub name: String,
    pub max_size: usize,
    pub max_age_ms: u64,
    pub entries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ControlReply {
    Pong {
        timestamp: Option<u64>,
        device_profile: DeviceProfile,
        optimizations: SlowDeviceOptimizations,
    },
    StatusResponse {
        connection_stats: ConnectionStats,
        device_profile: DeviceProfile,
        cache_stats: CacheStats,
        timestamp: u64,
    },
}

async fn cache_stats(orchestrator: &FetchOrchestrator) -> CacheStats {
    match orchestrator.cache() {
        Some(cache) => {
            let summary = cache.summary().await;
            CacheStats {
                name: summary.name,
                max_size: summary.max_entries,
                max_age_ms: summary.max_age_ms,
                entries: summary.entries,
            }
        }
        None => {
            let config = orchestrator.config();
            CacheStats {
                name: config.cache_name.clone(),
                max_size: config.max_cache_size,
                max_age_ms: config.max_cache_age.as_millis() as u64,
                entries: 0,
            }
        }
    }
}

/// Handles one message, returning the reply if the message expects one.
pub async fn handle(
    orchestrator: &FetchOrchestrator,
    message: ControlMessage,
) -> Option<ControlReply> {
    match message {
        ControlMessage::Ping { timestamp } => Some(ControlReply::Pong {
            timestamp,
            device_profile: orchestrator.profile().clone(),
            optimizations: SlowDeviceOptimizations::for_orchestrator(orchestrator),
        }),
        ControlMessage::StatusRequest => Some(ControlReply::StatusResponse {
            connection_stats: orchestrator.stats(),
            device_profile: orchestrator.profile().clone(),
            cache_stats: cache_stats(orchestrator).await,
            timestamp: now_millis(),
        }),
        ControlMessage::ErrorReport {
            url,
            device_profile,
            connection_stats,
            ..
        } => {
            let device = device_profile
                .as_ref()
                .and_then(|p| p.get("classification"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            let stats = connection_stats.unwrap_or_default();
            warn!(
                "Client error report for {} (device: {device}, stats: {stats})",
                url.as_deref().unwrap_or("unknown url"),
            );
            None
        }
        ControlMessage::ForceCacheMaintenance => {
            info!("Forced cache maintenance requested");
            orchestrator.spawn_maintenance();
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_messages() {
        let ping: ControlMessage =
            serde_json::from_str(r#"{"type":"PING","timestamp":42}"#).unwrap();
        assert_eq!(ping, ControlMessage::Ping { timestamp: Some(42) });

        let status: ControlMessage = serde_json::from_str(r#"{"type":"STATUS_REQUEST"}"#).unwrap();
        assert_eq!(status, ControlMessage::StatusRequest);

        let report: ControlMessage = serde_json::from_str(
            r#"{"type":"ERROR_REPORT","url":"https://a/","deviceProfile":{"classification":"slow"}}"#,
        )
        .unwrap();
        assert!(matches!(report, ControlMessage::ErrorReport { url: Some(_), device_profile: Some(_), .. }));

        let maintenance: ControlMessage =
            serde_json::from_str(r#"{"type":"FORCE_CACHE_MAINTENANCE"}"#).unwrap();
        assert_eq!(maintenance, ControlMessage::ForceCacheMaintenance);
        assert_eq!(maintenance.kind(), "FORCE_CACHE_MAINTENANCE");

        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"REBOOT"}"#).is_err());
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = ControlReply::StatusResponse {
            connection_stats: ConnectionStats::default(),
            device_profile: DeviceProfile::conservative(),
            cache_stats: CacheStats {
                name: "c".into(),
                max_size: 2000,
                max_age_ms: 1,
                entries: 0,
            },
            timestamp: 5,
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "STATUS_RESPONSE");
        assert_eq!(json["cacheStats"]["maxSize"], 2000);
        assert_eq!(json["connectionStats"]["total"], 0);
        assert_eq!(json["deviceProfile"]["classification"], "slow");
    }
}
