use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub transfer: TransferSettings,
    pub storage: StorageSettings,
    pub bridge: BridgeSettings,
}

/// Listening addresses and the token secret.
///
/// `port` serves the broker control protocol, `transfer_port` the binary
/// attachment protocol.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub transfer_port: u16,
    pub jwt_secret: String,
}

/// Limits of the subscription broker.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub max_connections: usize,
    /// Messages buffered per connection before new ones are dropped for it.
    pub outbound_buffer: usize,
    /// Requests queued per actor before senders wait.
    pub queue_depth: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransferSettings {
    pub max_frame_size: usize,
    pub chunk_high_water: usize,
    pub flush_timeout_ms: u64,
}

impl TransferSettings {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BridgeSettings {
    pub poll_interval_ms: u64,
}

impl BridgeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub transfer: Option<PartialTransferSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub bridge: Option<PartialBridgeSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub transfer_port: Option<u16>,
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_connections: Option<usize>,
    pub outbound_buffer: Option<usize>,
    pub queue_depth: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTransferSettings {
    pub max_frame_size: Option<usize>,
    pub chunk_high_water: Option<usize>,
    pub flush_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBridgeSettings {
    pub poll_interval_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                transfer_port: 8081,
                jwt_secret: "change-me".to_string(),
            },
            broker: BrokerSettings {
                max_connections: 1000,
                outbound_buffer: 256,
                queue_depth: 1024,
            },
            transfer: TransferSettings {
                max_frame_size: 8 * 1024 * 1024,
                chunk_high_water: 15 * 1024 * 1024,
                flush_timeout_ms: 10_000,
            },
            storage: StorageSettings {
                path: "popcast_db".to_string(),
            },
            bridge: BridgeSettings {
                poll_interval_ms: 1000,
            },
        }
    }
}

impl PartialSettings {
    /// Overlay whatever was specified on top of `default`.
    pub fn merge(self, default: Settings) -> Settings {
        let server = self.server.unwrap_or_default();
        let broker = self.broker.unwrap_or_default();
        let transfer = self.transfer.unwrap_or_default();
        let storage = self.storage.unwrap_or_default();
        let bridge = self.bridge.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
                transfer_port: server
                    .transfer_port
                    .unwrap_or(default.server.transfer_port),
                jwt_secret: server.jwt_secret.unwrap_or(default.server.jwt_secret),
            },
            broker: BrokerSettings {
                max_connections: broker
                    .max_connections
                    .unwrap_or(default.broker.max_connections),
                outbound_buffer: broker
                    .outbound_buffer
                    .unwrap_or(default.broker.outbound_buffer),
                queue_depth: broker.queue_depth.unwrap_or(default.broker.queue_depth),
            },
            transfer: TransferSettings {
                max_frame_size: transfer
                    .max_frame_size
                    .unwrap_or(default.transfer.max_frame_size),
                chunk_high_water: transfer
                    .chunk_high_water
                    .unwrap_or(default.transfer.chunk_high_water),
                flush_timeout_ms: transfer
                    .flush_timeout_ms
                    .unwrap_or(default.transfer.flush_timeout_ms),
            },
            storage: StorageSettings {
                path: storage.path.unwrap_or(default.storage.path),
            },
            bridge: BridgeSettings {
                poll_interval_ms: bridge
                    .poll_interval_ms
                    .unwrap_or(default.bridge.poll_interval_ms),
            },
        }
    }
}
