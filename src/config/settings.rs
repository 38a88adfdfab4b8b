use serde::Deserialize;

/// Top-level configuration settings for the hub.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub gossip: GossipSettings,
    pub workers: WorkerSettings,
    pub logging: LoggingSettings,
}

/// Listener addresses, identity of the owner and the peers to dial.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    /// Port for client connections.
    pub client_port: u16,
    /// Port for other servers.
    pub server_port: u16,
    pub public_client_address: String,
    pub public_server_address: String,
    /// When set, only this key may create LAOs.
    pub owner_public_key: Option<String>,
    pub peers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
}

/// Gossip policy. None of these values affect correctness, only traffic.
#[derive(Debug, Deserialize, Clone)]
pub struct GossipSettings {
    /// Chance of giving up on a rumor each time a peer reports it as a duplicate.
    pub stop_probability: f64,
    /// Number of locally published messages that triggers a new rumor.
    pub rumor_batch_size: usize,
    pub max_dispatch_passes: usize,
    pub max_unprocessed_attempts: u32,
    pub rumor_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// How often each peer is told the last rumor id accepted per origin.
    pub rumor_state_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    pub pool_size: usize,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub gossip: Option<PartialGossipSettings>,
    pub workers: Option<PartialWorkerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub client_port: Option<u16>,
    pub server_port: Option<u16>,
    pub public_client_address: Option<String>,
    pub public_server_address: Option<String>,
    pub owner_public_key: Option<String>,
    pub peers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialGossipSettings {
    pub stop_probability: Option<f64>,
    pub rumor_batch_size: Option<usize>,
    pub max_dispatch_passes: Option<usize>,
    pub max_unprocessed_attempts: Option<u32>,
    pub rumor_interval_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub rumor_state_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWorkerSettings {
    pub pool_size: Option<usize>,
    pub shutdown_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl PartialSettings {
    /// Overlay the values that were provided on top of `default`.
    pub fn merge(self, default: Settings) -> Settings {
        Settings {
            server: self.server.unwrap_or_default().merge(default.server),
            storage: self.storage.unwrap_or_default().merge(default.storage),
            gossip: self.gossip.unwrap_or_default().merge(default.gossip),
            workers: self.workers.unwrap_or_default().merge(default.workers),
            logging: self.logging.unwrap_or_default().merge(default.logging),
        }
    }
}

impl PartialServerSettings {
    fn merge(self, default: ServerSettings) -> ServerSettings {
        ServerSettings {
            host: self.host.unwrap_or(default.host),
            client_port: self.client_port.unwrap_or(default.client_port),
            server_port: self.server_port.unwrap_or(default.server_port),
            public_client_address: self
                .public_client_address
                .unwrap_or(default.public_client_address),
            public_server_address: self
                .public_server_address
                .unwrap_or(default.public_server_address),
            owner_public_key: self.owner_public_key.or(default.owner_public_key),
            peers: self.peers.unwrap_or(default.peers),
        }
    }
}

impl PartialStorageSettings {
    fn merge(self, default: StorageSettings) -> StorageSettings {
        StorageSettings {
            path: self.path.unwrap_or(default.path),
        }
    }
}

impl PartialGossipSettings {
    fn merge(self, default: GossipSettings) -> GossipSettings {
        GossipSettings {
            stop_probability: self.stop_probability.unwrap_or(default.stop_probability),
            rumor_batch_size: self.rumor_batch_size.unwrap_or(default.rumor_batch_size),
            max_dispatch_passes: self
                .max_dispatch_passes
                .unwrap_or(default.max_dispatch_passes),
            max_unprocessed_attempts: self
                .max_unprocessed_attempts
                .unwrap_or(default.max_unprocessed_attempts),
            rumor_interval_ms: self.rumor_interval_ms.unwrap_or(default.rumor_interval_ms),
            heartbeat_interval_ms: self
                .heartbeat_interval_ms
                .unwrap_or(default.heartbeat_interval_ms),
            rumor_state_interval_ms: self
                .rumor_state_interval_ms
                .unwrap_or(default.rumor_state_interval_ms),
        }
    }
}

impl PartialWorkerSettings {
    fn merge(self, default: WorkerSettings) -> WorkerSettings {
        WorkerSettings {
            pool_size: self.pool_size.unwrap_or(default.pool_size),
            shutdown_grace_secs: self
                .shutdown_grace_secs
                .unwrap_or(default.shutdown_grace_secs),
        }
    }
}

impl PartialLoggingSettings {
    fn merge(self, default: LoggingSettings) -> LoggingSettings {
        LoggingSettings {
            level: self.level.unwrap_or(default.level),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                client_port: 9000,
                server_port: 9001,
                public_client_address: "ws://127.0.0.1:9000".to_string(),
                public_server_address: "ws://127.0.0.1:9001".to_string(),
                owner_public_key: None,
                peers: Vec::new(),
            },
            storage: StorageSettings {
                path: "popmesh_db".to_string(),
            },
            gossip: GossipSettings {
                stop_probability: 0.5,
                rumor_batch_size: 1,
                max_dispatch_passes: 10,
                max_unprocessed_attempts: 10,
                rumor_interval_ms: 5000,
                heartbeat_interval_ms: 30_000,
                rumor_state_interval_ms: 10_000,
            },
            workers: WorkerSettings {
                pool_size: 64,
                shutdown_grace_secs: 5,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}
