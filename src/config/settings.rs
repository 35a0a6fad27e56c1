use std::time::Duration;

use serde::Deserialize;

use crate::transport::ConnectOptions;
use crate::worker::{Topology, WorkerOptions};

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub topology: TopologySettings,
    pub reconnect: ReconnectSettings,
    pub shutdown: ShutdownSettings,
    pub client: ClientSettings,
    pub pipeline: PipelineSettings,
    pub notifier: NotifierSettings,
    pub logging: LoggingSettings,
}

/// Where the broker lives and how the connection is kept alive.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Bare host name or full `amqp://` URL.
    pub host: String,
    /// Generous on purpose: pipeline runs take minutes.
    pub heartbeat_secs: u64,
    pub connection_name: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TopologySettings {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub reply_queue: String,
    pub status_queue: String,
    pub prefetch: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub step_secs: u64,
    pub max_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ShutdownSettings {
    pub step_timeout_secs: u64,
    pub drain_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClientSettings {
    pub reply_timeout_secs: u64,
}

/// External program run once per job.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct PipelineSettings {
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NotifierSettings {
    /// WebSocket URL of the STOMP endpoint; notifications are off when unset.
    pub url: Option<String>,
    pub destination: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub topology: Option<PartialTopologySettings>,
    pub reconnect: Option<PartialReconnectSettings>,
    pub shutdown: Option<PartialShutdownSettings>,
    pub client: Option<PartialClientSettings>,
    pub pipeline: Option<PartialPipelineSettings>,
    pub notifier: Option<PartialNotifierSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub heartbeat_secs: Option<u64>,
    pub connection_name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialTopologySettings {
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub reply_queue: Option<String>,
    pub status_queue: Option<String>,
    pub prefetch: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialReconnectSettings {
    pub step_secs: Option<u64>,
    pub max_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialShutdownSettings {
    pub step_timeout_secs: Option<u64>,
    pub drain_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClientSettings {
    pub reply_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPipelineSettings {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialNotifierSettings {
    pub url: Option<String>,
    pub destination: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        let topology = Topology::default();
        Self {
            broker: BrokerSettings {
                host: "localhost".to_string(),
                heartbeat_secs: 1800,
                connection_name: "jobrelay".to_string(),
            },
            topology: TopologySettings {
                exchange: topology.exchange,
                queue: topology.queue,
                routing_key: topology.routing_key,
                reply_queue: topology.reply_queue,
                status_queue: topology.status_queue,
                prefetch: topology.prefetch,
            },
            reconnect: ReconnectSettings {
                step_secs: 1,
                max_secs: 30,
            },
            shutdown: ShutdownSettings {
                step_timeout_secs: 5,
                drain_timeout_secs: 10,
            },
            client: ClientSettings {
                reply_timeout_secs: 3600,
            },
            pipeline: PipelineSettings {
                command: "pci-pipeline".to_string(),
                args: Vec::new(),
            },
            notifier: NotifierSettings {
                url: None,
                destination: crate::notify::stomp::DEFAULT_DESTINATION.to_string(),
                timeout_secs: 10,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::for_host(
            &self.broker.host,
            Duration::from_secs(self.broker.heartbeat_secs),
        )
        .with_connection_name(&self.broker.connection_name)
    }

    pub fn topology(&self) -> Topology {
        let t = &self.topology;
        Topology {
            exchange: t.exchange.clone(),
            queue: t.queue.clone(),
            routing_key: t.routing_key.clone(),
            reply_queue: t.reply_queue.clone(),
            status_queue: t.status_queue.clone(),
            prefetch: t.prefetch,
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            connect: self.connect_options(),
            topology: self.topology(),
            reconnect_step: Duration::from_secs(self.reconnect.step_secs),
            reconnect_max: Duration::from_secs(self.reconnect.max_secs),
            step_timeout: Duration::from_secs(self.shutdown.step_timeout_secs),
            drain_timeout: Duration::from_secs(self.shutdown.drain_timeout_secs),
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.client.reply_timeout_secs)
    }
}
