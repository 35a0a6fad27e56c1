//! Configuration loading.
//!
//! Sources, lowest precedence first: built-in defaults, an optional
//! `config/default.*` file, `JOBRELAY_*` environment variables (nested keys
//! separated by `__`, e.g. `JOBRELAY_BROKER__HOST`), and finally the legacy
//! `RABBITMQ_HOST` variable for the broker host. A `.env` file is loaded into
//! the environment first when present.

mod settings;

use std::path::Path;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    BrokerSettings, ClientSettings, LoggingSettings, NotifierSettings, PipelineSettings,
    ReconnectSettings, Settings, ShutdownSettings, TopologySettings,
};

pub const ENV_PREFIX: &str = "JOBRELAY";
pub const LEGACY_HOST_VAR: &str = "RABBITMQ_HOST";

/// Loads the configuration from `config/default` and the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from(Path::new("config/default"))
}

/// Loads the configuration using `file` (extension optional) as the file
/// layer. A missing file is not an error.
pub fn load_config_from(file: &Path) -> Result<Settings, ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::from(file).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(" ")
                .with_list_parse_key("pipeline.args")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let mut settings = merge(partial, Settings::default());
    if let Ok(host) = std::env::var(LEGACY_HOST_VAR) {
        if !host.trim().is_empty() {
            settings.broker.host = host;
        }
    }
    Ok(settings)
}

/// Fills every missing value of `partial` from `default`.
fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let broker = partial.broker.unwrap_or_default();
    let topology = partial.topology.unwrap_or_default();
    let reconnect = partial.reconnect.unwrap_or_default();
    let shutdown = partial.shutdown.unwrap_or_default();
    let client = partial.client.unwrap_or_default();
    let pipeline = partial.pipeline.unwrap_or_default();
    let notifier = partial.notifier.unwrap_or_default();
    let logging = partial.logging.unwrap_or_default();

    Settings {
        broker: BrokerSettings {
            host: broker.host.unwrap_or(default.broker.host),
            heartbeat_secs: broker
                .heartbeat_secs
                .unwrap_or(default.broker.heartbeat_secs),
            connection_name: broker
                .connection_name
                .unwrap_or(default.broker.connection_name),
        },
        topology: TopologySettings {
            exchange: topology.exchange.unwrap_or(default.topology.exchange),
            queue: topology.queue.unwrap_or(default.topology.queue),
            routing_key: topology.routing_key.unwrap_or(default.topology.routing_key),
            reply_queue: topology.reply_queue.unwrap_or(default.topology.reply_queue),
            status_queue: topology
                .status_queue
                .unwrap_or(default.topology.status_queue),
            prefetch: topology.prefetch.unwrap_or(default.topology.prefetch),
        },
        reconnect: ReconnectSettings {
            step_secs: reconnect.step_secs.unwrap_or(default.reconnect.step_secs),
            max_secs: reconnect.max_secs.unwrap_or(default.reconnect.max_secs),
        },
        shutdown: ShutdownSettings {
            step_timeout_secs: shutdown
                .step_timeout_secs
                .unwrap_or(default.shutdown.step_timeout_secs),
            drain_timeout_secs: shutdown
                .drain_timeout_secs
                .unwrap_or(default.shutdown.drain_timeout_secs),
        },
        client: ClientSettings {
            reply_timeout_secs: client
                .reply_timeout_secs
                .unwrap_or(default.client.reply_timeout_secs),
        },
        pipeline: PipelineSettings {
            command: pipeline.command.unwrap_or(default.pipeline.command),
            args: pipeline.args.unwrap_or(default.pipeline.args),
        },
        notifier: NotifierSettings {
            url: notifier.url.or(default.notifier.url),
            destination: notifier
                .destination
                .unwrap_or(default.notifier.destination),
            timeout_secs: notifier
                .timeout_secs
                .unwrap_or(default.notifier.timeout_secs),
        },
        logging: LoggingSettings {
            level: logging.level.unwrap_or(default.logging.level),
        },
    }
}
