mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, EventSettings, ForwardRule, KafkaSettings, LogSettings, MqttSettings,
    RabbitSettings, ServerSettings, Settings, ThingSettings,
};

/// Loads the configuration from `config/default` and `THINGBUS_*`
/// environment variables, merged over the default values.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_config_from("config/default")
}

/// Same as `load_config`, reading the optional file at `path` (extension
/// may be omitted).
pub fn load_config_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("THINGBUS")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("broker.backoff_ms")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        server: ServerSettings {
            host: partial
                .server
                .as_ref()
                .and_then(|s| s.host.clone())
                .unwrap_or(default.server.host),
            port: partial
                .server
                .as_ref()
                .and_then(|s| s.port)
                .unwrap_or(default.server.port),
        },
        log: LogSettings {
            level: partial
                .log
                .as_ref()
                .and_then(|l| l.level.clone())
                .unwrap_or(default.log.level),
        },
        broker: BrokerSettings {
            primary: partial
                .broker
                .as_ref()
                .and_then(|b| b.primary.clone())
                .unwrap_or(default.broker.primary),
            timeout_ms: partial
                .broker
                .as_ref()
                .and_then(|b| b.timeout_ms)
                .unwrap_or(default.broker.timeout_ms),
            backoff_ms: partial
                .broker
                .as_ref()
                .and_then(|b| b.backoff_ms.clone())
                .unwrap_or(default.broker.backoff_ms),
            instance: partial
                .broker
                .as_ref()
                .and_then(|b| b.instance.clone())
                .unwrap_or(default.broker.instance),
        },
        kafka: KafkaSettings {
            path: partial
                .kafka
                .as_ref()
                .and_then(|k| k.path.clone())
                .or(default.kafka.path),
            partitions: partial
                .kafka
                .as_ref()
                .and_then(|k| k.partitions)
                .unwrap_or(default.kafka.partitions),
        },
        rabbitmq: RabbitSettings {
            exchange: partial
                .rabbitmq
                .as_ref()
                .and_then(|r| r.exchange.clone())
                .unwrap_or(default.rabbitmq.exchange),
        },
        mqtt: MqttSettings {
            host: partial
                .mqtt
                .as_ref()
                .and_then(|m| m.host.clone())
                .unwrap_or(default.mqtt.host),
            port: partial
                .mqtt
                .as_ref()
                .and_then(|m| m.port)
                .unwrap_or(default.mqtt.port),
            remote: partial
                .mqtt
                .as_ref()
                .and_then(|m| m.remote)
                .unwrap_or(default.mqtt.remote),
            retain: partial
                .mqtt
                .as_ref()
                .and_then(|m| m.retain)
                .unwrap_or(default.mqtt.retain),
        },
        forward: partial.forward.unwrap_or(default.forward),
        things: partial.things.unwrap_or(default.things),
        events: EventSettings {
            stream: partial
                .events
                .as_ref()
                .and_then(|e| e.stream.clone())
                .unwrap_or(default.events.stream),
        },
    })
}
