use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Covers the edge listener, logging, the message brokers, the forwarding
/// rules and the things allowed to connect.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub log: LogSettings,
    pub broker: BrokerSettings,
    pub kafka: KafkaSettings,
    pub rabbitmq: RabbitSettings,
    pub mqtt: MqttSettings,
    pub forward: Vec<ForwardRule>,
    pub things: Vec<ThingSettings>,
    pub events: EventSettings,
}

/// Configuration settings for the server.
///
/// Defines the host and port the edge listener will bind to.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    pub level: String,
}

/// Settings shared by every broker connector.
///
/// `primary` names the backend sessions publish to and subscribe on
/// (`kafka`, `rabbitmq` or `mqtt`). `timeout_ms` bounds subscribe and
/// unsubscribe acknowledgements; `backoff_ms` is the publish retry schedule.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub primary: String,
    pub timeout_ms: u64,
    pub backoff_ms: Vec<u64>,
    pub instance: String,
}

/// Log broker settings. Without a `path` the log is kept in memory.
#[derive(Debug, Deserialize, Clone)]
pub struct KafkaSettings {
    pub path: Option<String>,
    pub partitions: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RabbitSettings {
    pub exchange: String,
}

/// MQTT backend settings. With `remote` set, the connector talks to the
/// broker at `host:port` instead of the embedded one.
#[derive(Debug, Deserialize, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub remote: bool,
    pub retain: bool,
}

/// Mirrors messages matching `source` from the primary broker to `target`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub source: String,
    pub target: String,
}

/// A thing allowed to connect with `key`, and the channels it may use.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ThingSettings {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventSettings {
    pub stream: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub log: Option<PartialLogSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub kafka: Option<PartialKafkaSettings>,
    pub rabbitmq: Option<PartialRabbitSettings>,
    pub mqtt: Option<PartialMqttSettings>,
    pub forward: Option<Vec<ForwardRule>>,
    pub things: Option<Vec<ThingSettings>>,
    pub events: Option<PartialEventSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub primary: Option<String>,
    pub timeout_ms: Option<u64>,
    pub backoff_ms: Option<Vec<u64>>,
    pub instance: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialKafkaSettings {
    pub path: Option<String>,
    pub partitions: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRabbitSettings {
    pub exchange: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialMqttSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub remote: Option<bool>,
    pub retain: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialEventSettings {
    pub stream: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the application has sensible defaults if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            log: LogSettings {
                level: "info".to_string(),
            },
            broker: BrokerSettings {
                primary: "rabbitmq".to_string(),
                timeout_ms: 2_000,
                backoff_ms: vec![1_000, 3_000, 10_000],
                instance: "thingbus".to_string(),
            },
            kafka: KafkaSettings {
                path: None,
                partitions: 4,
            },
            rabbitmq: RabbitSettings {
                exchange: "messages".to_string(),
            },
            mqtt: MqttSettings {
                host: "127.0.0.1".to_string(),
                port: 1883,
                remote: false,
                retain: false,
            },
            forward: Vec::new(),
            things: Vec::new(),
            events: EventSettings {
                stream: "events.mqtt".to_string(),
            },
        }
    }
}
