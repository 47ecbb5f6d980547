use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};

use thingbus::adapter::{BrokerEventStore, Forwarder, Handler, Mirror, StaticAuth};
use thingbus::broker::{ExchangeBroker, LogBroker, RetainedBroker};
use thingbus::config::{Settings, load_config};
use thingbus::messaging::kafka::KafkaTransport;
use thingbus::messaging::mqtt::{MqttTransport, RemoteMqttTransport};
use thingbus::messaging::rabbitmq::RabbitTransport;
use thingbus::messaging::transport::Transport;
use thingbus::messaging::{Backoff, BrokerPubSub, PubSub, Publisher};
use thingbus::transport::websocket::start_websocket_server;
use thingbus::utils::{BrokerError, logging};

/// One configured broker, as seen by sessions and as a mirror target.
struct Backend {
    pubsub: Arc<dyn PubSub>,
    publisher: Arc<dyn Publisher>,
}

impl Backend {
    fn new<T: Transport>(transport: T, settings: &Settings) -> Self {
        let pubsub = Arc::new(BrokerPubSub::new(
            transport,
            Duration::from_millis(settings.broker.timeout_ms),
            Backoff::from_millis(&settings.broker.backoff_ms),
        ));
        Self {
            pubsub: pubsub.clone(),
            publisher: pubsub,
        }
    }
}

fn build_backends(settings: &Settings, log: LogBroker) -> HashMap<&'static str, Backend> {
    let mut backends = HashMap::new();
    backends.insert("kafka", Backend::new(KafkaTransport::new(log), settings));
    backends.insert(
        "rabbitmq",
        Backend::new(
            RabbitTransport::new(ExchangeBroker::new(), &settings.rabbitmq.exchange),
            settings,
        ),
    );
    let mqtt = &settings.mqtt;
    let backend = if mqtt.remote {
        let client_id = format!("{}-mqtt", settings.broker.instance);
        let transport =
            RemoteMqttTransport::connect(&client_id, &mqtt.host, mqtt.port, mqtt.retain);
        Backend::new(transport, settings)
    } else {
        Backend::new(MqttTransport::new(RetainedBroker::new(), mqtt.retain), settings)
    };
    backends.insert("mqtt", backend);
    backends
}

fn open_log(settings: &Settings) -> Result<LogBroker, BrokerError> {
    match &settings.kafka.path {
        Some(path) => LogBroker::open(path, settings.kafka.partitions),
        None => Ok(LogBroker::new(settings.kafka.partitions)),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            return;
        }
    };
    logging::init(&settings.log.level);

    if let Err(e) = run_server(settings).await {
        error!("Server failed: {}", e);
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let log = open_log(&settings)?;
    let backends = build_backends(&settings, log.clone());
    let primary = backends
        .get(settings.broker.primary.as_str())
        .ok_or_else(|| format!("unknown primary broker '{}'", settings.broker.primary))?;
    info!("Using {} as primary broker", settings.broker.primary);

    let mut mirrors = Vec::new();
    let mut forwarders = Vec::new();
    for (i, rule) in settings.forward.iter().enumerate() {
        let Some(target) = backends.get(rule.target.as_str()) else {
            warn!("Skipping forward rule to unknown broker '{}'", rule.target);
            continue;
        };
        if rule.target == settings.broker.primary {
            warn!("Skipping forward rule from the primary broker to itself");
            continue;
        }
        mirrors.push(Mirror {
            name: rule.target.clone(),
            source: rule.source.clone(),
            target: target.publisher.clone(),
        });
        let forwarder = Forwarder::new(
            &format!("forwarder-{i}-{}", rule.target),
            &rule.source,
            target.publisher.clone(),
        );
        forwarder.forward(primary.pubsub.as_ref()).await?;
        forwarders.push(forwarder);
    }

    let events = BrokerEventStore::new(primary.publisher.clone(), &settings.events.stream);
    let handler = Handler::new(
        primary.pubsub.clone(),
        Arc::new(StaticAuth::new(&settings.things)),
        Arc::new(events),
        &settings.broker.instance,
    )
    .with_mirrors(mirrors);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    tokio::select! {
        result = start_websocket_server(&addr, Arc::new(handler)) => {
            if let Err(e) = result {
                error!("WebSocket server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    for forwarder in &forwarders {
        if let Err(e) = forwarder.stop(primary.pubsub.as_ref()).await {
            warn!("Failed to stop forwarder: {}", e);
        }
    }
    let closed = join_all(backends.values().map(|backend| backend.publisher.close())).await;
    for e in closed.into_iter().filter_map(Result::err) {
        warn!("Failed to close broker connection: {}", e);
    }
    log.shutdown();
    Ok(())
}
