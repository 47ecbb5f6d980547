use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout};

use super::kafka::KafkaTransport;
use super::mqtt::{MqttTransport, RemoteMqttTransport, Router, to_mqtt};
use super::rabbitmq::{RabbitTransport, to_binding};
use super::topic::{
    from_topic, matches, parse_edge_topic, parse_subtopic, to_edge_topic, to_topic,
};
use super::transport::{Delivery, Transport, TransportClient};
use super::{Backoff, BrokerPubSub, Message, MessageHandler, Publisher, Subscriber};
use crate::broker::{ExchangeBroker, LogBroker, RetainedBroker};
use crate::utils::{BrokerError, BrokerErrorKind, ErrorKind, MessagingError};

const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct MockState {
    published: Vec<(String, Vec<u8>)>,
    publish_attempts: usize,
    transient_failures: usize,
    reject_publish: bool,
    reject_subscribe: bool,
    subscribe_delay: Option<Duration>,
    unsubscribe_delay: Option<Duration>,
    routes: Vec<(String, String, Delivery)>,
    dialed: usize,
    closed_clients: usize,
    closed: bool,
}

#[derive(Clone, Default)]
struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Pushes raw bytes to every route matching `topic`.
    fn inject(&self, topic: &str, raw: Vec<u8>) {
        self.with(|state| {
            for (_, filter, delivery) in &state.routes {
                if matches(filter, topic) {
                    let _ = delivery.send(raw.clone());
                }
            }
        });
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Client = MockClient;

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let result = self.with(|state| {
            state.publish_attempts += 1;
            if state.reject_publish {
                return Err(BrokerError::rejected("NOT_FOUND"));
            }
            if state.transient_failures > 0 {
                state.transient_failures -= 1;
                return Err(BrokerError::transient("leader not available"));
            }
            state.published.push((topic.to_string(), payload.clone()));
            Ok(())
        });
        result?;
        self.inject(topic, payload);
        Ok(())
    }

    async fn dial(&self, client_id: &str) -> Result<MockClient, BrokerError> {
        self.with(|state| state.dialed += 1);
        Ok(MockClient {
            id: client_id.to_string(),
            transport: self.clone(),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.with(|state| state.closed = true);
        Ok(())
    }
}

struct MockClient {
    id: String,
    transport: MockTransport,
}

#[async_trait]
impl TransportClient for MockClient {
    async fn subscribe(&self, filter: &str, delivery: Delivery) -> Result<(), BrokerError> {
        let (delay, reject) = self
            .transport
            .with(|state| (state.subscribe_delay, state.reject_subscribe));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if reject {
            return Err(BrokerError::rejected("invalid filter"));
        }
        self.transport.with(|state| {
            state
                .routes
                .push((self.id.clone(), filter.to_string(), delivery))
        });
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        let delay = self.transport.with(|state| state.unsubscribe_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.transport.with(|state| {
            state
                .routes
                .retain(|(id, f, _)| !(id == &self.id && f == filter))
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.transport.with(|state| {
            state.closed_clients += 1;
            state.routes.retain(|(id, _, _)| id != &self.id);
        });
        Ok(())
    }
}

struct Recorder {
    tx: mpsc::UnboundedSender<Message>,
    cancelled: AtomicBool,
}

impl Recorder {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Self {
            tx,
            cancelled: AtomicBool::new(false),
        });
        (recorder, rx)
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, msg: Message) -> Result<(), MessagingError> {
        self.tx
            .send(msg)
            .map_err(|e| MessagingError::Handler(e.to_string()))
    }

    fn cancel(&self) -> Result<(), MessagingError> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn pubsub(mock: &MockTransport) -> BrokerPubSub<MockTransport> {
    BrokerPubSub::new(mock.clone(), TIMEOUT, Backoff::default())
}

fn message(channel: &str, payload: &str) -> Message {
    Message {
        channel: channel.to_string(),
        publisher: "thing-1".to_string(),
        protocol: "mqtt".to_string(),
        payload: payload.as_bytes().to_vec(),
        created: Message::now(),
        ..Message::default()
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no message delivered")
        .expect("handler channel closed")
}

#[test]
fn test_message_codec() {
    let msg = message("chan", "payload");
    let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
    assert_eq!(decoded, msg);

    let err = Message::decode(&[0xff, 0x01]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Codec);
}

#[test]
fn test_topic_naming() {
    assert_eq!(to_topic("chan", "").unwrap(), "channels.chan");
    assert_eq!(to_topic("chan", "a/b").unwrap(), "channels.chan.a.b");
    assert_eq!(to_topic("chan", "/a//b/").unwrap(), "channels.chan.a.b");
    assert_eq!(to_topic("", "a"), Err(MessagingError::EmptyChannel));

    let (channel, subtopic) = from_topic("channels.chan.a.b").unwrap();
    assert_eq!((channel.as_str(), subtopic.as_str()), ("chan", "a.b"));
    assert_eq!(from_topic("devices.chan"), Err(MessagingError::MalformedTopic));
}

#[test]
fn test_topic_round_trip() {
    for (subtopic, normalized) in [
        ("", ""),
        ("temp", "temp"),
        ("a/b/c", "a.b.c"),
        ("/a/b", "a.b"),
        ("a/b/", "a.b"),
        ("a//b///c", "a.b.c"),
        ("a.b/c", "a.b.c"),
        ("..a..", "a"),
    ] {
        let topic = to_topic("chan", subtopic).unwrap();
        let (channel, parsed) = from_topic(&topic).unwrap();
        assert_eq!(channel, "chan");
        assert_eq!(parsed, normalized, "subtopic {subtopic:?}");
        assert_eq!(to_topic(&channel, &parsed).unwrap(), topic);
    }
}

#[test]
fn test_subtopic_wildcards() {
    assert_eq!(parse_subtopic("a/+/#").unwrap(), "a.*.>");
    assert_eq!(parse_subtopic("temp*"), Err(MessagingError::MalformedSubtopic));
    assert_eq!(parse_subtopic("a/b#"), Err(MessagingError::MalformedSubtopic));
    assert_eq!(parse_subtopic("").unwrap(), "");
}

#[test]
fn test_edge_topics() {
    let (channel, subtopic) = parse_edge_topic("channels/chan/messages/a/b?ct=json").unwrap();
    assert_eq!(channel, "chan");
    assert_eq!(subtopic, "a.b");

    let (_, subtopic) = parse_edge_topic("/channels/chan/messages").unwrap();
    assert_eq!(subtopic, "");

    assert!(parse_edge_topic("channels/chan").is_err());
    assert!(parse_edge_topic("things/chan/messages").is_err());
    assert_eq!(to_edge_topic("chan", "a.b"), "channels/chan/messages/a/b");
}

#[test]
fn test_filter_matching() {
    assert!(matches("channels.>", "channels.a.b"));
    assert!(matches("channels.*.b", "channels.a.b"));
    assert!(matches("channels.a", "channels.a"));
    assert!(!matches("channels.>", "channels"));
    assert!(!matches("channels.*", "channels.a.b"));
}

#[test]
fn test_broker_topic_translation() {
    assert_eq!(to_mqtt("channels.a.*.>"), "channels/a/+/#");
    assert_eq!(to_binding("channels.a.>"), "channels.a.#");
    assert_eq!(to_binding("channels.*"), "channels.*");
}

#[tokio::test]
async fn test_validation_leaves_registry_untouched() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let (handler, _rx) = Recorder::new();

    let err = ps.subscribe("", "channels.a", handler.clone()).await;
    assert_eq!(err, Err(MessagingError::EmptyId));
    let err = ps.subscribe("c1", "", handler).await;
    assert_eq!(err, Err(MessagingError::EmptyTopic));
    assert_eq!(ps.unsubscribe("", "channels.a").await, Err(MessagingError::EmptyId));
    assert_eq!(ps.unsubscribe("c1", "").await, Err(MessagingError::EmptyTopic));

    assert_eq!(ps.clients(), 0);
    assert_eq!(mock.with(|s| s.dialed), 0);
}

#[tokio::test]
async fn test_publish_empty_topic() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let err = ps.publish("", &message("chan", "x")).await;
    assert_eq!(err, Err(MessagingError::EmptyTopic));
    assert_eq!(mock.with(|s| s.publish_attempts), 0);
}

#[tokio::test]
async fn test_subscribe_twice_is_a_conflict() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let (handler, _rx) = Recorder::new();

    ps.subscribe("c1", "channels.a", handler.clone()).await.unwrap();
    let err = ps.subscribe("c1", "channels.a", handler).await;
    assert_eq!(err, Err(MessagingError::AlreadySubscribed));
    assert_eq!(ps.topics("c1").await, vec!["channels.a".to_string()]);
    assert_eq!(mock.with(|s| s.dialed), 1);
}

#[tokio::test]
async fn test_unsubscribe_releases_client() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let (handler, _rx) = Recorder::new();

    let err = ps.unsubscribe("c1", "channels.a").await;
    assert_eq!(err, Err(MessagingError::NotSubscribed));

    ps.subscribe("c1", "channels.a", handler.clone()).await.unwrap();
    ps.subscribe("c1", "channels.b", handler.clone()).await.unwrap();
    assert_eq!(
        ps.unsubscribe("c1", "channels.c").await,
        Err(MessagingError::NotSubscribed)
    );

    ps.unsubscribe("c1", "channels.a").await.unwrap();
    assert!(ps.is_registered("c1").await);
    assert!(handler.cancelled.load(Ordering::SeqCst));

    ps.unsubscribe("c1", "channels.b").await.unwrap();
    assert!(!ps.is_registered("c1").await);
    assert_eq!(ps.clients(), 0);
    assert_eq!(mock.with(|s| s.closed_clients), 1);
    assert!(ps.topics("c1").await.is_empty());

    let err = ps.unsubscribe("c1", "channels.b").await;
    assert_eq!(err, Err(MessagingError::NotSubscribed));
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_timeout() {
    let mock = MockTransport::default();
    mock.with(|s| s.subscribe_delay = Some(Duration::from_secs(10)));
    let ps = pubsub(&mock);
    let (handler, _rx) = Recorder::new();

    let err = ps.subscribe("c1", "channels.a", handler).await.unwrap_err();
    assert_eq!(err, MessagingError::SubscribeTimeout);
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(!ps.is_registered("c1").await);
    assert_eq!(mock.with(|s| s.closed_clients), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_timeout_keeps_subscription() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let (handler, _rx) = Recorder::new();
    ps.subscribe("c1", "channels.a", handler).await.unwrap();

    mock.with(|s| s.unsubscribe_delay = Some(Duration::from_secs(10)));
    let err = ps.unsubscribe("c1", "channels.a").await;
    assert_eq!(err, Err(MessagingError::UnsubscribeTimeout));
    assert_eq!(ps.topics("c1").await, vec!["channels.a".to_string()]);
}

#[tokio::test]
async fn test_rejected_first_subscribe_creates_no_entry() {
    let mock = MockTransport::default();
    mock.with(|s| s.reject_subscribe = true);
    let ps = pubsub(&mock);
    let (handler, _rx) = Recorder::new();

    let err = ps.subscribe("c1", "channels.a", handler).await.unwrap_err();
    assert!(matches!(err, MessagingError::Broker(ref e) if e.kind == BrokerErrorKind::Rejected));
    assert_eq!(ps.clients(), 0);
    assert_eq!(mock.with(|s| (s.dialed, s.closed_clients)), (1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_same_client_operations_are_serialized() {
    let mock = MockTransport::default();
    mock.with(|s| s.subscribe_delay = Some(Duration::from_millis(500)));
    let ps = pubsub(&mock);
    let (h1, _rx1) = Recorder::new();
    let (h2, _rx2) = Recorder::new();

    let start = Instant::now();
    let (a, b) = tokio::join!(
        ps.subscribe("c1", "channels.a", h1),
        ps.subscribe("c1", "channels.b", h2)
    );
    a.unwrap();
    b.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(mock.with(|s| s.dialed), 1);
    assert_eq!(
        ps.topics("c1").await,
        vec!["channels.a".to_string(), "channels.b".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_different_clients_proceed_independently() {
    let mock = MockTransport::default();
    mock.with(|s| s.subscribe_delay = Some(Duration::from_millis(1500)));
    let ps = pubsub(&mock);
    let (h1, _rx1) = Recorder::new();
    let (h2, _rx2) = Recorder::new();

    let start = Instant::now();
    let (a, b) = tokio::join!(
        ps.subscribe("c1", "channels.a", h1),
        ps.subscribe("c2", "channels.a", h2)
    );
    a.unwrap();
    b.unwrap();

    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(mock.with(|s| s.dialed), 2);
    assert_eq!(ps.clients(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_operations_leave_no_entry() {
    let mock = MockTransport::default();
    mock.with(|s| s.subscribe_delay = Some(Duration::from_secs(10)));
    let ps = pubsub(&mock);
    let (h1, _rx1) = Recorder::new();
    let (h2, _rx2) = Recorder::new();

    let first = {
        let ps = ps.clone();
        tokio::spawn(async move { ps.subscribe("c1", "channels.a", h1).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(ps.clients(), 1);

    let waiting = timeout(Duration::from_millis(100), ps.subscribe("c1", "channels.b", h2)).await;
    assert!(waiting.is_err());
    assert!(ps.topics("c1").await.is_empty());

    assert_eq!(first.await.unwrap(), Err(MessagingError::SubscribeTimeout));
    assert!(!ps.is_registered("c1").await);
    assert_eq!(ps.clients(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_publish_retries_transient_errors() {
    let mock = MockTransport::default();
    mock.with(|s| s.transient_failures = 3);
    let ps = pubsub(&mock);

    let start = Instant::now();
    ps.publish("channels.a", &message("a", "x")).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(14));
    assert_eq!(mock.with(|s| s.publish_attempts), 4);
    assert_eq!(mock.with(|s| s.published.len()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_publish_returns_last_error_when_retries_run_out() {
    let mock = MockTransport::default();
    mock.with(|s| s.transient_failures = 10);
    let ps = pubsub(&mock);

    let err = ps.publish("channels.a", &message("a", "x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokerTransient);
    assert_eq!(mock.with(|s| s.publish_attempts), 4);
}

#[tokio::test]
async fn test_publish_does_not_retry_rejections() {
    let mock = MockTransport::default();
    mock.with(|s| s.reject_publish = true);
    let ps = pubsub(&mock);

    let err = ps.publish("channels.a", &message("a", "x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokerFatal);
    assert_eq!(mock.with(|s| s.publish_attempts), 1);
}

#[tokio::test]
async fn test_undecodable_payload_is_dropped() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let (handler, mut rx) = Recorder::new();
    ps.subscribe("c1", "channels.a", handler).await.unwrap();

    mock.inject("channels.a", vec![0xff, 0xff, 0xff]);
    ps.publish("channels.a", &message("a", "valid")).await.unwrap();

    assert_eq!(next(&mut rx).await.payload, b"valid".to_vec());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_fan_out_to_every_subscriber() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let (h1, mut rx1) = Recorder::new();
    let (h2, mut rx2) = Recorder::new();
    ps.subscribe("c1", "channels.topic", h1).await.unwrap();
    ps.subscribe("c2", "channels.topic", h2).await.unwrap();

    ps.publish("channels.topic", &message("topic", "payload"))
        .await
        .unwrap();

    assert_eq!(next(&mut rx1).await.payload, b"payload".to_vec());
    assert_eq!(next(&mut rx2).await.payload, b"payload".to_vec());
}

#[tokio::test]
async fn test_one_client_many_topics() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let (h1, mut rx1) = Recorder::new();
    let (h2, mut rx2) = Recorder::new();
    ps.subscribe("c1", "channels.topic", h1).await.unwrap();
    ps.subscribe("c1", "channels.topic.engine", h2).await.unwrap();

    assert_eq!(
        ps.topics("c1").await,
        vec!["channels.topic".to_string(), "channels.topic.engine".to_string()]
    );
    assert_eq!(mock.with(|s| s.dialed), 1);

    let mut msg = message("topic", "engine");
    msg.subtopic = "engine".to_string();
    ps.publish("channels.topic.engine", &msg).await.unwrap();

    assert_eq!(next(&mut rx2).await.subtopic, "engine");
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mock = MockTransport::default();
    let ps = pubsub(&mock);
    let (handler, _rx) = Recorder::new();
    ps.subscribe("c1", "channels.a", handler.clone()).await.unwrap();

    ps.close().await.unwrap();
    ps.close().await.unwrap();

    assert!(handler.cancelled.load(Ordering::SeqCst));
    assert!(mock.with(|s| s.closed && s.routes.is_empty()));
    let err = ps.publish("channels.a", &message("a", "x")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BrokerFatal);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule() {
    let backoff = Backoff::from_millis(&[100, 200]);
    assert_eq!(backoff.max_attempts(), 3);
    assert_eq!(Backoff::none().max_attempts(), 1);

    let mut calls = 0;
    let result: Result<(), MessagingError> = backoff
        .retry(|| {
            calls += 1;
            async { Err(BrokerError::transient("busy").into()) }
        })
        .await;
    assert!(result.is_err());
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn test_kafka_end_to_end() {
    let transport = KafkaTransport::new(LogBroker::new(4));
    let ps = BrokerPubSub::new(transport, TIMEOUT, Backoff::none());
    let (handler, mut rx) = Recorder::new();
    ps.subscribe("c1", "channels.a.>", handler).await.unwrap();

    ps.publish("channels.a.temp", &message("a", "21")).await.unwrap();
    assert_eq!(next(&mut rx).await.payload, b"21".to_vec());

    ps.unsubscribe("c1", "channels.a.>").await.unwrap();
    ps.publish("channels.a.temp", &message("a", "22")).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_kafka_leader_election_is_retried() {
    let broker = LogBroker::new(1);
    let ps = BrokerPubSub::new(KafkaTransport::new(broker.clone()), TIMEOUT, Backoff::default());
    broker.begin_election("channels.a");

    let elector = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        elector.complete_election("channels.a");
    });

    ps.publish("channels.a", &message("a", "x")).await.unwrap();
    assert_eq!(broker.end_offset("channels.a", 0), 1);
}

#[tokio::test]
async fn test_rabbitmq_end_to_end() {
    let broker = ExchangeBroker::new();
    let transport = RabbitTransport::new(broker.clone(), "messages");
    let ps = BrokerPubSub::new(transport, TIMEOUT, Backoff::none());
    let (handler, mut rx) = Recorder::new();
    ps.subscribe("c1", "channels.>", handler).await.unwrap();
    assert!(broker.has_queue("c1.channels.>"));

    ps.publish("channels.a.b", &message("a", "m")).await.unwrap();
    assert_eq!(next(&mut rx).await.payload, b"m".to_vec());

    ps.unsubscribe("c1", "channels.>").await.unwrap();
    assert!(!broker.has_queue("c1.channels.>"));
}

#[tokio::test]
async fn test_rabbitmq_blocked_connection_is_transient() {
    let broker = ExchangeBroker::new();
    let ps = BrokerPubSub::new(
        RabbitTransport::new(broker.clone(), "messages"),
        TIMEOUT,
        Backoff::none(),
    );
    broker.block();

    let err = ps.publish("channels.a", &message("a", "m")).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_mqtt_end_to_end_with_retained() {
    let broker = RetainedBroker::new();
    let ps = BrokerPubSub::new(MqttTransport::new(broker.clone(), true), TIMEOUT, Backoff::none());

    ps.publish("channels.a.temp", &message("a", "last")).await.unwrap();
    assert!(broker.retained("channels/a/temp").is_some());

    let (handler, mut rx) = Recorder::new();
    ps.subscribe("c1", "channels.a.*", handler).await.unwrap();
    assert_eq!(next(&mut rx).await.payload, b"last".to_vec());

    ps.unsubscribe("c1", "channels.a.*").await.unwrap();
    assert!(!broker.is_connected("c1"));
}

#[tokio::test]
async fn test_mqtt_empty_message_is_still_retained() {
    let broker = RetainedBroker::new();
    let ps = BrokerPubSub::new(MqttTransport::new(broker.clone(), true), TIMEOUT, Backoff::none());

    ps.publish("channels.a", &message("a", "")).await.unwrap();
    let retained = broker.retained("channels/a").unwrap();
    assert_eq!(Message::decode(&retained).unwrap().payload, Vec::<u8>::new());
}

#[tokio::test]
async fn test_mqtt_unavailable_is_transient() {
    let broker = RetainedBroker::new();
    let ps = BrokerPubSub::new(MqttTransport::new(broker.clone(), false), TIMEOUT, Backoff::none());
    broker.set_available(false);

    let err = ps.publish("channels.a", &message("a", "m")).await.unwrap_err();
    assert!(err.is_transient());
}

#[test]
fn test_router_dispatch_and_release() {
    let router = Router::default();
    let (tx1, mut rx1) = mpsc::unbounded_channel();
    let (tx2, mut rx2) = mpsc::unbounded_channel();
    router.add("c1", "channels/#", tx1);
    router.add("c2", "channels/#", tx2);

    assert_eq!(router.dispatch("channels/a", b"x"), 2);
    assert_eq!(rx1.try_recv().unwrap(), b"x".to_vec());
    assert_eq!(rx2.try_recv().unwrap(), b"x".to_vec());

    assert_eq!(router.remove("c1", "channels/#"), Some(true));
    assert_eq!(router.remove("c1", "channels/#"), None);
    assert_eq!(router.remove_owner("c2"), vec!["channels/#".to_string()]);
    assert_eq!(router.dispatch("channels/a", b"x"), 0);
}

async fn wait_for_requests(router: &Router, count: usize) {
    timeout(Duration::from_secs(1), async {
        while router.pending() < count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("request never sent");
}

fn granted() -> [rumqttc::SubscribeReasonCode; 1] {
    [rumqttc::SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce)]
}

#[tokio::test(start_paused = true)]
async fn test_remote_mqtt_unsubscribe_can_be_retried() {
    let (transport, _eventloop) =
        RemoteMqttTransport::detached("bridge", "127.0.0.1", 1883, false);
    let router = transport.router().clone();
    let client = Arc::new(transport.dial("c1").await.unwrap());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscribing = {
        let client = client.clone();
        tokio::spawn(async move { client.subscribe("channels.a", tx).await })
    };
    wait_for_requests(&router, 1).await;
    router.on_suback(&granted());
    subscribing.await.unwrap().unwrap();

    let first = timeout(TIMEOUT, client.unsubscribe("channels.a")).await;
    assert!(first.is_err());
    assert_eq!(router.dispatch("channels/a", b"x"), 1);
    assert_eq!(rx.try_recv().unwrap(), b"x".to_vec());

    // The late UNSUBACK of the abandoned request.
    router.on_unsuback();
    let retry = {
        let client = client.clone();
        tokio::spawn(async move { client.unsubscribe("channels.a").await })
    };
    wait_for_requests(&router, 1).await;
    router.on_unsuback();
    retry.await.unwrap().unwrap();

    assert_eq!(router.dispatch("channels/a", b"x"), 0);
    let err = client.unsubscribe("channels.a").await.unwrap_err();
    assert_eq!(err.kind, BrokerErrorKind::Rejected);
}

#[tokio::test(start_paused = true)]
async fn test_remote_mqtt_subscribe_timeout_is_undone() {
    let (transport, _eventloop) =
        RemoteMqttTransport::detached("bridge", "127.0.0.1", 1883, false);
    let router = transport.router().clone();
    let client = transport.dial("c1").await.unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();

    let subscribing = timeout(TIMEOUT, client.subscribe("channels.a", tx)).await;
    assert!(subscribing.is_err());
    assert_eq!(router.dispatch("channels/a", b"x"), 0);

    // The SUBACK still owed plus the UNSUBSCRIBE that takes it back.
    wait_for_requests(&router, 2).await;
    router.on_suback(&granted());
    router.on_unsuback();
    assert_eq!(router.pending(), 0);
}

#[tokio::test]
async fn test_router_correlates_acks_in_order() {
    use rumqttc::{QoS, SubscribeReasonCode};

    let router = Router::default();
    let (first, first_rx) = oneshot::channel();
    let (second, second_rx) = oneshot::channel();
    router.expect_suback(first);
    router.expect_suback(second);

    router.on_suback(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
    router.on_suback(&[SubscribeReasonCode::Failure]);

    assert!(first_rx.await.unwrap().is_ok());
    let err = second_rx.await.unwrap().unwrap_err();
    assert_eq!(err.kind, BrokerErrorKind::Rejected);

    let (pending, pending_rx) = oneshot::channel();
    router.expect_unsuback(pending);
    router.fail_pending(&BrokerError::closed());
    assert!(pending_rx.await.unwrap().is_err());
}
