use crate::dispatcher::{dispatch_broker_message, MessageDispatcher};
use crate::models::BrokerConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeFilter};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const REQUEST_CAPACITY: usize = 100;
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Process-wide connection settings shared by every broker connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub client_prefix: String,
    pub keep_alive: Duration,
    pub reconnect_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Topics to add and remove when a configuration's topic set changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl TopicDiff {
    pub fn between<'a>(
        current: impl IntoIterator<Item = &'a String>,
        wanted: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let current: BTreeSet<&String> = current.into_iter().collect();
        let wanted: BTreeSet<&String> = wanted.into_iter().collect();
        Self {
            added: wanted.difference(&current).map(|t| (*t).clone()).collect(),
            removed: current.difference(&wanted).map(|t| (*t).clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// One live connection to one broker configuration. All of the
/// configuration's topics share this single client; messages are handled in
/// arrival order by the connection's own task.
pub struct BrokerConnection {
    config: Arc<RwLock<Arc<BrokerConfig>>>,
    client: AsyncClient,
    topics: Arc<Mutex<BTreeSet<String>>>,
    client_state: Arc<Mutex<ClientState>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BrokerConnection {
    /// Starts the client and its event-loop task. Connecting happens in the
    /// background; failures are retried at a fixed interval for as long as
    /// the connection is open.
    pub fn open(
        config: BrokerConfig,
        settings: &ConnectionSettings,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Self {
        let client_id = client_id(&settings.client_prefix, config.id);
        debug!(
            config_id = config.id,
            "Configuring MQTT broker at {}:{} as '{}'...", config.broker, config.port, client_id
        );

        let mut mqtt_options = MqttOptions::new(client_id, config.broker.clone(), config.port);
        mqtt_options.set_keep_alive(settings.keep_alive);
        mqtt_options.set_clean_session(true);
        if let Some(username) = config.username.as_deref().filter(|u| !u.is_empty()) {
            mqtt_options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let topics = Arc::new(Mutex::new(
            config.subscription_topics().into_iter().collect::<BTreeSet<_>>(),
        ));
        let client_state = Arc::new(Mutex::new(ClientState::Connecting));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let config = Arc::new(RwLock::new(Arc::new(config)));

        let worker = ConnectionWorker {
            config: config.clone(),
            client: client.clone(),
            topics: topics.clone(),
            client_state: client_state.clone(),
            dispatcher,
            reconnect_interval: settings.reconnect_interval,
        };
        let task = tokio::spawn(worker.run(eventloop, shutdown_rx));

        Self {
            config,
            client,
            topics,
            client_state,
            shutdown,
            task,
        }
    }

    pub async fn config(&self) -> Arc<BrokerConfig> {
        self.config.read().await.clone()
    }

    pub async fn state(&self) -> ClientState {
        self.client_state.lock().await.clone()
    }

    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.topics.lock().await.iter().cloned().collect()
    }

    /// Moves this connection to `config`'s topic set without reconnecting:
    /// new topics are subscribed, dropped topics unsubscribed. Only valid
    /// when the connection parameters are unchanged.
    pub async fn apply_topics(&self, config: BrokerConfig) -> TopicDiff {
        let wanted = config.subscription_topics();
        let config_id = config.id;
        *self.config.write().await = Arc::new(config);

        let diff = {
            let mut topics = self.topics.lock().await;
            let diff = TopicDiff::between(topics.iter(), wanted.iter());
            // The set is what every later ConnAck resubscribes, so it changes
            // even if a request below fails.
            *topics = wanted.into_iter().collect();
            diff
        };

        if !diff.added.is_empty() {
            let filters = diff
                .added
                .iter()
                .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce));
            match self.client.subscribe_many(filters).await {
                Ok(_) => info!(config_id, "Subscribed to {:?}.", diff.added),
                Err(e) => warn!(config_id, "Failed to subscribe to {:?}: {}", diff.added, e),
            }
        }
        for topic in &diff.removed {
            match self.client.unsubscribe(topic.clone()).await {
                Ok(_) => info!(config_id, "Unsubscribed from '{}'.", topic),
                Err(e) => warn!(config_id, "Failed to unsubscribe from '{}': {}", topic, e),
            }
        }

        diff
    }

    /// Stops the event loop and waits for it. A message already being handled
    /// finishes first.
    pub async fn close(self) {
        let config_id = self.config.read().await.id;
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(config_id, "Connection task ended abnormally: {:?}", e);
        }
        info!(config_id, "Broker connection closed.");
    }
}

fn client_id(prefix: &str, config_id: i64) -> String {
    let short = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, config_id, &short[..8])
}

struct ConnectionWorker {
    config: Arc<RwLock<Arc<BrokerConfig>>>,
    client: AsyncClient,
    topics: Arc<Mutex<BTreeSet<String>>>,
    client_state: Arc<Mutex<ClientState>>,
    dispatcher: Arc<MessageDispatcher>,
    reconnect_interval: Duration,
}

impl ConnectionWorker {
    async fn run(self, mut eventloop: EventLoop, mut shutdown: watch::Receiver<bool>) {
        let config_id = self.config.read().await.id;
        info!(config_id, "Starting MQTT connection...");

        loop {
            let polled = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                polled = eventloop.poll() => polled,
            };

            match polled {
                Ok(event) => self.handle_event(event).await,
                Err(e) => {
                    *self.client_state.lock().await = ClientState::Error(e.to_string());
                    warn!(
                        config_id,
                        "Lost connection to MQTT broker: {}. Retrying in {:?}...",
                        e,
                        self.reconnect_interval
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = sleep(self.reconnect_interval) => {}
                    }
                    *self.client_state.lock().await = ClientState::Connecting;
                }
            }
        }

        if *self.client_state.lock().await == ClientState::Connected {
            let _ = self.client.try_disconnect();
            let _ = timeout(DISCONNECT_GRACE, async {
                while let Ok(event) = eventloop.poll().await {
                    if matches!(event, Event::Outgoing(Outgoing::Disconnect)) {
                        break;
                    }
                }
            })
            .await;
        }
        *self.client_state.lock().await = ClientState::Disconnected;
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::Incoming(Packet::Publish(publish)) => {
                let config = self.config.read().await.clone();
                debug!(config_id = config.id, topic = %publish.topic, "Incoming message.");
                dispatch_broker_message(
                    self.dispatcher.clone(),
                    config,
                    publish.topic,
                    Arc::new(publish.payload.to_vec()),
                )
                .await;
            }
            Event::Incoming(Packet::ConnAck(_)) => {
                let config_id = self.config.read().await.id;
                *self.client_state.lock().await = ClientState::Connected;
                info!(config_id, "Connected to MQTT broker.");
                self.resubscribe(config_id).await;
            }
            Event::Incoming(Packet::SubAck(ack)) => {
                debug!("Subscription acknowledged: {:?}", ack.return_codes);
            }
            Event::Outgoing(_) => {}
            other => {
                debug!("Unhandled event: {:?}", other);
            }
        }
    }

    /// Clean sessions drop subscriptions, so every (re)connect subscribes to
    /// the whole current set. Uses the non-blocking request path because this
    /// runs on the task that drains the request queue.
    async fn resubscribe(&self, config_id: i64) {
        let topics = self.topics.lock().await;
        if topics.is_empty() {
            return;
        }
        let filters = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce));
        match self.client.try_subscribe_many(filters) {
            Ok(_) => info!(config_id, "Subscribed to {} topic(s).", topics.len()),
            Err(e) => error!(config_id, "Failed to subscribe: {}", e),
        }
    }
}
