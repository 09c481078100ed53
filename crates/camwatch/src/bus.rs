//! MQTT event bus.
//!
//! Thin wrapper over `rumqttc`: publishes are fire-and-forget, inbound
//! messages are dispatched on the connection thread to registered callbacks
//! by topic pattern (first match wins), and subscriptions are replayed after
//! every reconnect. The broker sees a retained `online`/`offline` status
//! with a last-will fallback.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::Result;
use rumqttc::{Client, Event, LastWill, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::config::MqttConfig;

/// Publishing surface the event pipeline depends on. Implementations must
/// treat publishes as best-effort.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &str);
    fn topic_prefix(&self) -> &str;
    fn is_connected(&self) -> bool;
}

type MessageCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

struct Subscription {
    patterns: Vec<String>,
    qos: QoS,
    callback: MessageCallback,
}

struct BusShared {
    connected: AtomicBool,
    stopping: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
}

/// MQTT-backed [`EventBus`].
pub struct MqttBus {
    client: Client,
    prefix: String,
    shared: Arc<BusShared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and start the connection thread. The broker link is
    /// established in the background; publishes before that are dropped by
    /// the queue once it fills, never blocking the caller.
    pub fn new(config: &MqttConfig) -> Result<Self> {
        let client_id = format!("camwatch-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, config.broker.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            format!("{}/status", config.topic_prefix),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));
        if !config.username.is_empty() {
            options.set_credentials(config.username.clone(), config.password.clone());
        }

        let (client, mut connection) = Client::new(options, 64);
        let shared = Arc::new(BusShared {
            connected: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        });

        let status_topic = format!("{}/status", config.topic_prefix);
        let loop_shared = Arc::clone(&shared);
        let loop_client = client.clone();
        let broker = format!("{}:{}", config.broker, config.port);
        let handle = thread::Builder::new()
            .name("mqtt-bus".into())
            .spawn(move || {
                info!(broker = %broker, "connecting to MQTT broker");
                for event in connection.iter() {
                    if loop_shared.stopping.load(Ordering::Relaxed) {
                        break;
                    }
                    match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            info!(broker = %broker, "MQTT connected");
                            loop_shared.connected.store(true, Ordering::Relaxed);
                            let _ = loop_client.try_publish(
                                status_topic.as_str(),
                                QoS::AtLeastOnce,
                                true,
                                "online",
                            );
                            resubscribe(&loop_client, &loop_shared);
                        }
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let payload = String::from_utf8_lossy(&publish.payload);
                            dispatch(&loop_shared, &publish.topic, &payload);
                        }
                        Ok(Event::Incoming(Packet::Disconnect)) => {
                            warn!("MQTT broker disconnected");
                            loop_shared.connected.store(false, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            if loop_shared.connected.swap(false, Ordering::Relaxed) {
                                warn!(error = %err, "MQTT connection lost, retrying");
                            }
                            thread::sleep(Duration::from_secs(1));
                        }
                    }
                }
                debug!("MQTT connection thread exiting");
            })
            .expect("failed to spawn mqtt thread");

        Ok(Self {
            client,
            prefix: config.topic_prefix.clone(),
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Register a callback for one or more topic patterns (`+`/`#`
    /// wildcards). Also requests the broker-side subscription; it is
    /// re-requested on every reconnect.
    pub fn subscribe<F>(&self, patterns: &[&str], qos: QoS, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let subscription = Subscription {
            patterns: patterns.iter().map(|s| s.to_string()).collect(),
            qos,
            callback: Arc::new(callback),
        };
        for pattern in &subscription.patterns {
            if let Err(err) = self.client.subscribe(pattern.as_str(), qos) {
                warn!(topic = %pattern, error = %err, "MQTT subscribe failed");
            } else {
                info!(topic = %pattern, "subscribed");
            }
        }
        self.shared
            .subscriptions
            .lock()
            .expect("bus subscriptions poisoned")
            .push(subscription);
    }

    pub fn publish_with(&self, topic: &str, payload: &str, qos: QoS, retain: bool) {
        if let Err(err) = self.client.try_publish(topic, qos, retain, payload) {
            debug!(topic = %topic, error = %err, "MQTT publish failed");
        }
    }

    /// Publish the retained offline marker and stop the connection thread.
    /// Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = self
            .handle
            .lock()
            .expect("bus handle poisoned")
            .take()
        else {
            return;
        };
        self.publish_with(&format!("{}/status", self.prefix), "offline", QoS::AtLeastOnce, true);
        self.shared.stopping.store(true, Ordering::Relaxed);
        thread::sleep(Duration::from_millis(100));
        let _ = self.client.disconnect();
        let _ = handle.join();
    }
}

impl EventBus for MqttBus {
    fn publish(&self, topic: &str, payload: &str) {
        self.publish_with(topic, payload, QoS::AtMostOnce, false);
    }

    fn topic_prefix(&self) -> &str {
        &self.prefix
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resubscribe(client: &Client, shared: &BusShared) {
    let subscriptions = shared
        .subscriptions
        .lock()
        .expect("bus subscriptions poisoned");
    for sub in subscriptions.iter() {
        for pattern in &sub.patterns {
            if let Err(err) = client.try_subscribe(pattern.as_str(), sub.qos) {
                warn!(topic = %pattern, error = %err, "MQTT re-subscribe failed");
            }
        }
    }
}

fn dispatch(shared: &BusShared, topic: &str, payload: &str) {
    let subscriptions = shared
        .subscriptions
        .lock()
        .expect("bus subscriptions poisoned");
    for sub in subscriptions.iter() {
        if sub
            .patterns
            .iter()
            .any(|pattern| topic_matches(pattern, topic))
        {
            (sub.callback)(topic, payload);
            return; // first match wins
        }
    }
}

/// MQTT-style topic pattern match: `+` spans one level, a terminal `#`
/// spans the rest.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topics_match() {
        assert!(topic_matches(
            "camera/event/motion/start",
            "camera/event/motion/start"
        ));
        assert!(!topic_matches(
            "camera/event/motion/start",
            "camera/event/motion/stop"
        ));
    }

    #[test]
    fn plus_spans_exactly_one_level() {
        assert!(topic_matches("camera/+/motion", "camera/front/motion"));
        assert!(!topic_matches("camera/+/motion", "camera/front/yard/motion"));
        assert!(!topic_matches("camera/+/motion", "camera/motion"));
    }

    #[test]
    fn hash_spans_remaining_levels() {
        assert!(topic_matches("camera/#", "camera/event/motion/start"));
        assert!(topic_matches("camera/#", "camera/anything"));
        assert!(!topic_matches("camera/#", "other/event"));
        assert!(topic_matches("#", "a/b/c"));
    }

    #[test]
    fn pattern_longer_than_topic_fails() {
        assert!(!topic_matches("a/b/c", "a/b"));
        assert!(!topic_matches("a/+/c", "a/b"));
    }
}
