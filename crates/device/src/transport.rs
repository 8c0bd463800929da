//! Encrypted pub-sub transport behind a trait, so the session state machine
//! and the update pipeline can be exercised against a recording fake.
//!
//! The production implementation wraps a rumqttc `AsyncClient`/`EventLoop`
//! pair. The event loop is only ever polled from `process()` — there is no
//! spawned task, keeping the whole device on one cooperative control flow.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for one `process()` call — one non-blocking unit of work.
const PROCESS_BUDGET: Duration = Duration::from_millis(10);

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Channel capacity for the rumqttc request queue.
const CLIENT_CHANNEL_CAP: usize = 32;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("client channel error: {0}")]
    Client(String),
}

/// One inbound message delivered by `process()`.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Everything needed for one connect attempt, including the last will the
/// broker publishes if the device disappears without a clean disconnect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub last_will_topic: String,
    pub last_will_payload: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// The narrow publish-only view collaborators get. Only the session may
/// connect or disconnect.
pub trait Publish {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError>;
}

#[allow(async_fn_in_trait)]
pub trait Transport: Publish {
    /// One bounded connect attempt. Registers the last will and waits for
    /// the broker's acknowledgement or a deadline.
    async fn connect(&mut self, opts: &ConnectOptions) -> Result<(), TransportError>;

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Perform one bounded unit of inbound/outbound work and return any
    /// messages that arrived.
    async fn process(&mut self) -> Vec<Inbound>;

    /// Keep the connection serviced for `budget`, draining queued
    /// publishes. Inbound messages arriving during a flush are dropped.
    async fn flush(&mut self, budget: Duration);

    fn is_connected(&self) -> bool;

    /// Tear the socket down immediately. Safe to call when not connected.
    fn disconnect(&mut self);
}

// ---------------------------------------------------------------------------
// rumqttc-backed transport
// ---------------------------------------------------------------------------

struct Conn {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
}

pub struct MqttTransport {
    conn: Option<Conn>,
}

impl MqttTransport {
    pub fn new() -> Self {
        Self { conn: None }
    }
}

impl Publish for MqttTransport {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
        let Some(conn) = self.conn.as_ref().filter(|c| c.connected) else {
            return Err(TransportError::NotConnected);
        };
        conn.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .map_err(|e| TransportError::Client(e.to_string()))
    }
}

impl Transport for MqttTransport {
    async fn connect(&mut self, opts: &ConnectOptions) -> Result<(), TransportError> {
        // Drop any previous half-dead connection before dialing again.
        self.conn = None;

        let mut mqttoptions = MqttOptions::new(&opts.client_id, &opts.host, opts.port);
        mqttoptions.set_keep_alive(KEEP_ALIVE);
        if !opts.username.is_empty() {
            mqttoptions.set_credentials(&opts.username, &opts.password);
        }
        mqttoptions.set_last_will(LastWill::new(
            &opts.last_will_topic,
            opts.last_will_payload.clone(),
            QoS::AtLeastOnce,
            false,
        ));
        if opts.tls {
            mqttoptions.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, CLIENT_CHANNEL_CAP);

        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        loop {
            match tokio::time::timeout_at(deadline, eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Connect(format!("broker refused: {:?}", ack.code)));
                    }
                    self.conn = Some(Conn {
                        client,
                        eventloop,
                        connected: true,
                    });
                    return Ok(());
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
                Err(_) => return Err(TransportError::Connect("timed out".to_string())),
            }
        }
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let Some(conn) = self.conn.as_ref().filter(|c| c.connected) else {
            return Err(TransportError::NotConnected);
        };
        conn.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Client(e.to_string()))
    }

    async fn process(&mut self) -> Vec<Inbound> {
        let mut inbound = Vec::new();
        let Some(conn) = self.conn.as_mut() else {
            return inbound;
        };

        let deadline = tokio::time::Instant::now() + PROCESS_BUDGET;
        loop {
            match tokio::time::timeout_at(deadline, conn.eventloop.poll()).await {
                Ok(Ok(Event::Incoming(Packet::Publish(p)))) => {
                    inbound.push(Inbound {
                        topic: p.topic.clone(),
                        payload: p.payload.to_vec(),
                    });
                }
                Ok(Ok(Event::Incoming(Packet::Disconnect))) => {
                    warn!("broker requested disconnect");
                    conn.connected = false;
                    break;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => {
                    warn!("mqtt error: {e}");
                    conn.connected = false;
                    break;
                }
                Err(_) => break, // budget exhausted
            }
        }
        inbound
    }

    async fn flush(&mut self, budget: Duration) {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline && self.is_connected() {
            let dropped = self.process().await;
            if !dropped.is_empty() {
                debug!(count = dropped.len(), "inbound messages dropped during flush");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.connected)
    }

    fn disconnect(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Best effort; dropping the client and event loop closes the
            // socket either way, which is what lets the last will fire.
            let _ = conn.client.try_disconnect();
        }
    }
}

// ---------------------------------------------------------------------------
// Recording fake (tests only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) struct FakeTransport {
    pub connected: bool,
    /// Fail this many connect attempts before succeeding.
    pub fail_connects: u32,
    pub connects: u32,
    pub disconnects: u32,
    pub subscriptions: Vec<String>,
    /// (topic, payload, retain) for every successful publish.
    pub published: Vec<(String, String, bool)>,
    pub inbound: std::collections::VecDeque<Inbound>,
    pub processed: u32,
    pub flushes: Vec<Duration>,
}

#[cfg(test)]
impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self {
            connected: false,
            fail_connects: 0,
            connects: 0,
            disconnects: 0,
            subscriptions: Vec::new(),
            published: Vec::new(),
            inbound: std::collections::VecDeque::new(),
            processed: 0,
            flushes: Vec::new(),
        }
    }

    pub(crate) fn push_inbound(&mut self, topic: &str, payload: &[u8]) {
        self.inbound.push_back(Inbound {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    pub(crate) fn topics_published(&self, topic: &str) -> usize {
        self.published.iter().filter(|(t, _, _)| t == topic).count()
    }
}

#[cfg(test)]
impl Publish for FakeTransport {
    fn publish(&mut self, topic: &str, payload: &str, retain: bool) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.published
            .push((topic.to_string(), payload.to_string(), retain));
        Ok(())
    }
}

#[cfg(test)]
impl Transport for FakeTransport {
    async fn connect(&mut self, _opts: &ConnectOptions) -> Result<(), TransportError> {
        self.connects += 1;
        if self.fail_connects > 0 {
            self.fail_connects -= 1;
            return Err(TransportError::Connect("refused".to_string()));
        }
        self.connected = true;
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.subscriptions.push(topic.to_string());
        Ok(())
    }

    async fn process(&mut self) -> Vec<Inbound> {
        self.processed += 1;
        self.inbound.drain(..).collect()
    }

    async fn flush(&mut self, budget: Duration) {
        self.flushes.push(budget);
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn disconnect(&mut self) {
        self.disconnects += 1;
        self.connected = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
