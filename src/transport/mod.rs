//! # Transport Module - MQTT Broker Connection
//!
//! [`Transport`] is the seam between the gateway and the broker. [`MqttTransport`]
//! implements it on top of `rumqttc`: a background driver task owns the event loop,
//! reconnects with exponential backoff, re-issues subscriptions after every reconnect and
//! forwards incoming PUBLISH packets to [`Transport::receive`].
//!
//! ## Connection states
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ◄─► Reconnecting
//!                                   │
//!                               close() ─► Stopped
//! ```
//!
//! Publishing is only attempted while `Connected`; in any other state [`Transport::publish`]
//! returns [`TransportError::NotConnected`] right away instead of buffering.

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::MqttConfig;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// One message as delivered by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Reconnecting => "reconnecting",
            TransportState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to broker (state: {0})")]
    NotConnected(TransportState),
    #[error("transport has been closed")]
    Closed,
    #[error("timed out waiting for broker connection")]
    ConnectTimeout,
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to a topic pattern. The subscription survives reconnects.
    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next incoming message; `None` once the transport is closed and drained.
    async fn receive(&self) -> Option<RawMessage>;

    async fn close(&self);

    fn state(&self) -> TransportState;
}

pub struct MqttTransport {
    client: AsyncClient,
    state_rx: watch::Receiver<TransportState>,
    subscriptions: Arc<StdMutex<Vec<String>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<RawMessage>>,
    stop_tx: watch::Sender<bool>,
    driver: StdMutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Start connecting in the background. Returns immediately; use
    /// [`MqttTransport::wait_connected`] to wait for the first ConnAck.
    pub fn connect(cfg: &MqttConfig) -> Self {
        let client_id = cfg.effective_client_id();
        let mut options = MqttOptions::new(client_id.clone(), cfg.host.clone(), cfg.port);
        options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let Some(user) = cfg.username.as_deref().filter(|u| !u.is_empty()) {
            options.set_credentials(user, cfg.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(TransportState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(StdMutex::new(Vec::new()));

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            cfg.host, cfg.port, client_id
        );
        let driver = Driver {
            client: client.clone(),
            state_tx,
            subscriptions: subscriptions.clone(),
            incoming_tx,
            max_backoff: Duration::from_secs(cfg.reconnect_max_backoff_secs.max(1)),
        };
        let handle = tokio::spawn(driver.run(eventloop, stop_rx));

        Self {
            client,
            state_rx,
            subscriptions,
            incoming: Mutex::new(incoming_rx),
            stop_tx,
            driver: StdMutex::new(Some(handle)),
        }
    }

    /// Wait until the broker has acknowledged a connection.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    TransportState::Connected => return Ok(()),
                    TransportState::Stopped => return Err(TransportError::Closed),
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::Closed);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn subscribe(&self, pattern: &str) -> Result<(), TransportError> {
        {
            let mut subs = self.subscriptions.lock().unwrap_or_else(|p| p.into_inner());
            if !subs.iter().any(|s| s == pattern) {
                subs.push(pattern.to_string());
            }
        }
        match self.state() {
            TransportState::Stopped => Err(TransportError::Closed),
            TransportState::Connected => {
                info!("Subscribing to {}", pattern);
                self.client.subscribe(pattern, QoS::AtLeastOnce).await?;
                Ok(())
            }
            // issued by the driver on the next ConnAck
            _ => Ok(()),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        match self.state() {
            TransportState::Connected => {}
            TransportState::Stopped => return Err(TransportError::Closed),
            other => return Err(TransportError::NotConnected(other)),
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn receive(&self) -> Option<RawMessage> {
        self.incoming.lock().await.recv().await
    }

    async fn close(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("MQTT driver task ended abnormally: {}", e);
            }
        }
    }

    fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }
}

struct Driver {
    client: AsyncClient,
    state_tx: watch::Sender<TransportState>,
    subscriptions: Arc<StdMutex<Vec<String>>>,
    incoming_tx: mpsc::UnboundedSender<RawMessage>,
    max_backoff: Duration,
}

impl Driver {
    fn set_state(&self, state: TransportState) {
        let _ = self.state_tx.send_if_modified(|s| {
            if *s != state {
                debug!("MQTT transport {} -> {}", s, state);
                *s = state;
                true
            } else {
                false
            }
        });
    }

    fn resubscribe(&self) {
        let subs = self
            .subscriptions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for pattern in subs {
            info!("Subscribing to {}", pattern);
            // try_ variant: this task is the one draining the request queue
            if let Err(e) = self.client.try_subscribe(pattern.clone(), QoS::AtLeastOnce) {
                error!("Failed to queue subscription {}: {}", pattern, e);
            }
        }
    }

    async fn run(self, mut eventloop: EventLoop, mut stop_rx: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;
        self.set_state(TransportState::Connecting);
        loop {
            if *stop_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = stop_rx.changed() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                        backoff = INITIAL_BACKOFF;
                        self.set_state(TransportState::Connected);
                        self.resubscribe();
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        let msg = RawMessage { topic: p.topic, payload: p.payload };
                        if self.incoming_tx.send(msg).is_err() {
                            debug!("Incoming receiver dropped");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}; retrying in {:?}", e, backoff);
                        self.set_state(TransportState::Reconnecting);
                        tokio::select! {
                            _ = stop_rx.changed() => break,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(self.max_backoff);
                    }
                }
            }
        }

        if *self.state_tx.borrow() == TransportState::Connected {
            self.flush_and_disconnect(&mut eventloop).await;
        }
        self.set_state(TransportState::Stopped);
        info!("MQTT transport stopped");
    }

    /// Queue DISCONNECT behind any publishes already accepted and keep the event loop
    /// running until it has been written, so `Ok` from `publish` means the packet left.
    async fn flush_and_disconnect(&self, eventloop: &mut EventLoop) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_FLUSH_TIMEOUT;
        let mut disconnect_queued = false;
        loop {
            if !disconnect_queued {
                disconnect_queued = self.client.try_disconnect().is_ok();
            }
            match tokio::time::timeout_at(deadline, eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => {
                    debug!("DISCONNECT sent");
                    break;
                }
                Ok(Ok(Event::Outgoing(Outgoing::Publish(pkid)))) => {
                    debug!("Flushed publish {} before disconnect", pkid);
                }
                Ok(Ok(Event::Incoming(Packet::Publish(p)))) => {
                    let _ = self.incoming_tx.send(RawMessage {
                        topic: p.topic,
                        payload: p.payload,
                    });
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!("Connection lost while flushing before disconnect: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(
                        "Gave up flushing outgoing packets after {:?}",
                        SHUTDOWN_FLUSH_TIMEOUT
                    );
                    break;
                }
            }
        }
    }
}
