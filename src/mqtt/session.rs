//! Broker session seam and its rumqttc implementation
//!
//! [`BrokerSession`] is the only place the pipeline touches the wire protocol. The
//! production implementation, [`RumqttSession`], builds a fresh rumqttc client per connect
//! and hands the event loop to a driver task:
//!
//! ```text
//! RumqttSession ──publish──► AsyncClient ─[requests]─► EventLoop (driver task)
//!       ▲                                                  │
//!       └───────────── watch::Receiver<LinkStatus> ◄───────┘
//! ```
//!
//! rumqttc writes PINGREQ packets on its own keepalive timer. [`RumqttSession::ping`]
//! checks the link the driver reports and that the broker has been heard from recently.

use super::config::PipelineSettings;
use super::error::BrokerError;
use super::message::{status_payload, QoS, STATUS_OFFLINE};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

// capacity of rumqttc's internal request channel
const REQUEST_CAPACITY: usize = 100;
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
// room for fixed header, topic and packet id on top of the payload limit
const PACKET_OVERHEAD: usize = 1024;

/// Wire-level operations the publish pipeline needs from a broker connection.
pub trait BrokerSession: Send + 'static {
    /// Opens a session, registering the last will. Bounded by the connect timeout.
    fn connect(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Liveness check of the current session.
    fn ping(&mut self) -> impl Future<Output = Result<(), BrokerError>> + Send;
}

/// Link health as observed by the event loop driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Up { last_inbound: Instant },
    /// Graceful disconnect was sent
    Closed,
    Down(String),
}

pub struct RumqttSession {
    client_id: String,
    // wire address
    host: String,
    port: u16,
    keepalive: Duration,
    clean_session: bool,
    connect_timeout: Duration,
    max_payload_bytes: usize,
    last_will: LastWill,
    // only set while a session is open
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
    link: Option<watch::Receiver<LinkStatus>>,
}

impl RumqttSession {
    pub fn new(settings: &PipelineSettings) -> Self {
        // retained "offline" on the status topic, published by the broker if we vanish
        let last_will = LastWill::new(
            settings.topics.status(),
            status_payload(STATUS_OFFLINE),
            rumqttc::QoS::AtLeastOnce,
            true,
        );

        Self {
            client_id: settings.client_id.clone(),
            host: settings.broker_host.clone(),
            port: settings.broker_port,
            keepalive: settings.keepalive,
            clean_session: settings.clean_session,
            connect_timeout: settings.connect_timeout,
            max_payload_bytes: settings.max_payload_bytes,
            last_will,
            client: None,
            driver: None,
            link: None,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(self.keepalive)
            .set_clean_session(self.clean_session)
            .set_max_packet_size(self.max_packet_bytes(), self.max_packet_bytes())
            .set_last_will(self.last_will.clone());
        options
    }

    /// Largest PUBLISH packet handed to rumqttc; its event loop enforces the same limit.
    pub fn max_packet_bytes(&self) -> usize {
        self.max_payload_bytes.saturating_add(PACKET_OVERHEAD)
    }

    fn check_size(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), BrokerError> {
        if payload.len() > self.max_payload_bytes {
            return Err(BrokerError::PayloadTooLarge {
                size: payload.len(),
                limit: self.max_payload_bytes,
            });
        }
        let packet = publish_packet_size(topic, payload.len(), qos);
        if packet > self.max_packet_bytes() {
            return Err(BrokerError::PayloadTooLarge {
                size: packet,
                limit: self.max_packet_bytes(),
            });
        }
        Ok(())
    }

    /// Current link status; `Closed` when no session has been opened.
    pub fn link_status(&self) -> LinkStatus {
        self.link
            .as_ref()
            .map(|link| link.borrow().clone())
            .unwrap_or(LinkStatus::Closed)
    }

    fn ensure_link_up(&self) -> Result<Instant, BrokerError> {
        match self.link_status() {
            LinkStatus::Up { last_inbound } => Ok(last_inbound),
            LinkStatus::Closed => Err(BrokerError::NotConnected),
            LinkStatus::Down(reason) => Err(BrokerError::Transport(reason)),
        }
    }

    fn teardown(&mut self) {
        self.client = None;
        self.link = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for RumqttSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl BrokerSession for RumqttSession {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        self.teardown();
        info!(
            "Connecting to broker {}:{} with keepalive {:?} and timeout {:?}",
            self.host, self.port, self.keepalive, self.connect_timeout
        );

        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        match tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BrokerError::ConnectTimeout(self.connect_timeout)),
        }

        let (link_tx, link_rx) = watch::channel(LinkStatus::Up {
            last_inbound: Instant::now(),
        });
        self.driver = Some(tokio::spawn(drive_event_loop(eventloop, link_tx)));
        self.client = Some(client);
        self.link = Some(link_rx);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect request not delivered: {}", e);
            }
        }

        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver).await.is_err() {
                debug!("Event loop did not finish within {:?}, aborting", DISCONNECT_GRACE);
                driver.abort();
            }
        }
        self.link = None;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        validate_topic(topic)?;
        self.check_size(topic, payload, qos)?;
        self.ensure_link_up()?;

        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, qos.into(), retain, payload.to_vec())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }

    async fn ping(&mut self) -> Result<(), BrokerError> {
        let last_inbound = self.ensure_link_up()?;
        let silence = last_inbound.elapsed();
        if silence > self.keepalive * 3 / 2 {
            return Err(BrokerError::Transport(format!(
                "no broker traffic for {:?}",
                silence
            )));
        }
        Ok(())
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(BrokerError::Refused(format!("{:?}", code))),
                };
            }
            Ok(event) => trace!("Event before CONNACK: {:?}", event),
            Err(e) => return Err(BrokerError::Transport(e.to_string())),
        }
    }
}

// polls until the link fails, reporting health through `link`
async fn drive_event_loop(mut eventloop: EventLoop, link: watch::Sender<LinkStatus>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(packet)) => {
                trace!("Incoming {:?}", packet);
                link.send_replace(LinkStatus::Up {
                    last_inbound: Instant::now(),
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Graceful disconnect sent");
                link.send_replace(LinkStatus::Closed);
            }
            Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                if *link.borrow() != LinkStatus::Closed {
                    warn!("Broker link lost: {}", e);
                    link.send_replace(LinkStatus::Down(e.to_string()));
                }
                break;
            }
        }
    }
}

// publish topics must be non-empty and free of wildcards
fn validate_topic(topic: &str) -> Result<(), BrokerError> {
    if topic.is_empty() || topic.contains(['+', '#', '\0']) {
        return Err(BrokerError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

// encoded size of an MQTT 3.1.1 PUBLISH packet
fn publish_packet_size(topic: &str, payload_len: usize, qos: QoS) -> usize {
    let packet_id = match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 2,
    };
    let remaining = 2 + topic.len() + packet_id + payload_len;
    // variable length encoding, 7 bits per byte
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}
