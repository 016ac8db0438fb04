//! Connection state machine
//!
//! ```text
//!                 BeginConnect              Established
//! Disconnected ───────────────► Connecting ─────────────► Connected
//!      ▲                            │                         │
//!      │          Failed            │        Disconnect       │
//!      └────────────────────────────┴─────────────────────────┘
//! ```
//!
//! Transitions are a plain table ([`ConnectionState::on`]) so retry bounds and state changes
//! can be tested without a broker. [`Connection`] drives a [`BrokerSession`] through it.

use super::error::BrokerError;
use super::message::{status_payload, QoS, STATUS_ONLINE};
use super::session::BrokerSession;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    BeginConnect,
    Established,
    Failed,
    Disconnect,
}

impl ConnectionState {
    /// Transition table. `None` marks an event that is invalid in the current state.
    pub fn on(self, event: ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent::*;
        use ConnectionState::*;

        match (self, event) {
            (Disconnected, BeginConnect) => Some(Connecting),
            (Connecting, Established) => Some(Connected),
            (Connecting, Failed) => Some(Disconnected),
            (Connecting, Disconnect) => Some(Disconnected),
            (Connected, Disconnect) => Some(Disconnected),
            (Disconnected, Disconnect) => Some(Disconnected),
            _ => None,
        }
    }
}

/// Delay before reconnect attempt `attempt + 1`: 1 s, 2 s, 4 s, … without an upper bound.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt))
}

/// A broker session together with its connection state.
pub struct Connection<B> {
    session: B,
    state: ConnectionState,
    status_topic: String,
}

impl<B: BrokerSession> Connection<B> {
    /// `status_topic` receives a retained "online" announcement after every connect.
    pub fn new(session: B, status_topic: impl Into<String>) -> Self {
        Self {
            session,
            state: ConnectionState::Disconnected,
            status_topic: status_topic.into(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn apply(&mut self, event: ConnectionEvent) -> Result<(), BrokerError> {
        match self.state.on(event) {
            Some(next) => {
                debug!("Connection {:?} --{:?}--> {:?}", self.state, event, next);
                self.state = next;
                Ok(())
            }
            None => Err(BrokerError::InvalidTransition {
                from: self.state,
                event,
            }),
        }
    }

    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.apply(ConnectionEvent::BeginConnect)?;

        match self.session.connect().await {
            Ok(()) => {
                self.apply(ConnectionEvent::Established)?;
                info!("Connected to broker");
                self.announce_online().await;
                Ok(())
            }
            Err(e) => {
                self.apply(ConnectionEvent::Failed)?;
                Err(e)
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.apply(ConnectionEvent::Disconnect)?;
        info!("Disconnecting from broker");
        self.session.disconnect().await
    }

    /// Single disconnect + connect cycle; errors from the disconnect are ignored.
    pub async fn reconnect(&mut self) -> Result<(), BrokerError> {
        if let Err(e) = self.disconnect().await {
            debug!("Ignoring disconnect failure during reconnect: {}", e);
        }
        self.connect().await
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        if self.state != ConnectionState::Connected {
            return Err(BrokerError::NotConnected);
        }
        self.session.publish(topic, payload, qos, retain).await
    }

    pub async fn ping(&mut self) -> Result<(), BrokerError> {
        if self.state != ConnectionState::Connected {
            return Err(BrokerError::NotConnected);
        }
        self.session.ping().await
    }

    async fn announce_online(&mut self) {
        let payload = status_payload(STATUS_ONLINE);
        if let Err(e) = self
            .session
            .publish(&self.status_topic, &payload, QoS::AtLeastOnce, true)
            .await
        {
            warn!("Failed to announce online status: {}", e);
        }
    }
}

/// Reconnects `connection` with unbounded exponential backoff.
///
/// The lock is taken per attempt and released while sleeping, so other holders (the
/// keepalive task) are never starved by a long outage. Returns the number of failed attempts.
pub async fn reconnect_with_backoff<B: BrokerSession>(
    connection: &tokio::sync::Mutex<Connection<B>>,
) -> u32 {
    warn!("Reconnecting to broker");
    let mut attempt: u32 = 0;

    loop {
        let outcome = connection.lock().await.reconnect().await;
        match outcome {
            Ok(()) => {
                info!("Successfully reconnected to broker after {} failed attempts", attempt);
                return attempt;
            }
            Err(e) => {
                let backoff = backoff_delay(attempt);
                error!("Reconnect attempt {} failed: {}", attempt + 1, e);
                warn!("Broker connect backoff. Next attempt in {:?}", backoff);
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::testing::{assert_duration, ScriptedSession};
    use tokio::sync::Mutex;
    use tokio::time::Instant;
    use ConnectionEvent::*;
    use ConnectionState::*;

    #[test]
    fn transition_table() {
        assert_eq!(Disconnected.on(BeginConnect), Some(Connecting));
        assert_eq!(Connecting.on(Established), Some(Connected));
        assert_eq!(Connecting.on(Failed), Some(Disconnected));
        assert_eq!(Connected.on(Disconnect), Some(Disconnected));
        assert_eq!(Disconnected.on(Disconnect), Some(Disconnected));

        assert_eq!(Connected.on(BeginConnect), None);
        assert_eq!(Disconnected.on(Established), None);
        assert_eq!(Connected.on(Failed), None);
        assert_eq!(Connecting.on(BeginConnect), None);
    }

    #[test]
    fn backoff_doubles_from_one_second() {
        let delays: Vec<u64> = (0..5).map(|a| backoff_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        assert_eq!(backoff_delay(200), Duration::from_secs(u64::MAX));
    }

    #[tokio::test]
    async fn connect_announces_online_status() {
        let session = ScriptedSession::default();
        let mut connection = Connection::new(session.clone(), "root/lab/dev/system/status");

        connection.connect().await.expect("connect");

        assert_eq!(connection.state(), Connected);
        let published = session.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "root/lab/dev/system/status");
        assert_eq!(published[0].payload, br#"{"status":"online"}"#.to_vec());
        assert!(published[0].retain);
    }

    #[tokio::test]
    async fn connect_while_connected_is_rejected() {
        let mut connection = Connection::new(ScriptedSession::default(), "status");
        connection.connect().await.expect("connect");

        let err = connection.connect().await.expect_err("already connected");
        assert!(matches!(
            err,
            BrokerError::InvalidTransition {
                from: Connected,
                event: BeginConnect
            }
        ));
    }

    #[tokio::test]
    async fn failed_connect_returns_to_disconnected() {
        let session = ScriptedSession::default();
        session.fail_connects(1);
        let mut connection = Connection::new(session, "status");

        assert!(connection.connect().await.is_err());
        assert_eq!(connection.state(), Disconnected);
        let err = connection.publish("t", b"x", QoS::AtMostOnce, false).await;
        assert!(matches!(err, Err(BrokerError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_waits_the_sum_of_doubling_backoffs() {
        let session = ScriptedSession::default();
        let connection = Mutex::new(Connection::new(session.clone(), "status"));
        connection.lock().await.connect().await.expect("initial connect");
        session.fail_connects(4);

        let started = Instant::now();
        let failures = reconnect_with_backoff(&connection).await;

        assert_eq!(failures, 4);
        assert_duration(started.elapsed(), Duration::from_secs(1 + 2 + 4 + 8));
        assert_eq!(connection.lock().await.state(), Connected);
        assert_eq!(session.connects(), 1 + 5);
    }
}
