//! In-memory broker session for exercising the pipeline without a network.

use super::error::BrokerError;
use super::message::QoS;
use super::session::BrokerSession;
use super::STATUS_SUBTOPIC;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct Script {
    connect_failures: u32,
    // time every connect takes before it resolves
    connect_delay: Duration,
    publish_failures: VecDeque<BrokerError>,
    ping_failures: u32,
    connects: u32,
    disconnects: u32,
    pings: Vec<Instant>,
    attempts: Vec<Instant>,
    published: Vec<Published>,
}

/// Scripted [`BrokerSession`]. Clones share the same script and call log.
///
/// Status announcements always succeed and never consume scripted publish failures.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSession {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSession {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().expect("script lock")
    }

    pub fn slow_connects(&self, delay: Duration) {
        self.script().connect_delay = delay;
    }

    pub fn fail_connects(&self, count: u32) {
        self.script().connect_failures = count;
    }

    /// Queues errors returned by the next publishes, one per attempt.
    pub fn fail_publishes(&self, errors: impl IntoIterator<Item = BrokerError>) {
        self.script().publish_failures.extend(errors);
    }

    pub fn fail_pings(&self, count: u32) {
        self.script().ping_failures = count;
    }

    pub fn connects(&self) -> u32 {
        self.script().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.script().disconnects
    }

    pub fn pings(&self) -> Vec<Instant> {
        self.script().pings.clone()
    }

    /// Instants of every non-status publish attempt, failed or not.
    pub fn attempts(&self) -> Vec<Instant> {
        self.script().attempts.clone()
    }

    /// Successfully published messages, status announcements included.
    pub fn published(&self) -> Vec<Published> {
        self.script().published.clone()
    }

    /// Successfully published messages, status announcements excluded.
    pub fn delivered(&self) -> Vec<Published> {
        self.published()
            .into_iter()
            .filter(|p| !p.topic.ends_with(STATUS_SUBTOPIC))
            .collect()
    }
}

impl BrokerSession for ScriptedSession {
    async fn connect(&mut self) -> Result<(), BrokerError> {
        let delay = self.script().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        script.connects += 1;
        if script.connect_failures > 0 {
            script.connect_failures -= 1;
            return Err(BrokerError::Transport("connection refused".to_string()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.script().disconnects += 1;
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        let mut script = self.script();
        if !topic.ends_with(STATUS_SUBTOPIC) {
            script.attempts.push(Instant::now());
            if let Some(error) = script.publish_failures.pop_front() {
                return Err(error);
            }
        }
        script.published.push(Published {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), BrokerError> {
        let mut script = self.script();
        script.pings.push(Instant::now());
        if script.ping_failures > 0 {
            script.ping_failures -= 1;
            return Err(BrokerError::Transport("ping timed out".to_string()));
        }
        Ok(())
    }
}

/// Asserts `actual` matches `expected` to the millisecond the paused clock may round to.
pub fn assert_duration(actual: Duration, expected: Duration) {
    let slack = Duration::from_millis(5);
    assert!(
        actual >= expected && actual <= expected + slack,
        "expected {:?}, got {:?}",
        expected,
        actual
    );
}
