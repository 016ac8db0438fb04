//! Reliable publish pipeline
//!
//! ```text
//! Publisher::publish ─► BoundedQueue ─► publisher loop ─► Connection ─► broker
//!   (any task, never blocks)             │  transport error → reconnect with backoff, drop item
//!                                        │  other error     → retry ≤ max_retries, then drop
//!                       keepalive loop ──┘  ping every keepalive/2 − 1 s
//! ```
//!
//! The publisher loop is the single consumer of the queue. Both loops share the
//! connection through a mutex that is never held across a backoff sleep.

use super::config::PipelineSettings;
use super::connection::{backoff_delay, reconnect_with_backoff, Connection, ConnectionState};
use super::error::BrokerError;
use super::message::{status_payload, MeasurementPayload, PublishRequest, QoS, STATUS_OFFLINE};
use super::session::BrokerSession;
use super::TopicLayout;
use crate::queue::BoundedQueue;
use crate::sensors::{Measurement, Reading};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Cloneable handle for enqueueing publish requests.
#[derive(Debug, Clone)]
pub struct Publisher {
    queue: Arc<BoundedQueue<PublishRequest>>,
}

impl Publisher {
    pub fn new(queue: Arc<BoundedQueue<PublishRequest>>) -> Self {
        Self { queue }
    }

    /// Queues a message for `<base topic>/<subtopic>`. Never blocks; when the queue is full
    /// the oldest pending message is dropped.
    pub fn publish(
        &self,
        subtopic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) {
        let request = PublishRequest::new(subtopic, payload, qos, retain);
        debug!("Queuing message for publishing: {}", request);
        if let Some(dropped) = self.queue.enqueue(request) {
            warn!("Publish queue full, dropped oldest message {}", dropped);
        }
    }

    pub fn publish_measurement(
        &self,
        measurement: &Measurement,
        timestamp: i64,
        qos: QoS,
        retain: bool,
    ) {
        match serde_json::to_vec(&MeasurementPayload::new(measurement, timestamp)) {
            Ok(payload) => self.publish(
                TopicLayout::measurement_subtopic(measurement.name()),
                payload,
                qos,
                retain,
            ),
            Err(e) => error!("Failed to serialize measurement {}: {}", measurement, e),
        }
    }

    /// One acknowledged, non-retained publish per measurement, in reading order.
    pub fn publish_measurements_from_reading(&self, reading: &Reading) {
        for measurement in reading.measurements() {
            self.publish_measurement(measurement, reading.timestamp(), QoS::AtLeastOnce, false);
        }
    }

    /// Number of queued requests (advisory).
    pub fn pending(&self) -> usize {
        self.queue.size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    /// Transport failure; the link was re-established but the message is not resent
    DroppedAfterReconnect,
    /// Every bounded retry failed
    Exhausted,
}

// consumer side of the queue
struct Delivery<B> {
    queue: Arc<BoundedQueue<PublishRequest>>,
    // shared with the keepalive loop
    connection: Arc<Mutex<Connection<B>>>,
    topics: TopicLayout,
    max_retries: u32,
}

impl<B: BrokerSession> Delivery<B> {
    async fn run(self) {
        info!("Publisher loop started");
        loop {
            let request = self.queue.dequeue().await;
            self.deliver(request).await;
        }
    }

    async fn deliver(&self, request: PublishRequest) -> DeliveryOutcome {
        let topic = self.topics.topic(&request.subtopic);
        debug!("Publishing message to topic {}", topic);

        for attempt in 0..self.max_retries {
            let result = self
                .connection
                .lock()
                .await
                .publish(&topic, &request.payload, request.qos, request.retain)
                .await;

            match result {
                Ok(()) => {
                    return DeliveryOutcome::Delivered {
                        attempts: attempt + 1,
                    }
                }
                Err(e) if e.is_transport() => {
                    warn!("Failed to publish message to {}: {}", topic, e);
                    reconnect_with_backoff(&self.connection).await;
                    warn!("Message {} was not resent after reconnect", request);
                    return DeliveryOutcome::DroppedAfterReconnect;
                }
                Err(e) => {
                    warn!(
                        "Failed to publish message to {} (attempt {}): {}",
                        topic,
                        attempt + 1,
                        e
                    );
                    if attempt + 1 < self.max_retries {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        error!(
            "Failed to publish message after {} attempts. Dropping message {}",
            self.max_retries, request
        );
        DeliveryOutcome::Exhausted
    }
}

// Fixed schedule: a ping that finds the connection busy (reconnect attempt in flight)
// counts as failed and is not retried late.
async fn keepalive_loop<B: BrokerSession>(connection: Arc<Mutex<Connection<B>>>, interval: Duration) {
    let mut next = Instant::now() + interval;
    loop {
        tokio::time::sleep_until(next).await;
        next += interval;

        info!("Pinging broker");
        let result = match connection.try_lock() {
            Ok(mut connection) => connection.ping().await,
            Err(_) => Err(BrokerError::Transport("reconnect in progress".to_string())),
        };
        match result {
            Ok(()) => info!("Ping successful"),
            Err(e) => error!("Failed to ping broker: {}", e),
        }
    }
}

/// Queue, connection and the two background loops of one device.
pub struct PublishPipeline<B: BrokerSession> {
    settings: PipelineSettings,
    queue: Arc<BoundedQueue<PublishRequest>>,
    connection: Arc<Mutex<Connection<B>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<B: BrokerSession> PublishPipeline<B> {
    pub fn new(settings: PipelineSettings, session: B) -> Self {
        let queue = Arc::new(BoundedQueue::new(settings.queue_capacity));
        let connection = Arc::new(Mutex::new(Connection::new(session, settings.topics.status())));

        Self {
            settings,
            queue,
            connection,
            tasks: Vec::new(),
        }
    }

    pub fn topics(&self) -> &TopicLayout {
        &self.settings.topics
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.queue.clone())
    }

    pub fn publish(
        &self,
        subtopic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retain: bool,
    ) {
        self.publisher().publish(subtopic, payload, qos, retain);
    }

    pub fn publish_measurement(
        &self,
        measurement: &Measurement,
        timestamp: i64,
        qos: QoS,
        retain: bool,
    ) {
        self.publisher()
            .publish_measurement(measurement, timestamp, qos, retain);
    }

    pub fn publish_measurements_from_reading(&self, reading: &Reading) {
        self.publisher().publish_measurements_from_reading(reading);
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.lock().await.state()
    }

    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.connection.lock().await.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connection.lock().await.disconnect().await
    }

    /// Connects, then spawns the publisher and keepalive loops.
    ///
    /// # Errors
    ///
    /// The initial connect failure is returned as is; no loop is started in that case.
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        if !self.tasks.is_empty() {
            warn!("Publish pipeline already started");
            return Ok(());
        }

        self.connect().await?;

        let delivery = self.delivery();
        self.tasks.push(tokio::spawn(delivery.run()));
        self.tasks.push(tokio::spawn(keepalive_loop(
            self.connection.clone(),
            self.settings.ping_interval(),
        )));

        info!(
            "Publish pipeline started for {} (ping every {:?})",
            self.settings.topics.base(),
            self.settings.ping_interval()
        );
        Ok(())
    }

    /// Stops both loops, flushes what is still queued with a single attempt per message,
    /// marks the device offline and disconnects.
    pub async fn shutdown(&mut self) {
        info!("Shutting down publish pipeline");
        for task in self.tasks.drain(..) {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Pipeline task failed: {}", e);
                }
            }
        }

        let mut connection = self.connection.lock().await;
        if connection.state() != ConnectionState::Connected {
            debug!("Not connected, skipping flush");
            return;
        }

        let mut flushed = 0;
        while let Some(request) = self.queue.try_dequeue() {
            let topic = self.settings.topics.topic(&request.subtopic);
            match connection
                .publish(&topic, &request.payload, request.qos, request.retain)
                .await
            {
                Ok(()) => flushed += 1,
                Err(e) => warn!("Dropping {} during shutdown: {}", request, e),
            }
        }
        debug!("Flushed {} queued messages", flushed);

        let offline = status_payload(STATUS_OFFLINE);
        if let Err(e) = connection
            .publish(&self.settings.topics.status(), &offline, QoS::AtLeastOnce, true)
            .await
        {
            warn!("Failed to publish offline status: {}", e);
        }
        if let Err(e) = connection.disconnect().await {
            warn!("Failed to disconnect cleanly: {}", e);
        }
    }

    fn delivery(&self) -> Delivery<B> {
        Delivery {
            queue: self.queue.clone(),
            connection: self.connection.clone(),
            topics: self.settings.topics.clone(),
            max_retries: self.settings.max_retries,
        }
    }
}

impl<B: BrokerSession> Drop for PublishPipeline<B> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
