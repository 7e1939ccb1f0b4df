/// Socket job broker
///
/// Keeps, per (database, queue) pair, the worker connections subscribed to it
/// and pushes each available queue message to exactly one of them. The broker
/// only deals in frames; the WebSocket endpoint in `api::ws` is a thin wrapper
/// that moves frames between a socket and a [`BrokerConnection`].

use crate::{
    error::{EmulatorError, EmulatorResult},
    service::{PolledMessage, WorkflowService},
};
use arc_swap::ArcSwap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::MissedTickBehavior,
};

/// Frames sent by worker connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Subscribe { queue: String },
}

/// Frames pushed to worker connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    Subscribed { queue: String },
    Job(PolledMessage),
}

pub type ConnectionId = u64;

/// Subscription scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub db_name: String,
    pub queue_name: String,
}

/// Policy choosing which open connection receives a job
pub trait WorkerSelector: Send + Sync {
    /// Index into `open_connections` candidates, or None when there are none
    fn select(&self, open_connections: usize) -> Option<usize>;
}

/// Uniform random choice among open connections
#[derive(Debug, Default)]
pub struct UniformRandom;

impl WorkerSelector for UniformRandom {
    fn select(&self, open_connections: usize) -> Option<usize> {
        (open_connections > 0).then(|| rand::thread_rng().gen_range(0..open_connections))
    }
}

/// Cycles through open connections in subscription order
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl WorkerSelector for RoundRobin {
    fn select(&self, open_connections: usize) -> Option<usize> {
        (open_connections > 0)
            .then(|| self.next.fetch_add(1, Ordering::Relaxed) % open_connections)
    }
}

#[derive(Debug, Clone)]
struct Subscriber {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

impl Subscriber {
    /// Open while the connection still reads its outbound frames
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// One worker connection's side of the broker
#[derive(Debug)]
pub struct BrokerConnection {
    id: ConnectionId,
    db_name: String,
    sender: mpsc::UnboundedSender<ServerFrame>,
    outbound: mpsc::UnboundedReceiver<ServerFrame>,
}

impl BrokerConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    /// Next frame to deliver to the worker
    pub async fn recv(&mut self) -> Option<ServerFrame> {
        self.outbound.recv().await
    }

    /// Next frame if one is already queued
    pub fn try_recv(&mut self) -> Option<ServerFrame> {
        self.outbound.try_recv().ok()
    }
}

type SubscriptionTable = HashMap<QueueKey, Vec<Subscriber>>;

pub struct QueueBroker {
    service: Arc<WorkflowService>,
    selector: Box<dyn WorkerSelector>,
    /// Read on every poll tick, replaced on subscribe and disconnect
    subscriptions: ArcSwap<SubscriptionTable>,
    next_connection_id: AtomicU64,
}

impl QueueBroker {
    pub fn new(service: Arc<WorkflowService>) -> Self {
        Self::with_selector(service, UniformRandom)
    }

    pub fn with_selector(service: Arc<WorkflowService>, selector: impl WorkerSelector + 'static) -> Self {
        Self {
            service,
            selector: Box::new(selector),
            subscriptions: ArcSwap::from_pointee(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Open a connection scoped to one database
    pub fn connect(&self, db_name: &str) -> BrokerConnection {
        let (sender, outbound) = mpsc::unbounded_channel();
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Worker connection {} opened on '{}'", id, db_name);
        BrokerConnection {
            id,
            db_name: db_name.to_string(),
            sender,
            outbound,
        }
    }

    /// Handle one text frame from a worker
    ///
    /// SUBSCRIBE is confirmed with SUBSCRIBED before the connection is
    /// registered, so the confirmation always precedes the first job. Other
    /// events are ignored.
    pub fn handle_frame(&self, connection: &BrokerConnection, text: &str) -> EmulatorResult<()> {
        let frame: Value =
            serde_json::from_str(text).map_err(|e| EmulatorError::malformed("socket frame", e))?;

        match frame.get("event").and_then(Value::as_str) {
            Some("SUBSCRIBE") => {
                let ClientFrame::Subscribe { queue } = serde_json::from_value(frame)
                    .map_err(|e| EmulatorError::malformed("SUBSCRIBE frame", e))?;

                // A closed connection only loses its own confirmation
                let _ = connection.sender.send(ServerFrame::Subscribed {
                    queue: queue.clone(),
                });
                self.subscribe(connection, &queue);
                Ok(())
            }
            other => {
                tracing::debug!("Ignoring socket event {:?} from connection {}", other, connection.id);
                Ok(())
            }
        }
    }

    fn subscribe(&self, connection: &BrokerConnection, queue_name: &str) {
        let key = QueueKey {
            db_name: connection.db_name.clone(),
            queue_name: queue_name.to_string(),
        };
        let subscriber = Subscriber {
            id: connection.id,
            sender: connection.sender.clone(),
        };

        self.subscriptions.rcu(|current| {
            let mut next = SubscriptionTable::clone(current);
            let subscribers = next.entry(key.clone()).or_default();
            if !subscribers.iter().any(|s| s.id == subscriber.id) {
                subscribers.push(subscriber.clone());
            }
            next
        });
        tracing::info!(
            "Worker connection {} subscribed to '{}' on '{}'",
            connection.id,
            key.queue_name,
            key.db_name
        );
    }

    /// Remove a connection from every subscription
    ///
    /// Jobs already handed to it but not yet read by the worker go back to
    /// the queue.
    pub async fn disconnect(&self, mut connection: BrokerConnection) {
        let id = connection.id;
        self.subscriptions.rcu(|current| {
            let mut next = SubscriptionTable::clone(current);
            for subscribers in next.values_mut() {
                subscribers.retain(|s| s.id != id);
            }
            next.retain(|_, subscribers| !subscribers.is_empty());
            next
        });

        connection.outbound.close();
        while let Ok(frame) = connection.outbound.try_recv() {
            if let ServerFrame::Job(job) = frame {
                self.return_job(&connection, &job).await;
            }
        }
        tracing::debug!("Worker connection {} closed", id);
    }

    /// Put a job back on its queue after it could not reach the worker
    pub async fn return_job(&self, connection: &BrokerConnection, job: &PolledMessage) {
        if let Err(e) = self.service.nack(&connection.db_name, &job.id).await {
            tracing::error!("Failed to return job {} to the queue: {}", job.id, e);
        }
    }

    /// Number of open connections subscribed to a queue
    pub fn subscriber_count(&self, db_name: &str, queue_name: &str) -> usize {
        let key = QueueKey {
            db_name: db_name.to_string(),
            queue_name: queue_name.to_string(),
        };
        self.subscriptions
            .load()
            .get(&key)
            .map_or(0, |subscribers| subscribers.iter().filter(|s| s.is_open()).count())
    }

    /// One pass over every subscribed queue; returns the number of jobs delivered
    pub async fn poll_once(&self) -> usize {
        let subscriptions = self.subscriptions.load_full();
        let mut delivered = 0;

        for (key, subscribers) in subscriptions.iter() {
            if subscribers.is_empty() {
                continue;
            }
            match self.service.poll(&key.db_name, &key.queue_name).await {
                Ok(Some(job)) => {
                    if self.dispatch(key, subscribers, job).await {
                        delivered += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!(
                    "Error polling queue '{}' on '{}': {}",
                    key.queue_name,
                    key.db_name,
                    e
                ),
            }
        }
        delivered
    }

    /// Hand a claimed job to exactly one open subscriber, or nack it
    async fn dispatch(&self, key: &QueueKey, subscribers: &[Subscriber], job: PolledMessage) -> bool {
        let open: Vec<&Subscriber> = subscribers.iter().filter(|s| s.is_open()).collect();
        let job_id = job.id.clone();

        let delivered = match self.selector.select(open.len()).and_then(|i| open.get(i)) {
            Some(worker) => {
                tracing::debug!("Dispatching job {} to connection {}", job_id, worker.id);
                worker.sender.send(ServerFrame::Job(job)).is_ok()
            }
            None => false,
        };

        if !delivered {
            tracing::debug!(
                "No open worker for '{}' on '{}', returning job {}",
                key.queue_name,
                key.db_name,
                job_id
            );
            if let Err(e) = self.service.nack(&key.db_name, &job_id).await {
                tracing::error!("Failed to nack undeliverable job {}: {}", job_id, e);
            }
        }
        delivered
    }

    /// Run `poll_once` on a fixed interval until the task is aborted
    pub fn start(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tracing::info!("Starting queue broker (poll every {:?})", period);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                broker.poll_once().await;
            }
        })
    }
}

impl std::fmt::Debug for QueueBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBroker")
            .field("queues", &self.subscriptions.load().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_use_event_and_data_envelope() {
        let job = ServerFrame::Job(PolledMessage {
            id: "msg_1".to_string(),
            data: json!({ "runId": "wrun_1" }),
            attempt: 1,
        });
        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            json!({ "event": "JOB", "data": { "id": "msg_1", "data": { "runId": "wrun_1" }, "attempt": 1 } })
        );

        let subscribe: ClientFrame =
            serde_json::from_value(json!({ "event": "SUBSCRIBE", "data": { "queue": "q" } })).unwrap();
        assert_eq!(subscribe, ClientFrame::Subscribe { queue: "q".to_string() });
    }

    #[test]
    fn selectors_stay_in_range() {
        let random = UniformRandom;
        assert_eq!(random.select(0), None);
        for _ in 0..50 {
            assert!(random.select(3).unwrap() < 3);
        }

        let round_robin = RoundRobin::default();
        let picks: Vec<usize> = (0..4).filter_map(|_| round_robin.select(2)).collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }
}
