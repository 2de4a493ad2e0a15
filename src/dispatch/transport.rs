use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager, aio::MultiplexedConnection};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::errors::{DispatchError, DispatchResult};
use super::messages::{Envelope, Queue, WorkerReport};

const QUEUE_PREFIX: &str = "ts:queue";

pub(crate) fn queue_key(name: &str) -> String {
    format!("{QUEUE_PREFIX}:{name}")
}

/// A single, non-blocking delivery attempt to a worker queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, queue: Queue, envelope: &Envelope) -> DispatchResult<()>;
}

/// Receiving ends of the in-process worker queues.
#[derive(Debug)]
pub struct WorkerQueues {
    pub harvester: mpsc::Receiver<Envelope>,
    pub downloader: mpsc::Receiver<Envelope>,
}

/// Bounded in-process channels, one per worker queue.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    harvester: mpsc::Sender<Envelope>,
    downloader: mpsc::Sender<Envelope>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, WorkerQueues) {
        let (harvester, harvester_rx) = mpsc::channel(capacity.max(1));
        let (downloader, downloader_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                harvester,
                downloader,
            },
            WorkerQueues {
                harvester: harvester_rx,
                downloader: downloader_rx,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, queue: Queue, envelope: &Envelope) -> DispatchResult<()> {
        let sender = match queue {
            Queue::Harvester => &self.harvester,
            Queue::Downloader => &self.downloader,
        };
        sender
            .try_send(envelope.clone())
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => DispatchError::ChannelFull(queue),
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed(queue),
            })
    }
}

/// Redis lists as worker queues, `ts:queue:harvester` and
/// `ts:queue:downloader`. Workers pop from the right; reports come back on
/// `ts:queue:reports`.
#[derive(Clone)]
pub struct RedisTransport {
    client: redis::Client,
    conn: ConnectionManager,
    max_length: usize,
}

impl RedisTransport {
    pub async fn connect(url: &str, max_length: usize) -> DispatchResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            max_length,
        })
    }

    /// Opens a dedicated connection for blocking report reads.
    pub async fn report_listener(&self) -> DispatchResult<ReportListener> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        Ok(ReportListener { conn })
    }

    /// Pushes a worker report, as an out-of-process worker would.
    pub async fn publish_report(&self, report: &WorkerReport) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(report)?;
        let _: () = conn.lpush(queue_key("reports"), payload).await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn send(&self, queue: Queue, envelope: &Envelope) -> DispatchResult<()> {
        let mut conn = self.conn.clone();
        let key = queue_key(queue.as_str());

        let length: usize = conn.llen(&key).await?;
        if length >= self.max_length {
            return Err(DispatchError::ChannelFull(queue));
        }

        let payload = serde_json::to_string(envelope)?;
        let _: () = conn.lpush(&key, payload).await?;
        debug!(%queue, id = %envelope.id, "Pushed envelope");
        Ok(())
    }
}

/// Blocking reader of `ts:queue:reports`.
pub struct ReportListener {
    conn: MultiplexedConnection,
}

impl ReportListener {
    /// Puts `report` back at the tail of the queue, behind newer reports.
    pub async fn requeue(&mut self, report: &WorkerReport) -> DispatchResult<()> {
        let payload = serde_json::to_string(report)?;
        let _: () = self.conn.lpush(queue_key("reports"), payload).await?;
        Ok(())
    }

    /// Waits up to `timeout` for the next report.
    ///
    /// Undecodable payloads are logged and skipped, never retried.
    pub async fn next(&mut self, timeout: Duration) -> DispatchResult<Option<WorkerReport>> {
        let popped: Option<(String, String)> = self
            .conn
            .brpop(queue_key("reports"), timeout.as_secs_f64())
            .await?;
        let Some((_, payload)) = popped else {
            return Ok(None);
        };

        match serde_json::from_str(&payload) {
            Ok(report) => Ok(Some(report)),
            Err(e) => {
                warn!("Dropping undecodable worker report: {e}");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatchMessage, FetchMode};

    fn envelope() -> Envelope {
        Envelope::new(DispatchMessage::Harvest {
            issuer: "CN=CA".into(),
            crl_location: "http://crl.example.com/ca.crl".into(),
            mode: FetchMode::Incremental,
        })
    }

    #[tokio::test]
    async fn test_channel_routes_by_queue() {
        let (transport, mut queues) = ChannelTransport::new(4);
        let sent = envelope();
        transport.send(Queue::Harvester, &sent).await.unwrap();

        assert_eq!(queues.harvester.recv().await, Some(sent));
        assert!(queues.downloader.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_channel_is_transient() {
        let (transport, _queues) = ChannelTransport::new(1);
        transport.send(Queue::Downloader, &envelope()).await.unwrap();

        let err = transport
            .send(Queue::Downloader, &envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ChannelFull(Queue::Downloader)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_closed_channel_is_permanent() {
        let (transport, queues) = ChannelTransport::new(1);
        drop(queues);

        let err = transport
            .send(Queue::Harvester, &envelope())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Closed(Queue::Harvester)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_report_round_trip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let transport = RedisTransport::connect(&url, 1000).await.unwrap();
        let mut listener = transport.report_listener().await.unwrap();

        let report = WorkerReport::Removed {
            issuer: format!("CN=Removed {}", uuid::Uuid::new_v4()),
        };
        transport.publish_report(&report).await.unwrap();

        let received = listener.next(Duration::from_secs(2)).await.unwrap();
        assert_eq!(received, Some(report.clone()));

        listener.requeue(&report).await.unwrap();
        let redelivered = listener.next(Duration::from_secs(2)).await.unwrap();
        assert_eq!(redelivered, Some(report));
    }
}
