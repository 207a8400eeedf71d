//! Hand-off of decoded flows to the message sink.
//!
//! Workers call [`FlowSink::write`] once per flow and never wait on the
//! broker: each publisher sits behind its own bounded queue drained by a
//! dedicated thread, and a full queue drops the flow.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::flows::Flow;
use crate::metrics::SinkMetrics;
use crate::settings::SinkSettings;
use crate::sql::SqlitePublisher;

pub const CLOSE_TIMEOUT: Duration = Duration::from_millis(5000);
const DROP_LOG_EVERY: u64 = 10_000;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid sink configuration: {0}")]
    InvalidConfig(String),
    #[error("unable to start publisher {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("publisher {index} did not close within {timeout:?}")]
    CloseTimeout { index: usize, timeout: Duration },
}

pub trait FlowSink: Send + Sync {
    /// Fire and forget; failures are the sink's own business.
    fn write(&self, flow: &Flow);
}

/// One connection to the broker. Owned by a single drain thread.
pub trait FlowPublisher: Send {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

enum Command {
    Publish(Vec<u8>),
    Close,
}

struct PublisherHandle {
    index: usize,
    tx: SyncSender<Command>,
    worker: Mutex<Option<(JoinHandle<()>, Receiver<()>)>>,
}

impl PublisherHandle {
    fn close(&self, timeout: Duration) -> Result<(), SinkError> {
        let deadline = Instant::now() + timeout;
        let timed_out = SinkError::CloseTimeout {
            index: self.index,
            timeout,
        };

        //the close marker queues behind pending flows so they are flushed first
        loop {
            match self.tx.try_send(Command::Close) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => break,
                Err(TrySendError::Full(_)) => {
                    if Instant::now() >= deadline {
                        return Err(timed_out);
                    }
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((join_handle, done)) = worker {
            match done.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if join_handle.join().is_err() {
                        error!("Sink publisher {} panicked", self.index);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Err(timed_out),
            }
        }
        Ok(())
    }
}

/// Round-robins flows over a pool of publishers, one bounded queue each.
pub struct PooledFlowSink {
    handles: Vec<PublisherHandle>,
    next: AtomicUsize,
    closed: AtomicBool,
    metrics: Arc<SinkMetrics>,
}

impl PooledFlowSink {
    pub fn new(topic: &str, queue_size: usize, publishers: Vec<Box<dyn FlowPublisher>>) -> Result<Self, SinkError> {
        if publishers.is_empty() {
            return Err(SinkError::InvalidConfig("at least one publisher is required".to_string()));
        }
        if queue_size == 0 {
            return Err(SinkError::InvalidConfig("queue size must be at least 1".to_string()));
        }

        let metrics = Arc::new(SinkMetrics::new());
        let mut handles = Vec::with_capacity(publishers.len());
        for (index, publisher) in publishers.into_iter().enumerate() {
            let (tx, rx) = mpsc::sync_channel(queue_size);
            let (done_tx, done_rx) = mpsc::channel();
            let topic = topic.to_string();
            let drain_metrics = Arc::clone(&metrics);
            let join_handle = thread::Builder::new()
                .name(format!("kflow-sink-{index}"))
                .spawn(move || {
                    drain(index, &topic, publisher, rx, &drain_metrics);
                    let _ = done_tx.send(());
                })
                .map_err(|e| SinkError::Spawn { index, source: e })?;
            handles.push(PublisherHandle {
                index,
                tx,
                worker: Mutex::new(Some((join_handle, done_rx))),
            });
        }

        Ok(PooledFlowSink {
            handles,
            next: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            metrics,
        })
    }

    /// Opens `producers` SQLite publishers configured from `sink.props.*`.
    pub fn from_settings(settings: &SinkSettings) -> Result<Self, SinkError> {
        let mut publishers: Vec<Box<dyn FlowPublisher>> = Vec::with_capacity(settings.producers);
        for _ in 0..settings.producers {
            publishers.push(Box::new(SqlitePublisher::open(&settings.props)?));
        }
        info!(
            "Opened {} sqlite publishers for topic {}",
            publishers.len(),
            settings.topic
        );
        Self::new(&settings.topic, settings.queue_size, publishers)
    }

    pub fn metrics(&self) -> &Arc<SinkMetrics> {
        &self.metrics
    }

    pub fn publishers(&self) -> usize {
        self.handles.len()
    }

    /// Flushes queued flows and closes every publisher, waiting up to
    /// [`CLOSE_TIMEOUT`] for each. Later calls are no-ops.
    pub fn close(&self) -> Result<(), SinkError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Closing sink publishers");
        let mut result = Ok(());
        for handle in &self.handles {
            if let Err(e) = handle.close(CLOSE_TIMEOUT) {
                warn!("{e}, leaving it behind");
                result = Err(e);
            }
        }
        result
    }

    fn record_drop(&self, index: usize, cause: &str) {
        record_drop(&self.metrics, index, cause);
    }
}

fn record_drop(metrics: &SinkMetrics, index: usize, cause: &str) {
    let total = metrics.flow_dropped();
    if total == 1 || total % DROP_LOG_EVERY == 0 {
        warn!("Dropped flow for publisher {index} ({cause}), {total} dropped so far");
    }
}

impl FlowSink for PooledFlowSink {
    fn write(&self, flow: &Flow) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        if self.closed.load(Ordering::Relaxed) {
            self.record_drop(index, "sink closed");
            return;
        }
        let payload = match flow.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Unable to serialize flow: {e}");
                self.metrics.publish_failed();
                return;
            }
        };
        match self.handles[index].tx.try_send(Command::Publish(payload)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.record_drop(index, "queue full"),
            Err(TrySendError::Disconnected(_)) => self.record_drop(index, "publisher stopped"),
        }
    }
}

impl Drop for PooledFlowSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Sink did not close cleanly: {e}");
        }
    }
}

fn drain(
    index: usize,
    topic: &str,
    mut publisher: Box<dyn FlowPublisher>,
    rx: Receiver<Command>,
    metrics: &SinkMetrics,
) {
    debug!("Sink publisher {index} started");
    while let Ok(command) = rx.recv() {
        match command {
            Command::Publish(payload) => {
                if let Err(e) = publisher.publish(topic, &payload) {
                    metrics.publish_failed();
                    debug!("Sink publisher {index} failed to publish: {e}");
                }
            }
            Command::Close => break,
        }
    }
    //writes that raced with close land behind the marker
    for command in rx.try_iter() {
        if let Command::Publish(_) = command {
            record_drop(metrics, index, "sink closed");
        }
    }
    //later writes see a disconnected queue and count themselves
    drop(rx);
    if let Err(e) = publisher.close() {
        error!("Sink publisher {index} failed to close: {e}");
    }
    debug!("Sink publisher {index} stopped");
}

/// Keeps published payloads in memory. Handy for embedding and tests.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    records: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(topic, payload)` pairs in publish order.
    pub fn records(&self) -> Vec<(String, Vec<u8>)> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl FlowPublisher for MemoryPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), SinkError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::sync::mpsc::Sender;

    use super::*;

    fn flow(bytes: u64) -> Flow {
        Flow {
            bytes,
            ..Default::default()
        }
    }

    #[test]
    fn test_round_robin_over_publishers() {
        let first = MemoryPublisher::new();
        let second = MemoryPublisher::new();
        let sink = PooledFlowSink::new(
            "flows",
            16,
            vec![Box::new(first.clone()), Box::new(second.clone())],
        )
        .unwrap();

        for bytes in 0..6 {
            sink.write(&flow(bytes));
        }
        sink.close().unwrap();

        let first_records = first.records();
        let second_records = second.records();
        assert_eq!(first_records.len(), 3);
        assert_eq!(second_records.len(), 3);
        assert_eq!(first_records[0].0, "flows");
        assert!(String::from_utf8(first_records[1].1.clone()).unwrap().contains(r#""bytes":2,"#));
        assert!(String::from_utf8(second_records[0].1.clone()).unwrap().contains(r#""bytes":1,"#));
        assert_eq!(sink.metrics().dropped(), 0);
    }

    #[test]
    fn test_write_after_close_is_dropped() {
        let publisher = MemoryPublisher::new();
        let sink = PooledFlowSink::new("flows", 4, vec![Box::new(publisher.clone())]).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();

        sink.write(&flow(1));
        assert!(publisher.records().is_empty());
        assert_eq!(sink.metrics().dropped(), 1);
    }

    /// Holds every publish until told to go on.
    struct GatedPublisher {
        gate: Receiver<()>,
        published: Sender<Vec<u8>>,
    }

    impl FlowPublisher for GatedPublisher {
        fn publish(&mut self, _topic: &str, payload: &[u8]) -> Result<(), SinkError> {
            let _ = self.gate.recv();
            let _ = self.published.send(payload.to_vec());
            Ok(())
        }
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let (gate_tx, gate_rx) = mpsc::channel();
        let (published_tx, published_rx) = mpsc::channel();
        let sink = PooledFlowSink::new(
            "flows",
            1,
            vec![Box::new(GatedPublisher {
                gate: gate_rx,
                published: published_tx,
            })],
        )
        .unwrap();

        //first flow is taken by the drain thread and parks on the gate
        sink.write(&flow(1));
        let started = Instant::now();
        while sink.handles[0].tx.try_send(Command::Publish(Vec::new())).is_ok() {
            assert!(started.elapsed() < Duration::from_secs(5), "queue never filled");
            thread::sleep(Duration::from_millis(5));
        }

        sink.write(&flow(2));
        sink.write(&flow(3));
        assert_eq!(sink.metrics().dropped(), 2);

        for _ in 0..4 {
            let _ = gate_tx.send(());
        }
        drop(gate_tx);
        sink.close().unwrap();
        assert!(published_rx.try_iter().count() >= 1);
    }

    struct FailingPublisher;

    impl FlowPublisher for FailingPublisher {
        fn publish(&mut self, _topic: &str, _payload: &[u8]) -> Result<(), SinkError> {
            Err(SinkError::InvalidConfig("broker unavailable".to_string()))
        }
    }

    #[test]
    fn test_publish_failures_are_counted() {
        let sink = PooledFlowSink::new("flows", 4, vec![Box::new(FailingPublisher)]).unwrap();
        sink.write(&flow(1));
        sink.write(&flow(2));
        sink.close().unwrap();
        assert_eq!(sink.metrics().failed(), 2);
    }

    #[test]
    fn test_flows_queued_after_close_are_counted() {
        let (tx, rx) = mpsc::sync_channel(4);
        tx.send(Command::Publish(b"before".to_vec())).unwrap();
        tx.send(Command::Close).unwrap();
        tx.send(Command::Publish(b"after".to_vec())).unwrap();
        tx.send(Command::Publish(b"late".to_vec())).unwrap();

        let publisher = MemoryPublisher::new();
        let metrics = SinkMetrics::new();
        drain(0, "flows", Box::new(publisher.clone()), rx, &metrics);

        assert_eq!(publisher.records(), vec![("flows".to_string(), b"before".to_vec())]);
        assert_eq!(metrics.dropped(), 2);
    }

    #[test]
    fn test_requires_publishers() {
        assert!(matches!(
            PooledFlowSink::new("flows", 4, Vec::new()),
            Err(SinkError::InvalidConfig(_))
        ));
    }
}
