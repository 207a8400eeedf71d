use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::decoder::DecodeError;
use crate::socket_stats::*;
use crate::templates::TemplateStore;

pub const DECODE_ERROR_REASONS: [&str; 5] = [
    "invalid protocol version",
    "invalid set id",
    "invalid template id",
    "unknown template id",
    "malformed packet",
];

/// Instruments owned by the decoder.
#[derive(Debug, Default)]
pub struct DecoderMetrics {
    packets: AtomicU64,
    flows: AtomicU64,
    errors: [AtomicU64; DECODE_ERROR_REASONS.len()],
}

impl DecoderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn packet_received(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn flow_decoded(&self) {
        self.flows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self, error: &DecodeError) {
        let reason = error.reason();
        if let Some(index) = DECODE_ERROR_REASONS.iter().position(|r| *r == reason) {
            self.errors[index].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn flows(&self) -> u64 {
        self.flows.load(Ordering::Relaxed)
    }

    pub fn errors(&self, reason: &str) -> u64 {
        DECODE_ERROR_REASONS
            .iter()
            .position(|r| *r == reason)
            .map(|index| self.errors[index].load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn errors_by_reason(&self) -> BTreeMap<&'static str, u64> {
        DECODE_ERROR_REASONS
            .iter()
            .zip(self.errors.iter())
            .map(|(reason, count)| (*reason, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Instruments owned by the sink adapter.
#[derive(Debug, Default)]
pub struct SinkMetrics {
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl SinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the running total including this drop.
    #[inline]
    pub fn flow_dropped(&self) -> u64 {
        self.dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub fn publish_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    #[serde(rename = "decoder.ipfix.packets")]
    pub packets: u64,
    #[serde(rename = "decoder.ipfix.flows")]
    pub flows: u64,
    #[serde(rename = "decoder.ipfix.errors")]
    pub errors: BTreeMap<&'static str, u64>,
    #[serde(rename = "decoder.ipfix.templates")]
    pub templates: usize,
    #[serde(rename = "server.packet_drops")]
    pub packet_drops: f64,
    #[serde(rename = "server.receive_queue")]
    pub receive_queue: f64,
    #[serde(rename = "sink.dropped")]
    pub sink_dropped: u64,
    #[serde(rename = "sink.failed")]
    pub sink_failed: u64,
}

/// Read side handed to whatever exposes metrics. Holds references to the
/// instruments each component owns; nothing here is updated directly.
pub struct Telemetry {
    decoder: Arc<DecoderMetrics>,
    templates: Arc<TemplateStore>,
    socket_stats: Option<Arc<dyn SocketStatsReader>>,
    sink: Option<Arc<SinkMetrics>>,
}

impl Telemetry {
    pub fn new(decoder: Arc<DecoderMetrics>, templates: Arc<TemplateStore>) -> Self {
        Telemetry {
            decoder,
            templates,
            socket_stats: None,
            sink: None,
        }
    }

    pub fn with_socket_stats(mut self, socket_stats: Arc<dyn SocketStatsReader>) -> Self {
        self.socket_stats = Some(socket_stats);
        self
    }

    pub fn with_sink(mut self, sink: Arc<SinkMetrics>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let socket_stats = self
            .socket_stats
            .as_ref()
            .map(|reader| reader.socket_stats_or_unknown())
            .unwrap_or(SocketStats::UNKNOWN);
        MetricsSnapshot {
            packets: self.decoder.packets(),
            flows: self.decoder.flows(),
            errors: self.decoder.errors_by_reason(),
            templates: self.templates.len(),
            packet_drops: socket_stats.dropped_packets_count,
            receive_queue: socket_stats.recv_queue_size,
            sink_dropped: self.sink.as_ref().map(|s| s.dropped()).unwrap_or(0),
            sink_failed: self.sink.as_ref().map(|s| s.failed()).unwrap_or(0),
        }
    }
}
