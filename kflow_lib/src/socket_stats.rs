use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::prelude::*;
use chrono::TimeDelta;
use log::error;
use serde::Serialize;
use thiserror::Error;

use crate::time::*;

pub const PROC_NET_UDP: &str = "/proc/net/udp";
pub const DEFAULT_VALIDITY_SECS: i64 = 15;

//sl local_address:local_port remote_address:remote_port st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode ref pointer drops
//0  1             2          3              4           5  6        7        8  9        10       11  12      13    14  15      16
const PROC_NET_UDP_COLUMNS: usize = 17;
const LOCAL_PORT_COLUMN: usize = 2;
const RX_QUEUE_COLUMN: usize = 7;
const DROPS_COLUMN: usize = 16;

#[derive(Clone, Copy, Debug, Serialize)]
pub struct SocketStats {
    pub recv_queue_size: f64,
    pub dropped_packets_count: f64,
}

impl SocketStats {
    pub const UNKNOWN: SocketStats = SocketStats {
        recv_queue_size: f64::NAN,
        dropped_packets_count: f64::NAN,
    };

    pub fn is_unknown(&self) -> bool {
        self.recv_queue_size.is_nan() && self.dropped_packets_count.is_nan()
    }
}

#[derive(Debug, Error)]
pub enum SocketStatsError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to parse {column} in row {row:?}")]
    Parse { column: &'static str, row: String },
    #[error("socket statistics are not supported on this platform")]
    Unsupported,
}

pub trait SocketStatsReader: Send + Sync {
    fn socket_stats(&self) -> Result<SocketStats, SocketStatsError>;

    fn socket_stats_or_unknown(&self) -> SocketStats {
        self.socket_stats().unwrap_or(SocketStats::UNKNOWN)
    }
}

/// Sums receive queue depth and drop counters over every kernel UDP socket
/// bound to `port`, as listed in the connection table. Linux only.
pub struct ProcNetUdpReader {
    port: u16,
    path: PathBuf,
}

impl ProcNetUdpReader {
    pub fn new(port: u16) -> Self {
        Self::with_path(port, PROC_NET_UDP)
    }

    pub fn with_path(port: u16, path: impl Into<PathBuf>) -> Self {
        ProcNetUdpReader {
            port,
            path: path.into(),
        }
    }

    pub fn parse_table(&self, table: &str) -> Result<SocketStats, SocketStatsError> {
        let port_hex = format!("{:04X}", self.port);
        let mut stats = SocketStats {
            recv_queue_size: 0.0,
            dropped_packets_count: 0.0,
        };

        for line in table.lines().skip(1) {
            let cols: Vec<&str> = line
                .trim()
                .split([' ', ':'])
                .filter(|c| !c.is_empty())
                .collect();
            if cols.len() != PROC_NET_UDP_COLUMNS || !cols[LOCAL_PORT_COLUMN].eq_ignore_ascii_case(&port_hex) {
                continue;
            }
            let rx_queue = u64::from_str_radix(cols[RX_QUEUE_COLUMN], 16).map_err(|_| SocketStatsError::Parse {
                column: "rx_queue",
                row: line.to_string(),
            })?;
            let drops: u64 = cols[DROPS_COLUMN].parse().map_err(|_| SocketStatsError::Parse {
                column: "drops",
                row: line.to_string(),
            })?;
            stats.recv_queue_size += rx_queue as f64;
            stats.dropped_packets_count += drops as f64;
        }
        Ok(stats)
    }
}

impl SocketStatsReader for ProcNetUdpReader {
    fn socket_stats(&self) -> Result<SocketStats, SocketStatsError> {
        if !cfg!(target_os = "linux") {
            return Err(SocketStatsError::Unsupported);
        }
        let table = fs::read_to_string(&self.path).map_err(|e| SocketStatsError::Io {
            path: self.path.display().to_string(),
            source: e,
        })?;
        self.parse_table(&table)
    }
}

struct CacheState {
    stats: SocketStats,
    updated: Option<DateTime<Utc>>,
    disabled: bool,
}

/// Throttles reads of the wrapped reader to one per validity window. The first
/// failed refresh pins the value to [`SocketStats::UNKNOWN`] for good.
pub struct SocketStatsCachingReader<R> {
    reader: R,
    validity: TimeDelta,
    clock: Clock,
    state: Mutex<CacheState>,
}

impl<R: SocketStatsReader> SocketStatsCachingReader<R> {
    pub fn new(reader: R, validity: TimeDelta) -> Self {
        Self::with_clock(reader, validity, system_clock())
    }

    pub fn with_clock(reader: R, validity: TimeDelta, clock: Clock) -> Self {
        SocketStatsCachingReader {
            reader,
            validity,
            clock,
            state: Mutex::new(CacheState {
                stats: SocketStats::UNKNOWN,
                updated: None,
                disabled: false,
            }),
        }
    }

    pub fn is_disabled(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.disabled
    }
}

impl<R: SocketStatsReader> SocketStatsReader for SocketStatsCachingReader<R> {
    fn socket_stats(&self) -> Result<SocketStats, SocketStatsError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.disabled {
            return Ok(SocketStats::UNKNOWN);
        }

        let now = (self.clock)();
        let expired = match state.updated {
            Some(updated) => get_time_delta(now, updated) > self.validity,
            None => true,
        };
        if expired {
            match self.reader.socket_stats() {
                Ok(stats) => {
                    state.stats = stats;
                    state.updated = Some((self.clock)());
                }
                Err(e) => {
                    error!("Error reading socket stats, disabling further updates: {e}");
                    state.stats = SocketStats::UNKNOWN;
                    state.disabled = true;
                }
            }
        }
        Ok(state.stats)
    }
}
