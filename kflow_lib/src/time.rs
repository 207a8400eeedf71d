use std::sync::Arc;

use chrono::prelude::*;
use chrono::TimeDelta;

/// Source of "now", swappable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

pub fn get_time_delta(current_time: DateTime<Utc>, old_time: DateTime<Utc>) -> TimeDelta {
    current_time - old_time
}

/// IPFIX export time is in seconds, flow timestamps are in milliseconds.
pub fn export_time_to_millis(export_time: u32) -> i64 {
    i64::from(export_time) * 1000
}
