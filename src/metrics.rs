use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

/// In-process metrics recorder in the `mark(service, topic, duration,
/// code)` shape the components expect. Counters are queryable, which the
/// test suites use in place of a wire exporter.
#[derive(Default)]
pub struct Metrics {
    counters: Mutex<HashMap<(String, String, i32), u64>>,
}

pub const CODE_SUCCESS: i32 = 0;
pub const CODE_FAILURE: i32 = 1;

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self, service: &str, topic: &str, duration_us: i64, code: i32) {
        trace!(service, topic, duration_us, code, "metric");
        *self
            .counters
            .lock()
            .entry((service.to_string(), topic.to_string(), code))
            .or_insert(0) += 1;
    }

    pub fn count(&self, service: &str, topic: &str, code: i32) -> u64 {
        self.counters
            .lock()
            .get(&(service.to_string(), topic.to_string(), code))
            .copied()
            .unwrap_or(0)
    }
}

impl online_redis::MetricsSink for Metrics {
    fn mark(&self, service: &str, topic: &str, duration_us: i64, code: i32) {
        Metrics::mark(self, service, topic, duration_us, code)
    }
}
