use crate::wire::{Frame, LogLine, Topic};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

pub const DEFAULT_METRICS_CAPACITY: usize = 100;
pub const DEFAULT_LOG_LINES_PER_PROCESS: usize = 1000;
pub const DEFAULT_ALERT_CAPACITY: usize = 500;

/// How a [`ChannelBuffer`] retains entries once it reaches capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Append at the back, evict the oldest from the front.
    SlidingWindow(usize),
    /// Prepend at the front, evict the oldest from the back.
    NewestFirst(usize),
    /// Single slot; every ingest replaces the previous value.
    Latest,
}

impl Retention {
    pub fn capacity(self) -> usize {
        match self {
            Retention::SlidingWindow(capacity) | Retention::NewestFirst(capacity) => capacity,
            Retention::Latest => 1,
        }
    }
}

/// Ordered, bounded sequence of values for one topic (or one log key).
///
/// `len() <= retention.capacity()` holds after every operation.
#[derive(Debug, Clone)]
pub struct ChannelBuffer<T> {
    retention: Retention,
    items: VecDeque<T>,
}

impl<T> ChannelBuffer<T> {
    pub fn new(retention: Retention) -> Self {
        Self {
            retention,
            items: VecDeque::new(),
        }
    }

    pub fn sliding_window(capacity: usize) -> Self {
        Self::new(Retention::SlidingWindow(capacity))
    }

    pub fn newest_first(capacity: usize) -> Self {
        Self::new(Retention::NewestFirst(capacity))
    }

    pub fn latest() -> Self {
        Self::new(Retention::Latest)
    }

    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Stores `item` and returns whatever the policy evicted to make room.
    pub fn ingest(&mut self, item: T) -> Option<T> {
        match self.retention {
            Retention::SlidingWindow(capacity) => {
                self.items.push_back(item);
                if self.items.len() > capacity {
                    self.items.pop_front()
                } else {
                    None
                }
            }
            Retention::NewestFirst(capacity) => {
                self.items.push_front(item);
                if self.items.len() > capacity {
                    self.items.pop_back()
                } else {
                    None
                }
            }
            Retention::Latest => {
                let previous = self.items.pop_front();
                self.items.push_back(item);
                previous
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Entries in storage order: arrival order for sliding windows, newest
    /// first for newest-first buffers.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.items.iter()
    }

    /// The most recently ingested entry.
    pub fn newest(&self) -> Option<&T> {
        match self.retention {
            Retention::NewestFirst(_) => self.items.front(),
            Retention::SlidingWindow(_) | Retention::Latest => self.items.back(),
        }
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) -> usize {
        let before = self.items.len();
        self.items.retain(keep);
        before - self.items.len()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> ChannelBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    pub metrics: usize,
    pub log_lines_per_process: usize,
    pub alerts: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            metrics: DEFAULT_METRICS_CAPACITY,
            log_lines_per_process: DEFAULT_LOG_LINES_PER_PROCESS,
            alerts: DEFAULT_ALERT_CAPACITY,
        }
    }
}

/// The full set of per-topic buffers backing the live views.
#[derive(Debug, Clone)]
pub struct ChannelBuffers {
    limits: BufferLimits,
    processes: ChannelBuffer<Value>,
    cluster: ChannelBuffer<Value>,
    deployments: ChannelBuffer<Value>,
    metrics: ChannelBuffer<Value>,
    alerts: ChannelBuffer<Value>,
    logs: BTreeMap<String, ChannelBuffer<String>>,
}

impl Default for ChannelBuffers {
    fn default() -> Self {
        Self::new(BufferLimits::default())
    }
}

impl ChannelBuffers {
    pub fn new(limits: BufferLimits) -> Self {
        Self {
            limits,
            processes: ChannelBuffer::latest(),
            cluster: ChannelBuffer::latest(),
            deployments: ChannelBuffer::latest(),
            metrics: ChannelBuffer::sliding_window(limits.metrics),
            alerts: ChannelBuffer::newest_first(limits.alerts),
            logs: BTreeMap::new(),
        }
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// Routes one decoded frame into the buffer owning its topic.
    pub fn ingest(&mut self, frame: Frame) -> Topic {
        let topic = frame.topic();
        match frame {
            Frame::ProcessSnapshot(value) => {
                self.processes.ingest(value);
            }
            Frame::ClusterSnapshot(value) => {
                self.cluster.ingest(value);
            }
            Frame::DeploymentSnapshot(value) => {
                self.deployments.ingest(value);
            }
            Frame::MetricsSample(value) => {
                self.metrics.ingest(value);
            }
            Frame::Alert(value) => {
                self.alerts.ingest(value);
            }
            Frame::LogLine(line) => self.push_log_line(line),
        }
        topic
    }

    fn push_log_line(&mut self, line: LogLine) {
        let capacity = self.limits.log_lines_per_process;
        self.logs
            .entry(line.process_id)
            .or_insert_with(|| ChannelBuffer::sliding_window(capacity))
            .ingest(line.line);
    }

    pub fn processes(&self) -> Option<&Value> {
        self.processes.newest()
    }

    pub fn cluster(&self) -> Option<&Value> {
        self.cluster.newest()
    }

    pub fn deployments(&self) -> Option<&Value> {
        self.deployments.newest()
    }

    /// Metrics samples, oldest first.
    pub fn metrics(&self) -> &ChannelBuffer<Value> {
        &self.metrics
    }

    /// Alerts, newest first.
    pub fn alerts(&self) -> &ChannelBuffer<Value> {
        &self.alerts
    }

    /// Buffered lines for one process, oldest first.
    pub fn logs(&self, process_id: &str) -> Option<&ChannelBuffer<String>> {
        self.logs.get(process_id)
    }

    pub fn log_keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.logs.keys().map(String::as_str)
    }

    /// Removes every buffered alert whose `id` matches. Returns how many went.
    pub fn acknowledge_alert(&mut self, alert_id: &str) -> usize {
        self.alerts
            .retain(|alert| alert_id_of(alert).as_deref() != Some(alert_id))
    }

    pub fn drop_logs(&mut self, process_id: &str) -> bool {
        self.logs.remove(process_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
            && self.cluster.is_empty()
            && self.deployments.is_empty()
            && self.metrics.is_empty()
            && self.alerts.is_empty()
            && self.logs.is_empty()
    }

    pub fn clear(&mut self) {
        self.processes.clear();
        self.cluster.clear();
        self.deployments.clear();
        self.metrics.clear();
        self.alerts.clear();
        self.logs.clear();
    }
}

fn alert_id_of(alert: &Value) -> Option<String> {
    match alert.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log(process_id: &str, line: impl Into<String>) -> Frame {
        Frame::LogLine(LogLine {
            process_id: process_id.to_string(),
            line: line.into(),
        })
    }

    #[test]
    fn metrics_keep_last_hundred_in_arrival_order() {
        for total in [0usize, 1, 99, 100, 101, 105, 250] {
            let mut buffers = ChannelBuffers::default();
            for i in 0..total {
                buffers.ingest(Frame::MetricsSample(json!({ "seq": i })));
            }
            let retained = buffers.metrics().to_vec();
            assert_eq!(retained.len(), total.min(DEFAULT_METRICS_CAPACITY));
            let first = total.saturating_sub(DEFAULT_METRICS_CAPACITY);
            let expected: Vec<Value> = (first..total).map(|i| json!({ "seq": i })).collect();
            assert_eq!(retained, expected);
        }
    }

    #[test]
    fn log_lines_are_bounded_per_process() {
        let mut buffers = ChannelBuffers::new(BufferLimits {
            log_lines_per_process: 3,
            ..BufferLimits::default()
        });
        for i in 0..5 {
            buffers.ingest(log("api", format!("api-{i}")));
        }
        buffers.ingest(log("worker", "worker-0"));

        let api = buffers.logs("api").expect("api logs");
        assert_eq!(api.to_vec(), vec!["api-2", "api-3", "api-4"]);
        let worker = buffers.logs("worker").expect("worker logs");
        assert_eq!(worker.to_vec(), vec!["worker-0"]);
        assert_eq!(buffers.log_keys().collect::<Vec<_>>(), vec!["api", "worker"]);
    }

    #[test]
    fn alerts_are_newest_first_and_capped() {
        let mut buffers = ChannelBuffers::new(BufferLimits {
            alerts: 2,
            ..BufferLimits::default()
        });
        for id in ["a1", "a2", "a3"] {
            buffers.ingest(Frame::Alert(json!({ "id": id })));
        }
        assert_eq!(
            buffers.alerts().to_vec(),
            vec![json!({"id": "a3"}), json!({"id": "a2"})]
        );
        assert_eq!(buffers.alerts().newest(), Some(&json!({"id": "a3"})));
    }

    #[test]
    fn acknowledge_removes_matching_alerts_only() {
        let mut buffers = ChannelBuffers::default();
        buffers.ingest(Frame::Alert(json!({ "id": "cpu-high" })));
        buffers.ingest(Frame::Alert(json!({ "id": 7 })));
        buffers.ingest(Frame::Alert(json!({ "message": "no id" })));

        assert_eq!(buffers.acknowledge_alert("cpu-high"), 1);
        assert_eq!(buffers.acknowledge_alert("7"), 1);
        assert_eq!(buffers.acknowledge_alert("missing"), 0);
        assert_eq!(buffers.alerts().to_vec(), vec![json!({"message": "no id"})]);
    }

    #[test]
    fn snapshots_replace_in_place() {
        let mut buffers = ChannelBuffers::default();
        buffers.ingest(Frame::ProcessSnapshot(json!([{"id": "web"}])));
        buffers.ingest(Frame::ProcessSnapshot(json!([{"id": "api"}])));
        buffers.ingest(Frame::ClusterSnapshot(json!({"leader": "n1"})));
        buffers.ingest(Frame::DeploymentSnapshot(json!([])));

        assert_eq!(buffers.processes(), Some(&json!([{"id": "api"}])));
        assert_eq!(buffers.cluster(), Some(&json!({"leader": "n1"})));
        assert_eq!(buffers.deployments(), Some(&json!([])));
        assert_eq!(buffers.processes.len(), 1);
    }

    #[test]
    fn clear_empties_every_topic() {
        let mut buffers = ChannelBuffers::default();
        buffers.ingest(Frame::MetricsSample(json!({"cpu": 1})));
        buffers.ingest(Frame::Alert(json!({"id": "x"})));
        buffers.ingest(log("api", "boot"));
        buffers.ingest(Frame::ClusterSnapshot(json!({})));
        assert!(!buffers.is_empty());

        buffers.clear();
        assert!(buffers.is_empty());
        assert!(buffers.logs("api").is_none());
    }

    #[test]
    fn zero_capacity_window_retains_nothing() {
        let mut buffer = ChannelBuffer::sliding_window(0);
        assert_eq!(buffer.ingest(1), Some(1));
        assert!(buffer.is_empty());
    }
}
