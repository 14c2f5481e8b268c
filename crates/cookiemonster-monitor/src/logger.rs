// Measurement logging
//
// The same discharge shape as the document store's write buffer: records
// accumulate until a size or latency threshold and are then handed to the
// sink in one batch. Unlike document writes, measurement batches are lossy:
// a sink failure drops the batch with a warning.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::sink::MeasurementSink;

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    /// Name of the measured variable.
    pub measured: String,
    /// One or more named values describing it.
    pub values: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Measurement {
    pub fn named(measured: impl Into<String>, values: BTreeMap<String, Value>) -> Self {
        Self {
            measured: measured.into(),
            values,
            metadata: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// A single-valued measurement, stored under the "value" name.
    pub fn single(measured: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut values = BTreeMap::new();
        values.insert("value".to_string(), value.into());
        Self::named(measured, values)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub trait MeasurementLogger: Send + Sync {
    fn record(&self, measurement: Measurement);

    /// Force a discharge of anything buffered.
    fn flush(&self);

    fn record_value(&self, measured: &str, value: impl Into<Value>)
    where
        Self: Sized,
    {
        self.record(Measurement::single(measured, value));
    }
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub max_buffer_size: usize,
    pub buffer_latency: Duration,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: 100,
            buffer_latency: Duration::from_millis(500),
        }
    }
}

struct LoggerInner {
    sink: Arc<dyn MeasurementSink>,
    config: LoggerConfig,
    buffer: Mutex<BufferState>,
}

struct BufferState {
    records: Vec<Measurement>,
    last_append: Instant,
}

impl LoggerInner {
    fn discharge(&self) {
        let batch = {
            let mut buffer = self.buffer.lock();
            if buffer.records.is_empty() {
                return;
            }
            std::mem::take(&mut buffer.records)
        };
        if let Err(err) = self.sink.write(&batch) {
            warn!(%err, dropped = batch.len(), "measurement sink rejected batch");
        }
    }
}

/// Buffered measurement logger with a pluggable sink.
pub struct BufferedLogger {
    inner: Arc<LoggerInner>,
    watcher: JoinHandle<()>,
}

impl BufferedLogger {
    pub fn new(sink: Arc<dyn MeasurementSink>, config: LoggerConfig) -> Self {
        let inner = Arc::new(LoggerInner {
            sink,
            config: config.clone(),
            buffer: Mutex::new(BufferState {
                records: Vec::new(),
                last_append: Instant::now(),
            }),
        });

        let watcher = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let period =
                    (inner.config.buffer_latency / 2).max(Duration::from_millis(1));
                loop {
                    tokio::time::sleep(period).await;
                    let due = {
                        let buffer = inner.buffer.lock();
                        !buffer.records.is_empty()
                            && buffer.last_append.elapsed() >= inner.config.buffer_latency
                    };
                    if due {
                        inner.discharge();
                    }
                }
            })
        };

        Self { inner, watcher }
    }
}

impl MeasurementLogger for BufferedLogger {
    fn record(&self, measurement: Measurement) {
        let discharge_now = {
            let mut buffer = self.inner.buffer.lock();
            buffer.records.push(measurement);
            buffer.last_append = Instant::now();
            buffer.records.len() >= self.inner.config.max_buffer_size
        };
        if discharge_now {
            self.inner.discharge();
        }
    }

    fn flush(&self) {
        self.inner.discharge();
    }
}

impl Drop for BufferedLogger {
    fn drop(&mut self) {
        self.watcher.abort();
        self.inner.discharge();
    }
}
