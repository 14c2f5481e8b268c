// Measurement sinks

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::info;

use crate::logger::Measurement;

pub trait MeasurementSink: Send + Sync {
    fn write(&self, batch: &[Measurement]) -> anyhow::Result<()>;
}

/// Emits every measurement as a structured tracing record. The default sink.
pub struct TracingSink;

impl MeasurementSink for TracingSink {
    fn write(&self, batch: &[Measurement]) -> anyhow::Result<()> {
        for measurement in batch {
            info!(
                measured = %measurement.measured,
                values = %serde_json::to_string(&measurement.values).unwrap_or_default(),
                timestamp = %measurement.timestamp,
                "measurement"
            );
        }
        Ok(())
    }
}

/// Collects measurements in memory; can be told to reject writes.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<Measurement>>,
    rejecting: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting() -> Self {
        let sink = Self::default();
        sink.rejecting.store(true, Ordering::SeqCst);
        sink
    }

    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn recorded(&self) -> Vec<Measurement> {
        self.records.lock().clone()
    }
}

impl MeasurementSink for MemorySink {
    fn write(&self, batch: &[Measurement]) -> anyhow::Result<()> {
        if self.rejecting.load(Ordering::SeqCst) {
            anyhow::bail!("sink rejecting writes");
        }
        self.records.lock().extend_from_slice(batch);
        Ok(())
    }
}
