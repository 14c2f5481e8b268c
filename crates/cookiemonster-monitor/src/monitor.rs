// Periodic monitors
//
// A monitor samples some part of the system on a fixed period and records
// one measurement per tick, starting immediately. Start and stop are both
// idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use cookiemonster_core::CookieJar;

use crate::logger::{Measurement, MeasurementLogger};

pub const MEASURED_COOKIE_JAR_STATUS: &str = "cookie_jar_status";
pub const MEASURED_TO_PROCESS: &str = "to_process";
pub const MEASURED_NUMBER_OF_THREADS: &str = "number_of_threads";

#[async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(&self, logger: &dyn MeasurementLogger);
}

pub struct Monitor {
    logger: Arc<dyn MeasurementLogger>,
    sampler: Arc<dyn Sampler>,
    period: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Monitor {
    pub fn new(
        logger: Arc<dyn MeasurementLogger>,
        period: Duration,
        sampler: Arc<dyn Sampler>,
    ) -> Self {
        Self {
            logger,
            sampler,
            period,
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Start sampling. Has no effect if already started.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let logger = Arc::clone(&self.logger);
        let sampler = Arc::clone(&self.sampler);
        let period = self.period;
        *handle = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                sampler.sample(logger.as_ref()).await;
            }
        }));
    }

    /// Stop sampling. Has no effect if not started.
    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CookieJarSampler {
    jar: Arc<dyn CookieJar>,
}

#[async_trait]
impl Sampler for CookieJarSampler {
    async fn sample(&self, logger: &dyn MeasurementLogger) {
        if let Ok(depth) = self.jar.queue_length().await {
            let mut values = BTreeMap::new();
            values.insert(MEASURED_TO_PROCESS.to_string(), json!(depth));
            logger.record(Measurement::named(MEASURED_COOKIE_JAR_STATUS, values));
        }
    }
}

/// Samples the jar's queue depth.
pub fn cookie_jar_monitor(
    logger: Arc<dyn MeasurementLogger>,
    period: Duration,
    jar: Arc<dyn CookieJar>,
) -> Monitor {
    Monitor::new(logger, period, Arc::new(CookieJarSampler { jar }))
}

struct WorkerCountSampler {
    count: Arc<dyn Fn() -> usize + Send + Sync>,
}

#[async_trait]
impl Sampler for WorkerCountSampler {
    async fn sample(&self, logger: &dyn MeasurementLogger) {
        logger.record(Measurement::single(
            MEASURED_NUMBER_OF_THREADS,
            (self.count)(),
        ));
    }
}

/// Samples the number of busy processing workers.
pub fn worker_count_monitor(
    logger: Arc<dyn MeasurementLogger>,
    period: Duration,
    count: Arc<dyn Fn() -> usize + Send + Sync>,
) -> Monitor {
    Monitor::new(logger, period, Arc::new(WorkerCountSampler { count }))
}
