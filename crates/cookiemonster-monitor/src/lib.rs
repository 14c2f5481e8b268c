// cookiemonster-monitor - Measurements, sinks and periodic samplers
//
// Measurements are non-critical: they are buffered, flushed in batches and
// dropped (with a warning) if the sink rejects them. Monitors sample system
// state on a period; the timed jar wrapper measures every jar call.

mod logger;
mod monitor;
mod sink;
mod timed_jar;

pub use logger::{BufferedLogger, LoggerConfig, Measurement, MeasurementLogger};
pub use monitor::{
    cookie_jar_monitor, worker_count_monitor, Monitor, Sampler, MEASURED_COOKIE_JAR_STATUS,
    MEASURED_NUMBER_OF_THREADS, MEASURED_TO_PROCESS,
};
pub use sink::{MeasurementSink, MemorySink, TracingSink};
pub use timed_jar::TimedCookieJar;
