// Service wiring
//
// One builder assembles the full pipeline from configuration. Hosts embed
// the service by supplying their own update source and plug-in loaders; the
// packaged binary falls back to the filesystem source and ships with only
// the built-in tracing notification receiver.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use axum::Router;
use tracing::{info, warn};

use cookiemonster_config::{LogSink, RuntimeConfig};
use cookiemonster_core::{
    Context, CookieJar, Enrichment, EnrichmentLoader, NotificationReceiver, Rule, Update,
};
use cookiemonster_jar::{RateLimitedCookieJar, StoreCookieJar};
use cookiemonster_monitor::{
    cookie_jar_monitor, worker_count_monitor, BufferedLogger, LoggerConfig, MeasurementLogger,
    MemorySink, Monitor, TimedCookieJar, TracingSink,
};
use cookiemonster_processor::{ProcessorPool, ProcessorPoolConfig};
use cookiemonster_registry::{DirectoryRegistry, PluginLoader, Registry};
use cookiemonster_retriever::{
    DocumentRetrievalLog, FsUpdateSource, PeriodicRetrievalManager, UpdateSource,
};
use cookiemonster_store::{BufferConfig, BufferedStore};

use crate::handlers::{router, AppState};
use crate::init::init_store;

const MONITOR_PERIOD: Duration = Duration::from_secs(30);

pub struct ServiceBuilder {
    config: RuntimeConfig,
    update_source: Option<Arc<dyn UpdateSource>>,
    rule_plugins: Option<(String, Arc<dyn PluginLoader<Rule>>)>,
    enrichment_plugins: Option<(String, Arc<dyn PluginLoader<EnrichmentLoader>>)>,
    receiver_plugins: Option<(String, Arc<dyn PluginLoader<NotificationReceiver>>)>,
}

impl ServiceBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            update_source: None,
            rule_plugins: None,
            enrichment_plugins: None,
            receiver_plugins: None,
        }
    }

    /// Use a custom update source instead of the filesystem scanner.
    pub fn with_update_source(mut self, source: Arc<dyn UpdateSource>) -> Self {
        self.update_source = Some(source);
        self
    }

    /// Load rules from the configured rules directory with this loader;
    /// files are matched by `pattern`.
    pub fn with_rule_plugins(
        mut self,
        pattern: impl Into<String>,
        loader: Arc<dyn PluginLoader<Rule>>,
    ) -> Self {
        self.rule_plugins = Some((pattern.into(), loader));
        self
    }

    pub fn with_enrichment_plugins(
        mut self,
        pattern: impl Into<String>,
        loader: Arc<dyn PluginLoader<EnrichmentLoader>>,
    ) -> Self {
        self.enrichment_plugins = Some((pattern.into(), loader));
        self
    }

    pub fn with_receiver_plugins(
        mut self,
        pattern: impl Into<String>,
        loader: Arc<dyn PluginLoader<NotificationReceiver>>,
    ) -> Self {
        self.receiver_plugins = Some((pattern.into(), loader));
        self
    }

    pub async fn build(self) -> Result<Service> {
        let config = self.config;

        // Storage: one document store shared by the jar and retrieval log.
        let store = init_store(&config)?;
        let buffered = Arc::new(BufferedStore::new(
            Arc::clone(&store),
            BufferConfig {
                max_size: config.cookiejar.buffer.max_size,
                latency: config.cookiejar.buffer.latency(),
                ..BufferConfig::default()
            },
        ));

        let mut jar: Arc<dyn CookieJar> = StoreCookieJar::open(Arc::clone(&buffered))
            .await
            .map_err(|err| anyhow::anyhow!("failed to open cookie jar: {err}"))?;
        if let Some(rate) = config.cookiejar.max_requests_per_second {
            jar = Arc::new(RateLimitedCookieJar::new(jar, rate));
        }

        let sink: Arc<dyn cookiemonster_monitor::MeasurementSink> = match config.logging.sink {
            LogSink::Tracing => Arc::new(TracingSink),
            LogSink::Memory => Arc::new(MemorySink::new()),
        };
        let logger: Arc<dyn MeasurementLogger> =
            Arc::new(BufferedLogger::new(sink, LoggerConfig::default()));
        let jar: Arc<dyn CookieJar> =
            Arc::new(TimedCookieJar::new(jar, Arc::clone(&logger)));

        let ctx = Arc::new(Context::new(Arc::clone(&jar)));

        // Registries. The tracing receiver is always installed so
        // notifications are visible out of the box.
        let rules: Arc<Registry<Rule>> = Arc::new(Registry::new());
        let loaders: Arc<Registry<EnrichmentLoader>> = Arc::new(Registry::new());
        let receivers: Arc<Registry<NotificationReceiver>> = Arc::new(Registry::new());
        receivers.register_static(NotificationReceiver::tracing_receiver());

        let rule_watch = match (&config.rules, self.rule_plugins) {
            (Some(dir), Some((pattern, loader))) => Some(
                DirectoryRegistry::start(
                    Arc::clone(&rules),
                    &dir.dir,
                    &pattern,
                    loader,
                    Arc::clone(&ctx),
                )
                .context("failed to watch rules directory")?,
            ),
            _ => None,
        };
        let enrichment_watch = match (&config.enrichments, self.enrichment_plugins) {
            (Some(dir), Some((pattern, loader))) => Some(
                DirectoryRegistry::start(
                    Arc::clone(&loaders),
                    &dir.dir,
                    &pattern,
                    loader,
                    Arc::clone(&ctx),
                )
                .context("failed to watch enrichments directory")?,
            ),
            _ => None,
        };
        let receiver_watch = match (&config.receivers, self.receiver_plugins) {
            (Some(dir), Some((pattern, loader))) => Some(
                DirectoryRegistry::start(
                    Arc::clone(&receivers),
                    &dir.dir,
                    &pattern,
                    loader,
                    Arc::clone(&ctx),
                )
                .context("failed to watch receivers directory")?,
            ),
            _ => None,
        };

        // Retrieval: explicit source, else the filesystem scanner, else off.
        let source = match self.update_source {
            Some(source) => Some(source),
            None => match &config.retrieval.source_dir {
                Some(dir) => {
                    let fs: Arc<dyn UpdateSource> = Arc::new(
                        FsUpdateSource::new(dir).context("failed to open retrieval source dir")?,
                    );
                    Some(fs)
                }
                None => {
                    info!("no update source configured, retrieval disabled");
                    None
                }
            },
        };
        let retrieval = match source {
            Some(source) => {
                let log = DocumentRetrievalLog::open(Arc::clone(&store))
                    .await
                    .map_err(|err| anyhow::anyhow!("failed to open retrieval log: {err}"))?;
                let manager = Arc::new(PeriodicRetrievalManager::new(
                    config.retrieval.period(),
                    source,
                    Arc::new(log),
                    config.retrieval.start_from(),
                ));

                // Every retrieved update becomes an enrichment.
                let enriching_jar = Arc::clone(&jar);
                manager.add_listener(Arc::new(move |updates: &Vec<Update>| {
                    let jar = Arc::clone(&enriching_jar);
                    let updates = updates.clone();
                    tokio::spawn(async move {
                        for update in updates {
                            let enrichment = Enrichment::new(
                                "retrieval",
                                update.timestamp,
                                update.metadata,
                            );
                            if let Err(err) = jar.enrich_cookie(&update.target, enrichment).await
                            {
                                warn!(update = %update.target, %err, "failed to enrich from update");
                            }
                        }
                    });
                }));
                Some(manager)
            }
            None => None,
        };

        let pool = Arc::new(ProcessorPool::new(
            ProcessorPoolConfig {
                workers: config.processor.workers,
                retry_delay: config.processor.retry_delay(),
            },
            Arc::clone(&jar),
            Arc::clone(&rules),
            Arc::clone(&loaders),
            Arc::clone(&receivers),
            Arc::clone(&ctx),
        ));

        let monitors = vec![
            cookie_jar_monitor(Arc::clone(&logger), MONITOR_PERIOD, Arc::clone(&jar)),
            worker_count_monitor(Arc::clone(&logger), MONITOR_PERIOD, {
                let pool = Arc::clone(&pool);
                Arc::new(move || pool.busy_workers())
            }),
        ];

        Ok(Service {
            jar,
            buffered,
            logger,
            rules,
            loaders,
            receivers,
            retrieval,
            pool,
            monitors,
            api_port: config.api.port,
            _rule_watch: rule_watch,
            _enrichment_watch: enrichment_watch,
            _receiver_watch: receiver_watch,
        })
    }
}

pub struct Service {
    jar: Arc<dyn CookieJar>,
    buffered: Arc<BufferedStore>,
    logger: Arc<dyn MeasurementLogger>,
    rules: Arc<Registry<Rule>>,
    loaders: Arc<Registry<EnrichmentLoader>>,
    receivers: Arc<Registry<NotificationReceiver>>,
    retrieval: Option<Arc<PeriodicRetrievalManager>>,
    pool: Arc<ProcessorPool>,
    monitors: Vec<Monitor>,
    api_port: u16,
    _rule_watch: Option<DirectoryRegistry<Rule>>,
    _enrichment_watch: Option<DirectoryRegistry<EnrichmentLoader>>,
    _receiver_watch: Option<DirectoryRegistry<NotificationReceiver>>,
}

impl Service {
    pub fn builder(config: RuntimeConfig) -> ServiceBuilder {
        ServiceBuilder::new(config)
    }

    pub fn jar(&self) -> &Arc<dyn CookieJar> {
        &self.jar
    }

    pub fn rules(&self) -> &Arc<Registry<Rule>> {
        &self.rules
    }

    pub fn enrichment_loaders(&self) -> &Arc<Registry<EnrichmentLoader>> {
        &self.loaders
    }

    pub fn receivers(&self) -> &Arc<Registry<NotificationReceiver>> {
        &self.receivers
    }

    pub fn retrieval(&self) -> Option<&Arc<PeriodicRetrievalManager>> {
        self.retrieval.as_ref()
    }

    pub fn processor_pool(&self) -> &Arc<ProcessorPool> {
        &self.pool
    }

    /// The admin API router, for embedding or tests.
    pub fn router(&self) -> Router {
        router(AppState {
            jar: Arc::clone(&self.jar),
        })
    }

    /// Start the background components (pool, monitors, retrieval).
    pub fn start(&self) {
        self.pool.start();
        for monitor in &self.monitors {
            monitor.start();
        }
        if let Some(retrieval) = &self.retrieval {
            retrieval.start();
        }
    }

    /// Stop background components, drain in-flight work and flush buffers.
    pub async fn stop(&self) {
        if let Some(retrieval) = &self.retrieval {
            retrieval.stop().await;
        }
        self.pool.stop().await;
        for monitor in &self.monitors {
            monitor.stop();
        }
        self.logger.flush();
        self.buffered.flush().await;
    }

    /// Start everything, serve the admin API until `shutdown` resolves,
    /// then stop cleanly.
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        self.start();

        let addr = format!("0.0.0.0:{}", self.api_port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind to {addr}"))?;

        info!("Admin API listening on http://{addr}");
        info!("  GET    /queue                    - queue length");
        info!("  POST   /queue/reprocess          - requeue a cookie");
        info!("  GET    /cookiejar/<identifier>   - fetch a cookie");
        info!("  DELETE /cookiejar/<identifier>   - delete a cookie");
        info!("  GET    /health                   - health check");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("admin API server error")?;

        self.stop().await;
        info!("Service shutdown complete");
        Ok(())
    }
}
