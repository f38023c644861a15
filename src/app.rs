//! Pipeline assembly: wires storage, broker, stages, sinks and dispatch
//! into one running relay with its HTTP surface.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::broker::{Broker, LogStore, MemoryLog, spawn_retention_task};
use crate::classifier::{Classifier, default_rules, load_rules};
use crate::config::PipelineConfig;
use crate::dispatch::{Dispatcher, Endpoint, RouteTable, WorkerPool, endpoint_routes};
use crate::error::Error;
use crate::ingress::ingress_routes;
use crate::lookup::{CustomerLookup, LibSqlLookup, MemoryLookup};
use crate::sinks::monitor::MONITOR_NAME;
use crate::sinks::{CategorySink, MonitorSink, Sink, SinkEndpoint, category_routes, monitor_routes};
use crate::stages::{
    ContentValidator, DataExtractor, DatabaseEnricher, MessageRouter, Stage, StageEndpoint,
    register_stage_triggers,
};
use crate::store::{LibSqlLog, SqlDatabase};
use crate::triggers::{Destination, TriggerRegistry};

/// A running relay.
pub struct Pipeline {
    pub broker: Arc<Broker>,
    pub pool: Arc<WorkerPool>,
    pub monitor: Arc<MonitorSink>,
    /// Category name → sink.
    pub categories: BTreeMap<String, Arc<CategorySink>>,
    router: Router,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Open storage per `config.db_path` and assemble.
    pub async fn open(config: &PipelineConfig) -> Result<Self, Error> {
        let (log, lookup): (Arc<dyn LogStore>, Arc<dyn CustomerLookup>) = match &config.db_path {
            Some(path) => {
                let db = SqlDatabase::open_local(path).await?;
                (
                    Arc::new(LibSqlLog::new(Arc::clone(&db))),
                    Arc::new(LibSqlLookup::new(db)),
                )
            }
            None => {
                info!("Using in-memory log");
                (Arc::new(MemoryLog::new()), Arc::new(MemoryLookup::new()))
            }
        };
        Self::assemble(config, log, lookup).await
    }

    /// Build the pipeline over the given log and lookup and start its workers.
    pub async fn assemble(
        config: &PipelineConfig,
        log: Arc<dyn LogStore>,
        lookup: Arc<dyn CustomerLookup>,
    ) -> Result<Self, Error> {
        let base = config.message_type()?;
        let broker = Broker::open(log, config.broker.clone()).await?;

        let rules = match &config.rules_path {
            Some(path) => load_rules(path)?,
            None => default_rules(),
        };
        let classifier = Arc::new(Classifier::new(rules, config.fallback_category.clone()));

        // ── Triggers and endpoints ──────────────────────────────────
        let mut registry = TriggerRegistry::new();
        let mut endpoints: Vec<(Destination, Arc<dyn Endpoint>)> = Vec::new();

        register_stage_triggers(&mut registry, &base)?;
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(DataExtractor::new()),
            Arc::new(ContentValidator::new()),
            Arc::new(DatabaseEnricher::new(lookup)),
            Arc::new(MessageRouter::new(Arc::clone(&classifier))),
        ];
        for stage in stages {
            let name = Destination::new(stage.kind().name());
            endpoints.push((name, Arc::new(StageEndpoint::new(stage, base.clone()))));
        }

        let monitor = MonitorSink::new();
        registry.register("*", MONITOR_NAME)?;
        endpoints.push((
            Destination::new(MONITOR_NAME),
            Arc::new(SinkEndpoint::new(Arc::clone(&monitor) as Arc<dyn Sink>)),
        ));

        let mut categories = BTreeMap::new();
        for category in classifier.categories() {
            let sink = CategorySink::new(category.clone());
            registry.register(&format!("{base}.routed.{category}"), sink.name())?;
            endpoints.push((
                Destination::new(sink.name()),
                Arc::new(SinkEndpoint::new(Arc::clone(&sink) as Arc<dyn Sink>)),
            ));
            categories.insert(category, sink);
        }

        let mut routes = RouteTable::new();
        for (destination, endpoint) in &endpoints {
            let remote = config
                .remote_endpoints
                .iter()
                .find(|(name, _)| name == destination.as_str());
            match remote {
                Some((_, url)) => {
                    info!(%destination, url = %url, "Delivering over HTTP");
                    routes.register_remote(destination.clone(), url.clone());
                }
                None => routes.register_local(destination.clone(), Arc::clone(endpoint)),
            }
        }
        for (name, _) in &config.remote_endpoints {
            if !routes.contains(&Destination::new(name.as_str())) {
                warn!(destination = %name, "Remote endpoint has no trigger, ignoring");
            }
        }

        let local_endpoints = routes.local_endpoints();

        // ── Dispatch ────────────────────────────────────────────────
        let registry = Arc::new(registry);
        info!(triggers = registry.len(), "Trigger registry built");
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&broker),
            Arc::new(routes),
            config.retry,
            config.delivery_timeout,
        ));

        // The message topic exists up front so its workers start before the first publish.
        let message_topic = broker.topic_for(&base.child("received")?);
        broker.create_topic(&message_topic, config.broker.partitions).await?;

        let pool = WorkerPool::new(registry, dispatcher);
        let watcher = pool.start().await;
        let retention = spawn_retention_task(Arc::clone(&broker), config.retention, config.retention_interval);

        // ── HTTP ────────────────────────────────────────────────────
        let mut router = ingress_routes(Arc::clone(&broker), &base)?
            .nest("/monitor", monitor_routes(Arc::clone(&monitor)));
        for (category, sink) in &categories {
            router = router.nest(&format!("/sinks/{category}"), category_routes(Arc::clone(sink)));
        }
        for (destination, endpoint) in local_endpoints {
            router = router.nest(&format!("/endpoints/{destination}"), endpoint_routes(endpoint));
        }
        // Dashboards read the feeds from other origins.
        let router = router.layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

        info!(
            domain = %config.domain,
            categories = ?categories.keys().collect::<Vec<_>>(),
            workers = pool.len().await,
            "Pipeline ready"
        );

        Ok(Self {
            broker,
            pool,
            monitor,
            categories,
            router,
            tasks: vec![watcher, retention],
        })
    }

    /// The HTTP surface: `/`, `/healthz`, `/monitor/*`, `/sinks/<category>/*`,
    /// `/endpoints/<destination>`.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn category(&self, name: &str) -> Option<&Arc<CategorySink>> {
        self.categories.get(name)
    }

    /// Stop background tasks and wait for workers to finish.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
        info!("Pipeline stopped");
    }
}
