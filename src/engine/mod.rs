//! Production engine: owns the live graph of hosts.
//!
//! # Hot reload
//!
//! ```text
//! diff old/new items ──► start added + changed hosts (old graph keeps serving)
//!                         │ all Running?
//!                         ├─ no  → stop the new hosts, keep the old graph, Err
//!                         └─ yes → install new registry (kept hosts carried over)
//!                                  drain + stop removed/changed old hosts
//! ```
//!
//! Unchanged items keep their host, queue and workers across a reload.

pub mod registry;
pub mod source;

pub use registry::HostRegistry;
pub use source::{ConfigSource, JsonFileSource, StaticSource};

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::audit::{AuditSink, TracingAuditSink};
use crate::envelope::{Envelope, ParserRegistry};
use crate::events::{EngineEvent, EventBus, EventBusStats, FailureReceiver};
use crate::host::{Host, HostCatalog, HostState, HostStats};
use crate::resilience::{BreakerStats, CircuitBreakerRegistry};
use crate::router::Router;
use crate::supervisor::{ExecutionSupervisor, StopReport, SupervisorHandle};
use crate::types::{
    Config, EngineDefaults, Error, IsolationConfig, ItemConfig, MessagingPattern,
    ProductionConfig, Result,
};

// =============================================================================
// Reports
// =============================================================================

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub replaced: Vec<String>,
    pub removed: Vec<String>,
    pub kept: Vec<String>,
}

/// Engine statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub hosts: Vec<HostStats>,
    pub breakers: Vec<BreakerStats>,
    pub events: EventBusStats,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`ProductionEngine`].
#[derive(Debug, Default)]
pub struct ProductionEngineBuilder {
    parsers: Option<Arc<ParserRegistry>>,
    catalog: Option<HostCatalog>,
    audit: Option<Arc<dyn AuditSink>>,
    events: Option<Arc<EventBus>>,
    defaults: EngineDefaults,
    isolation: IsolationConfig,
}

impl ProductionEngineBuilder {
    pub fn parsers(mut self, parsers: Arc<ParserRegistry>) -> Self {
        self.parsers = Some(parsers);
        self
    }

    pub fn catalog(mut self, catalog: HostCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn defaults(mut self, defaults: EngineDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = isolation;
        self
    }

    /// Engine and isolation settings from a loaded [`Config`].
    pub fn config(self, config: &Config) -> Self {
        self.defaults(config.engine.clone())
            .isolation(config.isolation.clone())
    }

    pub fn build(self) -> ProductionEngine {
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let breakers = Arc::new(CircuitBreakerRegistry::new(self.defaults.breaker));
        let router = Router::new(breakers, audit.clone());
        ProductionEngine {
            supervisor: ExecutionSupervisor::new(router.clone(), self.isolation),
            router,
            parsers: self
                .parsers
                .unwrap_or_else(|| Arc::new(ParserRegistry::with_builtins())),
            catalog: self.catalog.unwrap_or_else(HostCatalog::with_builtins),
            audit,
            events: self.events.unwrap_or_default(),
            defaults: self.defaults,
            graph: Mutex::new(LiveGraph::default()),
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug)]
struct RunningHost {
    config: ItemConfig,
    handle: SupervisorHandle,
}

#[derive(Debug, Default)]
struct LiveGraph {
    production: ProductionConfig,
    running: HashMap<String, RunningHost>,
    /// Hosts retired by reloads, still draining.
    retiring: Vec<JoinHandle<Result<StopReport>>>,
    started: bool,
}

/// Owns every host, the router and the supervisors.
#[derive(Debug)]
pub struct ProductionEngine {
    router: Router,
    supervisor: ExecutionSupervisor,
    parsers: Arc<ParserRegistry>,
    catalog: HostCatalog,
    audit: Arc<dyn AuditSink>,
    events: Arc<EventBus>,
    defaults: EngineDefaults,
    graph: Mutex<LiveGraph>,
}

impl ProductionEngine {
    pub fn builder() -> ProductionEngineBuilder {
        ProductionEngineBuilder::default()
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn parsers(&self) -> &Arc<ParserRegistry> {
        &self.parsers
    }

    /// Live host by name.
    pub fn host(&self, name: &str) -> Option<Arc<Host>> {
        self.router.resolve(name).ok()
    }

    /// Deliver an externally produced envelope to its destination.
    pub async fn send(
        &self,
        envelope: Envelope,
        pattern: MessagingPattern,
        timeout: Duration,
    ) -> Result<()> {
        self.router.send(envelope, pattern, timeout).await
    }

    /// Operator error channel: restart exhaustion and abandoned messages as
    /// [`Error`] values. Host failures stay on [`EventBus::subscribe`].
    pub fn subscribe_failures(&self) -> FailureReceiver {
        self.events.subscribe_failures()
    }

    // =========================================================================
    // Start / reload / shutdown
    // =========================================================================

    /// Build and start every enabled item.
    pub async fn start(&self, production: ProductionConfig) -> Result<()> {
        production.validate()?;
        let mut graph = self.graph.lock().await;
        if graph.started {
            return Err(Error::state_transition(format!(
                "production '{}' already started; use reload",
                graph.production.name
            )));
        }

        let items: Vec<ItemConfig> = production.enabled_items().cloned().collect();
        let launched = self.launch(&items).await?;
        let hosts: Vec<Arc<Host>> = launched.iter().map(|r| r.handle.host().clone()).collect();
        self.router.install(Arc::new(HostRegistry::from_hosts(hosts)));

        tracing::info!(
            production = %production.name,
            hosts = launched.len(),
            "production started"
        );
        graph.running = launched
            .into_iter()
            .map(|r| (r.config.name.clone(), r))
            .collect();
        graph.production = production;
        graph.started = true;
        Ok(())
    }

    /// Load from `source` and start.
    pub async fn start_from(&self, source: &dyn ConfigSource) -> Result<()> {
        let production = source.load().await?;
        self.start(production).await
    }

    /// Swap to `production` without dropping messages.
    pub async fn reload(&self, production: ProductionConfig) -> Result<ReloadReport> {
        production.validate()?;
        let mut graph = self.graph.lock().await;
        if !graph.started {
            return Err(Error::state_transition("reload before start"));
        }

        let desired: BTreeMap<&str, &ItemConfig> = production
            .enabled_items()
            .map(|item| (item.name.as_str(), item))
            .collect();
        let mut report = ReloadReport::default();
        let mut fresh = Vec::new();
        for (name, item) in &desired {
            match graph.running.get(*name) {
                None => {
                    report.added.push(name.to_string());
                    fresh.push((*item).clone());
                }
                Some(running) if running.config != **item => {
                    report.replaced.push(name.to_string());
                    fresh.push((*item).clone());
                }
                Some(_) => report.kept.push(name.to_string()),
            }
        }
        let mut removed: Vec<String> = graph
            .running
            .keys()
            .filter(|name| !desired.contains_key(name.as_str()))
            .cloned()
            .collect();
        removed.sort_unstable();
        report.removed = removed;

        // Old graph keeps serving while the new hosts initialise.
        let launched = self.launch(&fresh).await?;

        let mut hosts: Vec<Arc<Host>> = report
            .kept
            .iter()
            .filter_map(|name| graph.running.get(name))
            .map(|r| r.handle.host().clone())
            .collect();
        hosts.extend(launched.iter().map(|r| r.handle.host().clone()));
        self.router.install(Arc::new(HostRegistry::from_hosts(hosts)));

        let drain_deadline = self.defaults.drain_deadline;
        for name in report.replaced.iter().chain(report.removed.iter()) {
            if let Some(old) = graph.running.remove(name) {
                tracing::info!(item = %name, "retiring host");
                graph
                    .retiring
                    .push(tokio::spawn(old.handle.stop(drain_deadline)));
            }
        }
        for running in launched {
            graph.running.insert(running.config.name.clone(), running);
        }
        graph.production = production;

        tracing::info!(
            production = %graph.production.name,
            added = ?report.added,
            replaced = ?report.replaced,
            removed = ?report.removed,
            kept = report.kept.len(),
            "reload completed"
        );
        self.events.publish(EngineEvent::ReloadCompleted {
            production: graph.production.name.clone(),
            added: report.added.clone(),
            replaced: report.replaced.clone(),
            removed: report.removed.clone(),
            kept: report.kept.clone(),
        });
        Ok(report)
    }

    /// Load from `source` and reload.
    pub async fn reload_from(&self, source: &dyn ConfigSource) -> Result<ReloadReport> {
        let production = source.load().await?;
        self.reload(production).await
    }

    /// Drain and stop every host. The engine can be started again afterwards.
    pub async fn shutdown(&self) -> Vec<StopReport> {
        let mut graph = self.graph.lock().await;
        let deadline = self.defaults.drain_deadline;
        tracing::info!(
            production = %graph.production.name,
            hosts = graph.running.len(),
            "shutting down"
        );

        let running: Vec<RunningHost> = graph.running.drain().map(|(_, r)| r).collect();
        let retiring = std::mem::take(&mut graph.retiring);
        let stops = join_all(running.into_iter().map(|r| r.handle.stop(deadline))).await;

        let mut reports = Vec::new();
        for result in stops {
            match result {
                Ok(report) => reports.push(report),
                Err(err) => tracing::warn!(error = %err, "host stop failed"),
            }
        }
        for handle in retiring {
            match handle.await {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) => tracing::warn!(error = %err, "retired host stop failed"),
                Err(err) => tracing::warn!(error = %err, "retired host stop task failed"),
            }
        }

        self.router.install(Arc::new(HostRegistry::default()));
        graph.started = false;
        reports.sort_by(|a, b| a.item.cmp(&b.item));
        reports
    }

    pub fn stats(&self) -> EngineStats {
        let registry = self.router.registry();
        let mut hosts: Vec<HostStats> = registry.hosts().map(|h| h.stats()).collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        EngineStats {
            hosts,
            breakers: self.router.breakers().stats(),
            events: self.events.stats(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Start hosts for `items` and wait until all are `Running`. On any
    /// failure, every host started here is stopped again.
    async fn launch(&self, items: &[ItemConfig]) -> Result<Vec<RunningHost>> {
        let mut hooks = Vec::with_capacity(items.len());
        for item in items {
            hooks.push(self.catalog.build(item)?);
        }

        let launched: Vec<RunningHost> = items
            .iter()
            .zip(hooks)
            .map(|(item, hooks)| {
                let host = Host::new(
                    item.clone(),
                    hooks,
                    self.parsers.clone(),
                    self.events.clone(),
                    self.audit.clone(),
                );
                RunningHost {
                    config: item.clone(),
                    handle: self.supervisor.start(host),
                }
            })
            .collect();

        let timeout = self.defaults.startup_timeout;
        let outcomes = join_all(
            launched
                .iter()
                .map(|r| r.handle.host().wait_started(timeout)),
        )
        .await;

        let mut failure = None;
        for (running, outcome) in launched.iter().zip(outcomes) {
            let problem = match outcome {
                Ok(HostState::Running) => continue,
                Ok(state) => Error::state_transition(format!(
                    "{} did not start (state {})",
                    running.config.name, state
                )),
                Err(err) => err,
            };
            tracing::error!(item = %running.config.name, error = %problem, "host failed to start");
            failure.get_or_insert(problem);
        }

        match failure {
            None => Ok(launched),
            Some(err) => {
                join_all(launched.into_iter().map(|r| r.handle.stop(Duration::ZERO))).await;
                Err(err)
            }
        }
    }
}
