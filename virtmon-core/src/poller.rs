//! Poll loop: one sweep over all domains per tick.
//!
//! ```text
//!          tick               sweep done (always)
//!   Idle ────────▶ Collecting ────────────────────▶ Idle
//!     │                │
//!     └── shutdown ────┴──▶ Stopped
//! ```
//!
//! Within a sweep, domains are processed by a bounded pool of workers. Each
//! worker samples its domain, normalizes the counters and reconciles remote
//! objects; its outcome is folded into the cycle report once it finishes.
//! The values of every finished domain are then sent in one batch.
//!
//! On shutdown no new domain is started but the ones in flight run to the
//! end. The cycle timeout aborts whatever is still running.

use crate::config::Config;
use crate::inspector::Inspector;
use crate::observability::metrics as agent_metrics;
use crate::sampling::{Item, MetricNormalizer, RateSampler};
use crate::threshold::ThresholdPolicy;
use crate::zabbix::{
    CycleScope, DeliveryReport, Metric, MonitoringApi, ObjectReconciler, SenderClient,
    TriggerState,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Collecting,
    Stopped,
}

/// Timing and concurrency knobs of the loop.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    /// Gap between the two reads of a domain
    pub sample_interval: Duration,
    pub max_workers: usize,
    /// A sweep still running after this long is abandoned.
    pub cycle_timeout: Duration,
    /// Send items that match no threshold rule.
    pub send_unmatched: bool,
}

impl PollSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.poll.interval(),
            sample_interval: config.poll.sample_interval(),
            max_workers: config.poll.max_workers.max(1),
            cycle_timeout: config.poll.cycle_timeout(),
            send_unmatched: config.agent.send_unmatched,
        }
    }
}

/// Summary of one sweep.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Domains listed by the inspector
    pub domains: usize,
    /// Domains fully processed
    pub completed: usize,
    /// Domains that could not be sampled
    pub failed_domains: usize,
    /// Items produced by the normalizer
    pub items: usize,
    /// Items handed to the sender
    pub sent: usize,
    /// Items matching no threshold rule, not sent
    pub skipped: usize,
    /// Items dropped because reconciliation failed
    pub reconcile_failures: usize,
    pub delivery: DeliveryReport,
    /// Shutdown arrived during the sweep; domains not yet started were skipped
    pub cancelled: bool,
    /// Sweep abandoned on the cycle timeout
    pub timed_out: bool,
    pub duration: Duration,
}

impl CycleReport {
    /// Count a finished domain; returns the values it wants sent.
    fn absorb(&mut self, outcome: DomainOutcome) -> Vec<Metric> {
        match outcome {
            DomainOutcome::Done { items, skipped, reconcile_failures, metrics } => {
                self.completed += 1;
                self.items += items;
                self.sent += metrics.len();
                self.skipped += skipped;
                self.reconcile_failures += reconcile_failures;
                metrics
            }
            DomainOutcome::Failed => {
                self.failed_domains += 1;
                Vec::new()
            }
            DomainOutcome::Skipped => Vec::new(),
        }
    }

    fn outcome(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.timed_out {
            "timed_out"
        } else if self.failed_domains > 0 || self.delivery.failed > 0 {
            "partial"
        } else {
            "ok"
        }
    }
}

enum DomainOutcome {
    Done {
        items: usize,
        skipped: usize,
        reconcile_failures: usize,
        metrics: Vec<Metric>,
    },
    Failed,
    /// Not started because of shutdown
    Skipped,
}

/// Everything a worker needs, shared across the pool.
struct Pipeline {
    inspector: Arc<dyn Inspector>,
    reconciler: ObjectReconciler,
    policy: ThresholdPolicy,
    sender: SenderClient,
    sampler: RateSampler,
    normalizer: MetricNormalizer,
    triggers: TriggerState,
    send_unmatched: bool,
}

impl Pipeline {
    #[instrument(skip(self, scope))]
    async fn process_domain(&self, scope: &CycleScope, domain: &str) -> DomainOutcome {
        let (first, second) =
            match self.sampler.sample(|| self.inspector.domain_stats(domain)).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(domain = %domain, error = %e, "Failed to sample domain");
                    return DomainOutcome::Failed;
                }
            };

        let items = self.normalizer.normalize(&first, Some(&second));
        agent_metrics::record_items_collected(items.len());

        let mut metrics = Vec::with_capacity(items.len());
        let mut skipped = 0;
        let mut reconcile_failures = 0;

        for item in &items {
            match self.prepare(scope, item).await {
                Ok(true) => metrics.push(self.to_metric(item)),
                Ok(false) => skipped += 1,
                Err(e) => {
                    warn!(
                        domain = %domain,
                        key = %item.key,
                        error = %e,
                        "Reconciliation failed, not sending item"
                    );
                    agent_metrics::record_reconcile_failure(e.kind());
                    reconcile_failures += 1;
                }
            }
        }

        debug!(domain = %domain, items = items.len(), to_send = metrics.len(), "Domain processed");
        DomainOutcome::Done { items: items.len(), skipped, reconcile_failures, metrics }
    }

    /// Reconcile remote objects for `item`; `Ok(false)` means it is not sent.
    async fn prepare(&self, scope: &CycleScope, item: &Item) -> crate::Result<bool> {
        match self.policy.classify(&item.key) {
            Some(rule) => {
                self.reconciler.ensure_item(scope, item).await?;
                if rule.is_breached(item.value) {
                    debug!(
                        key = %item.key,
                        value = item.value,
                        limit = rule.limit,
                        "Over threshold"
                    );
                    self.reconciler.ensure_trigger(scope, &self.triggers, item, rule).await?;
                }
                Ok(true)
            }
            None if self.send_unmatched => {
                self.reconciler.ensure_item(scope, item).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn to_metric(&self, item: &Item) -> Metric {
        let metric = Metric::new(self.reconciler.hostname(), &item.key, item.value);
        match item.clock {
            Some(clock) => metric.with_clock(clock),
            None => metric,
        }
    }
}

/// Drives sweeps on a fixed interval until shutdown.
pub struct PollLoop {
    pipeline: Arc<Pipeline>,
    settings: PollSettings,
    state: watch::Sender<PollState>,
}

impl PollLoop {
    pub fn new(
        inspector: Arc<dyn Inspector>,
        reconciler: ObjectReconciler,
        sender: SenderClient,
        policy: ThresholdPolicy,
        settings: PollSettings,
    ) -> Self {
        let pipeline = Pipeline {
            inspector,
            reconciler,
            policy,
            sender,
            sampler: RateSampler::new(settings.sample_interval),
            normalizer: MetricNormalizer::new(settings.sample_interval),
            triggers: TriggerState::new(),
            send_unmatched: settings.send_unmatched,
        };
        let (state, _) = watch::channel(PollState::Idle);

        Self { pipeline: Arc::new(pipeline), settings, state }
    }

    /// Wire a loop from configuration.
    pub fn from_config(
        config: &Config,
        inspector: Arc<dyn Inspector>,
        api: Arc<dyn MonitoringApi>,
        sender: SenderClient,
    ) -> Self {
        let reconciler =
            ObjectReconciler::new(api, config.agent.hostname.clone(), config.trigger.clone());
        let policy = ThresholdPolicy::from_config(&config.threshold);
        Self::new(inspector, reconciler, sender, policy, PollSettings::from_config(config))
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    /// Triggers known to exist, kept for the lifetime of the loop.
    pub fn trigger_state(&self) -> &TriggerState {
        &self.pipeline.triggers
    }

    /// Run sweeps until `shutdown` turns true or its sender is dropped.
    ///
    /// Ticks that fire while a sweep is running are skipped, not queued.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.settings.interval.as_secs(),
            workers = self.settings.max_workers,
            "Poll loop started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    let report = self.run_cycle(&shutdown).await;
                    if report.cancelled {
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.state.send_replace(PollState::Stopped);
        info!("Poll loop stopped");
    }

    /// One sweep over all domains.
    ///
    /// Never fails: errors are logged and counted in the report. Values of
    /// every domain that finished are sent, even when the sweep was cut short
    /// by shutdown or the timeout.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        self.state.send_replace(PollState::Collecting);
        let started = Instant::now();
        let mut report = CycleReport::default();

        match self.pipeline.inspector.list_domains().await {
            Ok(domains) => {
                report.domains = domains.len();
                agent_metrics::set_domain_count(domains.len());
                let batch = self.sweep(domains, shutdown, &mut report).await;
                if !batch.is_empty() {
                    report.delivery = self.pipeline.sender.send(&batch).await;
                }
            }
            Err(e) => {
                let inspector = self.pipeline.inspector.name();
                error!(inspector, error = %e, "Failed to list domains");
            }
        }

        report.duration = started.elapsed();
        agent_metrics::record_cycle(report.duration.as_secs_f64(), report.outcome());
        info!(
            domains = report.domains,
            completed = report.completed,
            failed = report.failed_domains,
            items = report.items,
            sent = report.sent,
            skipped = report.skipped,
            reconcile_failures = report.reconcile_failures,
            delivery = %report.delivery,
            duration_ms = report.duration.as_millis() as u64,
            outcome = report.outcome(),
            "Poll cycle finished"
        );

        self.state.send_replace(PollState::Idle);
        report
    }

    /// Process every domain, returning the values to send.
    async fn sweep(
        &self,
        domains: Vec<String>,
        shutdown: &watch::Receiver<bool>,
        report: &mut CycleReport,
    ) -> Vec<Metric> {
        let scope = Arc::new(CycleScope::new());
        let permits = Arc::new(Semaphore::new(self.settings.max_workers));
        let mut tasks = JoinSet::new();

        for domain in domains {
            let pipeline = self.pipeline.clone();
            let scope = scope.clone();
            let permits = permits.clone();
            let shutdown = shutdown.clone();

            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return DomainOutcome::Skipped;
                };
                if *shutdown.borrow() {
                    return DomainOutcome::Skipped;
                }
                pipeline.process_domain(&scope, &domain).await
            });
        }

        let deadline = tokio::time::sleep(self.settings.cycle_timeout);
        tokio::pin!(deadline);
        let mut shutdown = shutdown.clone();
        let mut batch = Vec::new();

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(outcome)) => batch.extend(report.absorb(outcome)),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => {
                        error!(error = %e, "Domain worker panicked");
                        report.failed_domains += 1;
                    }
                },
                _ = &mut deadline, if !report.timed_out => {
                    warn!(
                        timeout_secs = self.settings.cycle_timeout.as_secs(),
                        "Poll cycle timed out, abandoning remaining domains"
                    );
                    report.timed_out = true;
                    tasks.abort_all();
                }
                Ok(()) = shutdown.changed(), if !report.cancelled && !report.timed_out => {
                    // workers check the flag before starting, in-flight ones finish
                    if *shutdown.borrow() {
                        info!(
                            in_flight = tasks.len(),
                            "Shutdown requested, not starting new domains"
                        );
                        report.cancelled = true;
                    }
                }
            }
        }

        batch
    }
}
