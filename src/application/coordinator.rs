use super::aggregator::OutcomeAggregator;
use super::dispatcher::{CallPolicy, EntryDispatcher, RoutingTable};
use super::resolution_table::{Resolution, ResolutionTable};
use super::resolver::{DependencyGraph, ReferenceResolver};
use super::validator::EnvelopeValidator;
use crate::config::ProcessorConfig;
use crate::domain::bundle::{Bundle, Entry};
use crate::domain::outcome::{EntryError, EntryOutcome, Issue, ResponseBundle, Severity};
use crate::domain::ports::Identity;
use crate::error::{BundleError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{Instrument, Span, debug, debug_span, error, info, info_span, warn};

/// Lifecycle of one `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Validating,
    Resolving,
    Dispatching,
    Aggregating,
    Done,
    /// Rejected before any backend write.
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Resolving => "resolving",
            Self::Dispatching => "dispatching",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        use TransactionState::*;
        matches!(
            (self, next),
            (Validating, Resolving)
                | (Resolving, Dispatching)
                | (Dispatching, Aggregating)
                | (Aggregating, Done)
                | (Validating, Failed)
                | (Resolving, Failed)
        )
    }

    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(BundleError::IllegalTransition {
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Lifecycle {
    state: TransactionState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: TransactionState::Validating,
        }
    }

    fn advance(&mut self, next: TransactionState) -> Result<()> {
        self.state = self.state.transition(next)?;
        debug!(state = %self.state, "Transaction state changed");
        Ok(())
    }

    /// Moves to `Failed` when `result` is a Bundle-level error.
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.advance(TransactionState::Failed)?;
            warn!(error = %err, "Bundle rejected");
        }
        result
    }
}

/// Cooperative cancellation signal shared between a caller and a running
/// `process_with_cancel` call.
///
/// Cancelling stops new dispatches; adapter calls already in flight finish.
#[derive(Debug, Clone)]
pub struct Cancellation {
    flag: Arc<watch::Sender<bool>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(watch::Sender::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.flag.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut receiver = self.flag.subscribe();
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy { failing: Vec<String> },
}

/// Why dispatch stopped before every entry ran.
#[derive(Debug, Clone, Copy)]
enum Interruption {
    Timeout,
    Cancelled,
}

/// Entry point: validates, orders, dispatches and aggregates one Bundle.
#[derive(Debug, Clone)]
pub struct BundleProcessor {
    config: ProcessorConfig,
    validator: EnvelopeValidator,
    resolver: ReferenceResolver,
    dispatcher: Arc<EntryDispatcher>,
}

impl BundleProcessor {
    pub fn new(config: ProcessorConfig, routes: RoutingTable) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            validator: EnvelopeValidator::from_config(&config),
            resolver: ReferenceResolver,
            dispatcher: Arc::new(EntryDispatcher::new(
                routes,
                CallPolicy::from_config(&config),
            )),
            config,
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Processes a raw transaction Bundle.
    ///
    /// Returns `Err` only for Bundle-level failures, which happen before any
    /// backend write. Once dispatch starts the call returns `Ok` and every
    /// entry failure is reported inside the response.
    pub async fn process(&self, raw: &Value, identity: Option<Identity>) -> Result<ResponseBundle> {
        self.process_with_cancel(raw, identity, &Cancellation::new())
            .await
    }

    pub async fn process_with_cancel(
        &self,
        raw: &Value,
        identity: Option<Identity>,
        cancel: &Cancellation,
    ) -> Result<ResponseBundle> {
        self.run(raw, identity, cancel)
            .instrument(info_span!("bundle", entries = tracing::field::Empty))
            .await
    }

    /// Healthy when every routed adapter reports healthy.
    pub async fn health(&self) -> Health {
        let mut failing = Vec::new();
        for adapter in self.dispatcher.routes().adapters() {
            if !adapter.is_healthy().await {
                failing.push(adapter.name().to_string());
            }
        }
        if failing.is_empty() {
            Health::Healthy
        } else {
            warn!(?failing, "Unhealthy backends");
            Health::Unhealthy { failing }
        }
    }

    async fn run(
        &self,
        raw: &Value,
        identity: Option<Identity>,
        cancel: &Cancellation,
    ) -> Result<ResponseBundle> {
        let mut lifecycle = Lifecycle::new();

        let bundle = lifecycle.guard(self.validator.validate(raw))?;
        Span::current().record("entries", bundle.entries.len());
        lifecycle.advance(TransactionState::Resolving)?;

        let graph = lifecycle.guard(self.resolver.resolve(&bundle.entries))?;
        lifecycle.advance(TransactionState::Dispatching)?;

        let (outcomes, interruption) = self.dispatch_all(&bundle, &graph, identity, cancel).await;
        lifecycle.advance(TransactionState::Aggregating)?;

        let issues = vec![summary_issue(&outcomes, interruption, &self.config)];
        let response = OutcomeAggregator.assemble(bundle.identifier, &bundle.entries, outcomes, issues);
        lifecycle.advance(TransactionState::Done)?;

        info!(id = %response.id, status = response.status().code(), "Bundle processed");
        Ok(response)
    }

    /// Spawns one task per entry in processing order and collects their
    /// outcomes by entry index.
    async fn dispatch_all(
        &self,
        bundle: &Bundle,
        graph: &DependencyGraph,
        identity: Option<Identity>,
        cancel: &Cancellation,
    ) -> (Vec<Option<EntryOutcome>>, Option<Interruption>) {
        let entries: Arc<[Entry]> = bundle.entries.clone().into();
        let table = Arc::new(ResolutionTable::new(&entries));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrency));
        let stop = Cancellation::new();
        let mut interruption = None;
        if cancel.is_cancelled() {
            warn!("Bundle cancelled before dispatch, no entry will be attempted");
            interruption = Some(Interruption::Cancelled);
            stop.cancel();
        }

        let mut tasks = JoinSet::new();
        let mut task_entries = HashMap::new();
        for &index in graph.order() {
            let dependencies = graph.dependencies_of(index).to_vec();
            let references: Vec<String> = dependencies
                .iter()
                .filter_map(|dependency| entries[*dependency].full_url.clone())
                .collect();
            let task = EntryTask {
                index,
                entries: entries.clone(),
                dependencies,
                references,
                table: table.clone(),
                permits: permits.clone(),
                dispatcher: self.dispatcher.clone(),
                identity: identity.clone(),
                stop: stop.clone(),
                cancel: cancel.clone(),
            };
            let handle = tasks.spawn(task.run().instrument(debug_span!("entry", index)));
            task_entries.insert(handle.id(), index);
        }

        let deadline = self.config.bundle_timeout().map(|timeout| Instant::now() + timeout);
        let mut outcomes: Vec<Option<EntryOutcome>> = vec![None; entries.len()];
        loop {
            let joined = tokio::select! {
                joined = tasks.join_next_with_id() => joined,
                _ = until(deadline), if interruption.is_none() => {
                    warn!("Bundle timeout elapsed, stopping new dispatches");
                    interruption = Some(Interruption::Timeout);
                    stop.cancel();
                    continue;
                }
                _ = cancel.cancelled(), if interruption.is_none() => {
                    warn!("Bundle cancelled, stopping new dispatches");
                    interruption = Some(Interruption::Cancelled);
                    stop.cancel();
                    continue;
                }
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok((_, (index, outcome))) => outcomes[index] = Some(outcome),
                Err(err) => {
                    let Some(&index) = task_entries.get(&err.id()) else {
                        error!(error = %err, "Unknown entry task failed");
                        continue;
                    };
                    error!(index, error = %err, "Entry task failed");
                    table.settle(index, Resolution::Failed);
                    outcomes[index] = Some(Err(EntryError::Internal(format!(
                        "entry task failed: {}",
                        err
                    ))));
                }
            }
        }

        (outcomes, interruption)
    }
}

/// Everything one spawned entry task owns.
struct EntryTask {
    index: usize,
    entries: Arc<[Entry]>,
    dependencies: Vec<usize>,
    references: Vec<String>,
    table: Arc<ResolutionTable>,
    permits: Arc<Semaphore>,
    dispatcher: Arc<EntryDispatcher>,
    identity: Option<Identity>,
    stop: Cancellation,
    cancel: Cancellation,
}

impl EntryTask {
    async fn run(self) -> (usize, EntryOutcome) {
        let outcome = self.execute().await;
        match &outcome {
            Ok(applied) => info!(status = applied.status(), "Entry applied"),
            Err(err) => info!(status = err.status(), error = %err, "Entry failed"),
        }
        (self.index, outcome)
    }

    async fn execute(&self) -> EntryOutcome {
        let entry = &self.entries[self.index];

        // Dependencies are awaited without holding a worker permit.
        for &dependency in &self.dependencies {
            tokio::select! {
                biased;
                _ = self.halted() => return self.not_attempted(),
                _ = self.table.wait(dependency) => {}
            }
        }

        let blocked = self
            .dependencies
            .iter()
            .any(|dependency| !matches!(self.table.get(*dependency), Resolution::Resolved(_)));
        if blocked {
            if self.is_halted() {
                return self.not_attempted();
            }
            return self
                .dispatcher
                .dispatch(entry, &self.references, &self.table, self.identity.as_ref())
                .await;
        }

        let _permit = tokio::select! {
            biased;
            _ = self.halted() => return self.not_attempted(),
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    self.table.settle(self.index, Resolution::Failed);
                    return Err(EntryError::Internal("worker pool closed".to_string()));
                }
            },
        };
        if self.is_halted() {
            return self.not_attempted();
        }

        self.dispatcher
            .dispatch(entry, &self.references, &self.table, self.identity.as_ref())
            .await
    }

    /// Either the caller cancelled or the join loop stopped dispatching.
    fn is_halted(&self) -> bool {
        self.stop.is_cancelled() || self.cancel.is_cancelled()
    }

    async fn halted(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn not_attempted(&self) -> EntryOutcome {
        self.table.settle(self.index, Resolution::Failed);
        Err(EntryError::NotAttempted(
            "processing stopped before this entry was dispatched".to_string(),
        ))
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn summary_issue(
    outcomes: &[Option<EntryOutcome>],
    interruption: Option<Interruption>,
    config: &ProcessorConfig,
) -> Issue {
    let applied = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Some(Ok(_))))
        .count();
    let failed = outcomes.len() - applied;
    let skipped = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Some(Err(EntryError::NotAttempted(_)))))
        .count();

    match interruption {
        Some(Interruption::Timeout) => Issue::new(
            Severity::Error,
            "timeout",
            format!(
                "Bundle timeout of {} ms elapsed: {} entries applied, {} not attempted",
                config.bundle_timeout_ms.unwrap_or_default(),
                applied,
                skipped
            ),
        ),
        Some(Interruption::Cancelled) => Issue::new(
            Severity::Error,
            "timeout",
            format!(
                "Bundle processing cancelled: {} entries applied, {} not attempted",
                applied, skipped
            ),
        ),
        None if failed == 0 => Issue::new(
            Severity::Information,
            "informational",
            format!("Applied {} entries", applied),
        ),
        None => Issue::new(
            Severity::Warning,
            "processing",
            format!("Applied {} of {} entries", applied, outcomes.len()),
        ),
    }
}
