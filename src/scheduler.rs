use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::time::Duration;

use chrono::Utc;

use crate::blocked::BlockedTracker;
use crate::cancel::CancellationToken;
use crate::dag::{Dag, analysis};
use crate::error::{Result, TychoError};
use crate::fabric::Fabric;
use crate::filter::{self, FilterChain};
use crate::model::{Discovery, MemoryEntry, MemoryKind, TaskSpec, TaskState};
use crate::poll::{Decision, Poller};
use crate::publisher::{Publisher, RustSymbolParser, SymbolParser};
use crate::pushback::{PushbackAction, PushbackHandler};
use crate::snapshot::Snapshot;
use crate::telemetry::{self, SharedSink, TelemetryEvent, TelemetryKind};

const DEFAULT_TICK: Duration = Duration::from_millis(100);
const DEFAULT_MAX_CYCLES: u32 = 5;
const DEFAULT_ALPHA: f64 = 0.6;

// ---------------------------------------------------------------------------
// Collaborator contracts
// ---------------------------------------------------------------------------

/// What a worker hands back when it finishes a cycle.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub output: String,
    pub modified_files: Vec<String>,
    pub workdir: PathBuf,
}

/// Executes one task cycle. Implementations run the actual coding agent;
/// the scheduler only sees the report.
pub trait WorkerDispatcher: Send + Sync {
    fn run(&self, task: &TaskSpec, input: &str, token: &CancellationToken) -> WorkerReport;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReviewVerdict {
    Approved,
    IssuesFound(String),
}

/// Invoked after the filter chain passes.
pub trait Reviewer: Send + Sync {
    fn review(&self, task_id: &str, report: &WorkerReport) -> ReviewVerdict;
}

/// Builds the pre-review gate for a completed cycle.
pub type ChainFactory = Box<dyn Fn(&str, &[String]) -> FilterChain + Send + Sync>;

/// Human-attention callback fired on escalation.
pub type HailCallback = Box<dyn Fn(&str, &Discovery) + Send + Sync>;

// ---------------------------------------------------------------------------
// Epoch results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    /// Every task reached done or failed.
    Completed,
    /// The cancellation token fired.
    Cancelled,
    /// No runnable work remains but non-terminal tasks are left (blocked
    /// forever or awaiting human decisions).
    Stalled,
}

#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch_id: String,
    pub outcome: EpochOutcome,
    pub done: Vec<String>,
    pub failed: Vec<String>,
    pub human_decision: Vec<String>,
    pub blocked: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleKind {
    Claim,
    Task,
}

/// One soft-timeout finding from `stale_check`. Reporting only; acting on
/// it is the caller's policy.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleItem {
    pub kind: StaleKind,
    pub id: String,
    pub age: chrono::Duration,
    pub details: String,
}

enum Event {
    Completed { task_id: String, report: WorkerReport },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct SchedulerBuilder {
    fabric: Arc<Fabric>,
    specs: Vec<TaskSpec>,
    poller: Option<Box<dyn Poller>>,
    dispatcher: Option<Arc<dyn WorkerDispatcher>>,
    reviewer: Option<Arc<dyn Reviewer>>,
    parser: Arc<dyn SymbolParser>,
    chain_factory: Option<ChainFactory>,
    on_hail: Option<HailCallback>,
    telemetry: SharedSink,
    max_retries: u32,
    max_cycles: u32,
    tick: Duration,
    alpha: f64,
}

impl SchedulerBuilder {
    pub fn poller(mut self, poller: impl Poller + 'static) -> Self {
        self.poller = Some(Box::new(poller));
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn WorkerDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn reviewer(mut self, reviewer: Arc<dyn Reviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn SymbolParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn chain_factory(mut self, factory: ChainFactory) -> Self {
        self.chain_factory = Some(factory);
        self
    }

    pub fn on_hail(mut self, callback: HailCallback) -> Self {
        self.on_hail = Some(callback);
        self
    }

    pub fn telemetry(mut self, sink: SharedSink) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_cycles(mut self, max_cycles: u32) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let mut dag = Dag::new();
        let mut specs = HashMap::new();
        for mut spec in self.specs {
            spec.normalize();
            dag.ensure_node(&spec.id, spec.priority);
            specs.insert(spec.id.clone(), spec);
        }
        // Dependency ids must exist; edges reject cycles and self-edges.
        for spec in specs.values() {
            for dep in &spec.depends_on {
                if !dag.contains(dep) {
                    return Err(TychoError::NodeNotFound(dep.clone()));
                }
                dag.add_edge(&spec.id, dep)?;
            }
        }

        let impact = analysis::impact_scores(&dag, self.alpha)?;
        let partitions = analysis::partitions(&dag);

        let fabric = self.fabric;
        let chain_factory = self.chain_factory.unwrap_or_else(|| {
            let fabric = Arc::clone(&fabric);
            Box::new(move |task_id: &str, modified: &[String]| {
                filter::default_chain(Some(Arc::clone(&fabric)), task_id, modified)
            })
        });

        Ok(Scheduler {
            fabric,
            dag,
            specs,
            poller: self
                .poller
                .ok_or_else(|| TychoError::Config("a poller is required".into()))?,
            tracker: BlockedTracker::new(),
            pushback: PushbackHandler::new(self.max_retries),
            dispatcher: self
                .dispatcher
                .ok_or_else(|| TychoError::Config("a worker dispatcher is required".into()))?,
            reviewer: self
                .reviewer
                .ok_or_else(|| TychoError::Config("a reviewer is required".into()))?,
            publisher_parser: self.parser,
            chain_factory,
            on_hail: self.on_hail,
            telemetry: self.telemetry,
            token: CancellationToken::new(),
            tick: self.tick,
            max_cycles: self.max_cycles,
            cycles: HashMap::new(),
            feedback: HashMap::new(),
            active: HashSet::new(),
            rescan: Vec::new(),
            impact,
            partitions,
            epoch_id: uuid::Uuid::new_v4().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Drives one epoch of the task lifecycle: eligibility from the DAG, the
/// scan gate, parallel worker dispatch, the pre-review filter chain,
/// publication, blocked-task re-evaluation, and stale detection. The
/// scheduler owns the DAG and is the sole writer of task state.
pub struct Scheduler {
    fabric: Arc<Fabric>,
    dag: Dag,
    specs: HashMap<String, TaskSpec>,
    poller: Box<dyn Poller>,
    tracker: BlockedTracker,
    pushback: PushbackHandler,
    dispatcher: Arc<dyn WorkerDispatcher>,
    reviewer: Arc<dyn Reviewer>,
    publisher_parser: Arc<dyn SymbolParser>,
    chain_factory: ChainFactory,
    on_hail: Option<HailCallback>,
    telemetry: SharedSink,
    token: CancellationToken,
    tick: Duration,
    max_cycles: u32,
    cycles: HashMap<String, u32>,
    feedback: HashMap<String, String>,
    active: HashSet<String>,
    rescan: Vec<String>,
    impact: BTreeMap<String, f64>,
    partitions: BTreeMap<String, usize>,
    epoch_id: String,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("epoch_id", &self.epoch_id)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn builder(fabric: Arc<Fabric>, specs: Vec<TaskSpec>) -> SchedulerBuilder {
        SchedulerBuilder {
            fabric,
            specs,
            poller: None,
            dispatcher: None,
            reviewer: None,
            parser: Arc::new(RustSymbolParser),
            chain_factory: None,
            on_hail: None,
            telemetry: None,
            max_retries: crate::pushback::DEFAULT_MAX_RETRIES,
            max_cycles: DEFAULT_MAX_CYCLES,
            tick: DEFAULT_TICK,
            alpha: DEFAULT_ALPHA,
        }
    }

    /// Token observed by the epoch loop, workers, and filter checks. Clone
    /// it before `run_epoch` to cancel from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Composite impact score computed at construction.
    pub fn impact_of(&self, task_id: &str) -> Option<f64> {
        self.impact.get(task_id).copied()
    }

    /// Independent-track partition id computed at construction.
    pub fn partition_of(&self, task_id: &str) -> Option<usize> {
        self.partitions.get(task_id).copied()
    }

    /// Hand a task back from `human_decision` to the queue. The next tick
    /// picks it up like any other eligible task. Returns whether the task
    /// actually moved.
    pub fn resume(fabric: &Fabric, task_id: &str) -> Result<bool> {
        if fabric.get_state(task_id)? == Some(TaskState::HumanDecision) {
            fabric.set_state(task_id, TaskState::Queued)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// External resolution of a discovery. A running epoch notices the
    /// unresolved set shrinking and re-evaluates its blocked tasks.
    pub fn resolve_discovery(fabric: &Fabric, telemetry: &SharedSink, id: i64) -> Result<()> {
        fabric.resolve_discovery(id)?;
        telemetry::emit(
            telemetry,
            TelemetryEvent::new(TelemetryKind::DiscoveryResolved).with_detail(id.to_string()),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Epoch loop
    // -----------------------------------------------------------------------

    /// Run the epoch until every task is terminal, the token fires, or no
    /// runnable work remains. At most one epoch runs against an on-disk
    /// fabric at a time.
    pub fn run_epoch(&mut self) -> Result<EpochReport> {
        let _epoch_lock = self.fabric.epoch_lock()?;
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::EpochStart).with_detail(self.epoch_id.clone()),
        );

        self.reset_interrupted_states()?;
        let (tx, rx) = channel();
        let mut last_unresolved = self.unresolved_ids()?;
        // Bound on fully-idle rounds: every idle reevaluate either unblocks
        // someone or advances a retry counter toward escalation.
        let max_idle_rounds = 2 * self.pushback.max_retries().max(self.max_cycles) + 4;
        let mut idle_rounds = 0;

        let outcome = loop {
            if self.token.is_cancelled() {
                break self.cancel_epoch();
            }

            // Externally resolved discoveries re-open blocked tasks.
            let unresolved = self.unresolved_ids()?;
            if unresolved.len() < last_unresolved.len() {
                self.reevaluate()?;
            }
            last_unresolved = unresolved;

            let dispatched = self.dispatch_pass(&tx)?;

            if self.token.is_cancelled() {
                break self.cancel_epoch();
            }

            let states = self.fabric.all_states()?;
            let tracked: Vec<&String> = states
                .iter()
                .filter(|(id, _)| self.specs.contains_key(*id))
                .map(|(id, _)| id)
                .collect();
            let all_terminal = tracked
                .iter()
                .all(|id| states[id.as_str()].is_terminal());
            if all_terminal && self.active.is_empty() {
                break EpochOutcome::Completed;
            }

            if dispatched == 0 && self.active.is_empty() && self.rescan.is_empty() {
                // Nothing running and nothing to start: give blocked tasks
                // a re-poll; if that cannot make progress either, stall out.
                self.reevaluate()?;
                idle_rounds += 1;
                if self.rescan.is_empty() && idle_rounds > max_idle_rounds {
                    break EpochOutcome::Stalled;
                }
                if !self.rescan.is_empty() {
                    idle_rounds = 0;
                }
                if self.tracker.is_empty() && self.rescan.is_empty() && self.active.is_empty() {
                    // Not even blocked tasks remain to retry.
                    break EpochOutcome::Stalled;
                }
                std::thread::sleep(self.tick);
                continue;
            }
            idle_rounds = 0;

            match rx.recv_timeout(self.tick) {
                Ok(Event::Completed { task_id, report }) => {
                    self.handle_completion(&task_id, report, &tx)?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {}
            }
        };

        // Late completions are ignored once the outcome is decided.
        drop(rx);

        let report = self.epoch_report(outcome)?;
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::EpochDone).with_detail(format!(
                "{}: {} done, {} failed, {} awaiting human decision",
                self.epoch_id,
                report.done.len(),
                report.failed.len(),
                report.human_decision.len(),
            )),
        );
        Ok(report)
    }

    /// Tasks left mid-flight by a previous run go back to the queue; the
    /// blocked tracker starts empty, so stale blocked states do too.
    fn reset_interrupted_states(&mut self) -> Result<()> {
        for spec in self.specs.values() {
            match self.fabric.get_state(&spec.id)? {
                None => self.fabric.set_state(&spec.id, TaskState::Queued)?,
                Some(TaskState::Scanning | TaskState::Running | TaskState::Blocked) => {
                    self.fabric.set_state(&spec.id, TaskState::Queued)?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn cancel_epoch(&mut self) -> EpochOutcome {
        // Drained without escalation: no hails, no discoveries.
        let drained = self.tracker.drain();
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::EpochDone).with_detail(format!(
                "{}: cancelled with {} blocked task(s) drained",
                self.epoch_id,
                drained.len(),
            )),
        );
        EpochOutcome::Cancelled
    }

    fn unresolved_ids(&self) -> Result<BTreeSet<i64>> {
        Ok(self
            .fabric
            .unresolved_discoveries()?
            .into_iter()
            .map(|d| d.id)
            .collect())
    }

    /// One eligibility pass: scan re-opened tasks first, then fresh
    /// eligibles in priority order. Returns how many tasks were scanned.
    fn dispatch_pass(&mut self, tx: &Sender<Event>) -> Result<usize> {
        let states = self.fabric.all_states()?;
        let done: BTreeSet<String> = states
            .iter()
            .filter(|(_, s)| **s == TaskState::Done)
            .map(|(id, _)| id.clone())
            .collect();

        let mut to_scan: Vec<String> = std::mem::take(&mut self.rescan);
        for id in self.dag.ready(&done) {
            if !self.specs.contains_key(&id) {
                continue;
            }
            let in_flight = states.get(&id).is_some_and(|s| s.in_flight());
            if !in_flight && !to_scan.contains(&id) {
                to_scan.push(id);
            }
        }

        let scanned = to_scan.len();
        for task_id in to_scan {
            if self.token.is_cancelled() {
                return Ok(scanned);
            }
            self.scan_one(&task_id, tx)?;
        }
        Ok(scanned)
    }

    /// The scan gate for one task: state to scanning, poll against a fresh
    /// snapshot, then dispatch, block, or escalate.
    fn scan_one(&mut self, task_id: &str, tx: &Sender<Event>) -> Result<()> {
        self.set_state(task_id, TaskState::Scanning)?;
        let snapshot = self.snapshot()?;
        let result = self.poller.poll(task_id, &snapshot);

        match result.decision {
            Decision::Proceed => {
                self.tracker.unblock(task_id);
                self.dispatch(task_id, &snapshot, tx)
            }
            Decision::NeedInfo | Decision::Conflict => {
                let record = self.tracker.block(task_id, result);
                let in_progress: Vec<String> = snapshot
                    .in_progress
                    .iter()
                    .filter(|id| id.as_str() != task_id)
                    .cloned()
                    .collect();
                match self.pushback.handle(&record, &snapshot, &in_progress) {
                    PushbackAction::Retry => self.set_state(task_id, TaskState::Blocked),
                    PushbackAction::Proceed => {
                        self.tracker.unblock(task_id);
                        self.dispatch(task_id, &snapshot, tx)
                    }
                    PushbackAction::Escalate => self.escalate(task_id, &record, &in_progress),
                }
            }
        }
    }

    fn escalate(
        &mut self,
        task_id: &str,
        record: &crate::blocked::BlockedRecord,
        in_progress: &[String],
    ) -> Result<()> {
        let cap = self.pushback.retry_cap(record, in_progress);
        let message = self.pushback.escalation_message(record, cap);
        let kind = self
            .pushback
            .discovery_kind_for(record.last_result.decision);

        self.set_state(task_id, TaskState::HumanDecision)?;
        self.tracker.unblock(task_id);

        let mut discovery = Discovery::new(task_id, kind, message);
        discovery.id = self.fabric.post_discovery(&discovery)?;
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::DiscoveryPosted)
                .with_task(task_id)
                .with_detail(kind.to_string()),
        );
        if let Some(on_hail) = &self.on_hail {
            on_hail(task_id, &discovery);
        }
        Ok(())
    }

    /// Hand the task to a worker thread. The worker input carries the task
    /// body, the rendered snapshot, and any feedback from the previous
    /// cycle.
    fn dispatch(&mut self, task_id: &str, snapshot: &Snapshot, tx: &Sender<Event>) -> Result<()> {
        if self.token.is_cancelled() {
            return Ok(());
        }
        let Some(spec) = self.specs.get(task_id) else {
            return Err(TychoError::NodeNotFound(task_id.to_string()));
        };

        self.set_state(task_id, TaskState::Running)?;

        let cycle = *self.cycles.entry(task_id.to_string()).or_insert(0);
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::CycleStart)
                .with_task(task_id)
                .with_detail(format!("cycle {}/{}", cycle + 1, self.max_cycles)),
        );
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::AgentStart).with_task(task_id),
        );

        let mut input = format!("{}\n\n{}", spec.body, snapshot.render());
        if let Some(feedback) = self.feedback.remove(task_id) {
            input.push_str("\n\nPrevious cycle feedback:\n");
            input.push_str(&feedback);
        }

        let spec = spec.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let child = self.token.child();
        let tx = tx.clone();
        let id = task_id.to_string();
        self.active.insert(id.clone());
        std::thread::spawn(move || {
            let report = dispatcher.run(&spec, &input, &child);
            let _ = tx.send(Event::Completed {
                task_id: id,
                report,
            });
        });
        Ok(())
    }

    /// A worker finished a cycle: gate through the filter chain, then the
    /// reviewer, then publish.
    fn handle_completion(
        &mut self,
        task_id: &str,
        report: WorkerReport,
        tx: &Sender<Event>,
    ) -> Result<()> {
        self.active.remove(task_id);
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::AgentDone).with_task(task_id),
        );
        if self.token.is_cancelled() {
            return Ok(());
        }

        let chain = (self.chain_factory)(task_id, &report.modified_files);
        let chain_report = match chain.run(&self.token.child(), &report.workdir) {
            Ok(chain_report) => chain_report,
            Err(TychoError::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        };
        for check in &chain_report.checks {
            telemetry::emit(
                &self.telemetry,
                TelemetryEvent::new(TelemetryKind::FilterResult)
                    .with_task(task_id)
                    .with_detail(format!(
                        "{}: {}",
                        check.name,
                        if check.passed { "pass" } else { "fail" }
                    )),
            );
        }

        if let Some(failure) = chain_report.first_failure() {
            // The failing check's output goes back to the coder, never to
            // the reviewer.
            let feedback = format!("[{}] {}", failure.name, failure.output);
            self.fabric.add_memory(&MemoryEntry::new(
                task_id,
                MemoryKind::Failure,
                feedback.clone(),
            ))?;
            return self.bounce(task_id, feedback, tx);
        }

        match self.reviewer.review(task_id, &report) {
            ReviewVerdict::Approved => self.complete(task_id, &report),
            ReviewVerdict::IssuesFound(issues) => {
                self.fabric.add_memory(&MemoryEntry::new(
                    task_id,
                    MemoryKind::ReviewerFeedback,
                    issues.clone(),
                ))?;
                self.bounce(task_id, issues, tx)
            }
        }
    }

    /// Send a task around for another cycle, or fail it when the cycle
    /// budget is spent.
    fn bounce(&mut self, task_id: &str, feedback: String, tx: &Sender<Event>) -> Result<()> {
        let cycle = self.cycles.entry(task_id.to_string()).or_insert(0);
        *cycle += 1;
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::CycleDone)
                .with_task(task_id)
                .with_detail(format!("cycle {}/{}", cycle, self.max_cycles)),
        );

        if *cycle >= self.max_cycles {
            self.fail_task(task_id)?;
            return Ok(());
        }

        self.feedback.insert(task_id.to_string(), feedback);
        let snapshot = self.snapshot()?;
        self.dispatch(task_id, &snapshot, tx)
    }

    fn fail_task(&mut self, task_id: &str) -> Result<()> {
        self.release_claims(task_id)?;
        self.set_state(task_id, TaskState::Failed)
    }

    /// Reviewer-approved completion: publish artifacts, release claims,
    /// mark done, and re-evaluate the blocked set.
    fn complete(&mut self, task_id: &str, report: &WorkerReport) -> Result<()> {
        let publisher = Publisher::new(
            Arc::clone(&self.fabric),
            Arc::clone(&self.publisher_parser),
            self.telemetry.clone(),
        );
        if let Err(first) =
            publisher.publish(task_id, &report.modified_files, &report.workdir)
        {
            match first {
                // A foreign claim over one of the task's files is a
                // conflict, not a failure: the task re-enters the blocked
                // set and retries once the counterparty releases.
                TychoError::AlreadyClaimed { path, owner } => {
                    let result = crate::poll::PollResult::conflict(
                        format!("file {path} is claimed by {owner}"),
                        owner,
                    );
                    let record = self.tracker.block(task_id, result);
                    let snapshot = self.snapshot()?;
                    let in_progress: Vec<String> = snapshot
                        .in_progress
                        .iter()
                        .filter(|id| id.as_str() != task_id)
                        .cloned()
                        .collect();
                    return match self.pushback.handle(&record, &snapshot, &in_progress) {
                        PushbackAction::Escalate => self.escalate(task_id, &record, &in_progress),
                        _ => self.set_state(task_id, TaskState::Blocked),
                    };
                }
                // One retry per tick for storage trouble; a second failure
                // fails the task.
                TychoError::Db(_) => {
                    if publisher
                        .publish(task_id, &report.modified_files, &report.workdir)
                        .is_err()
                    {
                        self.fabric.add_memory(&MemoryEntry::new(
                            task_id,
                            MemoryKind::Failure,
                            format!("publish failed: {first}"),
                        ))?;
                        return self.fail_task(task_id);
                    }
                }
                other => {
                    self.fabric.add_memory(&MemoryEntry::new(
                        task_id,
                        MemoryKind::Failure,
                        format!("publish failed: {other}"),
                    ))?;
                    return self.fail_task(task_id);
                }
            }
        }

        self.release_claims(task_id)?;
        self.set_state(task_id, TaskState::Done)?;
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::CycleDone)
                .with_task(task_id)
                .with_detail("approved".to_string()),
        );
        self.reevaluate()
    }

    fn release_claims(&self, task_id: &str) -> Result<()> {
        let held = self.fabric.claims_for(task_id)?;
        self.fabric.release_all(task_id)?;
        for path in held {
            telemetry::emit(
                &self.telemetry,
                TelemetryEvent::new(TelemetryKind::ClaimReleased)
                    .with_task(task_id)
                    .with_detail(path),
            );
        }
        Ok(())
    }

    /// Re-poll every blocked task against a fresh snapshot. PROCEED moves a
    /// task back to scanning; the next tick dispatches it. Still-blocked
    /// tasks accrue a retry and may escalate.
    fn reevaluate(&mut self) -> Result<()> {
        let snapshot = self.snapshot()?;
        for record in self.tracker.all() {
            let task_id = record.task_id.clone();
            let result = self.poller.poll(&task_id, &snapshot);
            match result.decision {
                Decision::Proceed => {
                    self.tracker.unblock(&task_id);
                    self.set_state(&task_id, TaskState::Scanning)?;
                    self.rescan.push(task_id);
                }
                Decision::NeedInfo | Decision::Conflict => {
                    let record = self.tracker.block(&task_id, result);
                    let in_progress: Vec<String> = snapshot
                        .in_progress
                        .iter()
                        .filter(|id| id.as_str() != task_id)
                        .cloned()
                        .collect();
                    match self.pushback.handle(&record, &snapshot, &in_progress) {
                        PushbackAction::Retry => {}
                        PushbackAction::Proceed => {
                            self.tracker.unblock(&task_id);
                            self.set_state(&task_id, TaskState::Scanning)?;
                            self.rescan.push(task_id);
                        }
                        PushbackAction::Escalate => {
                            self.escalate(&task_id, &record, &in_progress)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stale detection
    // -----------------------------------------------------------------------

    /// Soft timeouts: claims older than `stale_claim_age` whose owner is
    /// not running, and tasks that have not transitioned within
    /// `stale_task_age`.
    pub fn stale_check(
        &self,
        stale_claim_age: chrono::Duration,
        stale_task_age: chrono::Duration,
    ) -> Result<Vec<StaleItem>> {
        let now = Utc::now();
        let states = self.fabric.all_states()?;
        let mut out = Vec::new();

        for claim in self.fabric.claim_info()? {
            let age = now.signed_duration_since(claim.claimed_at);
            if age <= stale_claim_age {
                continue;
            }
            let owner_state = states.get(&claim.owner_task_id).copied();
            if owner_state != Some(TaskState::Running) {
                let described = owner_state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                out.push(StaleItem {
                    kind: StaleKind::Claim,
                    id: claim.filepath.clone(),
                    age,
                    details: format!("owner {} is {}", claim.owner_task_id, described),
                });
            }
        }

        for info in self.fabric.state_info()? {
            if info.state.is_terminal() {
                continue;
            }
            let age = now.signed_duration_since(info.updated_at);
            if age > stale_task_age {
                out.push(StaleItem {
                    kind: StaleKind::Task,
                    id: info.task_id.clone(),
                    age,
                    details: format!("stuck in {} since last transition", info.state),
                });
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn snapshot(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::from_fabric(&self.fabric, Utc::now())?;
        let cycles: BTreeMap<String, (u32, u32)> = self
            .cycles
            .iter()
            .map(|(id, current)| (id.clone(), (*current, self.max_cycles)))
            .collect();
        snapshot.set_cycles(cycles);
        Ok(snapshot)
    }

    /// State write with one retry per tick; a second storage failure marks
    /// the task failed before surfacing the error.
    fn set_state(&self, task_id: &str, state: TaskState) -> Result<()> {
        let result = match self.fabric.set_state(task_id, state) {
            Err(TychoError::Db(_)) => self.fabric.set_state(task_id, state),
            other => other,
        };
        if result.is_err() {
            let _ = self.fabric.set_state(task_id, TaskState::Failed);
        } else {
            telemetry::emit(
                &self.telemetry,
                TelemetryEvent::new(TelemetryKind::TaskState)
                    .with_task(task_id)
                    .with_detail(state.to_string()),
            );
        }
        result
    }

    fn epoch_report(&self, outcome: EpochOutcome) -> Result<EpochReport> {
        let states = self.fabric.all_states()?;
        let bucket = |wanted: TaskState| -> Vec<String> {
            states
                .iter()
                .filter(|(id, s)| **s == wanted && self.specs.contains_key(*id))
                .map(|(id, _)| id.clone())
                .collect()
        };
        Ok(EpochReport {
            epoch_id: self.epoch_id.clone(),
            outcome,
            done: bucket(TaskState::Done),
            failed: bucket(TaskState::Failed),
            human_decision: bucket(TaskState::HumanDecision),
            blocked: bucket(TaskState::Blocked),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
