//! Parallel worker coordinator.
//!
//! Jobs are partitioned into batches with pairwise-disjoint ownership sets
//! before anything starts; overlapping jobs are serialized into later batches.
//! Each batch runs one thread per job and the coordinator waits at a barrier
//! until every job has reported or passed its own deadline. A timed-out job is
//! not interrupted, its thread is abandoned and its late result dropped. Its
//! ownership set stays claimed until the thread exits, so a later job that
//! would write the same paths fails instead of racing it.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::findings::dedup_by_location;
use crate::core::ownership::{BatchPlan, OwnershipConflict, first_overlap, partition_batches};
use crate::core::types::Finding;
use crate::error::EngineError;
use crate::io::config::{EngineConfig, TimeoutConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobRole {
    Analysis,
    Validation,
    Implementation,
    Fix,
    GoalCoverage,
    Compliance,
}

impl JobRole {
    /// Critical roles halt their batch on the first failure or timeout.
    pub fn is_critical(self) -> bool {
        matches!(self, JobRole::GoalCoverage | JobRole::Compliance)
    }

    pub fn default_timeout(self, timeouts: &TimeoutConfig) -> Duration {
        let secs = match self {
            JobRole::Analysis => timeouts.analysis_secs,
            JobRole::Validation | JobRole::GoalCoverage | JobRole::Compliance => {
                timeouts.validation_secs
            }
            JobRole::Implementation => timeouts.implementation_secs,
            JobRole::Fix => timeouts.fix_secs,
        };
        Duration::from_secs(secs)
    }
}

/// A unit of parallel work with an explicit write-ownership set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub id: String,
    pub role: JobRole,
    /// Paths the job reads.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Paths the job may write.
    pub ownership: BTreeSet<String>,
    /// Overrides the role's default timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkerJob {
    pub fn new(id: impl Into<String>, role: JobRole) -> Self {
        Self {
            id: id.into(),
            role,
            scope: Vec::new(),
            ownership: BTreeSet::new(),
            timeout_ms: None,
        }
    }

    pub fn owning<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ownership.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout(&self, timeouts: &TimeoutConfig) -> Duration {
        self.timeout_ms
            .map_or_else(|| self.role.default_timeout(timeouts), Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// Executes one job. Implementations must only write inside `job.ownership`.
pub trait Worker: Send + Sync {
    fn run(&self, job: &WorkerJob) -> Result<JobOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Success,
    Failure,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job: String,
    pub role: JobRole,
    pub batch: usize,
    pub result: JobResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchStatus {
    Completed,
    Aborted,
}

/// Aggregated outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub status: DispatchStatus,
    /// Job ids per planned batch.
    pub batches: Vec<Vec<String>>,
    #[serde(default)]
    pub conflicts: Vec<OwnershipConflict>,
    pub jobs: Vec<JobReport>,
    /// Merged findings of successful jobs; empty when aborted.
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

impl DispatchReport {
    pub fn is_aborted(&self) -> bool {
        self.status == DispatchStatus::Aborted
    }

    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs.iter().filter(|j| j.result != JobResult::Success)
    }
}

/// Plan returned by [`Coordinator::preview`], keyed by job id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchPlan {
    pub batches: Vec<Vec<String>>,
    pub conflicts: Vec<OwnershipConflict>,
}

/// Ownership sets of job threads that have not exited yet, by spawn ticket.
#[derive(Debug, Default)]
struct InFlight {
    next_ticket: u64,
    jobs: BTreeMap<u64, (String, BTreeSet<String>)>,
}

impl InFlight {
    fn claim(&mut self, job: &WorkerJob) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.jobs
            .insert(ticket, (job.id.clone(), job.ownership.clone()));
        ticket
    }

    /// The first running job whose ownership overlaps `ownership`, and the path.
    fn holder(&self, ownership: &BTreeSet<String>) -> Option<(String, String)> {
        self.jobs.values().find_map(|(id, held)| {
            first_overlap(ownership, held).map(|path| (id.clone(), path))
        })
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    timeouts: TimeoutConfig,
    failure_threshold: f64,
    in_flight: Arc<Mutex<InFlight>>,
}

impl Coordinator {
    pub fn new(timeouts: TimeoutConfig, failure_threshold: f64) -> Self {
        Self {
            timeouts,
            failure_threshold,
            in_flight: Arc::default(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.timeouts, config.failure_threshold)
    }

    fn plan(&self, jobs: &[WorkerJob]) -> BatchPlan {
        let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let sets: Vec<BTreeSet<String>> = jobs.iter().map(|j| j.ownership.clone()).collect();
        partition_batches(&ids, &sets)
    }

    /// Show how `jobs` would be partitioned without running anything.
    pub fn preview(&self, jobs: &[WorkerJob]) -> DispatchPlan {
        let plan = self.plan(jobs);
        DispatchPlan {
            batches: batch_ids(&plan, jobs),
            conflicts: plan.conflicts,
        }
    }

    /// Run `jobs` batch by batch on `worker`.
    ///
    /// A batch is aborted when a critical-role job fails or when its failure
    /// ratio (failures and timeouts over batch size) exceeds the threshold. An
    /// aborted dispatch merges nothing and runs no later batches.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub fn dispatch(&self, jobs: Vec<WorkerJob>, worker: Arc<dyn Worker>) -> DispatchReport {
        let plan = self.plan(&jobs);
        for conflict in &plan.conflicts {
            let err = EngineError::ConflictDetected {
                first: conflict.holder.clone(),
                second: conflict.deferred.clone(),
                path: conflict.path.clone(),
            };
            warn!(%err, "serializing conflicting jobs");
        }

        let mut report = DispatchReport {
            status: DispatchStatus::Completed,
            batches: batch_ids(&plan, &jobs),
            conflicts: plan.conflicts.clone(),
            jobs: Vec::new(),
            findings: Vec::new(),
            notes: Vec::new(),
            abort_reason: None,
        };
        let mut collected = Vec::new();

        for (index, batch) in plan.batches.iter().enumerate() {
            let batch_jobs: Vec<&WorkerJob> = batch.iter().map(|&i| &jobs[i]).collect();
            let results = self.run_batch(index, &batch_jobs, &worker);
            let failures = results
                .iter()
                .filter(|(r, _)| r.result != JobResult::Success)
                .count();
            let critical = results.iter().find(|(r, _)| {
                r.result != JobResult::Success && r.role.is_critical()
            });

            let abort_reason = match critical {
                Some((job, _)) => Some(format!(
                    "critical {} job '{}' did not succeed",
                    role_name(job.role),
                    job.job
                )),
                None if failures as f64 / batch_jobs.len() as f64 > self.failure_threshold => {
                    Some(format!(
                        "{failures} of {} jobs in batch {index} failed (threshold {:.0}%)",
                        batch_jobs.len(),
                        self.failure_threshold * 100.0
                    ))
                }
                None => None,
            };

            let mut outputs = Vec::new();
            for (job_report, output) in results {
                report.jobs.push(job_report);
                outputs.extend(output);
            }

            if let Some(reason) = abort_reason {
                warn!(batch = index, %reason, "batch aborted");
                report.status = DispatchStatus::Aborted;
                report.abort_reason = Some(reason);
                return report;
            }
            collected.extend(outputs);
        }

        let mut findings = Vec::new();
        for output in collected {
            findings.extend(output.findings);
            report.notes.extend(output.notes);
        }
        report.findings = dedup_by_location(findings);
        info!(
            batches = report.batches.len(),
            failed = report.failed_jobs().count(),
            findings = report.findings.len(),
            "dispatch complete"
        );
        report
    }

    /// Start every job of one batch and wait at the barrier.
    fn run_batch(
        &self,
        index: usize,
        jobs: &[&WorkerJob],
        worker: &Arc<dyn Worker>,
    ) -> Vec<(JobReport, Option<JobOutput>)> {
        let (tx, rx) = mpsc::channel::<(usize, Result<JobOutput, String>)>();
        let started = Instant::now();
        let mut deadlines = Vec::with_capacity(jobs.len());
        let mut outcomes: Vec<Option<JobOutcome>> = vec![None; jobs.len()];

        for (slot, job) in jobs.iter().enumerate() {
            let timeout = job.timeout(&self.timeouts);
            deadlines.push(started.checked_add(timeout).unwrap_or(started + FAR_DEADLINE));
            let ticket = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some((holder, path)) = in_flight.holder(&job.ownership) {
                    warn!(job = %job.id, %holder, %path, "ownership held by a timed-out job");
                    outcomes[slot] = Some(JobOutcome::Failed(format!(
                        "{path} is still being written by timed-out job '{holder}'"
                    )));
                    continue;
                }
                in_flight.claim(job)
            };
            let tx = tx.clone();
            let worker = Arc::clone(worker);
            let in_flight = Arc::clone(&self.in_flight);
            let owned = (*job).clone();
            debug!(job = %job.id, batch = index, ?timeout, "starting job");
            let spawned = thread::Builder::new()
                .name(format!("worker-{}", job.id))
                .spawn(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| worker.run(&owned)));
                    // Released before reporting, so the barrier never sees a stale claim.
                    release(&in_flight, ticket);
                    let outcome = match result {
                        Ok(Ok(output)) => Ok(output),
                        Ok(Err(err)) => Err(format!("{err:#}")),
                        Err(_) => Err("worker panicked".to_string()),
                    };
                    if tx.send((slot, outcome)).is_err() {
                        debug!(job = %owned.id, "result arrived after the barrier released");
                    }
                });
            if let Err(err) = spawned {
                release(&self.in_flight, ticket);
                outcomes[slot] = Some(JobOutcome::Failed(format!("spawn worker thread: {err}")));
            }
        }
        drop(tx);

        let mut pending: BTreeSet<usize> = (0..jobs.len())
            .filter(|slot| outcomes[*slot].is_none())
            .collect();
        while !pending.is_empty() {
            let now = Instant::now();
            let expired: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|slot| deadlines[*slot] <= now)
                .collect();
            for slot in expired {
                pending.remove(&slot);
                outcomes[slot] = Some(JobOutcome::TimedOut);
            }
            if expired_critical(jobs, &outcomes) {
                break;
            }
            let Some(next_deadline) = pending.iter().map(|slot| deadlines[*slot]).min() else {
                break;
            };
            match rx.recv_timeout(next_deadline.saturating_duration_since(now)) {
                Ok((slot, outcome)) => {
                    if pending.remove(&slot) {
                        outcomes[slot] = Some(match outcome {
                            Ok(output) => JobOutcome::Done(output),
                            Err(detail) => JobOutcome::Failed(detail),
                        });
                    }
                    if expired_critical(jobs, &outcomes) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        jobs.iter()
            .zip(outcomes)
            .zip(&deadlines)
            .map(|((job, outcome), deadline)| {
                let timeout = deadline.saturating_duration_since(started);
                job_report(index, job, outcome, timeout)
            })
            .collect()
    }
}

const FAR_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn release(in_flight: &Mutex<InFlight>, ticket: u64) {
    in_flight
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .jobs
        .remove(&ticket);
}

#[derive(Debug, Clone)]
enum JobOutcome {
    Done(JobOutput),
    Failed(String),
    TimedOut,
}

/// True once a critical-role job has failed or timed out.
fn expired_critical(jobs: &[&WorkerJob], outcomes: &[Option<JobOutcome>]) -> bool {
    jobs.iter().zip(outcomes).any(|(job, outcome)| {
        job.role.is_critical()
            && matches!(outcome, Some(JobOutcome::Failed(_) | JobOutcome::TimedOut))
    })
}

fn job_report(
    batch: usize,
    job: &WorkerJob,
    outcome: Option<JobOutcome>,
    timeout: Duration,
) -> (JobReport, Option<JobOutput>) {
    let report = |result, detail| JobReport {
        job: job.id.clone(),
        role: job.role,
        batch,
        result,
        detail,
    };
    match outcome {
        Some(JobOutcome::Done(output)) => (report(JobResult::Success, None), Some(output)),
        Some(JobOutcome::Failed(detail)) => {
            let err = EngineError::WorkerFailure {
                job: job.id.clone(),
                detail,
            };
            warn!(%err, "job failed");
            (report(JobResult::Failure, Some(err.to_string())), None)
        }
        Some(JobOutcome::TimedOut) => {
            let err = EngineError::WorkerTimeout {
                job: job.id.clone(),
                timeout_secs: timeout.as_secs(),
            };
            warn!(%err, "job timed out");
            (report(JobResult::Timeout, Some(err.to_string())), None)
        }
        None => (
            report(
                JobResult::Failure,
                Some("batch halted before the job reported".to_string()),
            ),
            None,
        ),
    }
}

fn batch_ids(plan: &BatchPlan, jobs: &[WorkerJob]) -> Vec<Vec<String>> {
    plan.batches
        .iter()
        .map(|batch| batch.iter().map(|&i| jobs[i].id.clone()).collect())
        .collect()
}

fn role_name(role: JobRole) -> &'static str {
    match role {
        JobRole::Analysis => "analysis",
        JobRole::Validation => "validation",
        JobRole::Implementation => "implementation",
        JobRole::Fix => "fix",
        JobRole::GoalCoverage => "goal-coverage",
        JobRole::Compliance => "compliance",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Location, Severity};
    use crate::test_support::{ScriptedWorker, WorkerScript};

    fn coordinator() -> Coordinator {
        Coordinator::new(TimeoutConfig::default(), 0.5)
    }

    fn finding(id: &str, severity: Severity, anchor: &str) -> Finding {
        Finding::new(
            id,
            "inconsistency",
            severity,
            Location::anchored("spec.md", anchor),
            "terms differ",
        )
    }

    fn analysis_job(id: &str, owned: &str) -> WorkerJob {
        WorkerJob::new(id, JobRole::Analysis).owning([owned])
    }

    /// Verifies a timed-out job is excluded and the batch still aggregates.
    #[test]
    fn one_timeout_in_four_still_aggregates() {
        let worker = ScriptedWorker::new()
            .script("a", WorkerScript::findings(vec![finding("A", Severity::Low, "1")]))
            .script("b", WorkerScript::findings(vec![finding("B", Severity::High, "2")]))
            .script("c", WorkerScript::findings(vec![finding("C", Severity::Low, "3")]))
            .script("d", WorkerScript::Sleep(Duration::from_millis(800)));
        let jobs = vec![
            analysis_job("a", "out/a.md"),
            analysis_job("b", "out/b.md"),
            analysis_job("c", "out/c.md"),
            analysis_job("d", "out/d.md").with_timeout(Duration::from_millis(50)),
        ];

        let report = coordinator().dispatch(jobs, Arc::new(worker));

        assert_eq!(report.status, DispatchStatus::Completed);
        assert_eq!(report.findings.len(), 3);
        let timed_out: Vec<&str> = report
            .failed_jobs()
            .map(|j| j.job.as_str())
            .collect();
        assert_eq!(timed_out, vec!["d"]);
        assert_eq!(report.jobs[3].result, JobResult::Timeout);
        assert!(
            report.jobs[3]
                .detail
                .as_deref()
                .is_some_and(|d| d.contains("timed out"))
        );
    }

    /// Verifies a majority failure aborts the batch and merges nothing.
    #[test]
    fn three_failures_in_four_abort_without_results() {
        let worker = ScriptedWorker::new()
            .script("a", WorkerScript::findings(vec![finding("A", Severity::Low, "1")]))
            .script("b", WorkerScript::Fail("boom".to_string()))
            .script("c", WorkerScript::Fail("boom".to_string()))
            .script("d", WorkerScript::Panic);
        let jobs = vec![
            analysis_job("a", "out/a.md"),
            analysis_job("b", "out/b.md"),
            analysis_job("c", "out/c.md"),
            analysis_job("d", "out/d.md"),
        ];

        let report = coordinator().dispatch(jobs, Arc::new(worker));

        assert!(report.is_aborted());
        assert!(report.findings.is_empty());
        assert_eq!(report.failed_jobs().count(), 3);
        assert!(
            report
                .abort_reason
                .as_deref()
                .is_some_and(|r| r.contains("3 of 4"))
        );
    }

    #[test]
    fn exactly_half_failing_is_tolerated() {
        let worker = ScriptedWorker::new()
            .script("a", WorkerScript::findings(Vec::new()))
            .script("b", WorkerScript::Fail("boom".to_string()));
        let jobs = vec![analysis_job("a", "a.md"), analysis_job("b", "b.md")];
        let report = coordinator().dispatch(jobs, Arc::new(worker));
        assert_eq!(report.status, DispatchStatus::Completed);
    }

    #[test]
    fn critical_role_failure_aborts_immediately() {
        let worker = ScriptedWorker::new()
            .script("coverage", WorkerScript::Fail("no map".to_string()))
            .script("slow", WorkerScript::Sleep(Duration::from_secs(5)))
            .script("ok-1", WorkerScript::findings(Vec::new()))
            .script("ok-2", WorkerScript::findings(Vec::new()));
        let jobs = vec![
            WorkerJob::new("coverage", JobRole::GoalCoverage).owning(["coverage.json"]),
            analysis_job("slow", "slow.md"),
            analysis_job("ok-1", "1.md"),
            analysis_job("ok-2", "2.md"),
        ];

        let started = Instant::now();
        let report = coordinator().dispatch(jobs, Arc::new(worker));

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(report.is_aborted());
        assert!(
            report
                .abort_reason
                .as_deref()
                .is_some_and(|r| r.contains("goal-coverage"))
        );
    }

    #[test]
    fn conflicting_jobs_run_in_separate_batches() {
        let worker = ScriptedWorker::new();
        let jobs = vec![
            WorkerJob::new("fix-spec", JobRole::Fix).owning(["specs/001/spec.md"]),
            WorkerJob::new("fix-spec-again", JobRole::Fix).owning(["specs/001/spec.md"]),
            WorkerJob::new("fix-plan", JobRole::Fix).owning(["specs/001/plan.md"]),
        ];

        let report = coordinator().dispatch(jobs, Arc::new(worker));

        assert_eq!(
            report.batches,
            vec![
                vec!["fix-spec".to_string(), "fix-plan".to_string()],
                vec!["fix-spec-again".to_string()],
            ]
        );
        assert_eq!(report.conflicts.len(), 1);
        assert!(report.jobs.iter().any(|j| j.job == "fix-spec-again" && j.batch == 1));
    }

    /// Verifies a job is refused while a timed-out job still writes its paths,
    /// and runs once that thread has exited.
    #[test]
    fn timed_out_job_keeps_its_paths_until_it_exits() {
        let coordinator = coordinator();
        let worker: Arc<dyn Worker> = Arc::new(
            ScriptedWorker::new().script("slow", WorkerScript::Sleep(Duration::from_millis(400))),
        );
        let slow = WorkerJob::new("slow", JobRole::Fix)
            .owning(["specs/001/spec.md"])
            .with_timeout(Duration::from_millis(50));
        let first = coordinator.dispatch(vec![slow], Arc::clone(&worker));
        assert_eq!(first.jobs[0].result, JobResult::Timeout);

        let retry = || {
            vec![
                WorkerJob::new("fix-spec", JobRole::Fix).owning(["specs/001/spec.md"]),
                WorkerJob::new("fix-plan", JobRole::Fix).owning(["specs/001/plan.md"]),
            ]
        };
        let second = coordinator.dispatch(retry(), Arc::clone(&worker));
        assert_eq!(second.jobs[0].result, JobResult::Failure);
        assert!(
            second.jobs[0]
                .detail
                .as_deref()
                .is_some_and(|d| d.contains("timed-out job 'slow'"))
        );
        assert_eq!(second.jobs[1].result, JobResult::Success);

        thread::sleep(Duration::from_millis(700));
        let third = coordinator.dispatch(retry(), worker);
        assert_eq!(third.failed_jobs().count(), 0);
    }

    #[test]
    fn findings_are_deduplicated_by_location() {
        let worker = ScriptedWorker::new()
            .script("a", WorkerScript::findings(vec![finding("A", Severity::Low, "same")]))
            .script("b", WorkerScript::findings(vec![finding("B", Severity::Critical, "same")]));
        let jobs = vec![analysis_job("a", "a.md"), analysis_job("b", "b.md")];
        let report = coordinator().dispatch(jobs, Arc::new(worker));
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].id, "B");
    }

    #[test]
    fn preview_reports_plan_without_running() {
        let jobs = vec![
            analysis_job("a", "src"),
            analysis_job("b", "src/lib.rs"),
            analysis_job("c", "docs"),
        ];
        let plan = coordinator().preview(&jobs);
        assert_eq!(plan.batches.len(), 2);
        assert_eq!(plan.conflicts[0].path, "src/lib.rs");
    }

    #[test]
    fn role_timeouts_follow_config() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(
            JobRole::Analysis.default_timeout(&timeouts),
            Duration::from_secs(180)
        );
        assert_eq!(
            JobRole::Implementation.default_timeout(&timeouts),
            Duration::from_secs(900)
        );
        assert!(JobRole::Compliance.is_critical());
        assert!(!JobRole::Fix.is_critical());
    }
}
