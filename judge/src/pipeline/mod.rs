//! The judging pipeline: compile a submission, run each test group, have the
//! evaluator score the output, and keep the submission's bookkeeping
//! consistent while groups report in any order.

pub mod db;
pub mod model;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use err_derive::Error;
use itertools::Itertools;
use tracing::{info, warn};

use crate::master::{JudgeCallError, JudgeConnection, Master, RunOutcome};
use crate::proto::RunVerdict;
use crate::store::{FileStore, StoreError};

use self::db::DbError;
use self::model::{
    CaseResult, CaseVerdict, Id, Program, Submission, SubmissionStatus, Task, TestCase,
};

/// Limits for compile steps.
const COMPILE_TIME_LIMIT: f64 = 10.0;
const COMPILE_MEMORY_LIMIT: i64 = 50 << 20;
/// Limits for evaluator runs.
const EVALUATE_TIME_LIMIT: f64 = 1.0;
const EVALUATE_MEMORY_LIMIT: i64 = 100 << 20;

/// Unit of scheduler work. Tasks carry identifiers only -- execution happens
/// asynchronously, so state is reloaded when the task actually runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgingTask {
    CompileSubmission { submission: Id },
    CompileEvaluator { task: Id },
    RunTestGroup { submission: Id, group: Id },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(display = "judge call failed: {}", _0)]
    Call(#[error(source)] JudgeCallError),

    #[error(display = "database error: {}", _0)]
    Db(#[error(source)] DbError),

    #[error(display = "store error: {}", _0)]
    Store(#[error(source)] StoreError),

    #[error(display = "{}", _0)]
    Invariant(String),
}

/// Entry point for the web layer: a submission arrived. Persists it as
/// pending and queues its compile step.
pub fn enqueue_for_judging(master: &Master, submission: Id) -> Result<(), DbError> {
    let mut sub = master.db().load_submission(submission)?;
    sub.status = SubmissionStatus::Pending;
    master.db().update_submission(&sub)?;
    master.add_task(JudgingTask::CompileSubmission { submission });
    Ok(())
}

/// Entry point for the web layer: a task's evaluator source changed and
/// needs recompiling.
pub fn compile_evaluator(master: &Master, task: Id) {
    master.add_task(JudgingTask::CompileEvaluator { task });
}

/// Entry point for the web layer at startup: requeue submissions an earlier
/// process left sitting in PENDING. Returns how many were queued.
pub fn requeue_pending(master: &Master) -> Result<usize, DbError> {
    let pending = master.db().submissions_with_status(SubmissionStatus::Pending)?;
    let count = pending.len();
    for submission in pending {
        master.add_task(JudgingTask::CompileSubmission { submission });
    }
    Ok(count)
}

/// Run one dispatched task on the given host connection.
pub(crate) async fn execute(
    master: &Arc<Master>,
    conn: &JudgeConnection,
    task: JudgingTask,
) -> Result<(), PipelineError> {
    match task {
        JudgingTask::CompileSubmission { submission } => {
            compile_submission(master, conn, submission).await
        }
        JudgingTask::CompileEvaluator { task } => compile_evaluator_task(master, conn, task).await,
        JudgingTask::RunTestGroup { submission, group } => {
            run_test_group(master, conn, submission, group).await
        }
    }
}

/// Compile `program` on the connected host. Fills in the compile message
/// (compiler stdout and stderr contents, concatenated) and the binary, if
/// one was produced. Persisting the owning record is the caller's job.
async fn compile_program(
    store: &FileStore,
    conn: &JudgeConnection,
    program: &mut Program,
) -> Result<(), PipelineError> {
    let inputs = [("source".to_owned(), program.source.clone())];
    let outcome = conn
        .run_on_host(
            store,
            program.language.compiler.clone(),
            &inputs,
            COMPILE_TIME_LIMIT,
            COMPILE_MEMORY_LIMIT,
        )
        .await?;

    let message_parts = ["stdout", "stderr"]
        .iter()
        .filter_map(|name| outcome.outputs.get(*name))
        .map(|digest| store.read(digest))
        .collect::<Result<Vec<_>, _>>()?;
    program.compile_message = message_parts
        .iter()
        .map(|part| String::from_utf8_lossy(part))
        .join("");
    program.binary = outcome.outputs.get("binary").cloned();
    Ok(())
}

async fn compile_submission(
    master: &Arc<Master>,
    conn: &JudgeConnection,
    id: Id,
) -> Result<(), PipelineError> {
    let db = master.db();
    let mut sub = db.load_submission(id)?;
    sub.status = SubmissionStatus::Judging;
    db.update_submission(&sub)?;

    if let Err(e) = compile_program(master.store(), conn, &mut sub.program).await {
        sub.status = SubmissionStatus::Error;
        db.update_submission(&sub)?;
        return Err(e);
    }
    db.update_submission(&sub)?;

    if sub.program.binary.is_some() {
        start_test_groups(master, &mut sub)?;
    } else {
        info!("submission {} failed to compile", sub.id);
        sub.status = SubmissionStatus::CompileError;
        db.update_submission(&sub)?;
    }
    Ok(())
}

/// Queue one run task per test group. The missing-results countdown is set
/// first so completion can be detected by decrement, whatever order the
/// groups finish in. A task without test groups has nothing left to wait
/// for and goes straight to READY.
fn start_test_groups(master: &Master, sub: &mut Submission) -> Result<(), PipelineError> {
    let task = master.db().load_task(sub.task)?;
    sub.missing_results = task.test_groups.len() as i32;
    if task.test_groups.is_empty() {
        sub.status = SubmissionStatus::Ready;
    }
    master.db().update_submission(sub)?;
    for group in &task.test_groups {
        master.add_task(JudgingTask::RunTestGroup {
            submission: sub.id,
            group: group.id,
        });
    }
    Ok(())
}

async fn compile_evaluator_task(
    master: &Arc<Master>,
    conn: &JudgeConnection,
    id: Id,
) -> Result<(), PipelineError> {
    let db = master.db();
    let mut task = db.load_task(id)?;
    compile_program(master.store(), conn, &mut task.evaluator).await?;
    db.update_task(&task)?;
    Ok(())
}

/// Scoped submission bookkeeping. When the guard drops -- normally or on an
/// early exit -- it takes the per-submission lock, decrements the missing
/// result count, adds `score`, and flips JUDGING to READY once the last
/// group has reported.
struct SubmissionUpdate<'a> {
    master: &'a Master,
    submission: Id,
    score: i32,
}

impl Drop for SubmissionUpdate<'_> {
    fn drop(&mut self) {
        let lock = self.master.submission_lock(self.submission);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let db = self.master.db();
        let mut sub = match db.load_submission(self.submission) {
            Ok(sub) => sub,
            Err(e) => {
                log::error!("submission {} vanished during update: {}", self.submission, e);
                return;
            }
        };
        sub.missing_results -= 1;
        sub.score += self.score;
        if sub.missing_results == 0 && sub.status == SubmissionStatus::Judging {
            sub.status = SubmissionStatus::Ready;
        }
        if let Err(e) = db.update_submission(&sub) {
            log::error!("failed to persist submission {}: {}", sub.id, e);
        }
    }
}

/// Run one group's bookkeeping immediately: create the guard and drop it.
#[cfg(test)]
pub(crate) fn apply_group_result(master: &Master, submission: Id, score: i32) {
    drop(SubmissionUpdate {
        master,
        submission,
        score,
    });
}

async fn run_test_group(
    master: &Arc<Master>,
    conn: &JudgeConnection,
    submission_id: Id,
    group_id: Id,
) -> Result<(), PipelineError> {
    let db = master.db();
    let sub = db.load_submission(submission_id)?;
    let task = db.load_task(sub.task)?;
    let group = task
        .test_groups
        .iter()
        .find(|g| g.id == group_id)
        .ok_or_else(|| {
            PipelineError::Invariant(format!("test group {} not in task {}", group_id, task.id))
        })?;

    let mut update = SubmissionUpdate {
        master: master.as_ref(),
        submission: submission_id,
        score: 0,
    };

    let outcome: Result<bool, PipelineError> = async {
        let mut all_ok = true;
        for test in &group.tests {
            let mut result = run_case(master, conn, &sub, &task, test).await?;
            match result.verdict {
                None => {
                    all_ok &= evaluate_output(master, conn, &task, test, &mut result).await?;
                }
                Some(_) => all_ok = false,
            }
            // A failed case settles the whole group; skip the rest.
            if !all_ok {
                break;
            }
        }
        Ok(all_ok)
    }
    .await;

    match outcome {
        Ok(all_ok) => {
            update.score = if all_ok { group.points } else { 0 };
            drop(update);
            Ok(())
        }
        Err(e) => {
            // The guard still decrements before the submission is marked
            // ERROR, so ERROR always wins over a simultaneous READY.
            drop(update);
            let lock = master.submission_lock(submission_id);
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            let mut sub = db.load_submission(submission_id)?;
            sub.status = SubmissionStatus::Error;
            db.update_submission(&sub)?;
            Err(e)
        }
    }
}

/// Run one test case. The returned result is already persisted; its verdict
/// is `None` when the evaluator still has to decide.
async fn run_case(
    master: &Arc<Master>,
    conn: &JudgeConnection,
    sub: &Submission,
    task: &Task,
    test: &TestCase,
) -> Result<CaseResult, PipelineError> {
    let binary = sub.program.binary.clone().ok_or_else(|| {
        PipelineError::Invariant(format!("submission {} has no binary", sub.id))
    })?;
    let inputs = [
        ("binary".to_owned(), binary),
        ("input".to_owned(), test.input.clone()),
    ];

    let started = Instant::now();
    let outcome = conn
        .run_on_host(
            master.store(),
            sub.program.language.runner.clone(),
            &inputs,
            task.time_limit,
            task.memory_limit_bytes,
        )
        .await?;
    let wall_time = started.elapsed().as_secs_f64();

    let mut result = CaseResult {
        id: 0,
        submission: sub.id,
        test_case: test.id,
        verdict: None,
        output: outcome.outputs.get("stdout").cloned(),
        err_output: outcome.outputs.get("stderr").cloned(),
        wall_time: Some(wall_time),
        memory_bytes: None,
        judged_at: Utc::now(),
    };
    result.verdict = match outcome.verdict {
        RunVerdict::TimeLimitExceeded => Some(CaseVerdict::TimeLimit),
        RunVerdict::NonZeroExit => Some(CaseVerdict::RuntimeError),
        RunVerdict::Success if result.output.is_none() => Some(CaseVerdict::InternalError),
        // Left for the evaluator to decide.
        RunVerdict::Success => None,
    };
    result.id = master.db().persist_result(&result)?;
    Ok(result)
}

/// Run the task's evaluator over one case's output and persist the verdict.
/// Returns whether the case was judged correct.
async fn evaluate_output(
    master: &Arc<Master>,
    conn: &JudgeConnection,
    task: &Task,
    test: &TestCase,
    result: &mut CaseResult,
) -> Result<bool, PipelineError> {
    let evaluator_binary = task.evaluator.binary.clone().ok_or_else(|| {
        PipelineError::Invariant(format!("evaluator of task {} is not compiled", task.id))
    })?;
    let output = result.output.clone().ok_or_else(|| {
        PipelineError::Invariant("evaluating a case that produced no output".into())
    })?;
    let inputs = [
        ("binary".to_owned(), evaluator_binary),
        ("output".to_owned(), output),
        ("input".to_owned(), test.input.clone()),
        ("correct".to_owned(), test.correct_output.clone()),
    ];

    let outcome = conn
        .run_on_host(
            master.store(),
            task.evaluator.language.runner.clone(),
            &inputs,
            EVALUATE_TIME_LIMIT,
            EVALUATE_MEMORY_LIMIT,
        )
        .await?;

    let verdict = read_evaluator_verdict(master.store(), &outcome);
    let ok = verdict == CaseVerdict::Correct;
    result.verdict = Some(verdict);
    master.db().update_result(result)?;
    Ok(ok)
}

/// The evaluator communicates through a one-line numeric `result` file:
/// non-zero means correct, zero means wrong. Anything else counts as an
/// internal error for the case rather than a crashed worker.
fn read_evaluator_verdict(store: &FileStore, outcome: &RunOutcome) -> CaseVerdict {
    if outcome.verdict != RunVerdict::Success {
        warn!("evaluator did not run to completion");
        return CaseVerdict::InternalError;
    }
    let digest = match outcome.outputs.get("result") {
        Some(digest) => digest,
        None => {
            warn!("evaluator produced no result file");
            return CaseVerdict::InternalError;
        }
    };
    let data = match store.read(digest) {
        Ok(data) => data,
        Err(e) => {
            warn!("could not read evaluator result file: {}", e);
            return CaseVerdict::InternalError;
        }
    };
    match String::from_utf8_lossy(&data).trim().parse::<i64>() {
        Ok(0) => CaseVerdict::WrongAnswer,
        Ok(_) => CaseVerdict::Correct,
        Err(_) => {
            warn!("evaluator result file is not numeric");
            CaseVerdict::InternalError
        }
    }
}
