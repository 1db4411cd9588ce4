//! Interface to the external persistence layer.
//!
//! The real backend is a relational store owned by the web process and out
//! of scope here; the pipeline consumes it through load-by-id, update,
//! persist and query-by-field operations. Every method is one transactional
//! unit of work in the real backend. The in-memory implementation used in
//! tests gives the same per-call atomicity under a single mutex.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use err_derive::Error;

use super::model::{CaseResult, Id, Submission, SubmissionStatus, Task};
use crate::master::JudgeHost;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(display = "no {} with id {}", _0, _1)]
    NotFound(&'static str, Id),

    #[error(display = "persistence failure: {}", _0)]
    Backend(String),
}

pub trait Database: Send + Sync + 'static {
    fn load_submission(&self, id: Id) -> Result<Submission, DbError>;
    fn update_submission(&self, submission: &Submission) -> Result<(), DbError>;

    fn load_task(&self, id: Id) -> Result<Task, DbError>;
    fn update_task(&self, task: &Task) -> Result<(), DbError>;

    /// Persist a fresh result row, returning its id.
    fn persist_result(&self, result: &CaseResult) -> Result<Id, DbError>;
    fn update_result(&self, result: &CaseResult) -> Result<(), DbError>;

    /// Query-by-field: the configured execution hosts.
    fn judge_hosts(&self) -> Result<Vec<JudgeHost>, DbError>;

    /// Query-by-field: ids of submissions currently in `status`.
    fn submissions_with_status(&self, status: SubmissionStatus) -> Result<Vec<Id>, DbError>;
}

/// In-memory [`Database`] for tests and local experiments.
#[derive(Default)]
pub struct MemDb {
    inner: Mutex<MemDbInner>,
}

#[derive(Default)]
struct MemDbInner {
    submissions: HashMap<Id, Submission>,
    tasks: HashMap<Id, Task>,
    results: HashMap<Id, CaseResult>,
    hosts: Vec<JudgeHost>,
    next_result_id: Id,
}

impl MemDb {
    pub fn new() -> MemDb {
        MemDb::default()
    }

    fn inner(&self) -> MutexGuard<'_, MemDbInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_submission(&self, submission: Submission) {
        self.inner().submissions.insert(submission.id, submission);
    }

    pub fn insert_task(&self, task: Task) {
        self.inner().tasks.insert(task.id, task);
    }

    pub fn set_hosts(&self, hosts: Vec<JudgeHost>) {
        self.inner().hosts = hosts;
    }

    pub fn results_for(&self, submission: Id) -> Vec<CaseResult> {
        let mut results: Vec<_> = self
            .inner()
            .results
            .values()
            .filter(|r| r.submission == submission)
            .cloned()
            .collect();
        results.sort_by_key(|r| r.id);
        results
    }
}

impl Database for MemDb {
    fn load_submission(&self, id: Id) -> Result<Submission, DbError> {
        self.inner()
            .submissions
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound("submission", id))
    }

    fn update_submission(&self, submission: &Submission) -> Result<(), DbError> {
        let mut inner = self.inner();
        if !inner.submissions.contains_key(&submission.id) {
            return Err(DbError::NotFound("submission", submission.id));
        }
        inner.submissions.insert(submission.id, submission.clone());
        Ok(())
    }

    fn load_task(&self, id: Id) -> Result<Task, DbError> {
        self.inner()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(DbError::NotFound("task", id))
    }

    fn update_task(&self, task: &Task) -> Result<(), DbError> {
        let mut inner = self.inner();
        if !inner.tasks.contains_key(&task.id) {
            return Err(DbError::NotFound("task", task.id));
        }
        inner.tasks.insert(task.id, task.clone());
        Ok(())
    }

    fn persist_result(&self, result: &CaseResult) -> Result<Id, DbError> {
        let mut inner = self.inner();
        inner.next_result_id += 1;
        let id = inner.next_result_id;
        let mut result = result.clone();
        result.id = id;
        inner.results.insert(id, result);
        Ok(id)
    }

    fn update_result(&self, result: &CaseResult) -> Result<(), DbError> {
        let mut inner = self.inner();
        if !inner.results.contains_key(&result.id) {
            return Err(DbError::NotFound("result", result.id));
        }
        inner.results.insert(result.id, result.clone());
        Ok(())
    }

    fn judge_hosts(&self) -> Result<Vec<JudgeHost>, DbError> {
        Ok(self.inner().hosts.clone())
    }

    fn submissions_with_status(&self, status: SubmissionStatus) -> Result<Vec<Id>, DbError> {
        let mut ids: Vec<_> = self
            .inner()
            .submissions
            .values()
            .filter(|s| s.status == status)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}
