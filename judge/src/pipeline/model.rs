//! Judging-domain entities. They are owned by the external persistence
//! layer; the shapes here are what the pipeline loads, mutates and writes
//! back through the [`super::db::Database`] interface.

use chrono::{DateTime, Utc};

use crate::proto::SandboxSpec;
use crate::store::Digest;

pub type Id = i64;

/// Submission lifecycle. `Pending` and `Judging` are transient; the other
/// three states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Judging,
    CompileError,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct Language {
    pub name: String,
    pub compiler: SandboxSpec,
    pub runner: SandboxSpec,
}

/// A program plus its compilation state. Used both for submissions and for
/// task evaluators.
#[derive(Debug, Clone)]
pub struct Program {
    pub language: Language,
    pub source: Digest,
    pub binary: Option<Digest>,
    pub compile_message: String,
}

#[derive(Debug, Clone)]
pub struct TestCase {
    pub id: Id,
    pub input: Digest,
    pub correct_output: Digest,
}

/// All-or-nothing scored bundle of test cases.
#[derive(Debug, Clone)]
pub struct TestGroup {
    pub id: Id,
    pub points: i32,
    pub tests: Vec<TestCase>,
}

/// A contest problem: limits, an evaluator program and the test groups.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Id,
    /// Per-test-case wall-clock limit, in seconds.
    pub time_limit: f64,
    pub memory_limit_bytes: i64,
    pub evaluator: Program,
    pub test_groups: Vec<TestGroup>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub id: Id,
    pub task: Id,
    pub program: Program,
    pub status: SubmissionStatus,
    pub score: i32,
    /// Count of test groups that have not reported yet.
    pub missing_results: i32,
}

/// Verdict of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseVerdict {
    Correct,
    WrongAnswer,
    TimeLimit,
    RuntimeError,
    InternalError,
}

/// Outcome of one test case run.
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub id: Id,
    pub submission: Id,
    pub test_case: Id,
    /// `None` between the run step and the evaluator's decision; failures
    /// are filled in directly.
    pub verdict: Option<CaseVerdict>,
    pub output: Option<Digest>,
    pub err_output: Option<Digest>,
    /// Wall-clock of the run step as observed by the master, in seconds.
    pub wall_time: Option<f64>,
    /// Peak memory of the run. Neither backend reports it yet.
    pub memory_bytes: Option<i64>,
    pub judged_at: DateTime<Utc>,
}
