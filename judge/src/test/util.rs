//! Shared fixtures: a scripted sandbox backend, ready-made hosts and a fully
//! wired master + database environment.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpListener;

use crate::master::{JudgeHost, Master};
use crate::pipeline::db::{Database, MemDb};
use crate::pipeline::model::{
    Id, Language, Program, Submission, SubmissionStatus, Task, TestCase, TestGroup,
};
use crate::proto::{FileRef, RunOptions, RunResult, RunVerdict, SandboxSpec};
use crate::sandbox::SandboxBackend;
use crate::service::ExecService;
use crate::store::FileStore;

pub const TOKEN: &str = "sekrit";

/// Observations shared between a [`MockSandbox`] and the test that owns it.
#[derive(Default)]
pub struct Counters {
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    compiled: Mutex<Vec<String>>,
}

impl Counters {
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn compiled(&self) -> Vec<String> {
        self.compiled.lock().unwrap().clone()
    }

    fn enter(self: &Arc<Self>) -> ConcurrencyGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        ConcurrencyGuard {
            counters: Arc::clone(self),
        }
    }

    fn record_compile(&self, source: &[u8]) {
        self.compiled
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(source).into_owned());
    }
}

struct ConcurrencyGuard {
    counters: Arc<Counters>,
}

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A sandbox backend scripted through its input blobs.
///
/// Steps are told apart by their input names. A compile step (`source`)
/// produces a binary equal to the source unless the source asks for a
/// compile error. A run step (`binary` + `input`) echoes the input to
/// stdout, or misbehaves when the input contains a marker word: `tle`,
/// `crash`, `silent` (no stdout) or `die` (backend failure). An evaluator
/// step (`correct` present) writes `1` or `0` depending on whether output
/// and correct output match.
pub struct MockSandbox {
    pub counters: Arc<Counters>,
    pub delay: Duration,
}

#[async_trait]
impl SandboxBackend for MockSandbox {
    async fn run(
        &self,
        _spec: &SandboxSpec,
        inputs: &[FileRef],
        _options: &RunOptions,
        store: &FileStore,
    ) -> anyhow::Result<RunResult> {
        let _running = self.counters.enter();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut blobs = HashMap::new();
        for input in inputs {
            blobs.insert(input.name.as_str(), store.read(&input.digest)?);
        }

        if let Some(source) = blobs.get("source") {
            self.counters.record_compile(source);
            let text = String::from_utf8_lossy(source);
            let mut outputs = vec![FileRef {
                name: "stdout".into(),
                digest: store.save(b"compiling\n")?,
            }];
            if text.contains("#compile_error") {
                outputs.push(FileRef {
                    name: "stderr".into(),
                    digest: store.save(b"syntax error\n")?,
                });
            } else {
                outputs.push(FileRef {
                    name: "binary".into(),
                    digest: store.save(source)?,
                });
            }
            return Ok(RunResult {
                verdict: RunVerdict::Success,
                outputs,
            });
        }

        if let Some(correct) = blobs.get("correct") {
            let output = blobs.get("output").context("evaluator needs an output")?;
            let line = if output == correct { "1\n" } else { "0\n" };
            return Ok(RunResult {
                verdict: RunVerdict::Success,
                outputs: vec![FileRef {
                    name: "result".into(),
                    digest: store.save(line.as_bytes())?,
                }],
            });
        }

        let input = blobs.get("input").context("run step needs an input")?;
        let text = String::from_utf8_lossy(input);
        if text.contains("die") {
            anyhow::bail!("sandbox host exploded");
        }
        if text.contains("tle") {
            return Ok(RunResult {
                verdict: RunVerdict::TimeLimitExceeded,
                outputs: vec![],
            });
        }
        if text.contains("crash") {
            return Ok(RunResult {
                verdict: RunVerdict::NonZeroExit,
                outputs: vec![],
            });
        }
        if text.contains("silent") {
            return Ok(RunResult {
                verdict: RunVerdict::Success,
                outputs: vec![],
            });
        }
        Ok(RunResult {
            verdict: RunVerdict::Success,
            outputs: vec![
                FileRef {
                    name: "stdout".into(),
                    digest: store.save(input)?,
                },
                FileRef {
                    name: "stderr".into(),
                    digest: store.save(b"")?,
                },
            ],
        })
    }
}

/// One mock execution host listening on an ephemeral localhost port.
pub struct TestHost {
    pub host: JudgeHost,
    pub counters: Arc<Counters>,
    _store_dir: tempfile::TempDir,
}

pub async fn spawn_host(name: &str, delay: Duration) -> TestHost {
    let store_dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(store_dir.path()).unwrap();
    let counters = Arc::new(Counters::default());
    let backend = Arc::new(MockSandbox {
        counters: Arc::clone(&counters),
        delay,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let service = Arc::new(ExecService::new(store, TOKEN, backend));
    tokio::spawn(async move {
        let _ = service.serve(listener).await;
    });
    TestHost {
        host: JudgeHost {
            name: name.into(),
            host: "127.0.0.1".into(),
            port,
        },
        counters,
        _store_dir: store_dir,
    }
}

/// A master wired to `n_hosts` mock hosts through a [`MemDb`].
pub struct JudgedEnv {
    pub db: Arc<MemDb>,
    pub master: Arc<Master>,
    pub hosts: Vec<TestHost>,
    _store_dir: tempfile::TempDir,
}

pub async fn judged_env(n_hosts: usize) -> JudgedEnv {
    judged_env_with_delay(n_hosts, Duration::ZERO).await
}

pub async fn judged_env_with_delay(n_hosts: usize, delay: Duration) -> JudgedEnv {
    let mut hosts = Vec::new();
    for i in 0..n_hosts {
        hosts.push(spawn_host(&format!("judge{}", i), delay).await);
    }
    let db = Arc::new(MemDb::new());
    db.set_hosts(hosts.iter().map(|h| h.host.clone()).collect());

    let store_dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(store_dir.path()).unwrap();
    let master = Master::start(Arc::clone(&db) as Arc<dyn Database>, store, TOKEN);
    master.refresh_hosts().unwrap();
    wait_until(|| master.connected_hosts() == n_hosts, "hosts to connect").await;

    JudgedEnv {
        db,
        master,
        hosts,
        _store_dir: store_dir,
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn wait_for_terminal(db: &MemDb, submission: Id) -> Submission {
    for _ in 0..400 {
        let sub = db.load_submission(submission).unwrap();
        if matches!(
            sub.status,
            SubmissionStatus::Ready | SubmissionStatus::Error | SubmissionStatus::CompileError
        ) {
            return sub;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let sub = db.load_submission(submission).unwrap();
    panic!("submission {} stuck in {:?}", submission, sub.status);
}

pub fn image_id() -> String {
    "0123456789abcdef".repeat(4)
}

pub fn container_spec(repository: &str) -> SandboxSpec {
    SandboxSpec::Container {
        repository: repository.into(),
        image_id: image_id(),
    }
}

pub fn mock_language() -> Language {
    Language {
        name: "mock".into(),
        compiler: container_spec("compiler"),
        runner: container_spec("runtime"),
    }
}

pub fn store_program(store: &FileStore, source: &str) -> Program {
    Program {
        language: mock_language(),
        source: store.save(source.as_bytes()).unwrap(),
        binary: None,
        compile_message: String::new(),
    }
}

/// An evaluator that is already compiled, the usual state for a live task.
pub fn store_evaluator(store: &FileStore) -> Program {
    let mut program = store_program(store, "evaluator source");
    program.binary = Some(store.save(b"evaluator binary").unwrap());
    program
}

/// Build a task from `(points, [(input, correct output)])` group specs, with
/// all blobs saved into `store`.
pub fn store_task(store: &FileStore, id: Id, groups: &[(i32, Vec<(&str, &str)>)]) -> Task {
    let mut next_case = id * 1000;
    let test_groups = groups
        .iter()
        .enumerate()
        .map(|(i, (points, cases))| TestGroup {
            id: id * 100 + i as Id + 1,
            points: *points,
            tests: cases
                .iter()
                .map(|(input, correct)| {
                    next_case += 1;
                    TestCase {
                        id: next_case,
                        input: store.save(input.as_bytes()).unwrap(),
                        correct_output: store.save(correct.as_bytes()).unwrap(),
                    }
                })
                .collect(),
        })
        .collect();
    Task {
        id,
        time_limit: 2.0,
        memory_limit_bytes: 64 << 20,
        evaluator: store_evaluator(store),
        test_groups,
    }
}

pub fn store_submission(store: &FileStore, id: Id, task: Id, source: &str) -> Submission {
    Submission {
        id,
        task,
        program: store_program(store, source),
        status: SubmissionStatus::Pending,
        score: 0,
        missing_results: 0,
    }
}
