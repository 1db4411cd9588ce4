//! The master scheduler: queues judging work, keeps track of which execution
//! hosts are free, and dispatches tasks to them.

mod connection;

pub use connection::{JudgeCallError, JudgeConnection, JudgeHost, RunOutcome};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_futures::Instrument;

use crate::pipeline::db::{Database, DbError};
use crate::pipeline::model::Id;
use crate::pipeline::{self, JudgingTask, PipelineError};
use crate::store::FileStore;

/// Fixed delay between attempts to reach an execution host.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Default)]
struct MasterState {
    pending: VecDeque<JudgingTask>,
    all_hosts: BTreeMap<JudgeHost, Arc<JudgeConnection>>,
    busy_hosts: BTreeSet<JudgeHost>,
}

/// The process-wide scheduler. Construct exactly one with [`Master::start`]
/// and hand the `Arc` to everything that produces judging work -- there is no
/// hidden global instance.
pub struct Master {
    state: Mutex<MasterState>,
    /// Signalled whenever the queue or the free-host set changes.
    wakeup: Notify,
    db: Arc<dyn Database>,
    store: FileStore,
    token: String,
    /// Per-submission bookkeeping locks, keyed by submission id.
    submission_locks: DashMap<Id, Arc<Mutex<()>>>,
}

impl Master {
    /// Create the scheduler and start its dispatch loop. Must be called from
    /// within a tokio runtime.
    pub fn start(db: Arc<dyn Database>, store: FileStore, token: impl Into<String>) -> Arc<Master> {
        let master = Arc::new(Master {
            state: Mutex::new(MasterState::default()),
            wakeup: Notify::new(),
            db,
            store,
            token: token.into(),
            submission_locks: DashMap::new(),
        });
        tokio::spawn(Arc::clone(&master).dispatch_loop());
        master
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Number of hosts currently known (free or busy).
    pub fn connected_hosts(&self) -> usize {
        self.state().all_hosts.len()
    }

    pub(crate) fn submission_lock(&self, submission: Id) -> Arc<Mutex<()>> {
        self.submission_locks
            .entry(submission)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn state(&self) -> MutexGuard<'_, MasterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one task for dispatch.
    pub fn add_task(&self, task: JudgingTask) {
        self.state().pending.push_back(task);
        self.wakeup.notify_one();
    }

    /// Reload the host list from persistent configuration and (re)connect to
    /// every host. Each host gets a background connector that retries with a
    /// fixed backoff until a live connection is established.
    pub fn refresh_hosts(self: &Arc<Self>) -> Result<(), DbError> {
        let hosts = self.db.judge_hosts()?;
        self.state().all_hosts.clear();
        for host in hosts {
            let master = Arc::clone(self);
            tokio::spawn(async move { master.connect_host_loop(host).await });
        }
        Ok(())
    }

    async fn connect_host_loop(self: Arc<Self>, host: JudgeHost) {
        loop {
            match JudgeConnection::connect(host.clone(), self.token.clone()).await {
                Ok(conn) => {
                    info!("connected to judge host {}", host.name);
                    let mut state = self.state();
                    state.all_hosts.insert(host.clone(), Arc::new(conn));
                    state.busy_hosts.remove(&host);
                    drop(state);
                    self.wakeup.notify_one();
                    return;
                }
                Err(e) => {
                    tracing::debug!("connecting to judge host {} failed: {}", host.name, e);
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            self.wakeup.notified().await;
            self.start_pending();
        }
    }

    /// Pair free hosts with pending tasks until either runs out.
    fn start_pending(self: &Arc<Self>) {
        let mut state = self.state();
        loop {
            if state.pending.is_empty() {
                return;
            }
            let free = state
                .all_hosts
                .iter()
                .find(|(host, _)| !state.busy_hosts.contains(*host))
                .map(|(host, conn)| (host.clone(), Arc::clone(conn)));
            let (host, conn) = match free {
                Some(pair) => pair,
                None => return,
            };
            let task = state.pending.pop_front().expect("pending is non-empty");
            state.busy_hosts.insert(host.clone());
            info!("dispatching {:?} to host {}", task, host.name);
            let span = tracing::info_span!("judging_task", host = %host.name);
            tokio::spawn(Arc::clone(self).run_task(task, host, conn).instrument(span));
        }
    }

    /// Worker for one dispatched task. The host goes back to the free set no
    /// matter how the task ends, including cancellation.
    async fn run_task(self: Arc<Self>, task: JudgingTask, host: JudgeHost, conn: Arc<JudgeConnection>) {
        let _release = scopeguard::guard((Arc::clone(&self), host.clone()), |(master, host)| {
            master.release_host(host);
        });

        match pipeline::execute(&self, &conn, task).await {
            Ok(()) => {}
            Err(PipelineError::Call(JudgeCallError::Rpc(e))) => {
                // Typed errors from the host are logged and swallowed here;
                // the pipeline has already moved the submission to a
                // terminal state.
                error!("judge host {} returned error: {}", host.name, e);
            }
            Err(e) => error!("judging task on host {} failed: {}", host.name, e),
        }
    }

    fn release_host(&self, host: JudgeHost) {
        self.state().busy_hosts.remove(&host);
        self.wakeup.notify_one();
    }
}
