//! Restricted-process sandbox: hand the run over to a privileged wrapper
//! script that applies the syscall policy and resource limits.

use std::path::Path;

use anyhow::{Context, Result};
use tokio::process::Command;

use super::workspace::RunDir;
use crate::proto::{FileRef, RunOptions, RunResult, RunVerdict, SyscallPolicy};
use crate::store::{Digest, FileStore};

/// Scratch-space cap handed to the wrapper, in KiB.
const SPACE_LIMIT_KIB: i64 = 4096;
/// Name the runner script is linked under inside the input directory.
const RUNNER_NAME: &str = "runner";

pub async fn run(
    wrapper: &Path,
    policy: SyscallPolicy,
    allowed_syscalls: &str,
    runner: &Digest,
    inputs: &[FileRef],
    options: &RunOptions,
    store: &FileStore,
) -> Result<RunResult> {
    let dir = RunDir::create()?;
    dir.link_inputs(store, inputs)?;
    let runner_path = dir.link_into_input(store, runner, RUNNER_NAME)?;
    // The sandboxed process runs under a separate low-privilege account.
    dir.make_world_accessible()?;

    let time_limit_secs = options.time_limit.ceil() as i64;
    let memory_kib = options.memory_limit_bytes / 1024;

    let status = Command::new(wrapper)
        .arg(time_limit_secs.to_string())
        .arg(memory_kib.to_string())
        .arg(SPACE_LIMIT_KIB.to_string())
        .arg(&runner_path)
        .env("SANDBOX_POLICY", policy.wrapper_name())
        .env("SANDBOX_ALLOWED_SYSCALLS", allowed_syscalls)
        .env("SANDBOX_INPUT_DIR", dir.input_dir())
        .env("SANDBOX_OUTPUT_DIR", dir.output_dir())
        .kill_on_drop(true)
        .status()
        .await
        .with_context(|| format!("spawning sandbox wrapper {:?}", wrapper))?;

    if !status.success() {
        // The wrapper reports every failure mode, the time limit included,
        // through its exit status; nothing in `out/` is trustworthy then.
        return Ok(RunResult {
            verdict: RunVerdict::NonZeroExit,
            outputs: vec![],
        });
    }

    let outputs = dir.collect_outputs(store)?;
    Ok(RunResult {
        verdict: RunVerdict::Success,
        outputs,
    })
}
