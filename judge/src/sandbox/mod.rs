//! Sandboxed execution: the two isolation backends and their shared scratch
//! workspace.

pub mod container;
pub mod restricted;
pub mod workspace;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::proto::{FileRef, RunOptions, RunResult, SandboxSpec};
use crate::store::FileStore;

/// Something that can execute one sandboxed run. The execution service only
/// sees this trait, so tests can substitute their own backend.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn run(
        &self,
        spec: &SandboxSpec,
        inputs: &[FileRef],
        options: &RunOptions,
        store: &FileStore,
    ) -> anyhow::Result<RunResult>;
}

/// The production backend, dispatching on the sandbox spec.
pub struct HostSandbox {
    docker: bollard::Docker,
    /// Wrapper script executed for restricted-process runs.
    wrapper: PathBuf,
}

impl HostSandbox {
    pub fn new(wrapper: impl Into<PathBuf>) -> Result<HostSandbox, bollard::errors::Error> {
        Ok(HostSandbox {
            docker: bollard::Docker::connect_with_local_defaults()?,
            wrapper: wrapper.into(),
        })
    }
}

#[async_trait]
impl SandboxBackend for HostSandbox {
    async fn run(
        &self,
        spec: &SandboxSpec,
        inputs: &[FileRef],
        options: &RunOptions,
        store: &FileStore,
    ) -> anyhow::Result<RunResult> {
        match spec {
            SandboxSpec::Container {
                repository,
                image_id,
            } => container::run(&self.docker, repository, image_id, inputs, options, store).await,
            SandboxSpec::RestrictedProcess {
                policy,
                allowed_syscalls,
                runner,
            } => {
                restricted::run(
                    &self.wrapper,
                    *policy,
                    allowed_syscalls,
                    runner,
                    inputs,
                    options,
                    store,
                )
                .await
            }
        }
    }
}
