//! Client side of the judge wire protocol.

use std::collections::HashMap;
use std::io;

use err_derive::Error;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::proto::{
    wire, FileRef, Request, Response, RpcError, RunOptions, RunResult, RunVerdict, SandboxSpec,
};
use crate::store::{Digest, FileStore, StoreError};

/// A reachable execution-service endpoint. The derived ordering is
/// (name, host, port), which is what keeps host sets well-behaved.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JudgeHost {
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// Errors a judge call can produce: a typed error from the host itself, or
/// trouble on the way there.
#[derive(Debug, Error)]
pub enum JudgeCallError {
    #[error(display = "judge returned error: {}", _0)]
    Rpc(#[error(source)] RpcError),

    #[error(display = "transport error: {}", _0)]
    Transport(#[error(source)] io::Error),

    #[error(display = "local store error: {}", _0)]
    Store(#[error(source)] StoreError),

    #[error(display = "judge sent an unexpected response")]
    UnexpectedResponse,
}

/// What one [`JudgeConnection::run_on_host`] produced: the verdict plus a
/// name-to-digest map of the collected outputs.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub verdict: RunVerdict,
    pub outputs: HashMap<String, Digest>,
}

/// A live connection to one judge host. Calls are serialized over the single
/// underlying stream; the scheduler's busy-set guarantees one task per host
/// anyway.
pub struct JudgeConnection {
    host: JudgeHost,
    token: String,
    frames: Mutex<wire::JudgeFrames>,
}

impl JudgeConnection {
    pub async fn connect(host: JudgeHost, token: impl Into<String>) -> io::Result<JudgeConnection> {
        let stream = TcpStream::connect((host.host.as_str(), host.port)).await?;
        Ok(JudgeConnection {
            host,
            token: token.into(),
            frames: Mutex::new(wire::frame_stream(stream)),
        })
    }

    pub fn host(&self) -> &JudgeHost {
        &self.host
    }

    async fn call(&self, req: Request) -> Result<Response, JudgeCallError> {
        let mut frames = self.frames.lock().await;
        wire::send(&mut frames, &req).await?;
        match wire::recv::<Response>(&mut frames).await? {
            Some(Response::Error { error }) => Err(JudgeCallError::Rpc(error)),
            Some(resp) => Ok(resp),
            None => Err(JudgeCallError::Transport(
                io::ErrorKind::UnexpectedEof.into(),
            )),
        }
    }

    pub async fn has_file(&self, digest: &Digest) -> Result<bool, JudgeCallError> {
        match self
            .call(Request::HasFile {
                token: self.token.clone(),
                digest: digest.to_string(),
            })
            .await?
        {
            Response::Has { exists } => Ok(exists),
            _ => Err(JudgeCallError::UnexpectedResponse),
        }
    }

    pub async fn send_file(&self, data: Vec<u8>) -> Result<Digest, JudgeCallError> {
        match self
            .call(Request::SendFile {
                token: self.token.clone(),
                data,
            })
            .await?
        {
            Response::Sent { digest } => Ok(digest),
            _ => Err(JudgeCallError::UnexpectedResponse),
        }
    }

    pub async fn get_file(&self, digest: &Digest) -> Result<Vec<u8>, JudgeCallError> {
        match self
            .call(Request::GetFile {
                token: self.token.clone(),
                digest: digest.to_string(),
            })
            .await?
        {
            Response::Data { data } => Ok(data),
            _ => Err(JudgeCallError::UnexpectedResponse),
        }
    }

    pub async fn run(
        &self,
        sandbox: SandboxSpec,
        inputs: Vec<FileRef>,
        options: RunOptions,
    ) -> Result<RunResult, JudgeCallError> {
        match self
            .call(Request::Run {
                token: self.token.clone(),
                sandbox,
                inputs,
                options,
            })
            .await?
        {
            Response::Run { result } => Ok(result),
            _ => Err(JudgeCallError::UnexpectedResponse),
        }
    }

    /// Push a blob to the host if it is missing there.
    async fn ensure_file(
        &self,
        store: &FileStore,
        digest: &Digest,
    ) -> Result<(), JudgeCallError> {
        if self.has_file(digest).await? {
            return Ok(());
        }
        self.send_file(store.read(digest)?).await?;
        Ok(())
    }

    /// Run a sandboxed step on this host: upload missing inputs (and the
    /// restricted-process runner, if any), execute, then pull back any
    /// outputs the local store does not have yet.
    pub async fn run_on_host(
        &self,
        store: &FileStore,
        sandbox: SandboxSpec,
        inputs: &[(String, Digest)],
        time_limit: f64,
        memory_limit_bytes: i64,
    ) -> Result<RunOutcome, JudgeCallError> {
        if let SandboxSpec::RestrictedProcess { runner, .. } = &sandbox {
            self.ensure_file(store, runner).await?;
        }

        let mut refs = Vec::with_capacity(inputs.len());
        for (name, digest) in inputs {
            self.ensure_file(store, digest).await?;
            refs.push(FileRef {
                name: name.clone(),
                digest: digest.clone(),
            });
        }

        let result = self
            .run(
                sandbox,
                refs,
                RunOptions {
                    time_limit,
                    memory_limit_bytes,
                },
            )
            .await?;

        let mut outputs = HashMap::new();
        for output in result.outputs {
            if !store.exists(&output.digest) {
                let data = self.get_file(&output.digest).await?;
                let stored = store.save(&data)?;
                if stored != output.digest {
                    tracing::warn!(
                        "host {} returned blob {} whose content hashes to {}",
                        self.host.name,
                        output.digest,
                        stored
                    );
                }
            }
            outputs.insert(output.name, output.digest);
        }
        Ok(RunOutcome {
            verdict: result.verdict,
            outputs,
        })
    }
}
