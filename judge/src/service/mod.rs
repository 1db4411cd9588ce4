//! The execution service: the network face of one judge host.
//!
//! Every request is validated in full -- token, digest grammar, identifier
//! grammar, limit ranges, blob existence -- before any sandbox or filesystem
//! side effect happens. Failures surface as one of the three typed errors;
//! anything unexpected is logged here and resignalled as `Internal` with the
//! detail withheld from the caller.

use std::{io, sync::Arc};

use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

use crate::proto::{
    wire, FileRef, Request, Response, RpcError, RunOptions, SandboxSpec,
};
use crate::sandbox::SandboxBackend;
use crate::store::{Digest, FileStore, StoreError};
use crate::util::ident::is_safe_identifier;

pub struct ExecService {
    store: FileStore,
    token: String,
    backend: Arc<dyn SandboxBackend>,
}

impl ExecService {
    pub fn new(
        store: FileStore,
        token: impl Into<String>,
        backend: Arc<dyn SandboxBackend>,
    ) -> ExecService {
        ExecService {
            store,
            token: token.into(),
            backend,
        }
    }

    /// Accept loop. Each connection gets its own task; requests on one
    /// connection are handled in order.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let service = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = service.handle_connection(stream).await {
                    warn!("connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        let mut frames = wire::frame_stream(stream);
        loop {
            let req = match wire::recv::<Request>(&mut frames).await {
                Ok(Some(req)) => req,
                Ok(None) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    // Undecodable request: tell the peer, then give up on
                    // the stream since framing may be out of sync.
                    let resp = Response::Error {
                        error: RpcError::invalid_data("undecodable request"),
                    };
                    wire::send(&mut frames, &resp).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let resp = match self.handle_request(req).await {
                Ok(resp) => resp,
                Err(error) => Response::Error { error },
            };
            wire::send(&mut frames, &resp).await?;
        }
    }

    async fn handle_request(&self, req: Request) -> Result<Response, RpcError> {
        match req {
            Request::HasFile { token, digest } => {
                self.authorize(&token)?;
                let digest = parse_digest(&digest)?;
                Ok(Response::Has {
                    exists: self.store.exists(&digest),
                })
            }
            Request::SendFile { token, data } => {
                self.authorize(&token)?;
                let digest = self
                    .store
                    .save(&data)
                    .map_err(|e| internal("storing uploaded file", e))?;
                Ok(Response::Sent { digest })
            }
            Request::GetFile { token, digest } => {
                self.authorize(&token)?;
                let digest = parse_digest(&digest)?;
                match self.store.read(&digest) {
                    Ok(data) => Ok(Response::Data { data }),
                    Err(StoreError::NotFound(_)) => {
                        Err(RpcError::invalid_data("no such file"))
                    }
                    Err(e) => Err(internal("reading stored file", e)),
                }
            }
            Request::Run {
                token,
                sandbox,
                inputs,
                options,
            } => {
                self.authorize(&token)?;
                self.validate_run(&sandbox, &inputs, &options)?;
                let result = self
                    .backend
                    .run(&sandbox, &inputs, &options, &self.store)
                    .await
                    .map_err(|e| internal("sandboxed run failed", e))?;
                Ok(Response::Run { result })
            }
        }
    }

    fn authorize(&self, token: &str) -> Result<(), RpcError> {
        if token != self.token {
            return Err(RpcError::auth("invalid token"));
        }
        Ok(())
    }

    /// All validation happens before any sandbox is created.
    fn validate_run(
        &self,
        sandbox: &SandboxSpec,
        inputs: &[FileRef],
        options: &RunOptions,
    ) -> Result<(), RpcError> {
        sandbox.validate()?;
        if let SandboxSpec::RestrictedProcess { runner, .. } = sandbox {
            if !self.store.exists(runner) {
                return Err(RpcError::invalid_data("runner script does not exist"));
            }
        }
        for input in inputs {
            if !is_safe_identifier(&input.name) {
                return Err(RpcError::invalid_data(
                    "input file name is not a safe identifier",
                ));
            }
            if !self.store.exists(&input.digest) {
                return Err(RpcError::invalid_data("input file does not exist"));
            }
        }
        options.validate()
    }
}

fn parse_digest(s: &str) -> Result<Digest, RpcError> {
    s.parse()
        .map_err(|_| RpcError::invalid_data("malformed file digest"))
}

fn internal(context: &str, e: impl std::fmt::Display) -> RpcError {
    // The detail stays in the host log; the caller only learns we failed.
    tracing::error!("{}: {}", context, e);
    RpcError::internal()
}
