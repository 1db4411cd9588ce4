//! Wire model of the execution service: file references, sandbox
//! specifications, run options and the typed error surface shared by judge
//! hosts and masters.

pub mod wire;

use err_derive::Error;
use serde::{Deserialize, Serialize};

use crate::store::Digest;
use crate::util::ident::{is_safe_identifier, is_valid_image_id};

/// A (logical name, digest) pair labelling a blob's role in a sandboxed run,
/// e.g. `binary`, `input` or `stdout`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub digest: Digest,
}

/// Syscall restriction level of the restricted-process sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyscallPolicy {
    Unrestricted,
    Traced,
    Filtered,
}

impl SyscallPolicy {
    /// Policy name understood by the sandbox wrapper script.
    pub fn wrapper_name(self) -> &'static str {
        match self {
            SyscallPolicy::Unrestricted => "NONE",
            SyscallPolicy::Traced => "PTRACE",
            SyscallPolicy::Filtered => "SECCOMP",
        }
    }
}

/// Tagged choice of isolation strategy for one run. Callers of `run` never
/// learn which backend executed their request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "camelCase")]
pub enum SandboxSpec {
    /// Container-based isolation, named by repository + image id.
    #[serde(rename_all = "camelCase")]
    Container { repository: String, image_id: String },

    /// Syscall-restricted process execution driven by a runner script.
    #[serde(rename_all = "camelCase")]
    RestrictedProcess {
        policy: SyscallPolicy,
        allowed_syscalls: String,
        runner: Digest,
    },
}

impl SandboxSpec {
    /// Check the identifier grammar of the spec. Blob existence is the
    /// execution service's concern.
    pub fn validate(&self) -> Result<(), RpcError> {
        match self {
            SandboxSpec::Container {
                repository,
                image_id,
            } => {
                if !is_safe_identifier(repository) {
                    return Err(RpcError::invalid_data(
                        "image repository is not a safe identifier",
                    ));
                }
                if !is_valid_image_id(image_id) {
                    return Err(RpcError::invalid_data("invalid image id"));
                }
                Ok(())
            }
            SandboxSpec::RestrictedProcess { .. } => Ok(()),
        }
    }
}

/// Smallest memory limit a host accepts.
pub const MEMORY_LIMIT_FLOOR: i64 = 512 * 1024;
/// Largest memory limit a host accepts.
pub const MEMORY_LIMIT_CEILING: i64 = 512 * 1024 * 1024;

/// Resource limits for one sandboxed run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Wall-clock limit, in seconds.
    pub time_limit: f64,
    pub memory_limit_bytes: i64,
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), RpcError> {
        if !self.time_limit.is_finite() {
            return Err(RpcError::invalid_data("non-finite time limit"));
        }
        if self.time_limit <= 0.0 {
            return Err(RpcError::invalid_data("non-positive time limit"));
        }
        if self.memory_limit_bytes < MEMORY_LIMIT_FLOOR {
            return Err(RpcError::invalid_data("memory limit under 512 KiB"));
        }
        if self.memory_limit_bytes > MEMORY_LIMIT_CEILING {
            return Err(RpcError::invalid_data("memory limit over 512 MiB"));
        }
        Ok(())
    }
}

/// How a sandboxed program finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunVerdict {
    Success,
    NonZeroExit,
    TimeLimitExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub verdict: RunVerdict,
    pub outputs: Vec<FileRef>,
}

/// Typed errors every execution-service operation can return.
///
/// `Internal` deliberately carries only a generic message; the detail stays
/// in the host's own log.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "msg")]
#[serde(rename_all = "camelCase")]
pub enum RpcError {
    #[error(display = "authorization failed: {}", _0)]
    Auth(String),

    #[error(display = "invalid data: {}", _0)]
    InvalidData(String),

    #[error(display = "internal judge error: {}", _0)]
    Internal(String),
}

impl RpcError {
    pub fn auth(msg: impl Into<String>) -> RpcError {
        RpcError::Auth(msg.into())
    }

    pub fn invalid_data(msg: impl Into<String>) -> RpcError {
        RpcError::InvalidData(msg.into())
    }

    /// The message callers are allowed to see.
    pub fn internal() -> RpcError {
        RpcError::Internal("internal judge error".into())
    }
}

/// Request envelope of the judge wire protocol. Digests arriving as loose
/// strings are validated by the service, not the decoder, so a malformed one
/// yields a typed error instead of a dead connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
#[serde(rename_all = "camelCase")]
pub enum Request {
    #[serde(rename_all = "camelCase")]
    HasFile { token: String, digest: String },

    #[serde(rename_all = "camelCase")]
    SendFile { token: String, data: Vec<u8> },

    #[serde(rename_all = "camelCase")]
    GetFile { token: String, digest: String },

    #[serde(rename_all = "camelCase")]
    Run {
        token: String,
        sandbox: SandboxSpec,
        inputs: Vec<FileRef>,
        options: RunOptions,
    },
}

/// Response envelope, one variant per request kind plus the error case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
#[serde(rename_all = "camelCase")]
pub enum Response {
    Has { exists: bool },
    Sent { digest: Digest },
    Data { data: Vec<u8> },
    Run { result: RunResult },
    Error { error: RpcError },
}
