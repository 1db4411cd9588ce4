//! Core of the gavel contest judge.
//!
//! The crate is split along the judging data path: a content-addressed
//! [`store`] moves code, binaries and test data between components; the
//! [`service`] runs on every execution host and exposes file transfer plus
//! sandboxed execution over a framed TCP protocol; the [`sandbox`] module
//! holds the two isolation backends; the [`master`] scheduler queues judging
//! work and dispatches it to free hosts; and the [`pipeline`] sequences
//! compile, run and evaluate steps for a submission.

pub mod config;
pub mod master;
pub mod pipeline;
pub mod proto;
pub mod sandbox;
pub mod service;
pub mod store;
pub mod util;

#[cfg(test)]
mod test;
