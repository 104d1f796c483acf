//! IPC bridge for controller-worker communication.
//!
//! This module provides the wire protocol, codec and in-memory pipe used
//! between a [`WorkerClient`](crate::WorkerClient) and its worker task.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (Header, Response) and message framing helpers
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Duplex pipe split into typed framed halves

pub mod codec;
pub mod protocol;
pub mod transport;
