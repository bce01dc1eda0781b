//! # tsrpc
//!
//! Typed RPC endpoints over pluggable transports.
//!
//! This crate holds the transport-independent endpoint machinery:
//!
//! - [Conn]: the shared connection state machine with `call_api`,
//!   `send_msg`, and per-name message listeners,
//! - [PendingRegistry]: SN correlation, per-call timeouts, cancellation,
//! - [Flows]: the interceptor stages bracketing every operation,
//! - [Server]: connection ownership, handler dispatch, broadcast, and
//!   graceful stop.
//!
//! Wire-level concerns (service tables, the transport data boxes, the error
//! taxonomy) live in [`tsrpc_core`]; concrete transports live in their own
//! crates (e.g. `tsrpc-http`).

#[macro_use]
extern crate captains_log;

mod call;
pub use call::ApiCall;

mod conn;
pub use conn::{
    CallApiOptions, Conn, ConnOptions, ConnState, ConnTransport, MsgListener, MsgNotify, WireData,
};

pub mod flows;
pub use flows::Flows;

mod pending;
pub use pending::{OnAbort, PendingRegistry, PendingReply};

mod server;
pub use server::{
    api_handler, ApiHandler, AutoImplDelay, AutoImplResult, HandlerLoader, Server, ServerState,
    ServerTransport,
};

pub use tsrpc_core as core;
pub use tsrpc_core::error::{ApiReturn, ErrorKind, TsrpcError};
pub use tsrpc_core::{Aborted, OpResult};
