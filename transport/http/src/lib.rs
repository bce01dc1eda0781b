//! # tsrpc-http
//!
//! HTTP specialization of the `tsrpc` endpoints: a stateless client doing one
//! POST per call, and a server turning every inbound request into a transient
//! connection. Duplex messaging is out: the server cannot push to a client,
//! and a client cannot implement APIs.

#[macro_use]
extern crate captains_log;

mod client;
pub use client::HttpClient;

pub mod net;

mod server;
pub use server::HttpServer;
