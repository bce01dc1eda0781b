//! # tsrpc-core
//!
//! This crate provides the wire model shared by every `tsrpc` endpoint and
//! transport:
//!
//! - the service table ([ServiceMap]) resolving service names to ids and
//!   schema ids,
//! - the tagged [TransportData] envelope with its two encodings
//!   ([binary_box] and [text_box]),
//! - the [Flow] interceptor pipeline,
//! - the error taxonomy ([error::TsrpcError]) and the end-to-end
//!   [error::ApiReturn] sum,
//! - small utilities: the wrap-to-one [Counter] and the level-gated logger
//!   helpers.
//!
//! Schema encoding and validation is delegated to an external [Validator]
//! implementation; [JsonValidator] is a schema-less passthrough for JSON
//! deployments and tests.

pub mod error;

mod config;
pub use config::{ClientConfig, DecodeReturnText, EncodeReturnText, ServerConfig};

mod codec;
pub use codec::{JsonValidator, Validator};

mod counter;
pub use counter::Counter;

pub mod logger;

mod service;
pub use service::{
    ApiService, EndpointSide, MsgService, ProtoInfo, Service, ServiceDef, ServiceKind,
    ServiceMap, ServiceProto, ServiceSide,
};

mod transport_data;
pub use transport_data::{DataKind, DataType, TransportData};

pub mod binary_box;
pub mod text_box;

mod flow;
pub use flow::{Aborted, Flow, FlowControl, OpResult};
