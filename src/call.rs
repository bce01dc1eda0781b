//! Server-side representation of one inbound API call.

use crate::conn::Conn;
use crossfire::MTx;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tsrpc_core::error::{ApiReturn, TsrpcError};

/// Handed to the API handler. The handler resolves it exactly once through
/// [ApiCall::succ] or [ApiCall::error]; later resolutions are no-ops (the
/// reply may already be on the wire, e.g. after a server timeout).
#[derive(Clone)]
pub struct ApiCall {
    pub api_name: String,
    pub sn: u32,
    pub req: Value,
    pub conn: Arc<Conn>,
    reply_tx: Arc<Mutex<Option<MTx<ApiReturn>>>>,
}

impl ApiCall {
    pub(crate) fn new(
        api_name: String, sn: u32, req: Value, conn: Arc<Conn>, reply_tx: MTx<ApiReturn>,
    ) -> Self {
        Self { api_name, sn, req, conn, reply_tx: Arc::new(Mutex::new(Some(reply_tx))) }
    }

    /// Resolve with a success body. Returns false if the call was already
    /// resolved.
    pub fn succ(&self, res: Value) -> bool {
        self.reply(ApiReturn::Succ(res))
    }

    /// Resolve with an error. Handlers producing domain failures should pass
    /// an `ApiError`-kinded [TsrpcError]; it reaches the caller verbatim.
    pub fn error(&self, err: TsrpcError) -> bool {
        self.reply(ApiReturn::Err(err))
    }

    pub(crate) fn reply(&self, ret: ApiReturn) -> bool {
        let tx = self.reply_tx.lock().unwrap().take();
        match tx {
            Some(tx) => {
                let _ = tx.send(ret);
                true
            }
            None => false,
        }
    }

    /// Whether the call has already been resolved.
    pub fn is_replied(&self) -> bool {
        self.reply_tx.lock().unwrap().is_none()
    }
}

impl std::fmt::Debug for ApiCall {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "[call {} sn={}]", self.api_name, self.sn)
    }
}
