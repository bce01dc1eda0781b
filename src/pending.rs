//! The in-flight call registry of a connection.
//!
//! Every outbound `callApi` registers here under a fresh serial number. The
//! matching inbound response settles it; a per-call timer settles it with
//! NetworkError/TIMEOUT; an abort removes it without ever resolving the
//! caller (the tested semantics: an aborted call stays pending forever from
//! the caller's point of view).

use captains_log::filter::LogFilter;
use crossfire::{AsyncRx, MTx};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tsrpc_core::error::{ApiReturn, TsrpcError};
use tsrpc_core::Counter;

pub type OnAbort = Box<dyn FnOnce() + Send>;

pub struct PendingCall {
    pub sn: u32,
    pub api_name: String,
    pub started_at: Instant,
    on_abort: Option<OnAbort>,
    ret_tx: MTx<ApiReturn>,
    timeout_timer: Option<tokio::task::JoinHandle<()>>,
}

/// The caller's half of a pending call.
pub struct PendingReply {
    rx: AsyncRx<ApiReturn>,
}

impl PendingReply {
    /// Wait for the call to settle. An aborted call never settles; this
    /// future then stays pending for good.
    pub async fn wait(self) -> ApiReturn {
        match self.rx.recv().await {
            Ok(ret) => ret,
            Err(_) => futures::future::pending().await,
        }
    }
}

pub struct PendingRegistry {
    calls: Mutex<FxHashMap<u32, PendingCall>>,
    sn_counter: Counter,
    last_sn: AtomicU32,
    logger: Arc<LogFilter>,
}

impl PendingRegistry {
    pub fn new(logger: Arc<LogFilter>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(FxHashMap::default()),
            sn_counter: Counter::new(),
            last_sn: AtomicU32::new(0),
            logger,
        })
    }

    /// SN of the most recent registration; 0 before the first one.
    pub fn last_sn(&self) -> u32 {
        self.last_sn.load(Ordering::Relaxed)
    }

    /// Register a call, drawing the next SN. `on_abort` is invoked at most
    /// once, by an explicit abort or by the timeout timer.
    pub fn register(
        self: &Arc<Self>, api_name: &str, timeout: Option<Duration>, on_abort: Option<OnAbort>,
    ) -> (u32, PendingReply) {
        let sn = self.sn_counter.next();
        self.last_sn.store(sn, Ordering::Relaxed);
        let (ret_tx, rx) = crossfire::mpsc::unbounded_async::<ApiReturn>();
        let timeout_timer = timeout.map(|t| {
            let registry = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::time::sleep(t).await;
                if let Some(registry) = registry.upgrade() {
                    registry.on_timeout(sn);
                }
            })
        });
        let call = PendingCall {
            sn,
            api_name: api_name.to_string(),
            started_at: Instant::now(),
            on_abort,
            ret_tx,
            timeout_timer,
        };
        self.calls.lock().unwrap().insert(sn, call);
        (sn, PendingReply { rx })
    }

    /// Resolve the call. The first settle wins; settling an unknown or
    /// already-settled SN is a no-op.
    pub fn settle(&self, sn: u32, ret: ApiReturn) -> bool {
        let call = self.calls.lock().unwrap().remove(&sn);
        match call {
            Some(call) => {
                if let Some(timer) = call.timeout_timer {
                    timer.abort();
                }
                let _ = call.ret_tx.send(ret);
                true
            }
            None => {
                logger_warn!(self.logger, "settle unknown sn={}, dropped: {:?}", sn, ret);
                false
            }
        }
    }

    fn on_timeout(&self, sn: u32) {
        let call = self.calls.lock().unwrap().remove(&sn);
        if let Some(mut call) = call {
            logger_debug!(self.logger, "callApi {} sn={} timed out", call.api_name, sn);
            if let Some(on_abort) = call.on_abort.take() {
                on_abort();
            }
            let _ = call.ret_tx.send(ApiReturn::Err(TsrpcError::request_timeout()));
        }
    }

    /// Drop the call without resolving the caller. Fires `on_abort` once.
    pub fn abort(&self, sn: u32) {
        let call = self.calls.lock().unwrap().remove(&sn);
        if let Some(mut call) = call {
            logger_debug!(self.logger, "callApi {} sn={} aborted", call.api_name, sn);
            if let Some(timer) = call.timeout_timer.take() {
                timer.abort();
            }
            if let Some(on_abort) = call.on_abort.take() {
                on_abort();
            }
            // ret_tx drops unsent: the caller's future stays pending
        }
    }

    /// Abort every call matching the predicate.
    pub fn abort_by(&self, pred: impl Fn(&PendingCall) -> bool) {
        let sns: Vec<u32> = {
            let calls = self.calls.lock().unwrap();
            calls.values().filter(|c| pred(c)).map(|c| c.sn).collect()
        };
        for sn in sns {
            self.abort(sn);
        }
    }

    pub fn abort_all(&self) {
        self.abort_by(|_| true);
    }

    /// Settle every pending call with the same error (connection teardown).
    pub fn settle_all(&self, err: TsrpcError) {
        let sns: Vec<u32> = self.calls.lock().unwrap().keys().copied().collect();
        for sn in sns {
            self.settle(sn, ApiReturn::Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tsrpc_core::logger::new_logger;

    fn registry() -> Arc<PendingRegistry> {
        PendingRegistry::new(new_logger(log::Level::Warn))
    }

    #[tokio::test]
    async fn test_sn_strictly_increasing() {
        let reg = registry();
        let mut last = 0;
        for _ in 0..10 {
            let (sn, _reply) = reg.register("Test", None, None);
            assert!(sn > last);
            last = sn;
        }
        assert_eq!(reg.len(), 10);
    }

    #[tokio::test]
    async fn test_settle_resolves_and_drains() {
        let reg = registry();
        let (sn, reply) = reg.register("Test", None, None);
        assert_eq!(reg.len(), 1);
        assert!(reg.settle(sn, ApiReturn::Succ(json!({"ok": true}))));
        assert_eq!(reg.len(), 0);
        let ret = reply.wait().await;
        assert!(ret.is_succ());
        // second settle on the same sn is a dropped no-op
        assert!(!reg.settle(sn, ApiReturn::Succ(json!(2))));
    }

    #[tokio::test]
    async fn test_timeout_settles_with_network_error() {
        let reg = registry();
        let (_sn, reply) = reg.register("Test", Some(Duration::from_millis(20)), None);
        let ret = reply.wait().await;
        let err = ret.err().unwrap();
        assert_eq!(err.code.as_deref(), Some("TIMEOUT"));
        assert_eq!(err.message, "Request Timeout");
        assert_eq!(reg.len(), 0);
    }

    #[tokio::test]
    async fn test_abort_never_resolves() {
        let reg = registry();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let (sn, reply) = reg.register(
            "Test",
            None,
            Some(Box::new(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        );
        reg.abort(sn);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(reg.len(), 0);
        // the caller keeps waiting forever
        let waited =
            tokio::time::timeout(Duration::from_millis(150), reply.wait()).await;
        assert!(waited.is_err());
        // aborting again is a no-op; on_abort fired exactly once
        reg.abort(sn);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settle_all_on_disconnect() {
        let reg = registry();
        let (_s1, r1) = reg.register("A", None, None);
        let (_s2, r2) = reg.register("B", None, None);
        reg.settle_all(TsrpcError::conn_disconnected());
        assert_eq!(reg.len(), 0);
        for reply in [r1, r2] {
            let ret = reply.wait().await;
            assert_eq!(ret.err().unwrap().message, "Connection disconnected");
        }
    }

    #[tokio::test]
    async fn test_abort_by_predicate() {
        let reg = registry();
        let (_s1, _r1) = reg.register("Keep", None, None);
        let (_s2, _r2) = reg.register("Drop", None, None);
        reg.abort_by(|c| c.api_name == "Drop");
        assert_eq!(reg.len(), 1);
        reg.abort_all();
        assert_eq!(reg.len(), 0);
    }
}
