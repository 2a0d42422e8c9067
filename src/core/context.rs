//! Per-request unit of work and its lifecycle state machine.
//!
//! A context is shared (`Arc`) between the worker running the filter chain,
//! the downstream completion task and, for circuit-broken calls, the timeout
//! path. Status only moves forward; the response is first-writer-wins; the
//! transport write is gated on the `Written` to `Completed` transition; the
//! inbound request is released at most once.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering},
    },
    time::Instant,
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::Response;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::core::{
    error::GatewayError,
    model::Rule,
    request::GatewayRequest,
    response::{GatewayResponse, ResponseCode},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ContextStatus {
    /// Filters are still running or the downstream call is in flight.
    Running = 0,
    /// A response is set but not yet flushed to the transport.
    Written = 1,
    /// The response has been handed to the transport.
    Completed = 2,
    /// The pipeline was short-circuited.
    Terminated = 3,
}

impl ContextStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Written,
            2 => Self::Completed,
            _ => Self::Terminated,
        }
    }
}

/// Write-once handle to the waiting transport connection.
#[derive(Clone)]
pub struct ResponseSink {
    sender: Arc<Mutex<Option<oneshot::Sender<Response<AxumBody>>>>>,
}

impl ResponseSink {
    pub fn channel() -> (Self, oneshot::Receiver<Response<AxumBody>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                sender: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    /// Sends the response if nothing was sent before. Returns whether this
    /// call performed the write.
    pub fn send(&self, response: Response<AxumBody>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        if sender.send(response).is_err() {
            tracing::debug!("Client went away before the response was written");
        }
        true
    }

    pub fn is_sent(&self) -> bool {
        self.sender.lock().is_none()
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("sent", &self.is_sent())
            .finish()
    }
}

pub type CompletedCallback = Box<dyn FnOnce(&GatewayContext) + Send>;

pub struct GatewayContext {
    rule: Arc<Rule>,
    keep_alive: bool,
    started: Instant,
    request: Mutex<GatewayRequest>,
    inbound: Mutex<Option<Bytes>>,
    response: Mutex<Option<GatewayResponse>>,
    error: Mutex<Option<GatewayError>>,
    attributes: Mutex<HashMap<String, serde_json::Value>>,
    completed_callbacks: Mutex<Vec<CompletedCallback>>,
    status: AtomicU8,
    gray: AtomicBool,
    retry_count: AtomicU32,
    request_released: AtomicBool,
    sink: ResponseSink,
}

impl GatewayContext {
    pub fn new(request: GatewayRequest, rule: Arc<Rule>, sink: ResponseSink) -> Arc<Self> {
        let inbound = request.body().clone();
        Arc::new(Self {
            rule,
            keep_alive: request.keep_alive(),
            started: Instant::now(),
            request: Mutex::new(request),
            inbound: Mutex::new(Some(inbound)),
            response: Mutex::new(None),
            error: Mutex::new(None),
            attributes: Mutex::new(HashMap::new()),
            completed_callbacks: Mutex::new(Vec::new()),
            status: AtomicU8::new(ContextStatus::Running as u8),
            gray: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            request_released: AtomicBool::new(false),
            sink,
        })
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn protocol(&self) -> &str {
        &self.rule.protocol
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn with_request<R>(&self, f: impl FnOnce(&GatewayRequest) -> R) -> R {
        f(&self.request.lock())
    }

    pub fn with_request_mut<R>(&self, f: impl FnOnce(&mut GatewayRequest) -> R) -> R {
        f(&mut self.request.lock())
    }

    pub fn status(&self) -> ContextStatus {
        ContextStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_status(&self, status: ContextStatus) -> bool {
        self.status() == status
    }

    /// Moves the status forward. Backward moves and moves out of
    /// `Terminated` are refused.
    pub fn set_status(&self, to: ContextStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn transition(&self, from: ContextStatus, to: ContextStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn terminate(&self) -> bool {
        self.set_status(ContextStatus::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.is_status(ContextStatus::Terminated)
    }

    /// Stores the response and marks the context `Written`. Only the first
    /// caller while `Running` wins; later responses are dropped.
    pub fn set_response(&self, response: GatewayResponse) -> bool {
        let mut slot = self.response.lock();
        if !self.is_status(ContextStatus::Running) {
            return false;
        }
        *slot = Some(response);
        self.transition(ContextStatus::Running, ContextStatus::Written)
    }

    pub fn response(&self) -> Option<GatewayResponse> {
        self.response.lock().clone()
    }

    /// Records the error and sets its error response.
    pub fn set_error(&self, error: GatewayError) -> bool {
        let code = error.response_code();
        *self.error.lock() = Some(error);
        self.set_response(GatewayResponse::from_code(code))
    }

    pub fn error_code(&self) -> Option<ResponseCode> {
        self.error.lock().as_ref().map(GatewayError::response_code)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.lock().as_ref().map(ToString::to_string)
    }

    pub fn attribute(&self, key: &str) -> Option<serde_json::Value> {
        self.attributes.lock().get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: serde_json::Value) {
        self.attributes.lock().insert(key.into(), value);
    }

    pub fn is_gray(&self) -> bool {
        self.gray.load(Ordering::Relaxed)
    }

    pub fn set_gray(&self, gray: bool) {
        self.gray.store(gray, Ordering::Relaxed);
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    /// Returns the new retry count.
    pub fn increment_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Releases the inbound request body. Returns true only for the call that
    /// actually released it.
    pub fn release_request(&self) -> bool {
        if self
            .request_released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inbound.lock().take();
        true
    }

    pub fn is_request_released(&self) -> bool {
        self.request_released.load(Ordering::Acquire)
    }

    /// Flushes the written response to the transport exactly once.
    ///
    /// Releases the request, then performs the `Written` to `Completed`
    /// transition; the caller that wins it writes and fires the completion
    /// callbacks. Returns whether this call wrote the response.
    pub fn write_response(&self) -> bool {
        self.release_request();
        if !self.transition(ContextStatus::Written, ContextStatus::Completed) {
            if self.is_status(ContextStatus::Completed) {
                self.fire_completed();
            }
            return false;
        }

        let response = self
            .response
            .lock()
            .clone()
            .unwrap_or_else(|| GatewayResponse::from_code(ResponseCode::InternalError));
        self.sink.send(response.into_http(self.keep_alive));
        self.fire_completed();
        true
    }

    /// Sends a response straight to the transport, bypassing the state
    /// machine. Used when no regular write can happen any more.
    pub fn respond_directly(&self, response: GatewayResponse) -> bool {
        self.release_request();
        self.sink.send(response.into_http(self.keep_alive))
    }

    pub fn is_responded(&self) -> bool {
        self.sink.is_sent()
    }

    pub fn on_completed(&self, callback: CompletedCallback) {
        self.completed_callbacks.lock().push(callback);
        if self.is_status(ContextStatus::Completed) {
            self.fire_completed();
        }
    }

    /// Runs the registered callbacks once the context is completed. Each
    /// callback runs exactly once; a terminated context never runs them.
    pub fn fire_completed(&self) {
        if !self.is_status(ContextStatus::Completed) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.completed_callbacks.lock());
        for callback in callbacks {
            callback(self);
        }
    }
}

impl fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayContext")
            .field("rule", &self.rule.id)
            .field("status", &self.status())
            .field("gray", &self.is_gray())
            .field("retry_count", &self.retry_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use http::{Request, StatusCode};

    use super::*;

    fn context() -> (Arc<GatewayContext>, oneshot::Receiver<Response<AxumBody>>) {
        let (parts, _) = Request::builder()
            .uri("/user/info")
            .header("uniqueId", "user:1.0")
            .body(())
            .unwrap()
            .into_parts();
        let request = GatewayRequest::from_parts(&parts, Bytes::from_static(b"hi"), None).unwrap();
        let (sink, rx) = ResponseSink::channel();
        (GatewayContext::new(request, Arc::new(Rule::default()), sink), rx)
    }

    #[test]
    fn status_only_moves_forward() {
        let (ctx, _rx) = context();
        assert!(ctx.is_status(ContextStatus::Running));
        assert!(ctx.set_status(ContextStatus::Written));
        assert!(!ctx.set_status(ContextStatus::Running));
        assert!(ctx.terminate());
        assert!(!ctx.set_status(ContextStatus::Completed));
        assert!(ctx.is_terminated());
    }

    #[test]
    fn first_response_wins() {
        let (ctx, _rx) = context();
        assert!(ctx.set_response(GatewayResponse::from_code(ResponseCode::RequestTimeout)));
        assert!(!ctx.set_response(GatewayResponse::from_code(ResponseCode::Success)));
        assert_eq!(
            ctx.response().unwrap().code(),
            Some(ResponseCode::RequestTimeout)
        );
    }

    #[test]
    fn release_happens_once() {
        let (ctx, _rx) = context();
        assert!(ctx.release_request());
        assert!(!ctx.release_request());
        assert!(ctx.is_request_released());
    }

    #[tokio::test]
    async fn racing_write_backs_write_once() {
        let (ctx, rx) = context();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        ctx.on_completed(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        ctx.set_error(GatewayError::Internal("boom".into()));
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let ctx = ctx.clone();
                std::thread::spawn(move || ctx.write_response())
            })
            .collect();
        let wins = writers
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(wins, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ctx.is_status(ContextStatus::Completed));
        assert!(ctx.is_request_released());
        assert_eq!(rx.await.unwrap().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn write_without_response_is_a_no_op() {
        let (ctx, _rx) = context();
        assert!(!ctx.write_response());
        assert!(!ctx.is_responded());
        // The request is still released.
        assert!(ctx.is_request_released());
    }

    #[test]
    fn late_callback_runs_immediately() {
        let (ctx, _rx) = context();
        ctx.set_response(GatewayResponse::from_code(ResponseCode::Success));
        ctx.write_response();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        ctx.on_completed(Box::new(move |_| flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn terminated_context_skips_callbacks() {
        let (ctx, _rx) = context();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        ctx.on_completed(Box::new(move |_| flag.store(true, Ordering::SeqCst)));

        assert!(ctx.terminate());
        ctx.fire_completed();
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!ctx.write_response());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn attributes_and_retry_counter() {
        let (ctx, _rx) = context();
        ctx.set_attribute("tenant", serde_json::json!("acme"));
        assert_eq!(ctx.attribute("tenant"), Some(serde_json::json!("acme")));
        assert_eq!(ctx.increment_retry(), 1);
        assert_eq!(ctx.increment_retry(), 2);
        assert_eq!(ctx.retry_count(), 2);
    }
}
