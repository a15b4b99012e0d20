//! Correlated remote procedure calls
//!
//! Every call gets a fresh correlation id and an entry in the pending table.
//! The request frame is sent when the call is made, not when it is first
//! polled, and the timeout deadline is fixed at that moment too. The entry
//! leaves the table exactly once: on the matching response, on cancellation,
//! on timeout, or on disconnect. An entry past its deadline counts as timed
//! out even before its future is polled again. Responses that find no live
//! entry (late, cancelled, unknown) are dropped.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use mps_protocol::{Frame, Reliability, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::config::RpcConfig;
use crate::transport::Transport;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcError {
    #[error("Remote procedure '{proc_name}' timed out after {after:?}")]
    Timeout { proc_name: String, after: Duration },

    #[error("Remote procedure '{proc_name}' was cancelled")]
    Cancelled { proc_name: String },

    #[error("Remote procedure '{proc_name}' failed: {message}")]
    Remote { proc_name: String, message: String },

    #[error("Could not send remote procedure call: {0}")]
    Transport(String),

    #[error("Connection closed before '{proc_name}' answered")]
    Disconnected { proc_name: String },
}

/// Lifecycle of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcState {
    Pending,
    Resolved,
    Rejected,
    Cancelled,
}

/// Per-call overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Cancel earlier pending calls to the same procedure first
    pub exclusive: bool,
    /// Replaces the configured timeout; `Duration::ZERO` waits forever
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Snapshot of a pending table entry
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCallInfo {
    pub correlation_id: u64,
    pub proc_name: String,
    pub created_at: Instant,
}

type Outcome = Result<Value, RpcError>;

struct PendingEntry {
    proc_name: String,
    created_at: Instant,
    deadline: Option<tokio::time::Instant>,
    state: Rc<Cell<RpcState>>,
    completion: oneshot::Sender<Outcome>,
}

impl PendingEntry {
    fn is_expired(&self, now: tokio::time::Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }

    fn settle(self, state: RpcState, outcome: Outcome) {
        self.state.set(state);
        // The caller may have dropped its future already
        let _ = self.completion.send(outcome);
    }
}

struct RpcInner {
    pending: RefCell<HashMap<u64, PendingEntry>>,
    next_correlation_id: Cell<u64>,
    transport: Rc<dyn Transport>,
    config: RpcConfig,
}

impl RpcInner {
    /// Register a table entry and send the request frame
    fn dispatch(
        &self,
        name: &str,
        args: &[Value],
        state: &Rc<Cell<RpcState>>,
        timeout: Option<Duration>,
    ) -> Result<Dispatched, RpcError> {
        let correlation_id = self.next_correlation_id.get();
        self.next_correlation_id.set(correlation_id + 1);
        let deadline = timeout.map(|after| tokio::time::Instant::now() + after);

        let (completion, receiver) = oneshot::channel();
        self.pending.borrow_mut().insert(
            correlation_id,
            PendingEntry {
                proc_name: name.to_string(),
                created_at: Instant::now(),
                deadline,
                state: Rc::clone(state),
                completion,
            },
        );

        let frame = Frame::RpcRequest {
            correlation_id,
            name: name.to_string(),
            args: args.to_vec(),
        };
        if let Err(err) = self.transport.send(frame, Reliability::Reliable) {
            self.pending.borrow_mut().remove(&correlation_id);
            state.set(RpcState::Rejected);
            warn!(proc = name, "Request not sent: {}", err);
            return Err(RpcError::Transport(err.to_string()));
        }

        trace!(proc = name, "Request #{} sent", correlation_id);
        Ok(Dispatched {
            correlation_id,
            receiver,
            deadline,
        })
    }

    fn forget(&self, correlation_id: u64) -> bool {
        self.pending.borrow_mut().remove(&correlation_id).is_some()
    }

    /// Remove the live entries matching `filter`; expired ones stay for their timeout
    fn drain(&self, filter: Option<&str>) -> Vec<PendingEntry> {
        let now = tokio::time::Instant::now();
        let mut pending = self.pending.borrow_mut();
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter(|(_, entry)| filter.is_none_or(|name| entry.proc_name == name))
            .map(|(&id, _)| id)
            .collect();
        ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
    }
}

struct Dispatched {
    correlation_id: u64,
    receiver: oneshot::Receiver<Outcome>,
    deadline: Option<tokio::time::Instant>,
}

/// Removes the call's entry when its future is dropped unfinished
struct PendingGuard {
    inner: Rc<RpcInner>,
    correlation_id: Option<u64>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some(id) = self.correlation_id {
            if self.inner.forget(id) {
                trace!("Request #{} abandoned by its caller", id);
            }
        }
    }
}

/// Future of one remote procedure call
pub struct RpcCall {
    proc_name: String,
    state: Rc<Cell<RpcState>>,
    future: Pin<Box<dyn Future<Output = Outcome>>>,
}

impl RpcCall {
    pub fn proc_name(&self) -> &str {
        &self.proc_name
    }

    pub fn state(&self) -> RpcState {
        self.state.get()
    }
}

impl Future for RpcCall {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.future.as_mut().poll(cx)
    }
}

impl fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcCall")
            .field("proc_name", &self.proc_name)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Client side of remote procedure calls
#[derive(Clone)]
pub struct RpcClient {
    inner: Rc<RpcInner>,
}

impl RpcClient {
    pub fn new(transport: Rc<dyn Transport>, config: RpcConfig) -> Self {
        Self {
            inner: Rc::new(RpcInner {
                pending: RefCell::new(HashMap::new()),
                next_correlation_id: Cell::new(1),
                transport,
                config,
            }),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Call `name` with the configured timeout
    pub fn call_remote_proc(&self, name: impl Into<String>, args: Vec<Value>) -> RpcCall {
        self.call_remote_proc_with(name, args, CallOptions::default())
    }

    pub fn call_remote_proc_with(
        &self,
        name: impl Into<String>,
        args: Vec<Value>,
        options: CallOptions,
    ) -> RpcCall {
        let proc_name = name.into();
        if options.exclusive {
            let superseded = self.cancel_pending_rpc(Some(&proc_name));
            if superseded > 0 {
                debug!(proc = %proc_name, "Superseded {} pending call(s)", superseded);
            }
        }

        let timeout = match options.timeout {
            Some(after) if after.is_zero() => None,
            Some(after) => Some(after),
            None => self.inner.config.timeout(),
        };
        let max_retries = self.inner.config.max_retries;

        let state = Rc::new(Cell::new(RpcState::Pending));
        let first = self.inner.dispatch(&proc_name, &args, &state, timeout);
        let mut guard = PendingGuard {
            inner: Rc::clone(&self.inner),
            correlation_id: first.as_ref().ok().map(|sent| sent.correlation_id),
        };

        let name = proc_name.clone();
        let call_state = Rc::clone(&state);
        let future = async move {
            let mut sent = match first {
                Ok(sent) => sent,
                Err(err) => return Err(err),
            };
            let mut retries = 0;

            loop {
                let received = match (timeout, sent.deadline) {
                    (Some(after), Some(deadline)) => {
                        match tokio::time::timeout_at(deadline, &mut sent.receiver).await {
                            Ok(Ok(outcome)) => Some(outcome),
                            Ok(Err(_)) if tokio::time::Instant::now() < deadline => None,
                            _ => {
                                if let Some(id) = guard.correlation_id.take() {
                                    guard.inner.forget(id);
                                }
                                if retries < max_retries {
                                    retries += 1;
                                    debug!(proc = %name, "Timed out, retry {}/{}", retries, max_retries);
                                    match guard.inner.dispatch(&name, &args, &call_state, timeout) {
                                        Ok(next) => {
                                            guard.correlation_id = Some(next.correlation_id);
                                            sent = next;
                                            continue;
                                        }
                                        Err(err) => return Err(err),
                                    }
                                }
                                call_state.set(RpcState::Rejected);
                                debug!(proc = %name, "Timed out after {:?}", after);
                                return Err(RpcError::Timeout {
                                    proc_name: name,
                                    after,
                                });
                            }
                        }
                    }
                    _ => (&mut sent.receiver).await.ok(),
                };

                guard.correlation_id = None;
                return received.unwrap_or(Err(RpcError::Disconnected { proc_name: name }));
            }
        };

        RpcCall {
            proc_name,
            state,
            future: Box::pin(future),
        }
    }

    /// Deliver a response; false when no pending call matches `correlation_id`
    pub fn resolve(&self, correlation_id: u64, outcome: Result<Value, String>) -> bool {
        let now = tokio::time::Instant::now();
        let expired = self
            .inner
            .pending
            .borrow()
            .get(&correlation_id)
            .is_some_and(|entry| entry.is_expired(now));
        if expired {
            trace!("Dropping response #{} past its deadline", correlation_id);
            return false;
        }

        let Some(entry) = self.inner.pending.borrow_mut().remove(&correlation_id) else {
            trace!("Dropping response #{} with no pending call", correlation_id);
            return false;
        };

        trace!(proc = %entry.proc_name, "Response #{} received", correlation_id);
        match outcome {
            Ok(value) => entry.settle(RpcState::Resolved, Ok(value)),
            Err(message) => {
                let proc_name = entry.proc_name.clone();
                entry.settle(RpcState::Rejected, Err(RpcError::Remote { proc_name, message }));
            }
        }
        true
    }

    /// Reject pending calls with [`RpcError::Cancelled`]; every call when `name` is `None`
    ///
    /// The peer is not told. Returns how many calls were cancelled.
    pub fn cancel_pending_rpc(&self, name: Option<&str>) -> usize {
        let cancelled = self.inner.drain(name);
        let count = cancelled.len();
        for entry in cancelled {
            let proc_name = entry.proc_name.clone();
            entry.settle(RpcState::Cancelled, Err(RpcError::Cancelled { proc_name }));
        }
        count
    }

    /// Reject every pending call with [`RpcError::Disconnected`]
    ///
    /// Calls already past their deadline still report [`RpcError::Timeout`].
    pub fn disconnect(&self) -> usize {
        let dropped = self.inner.drain(None);
        let count = dropped.len();
        for entry in dropped {
            let proc_name = entry.proc_name.clone();
            entry.settle(RpcState::Rejected, Err(RpcError::Disconnected { proc_name }));
        }
        // Dropping the senders wakes the expired calls into their timeout
        self.inner.pending.borrow_mut().clear();
        if count > 0 {
            debug!("Rejected {} pending call(s) on disconnect", count);
        }
        count
    }

    pub fn has_pending_rpc(&self, name: Option<&str>) -> bool {
        let now = tokio::time::Instant::now();
        self.inner
            .pending
            .borrow()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .any(|entry| name.is_none_or(|name| entry.proc_name == name))
    }

    pub fn pending_count(&self) -> usize {
        let now = tokio::time::Instant::now();
        self.inner
            .pending
            .borrow()
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Pending calls ordered by correlation id
    pub fn pending_calls(&self) -> Vec<PendingCallInfo> {
        let now = tokio::time::Instant::now();
        let mut calls: Vec<PendingCallInfo> = self
            .inner
            .pending
            .borrow()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(&correlation_id, entry)| PendingCallInfo {
                correlation_id,
                proc_name: entry.proc_name.clone(),
                created_at: entry.created_at,
            })
            .collect();
        calls.sort_by_key(|call| call.correlation_id);
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;

    fn client(timeout_ms: u64, max_retries: u32) -> (RpcClient, Rc<RecordingTransport>) {
        let transport = Rc::new(RecordingTransport::default());
        let config = RpcConfig {
            timeout_ms,
            max_retries,
        };
        (RpcClient::new(transport.clone(), config), transport)
    }

    fn request_ids(transport: &RecordingTransport) -> Vec<u64> {
        transport
            .take()
            .iter()
            .filter_map(|frame| frame.correlation_id())
            .collect()
    }

    #[tokio::test]
    async fn test_echo_resolves() {
        let (client, transport) = client(0, 0);
        let call = client.call_remote_proc("echo", vec![Value::from("hi")]);

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        let Frame::RpcRequest {
            correlation_id,
            name,
            args,
        } = &sent[0]
        else {
            panic!("expected a request, got {:?}", sent[0]);
        };
        assert_eq!(name, "echo");
        assert!(client.has_pending_rpc(Some("echo")));

        assert!(client.resolve(*correlation_id, Ok(args[0].clone())));
        assert_eq!(call.state(), RpcState::Resolved);
        assert_eq!(call.await, Ok(Value::from("hi")));
        assert!(!client.has_pending_rpc(None));
    }

    #[tokio::test]
    async fn test_cancel_then_late_response_dropped() {
        let (client, transport) = client(0, 0);
        let call = client.call_remote_proc("echo", vec![Value::Int(1)]);
        let id = request_ids(&transport)[0];

        assert_eq!(client.cancel_pending_rpc(Some("echo")), 1);
        assert_eq!(call.state(), RpcState::Cancelled);
        assert!(!client.resolve(id, Ok(Value::Int(1))));
        assert_eq!(
            call.await,
            Err(RpcError::Cancelled {
                proc_name: "echo".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let (client, transport) = client(0, 0);
        let first = client.call_remote_proc("sum", vec![Value::Int(1), Value::Int(2)]);
        let second = client.call_remote_proc("sum", vec![Value::Int(3), Value::Int(4)]);

        let ids = request_ids(&transport);
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);

        assert!(client.resolve(ids[1], Ok(Value::Int(7))));
        assert!(client.resolve(ids[0], Ok(Value::Int(3))));

        assert_eq!(first.await, Ok(Value::Int(3)));
        assert_eq!(second.await, Ok(Value::Int(7)));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let (client, _) = client(0, 0);
        let calls = vec![
            client.call_remote_proc("a", vec![]),
            client.call_remote_proc("b", vec![]),
            client.call_remote_proc("b", vec![]),
        ];
        assert_eq!(client.pending_count(), 3);

        assert_eq!(client.cancel_pending_rpc(None), 3);
        assert!(!client.has_pending_rpc(None));
        for call in calls {
            assert!(matches!(call.await, Err(RpcError::Cancelled { .. })));
        }
        assert_eq!(client.cancel_pending_rpc(None), 0);
    }

    #[tokio::test]
    async fn test_remote_error() {
        let (client, transport) = client(0, 0);
        let call = client.call_remote_proc("buy", vec![]);
        let id = request_ids(&transport)[0];

        client.resolve(id, Err("not enough money".to_string()));
        assert_eq!(
            call.await,
            Err(RpcError::Remote {
                proc_name: "buy".to_string(),
                message: "not enough money".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_drops_entry() {
        let (client, transport) = client(500, 0);
        let call = client.call_remote_proc("slow", vec![]);
        let id = request_ids(&transport)[0];

        let result = call.await;
        assert_eq!(
            result,
            Err(RpcError::Timeout {
                proc_name: "slow".to_string(),
                after: Duration::from_millis(500)
            })
        );
        assert!(!client.has_pending_rpc(None));
        assert!(!client.resolve(id, Ok(Value::Null)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_runs_from_dispatch() {
        let (client, transport) = client(500, 0);
        let call = client.call_remote_proc("slow", vec![]);
        let id = request_ids(&transport)[0];

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!client.has_pending_rpc(Some("slow")));
        assert_eq!(client.pending_count(), 0);
        assert!(!client.resolve(id, Ok(Value::Int(1))));

        assert!(matches!(call.await, Err(RpcError::Timeout { .. })));
        assert!(client.pending_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_after_deadline_reports_timeout() {
        let (client, _) = client(500, 0);
        let late = client.call_remote_proc("slow", vec![]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(client.disconnect(), 0);
        assert!(matches!(late.await, Err(RpcError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_uses_fresh_correlation_id() {
        let (client, transport) = client(100, 1);
        let local = tokio::task::LocalSet::new();

        local
            .run_until(async {
                let call = client.call_remote_proc("flaky", vec![]);
                let handle = tokio::task::spawn_local(call);

                tokio::time::sleep(Duration::from_millis(150)).await;
                let ids = request_ids(&transport);
                assert_eq!(ids.len(), 2);
                assert!(!client.resolve(ids[0], Ok(Value::Int(0))));
                assert!(client.resolve(ids[1], Ok(Value::Int(1))));

                assert_eq!(handle.await.unwrap(), Ok(Value::Int(1)));
            })
            .await;
    }

    #[tokio::test]
    async fn test_exclusive_call_supersedes_previous() {
        let (client, _) = client(0, 0);
        let old = client.call_remote_proc("aim", vec![]);
        let other = client.call_remote_proc("fire", vec![]);
        let new = client.call_remote_proc_with("aim", vec![], CallOptions::default().exclusive());

        assert!(matches!(old.await, Err(RpcError::Cancelled { .. })));
        assert_eq!(other.state(), RpcState::Pending);
        assert_eq!(new.state(), RpcState::Pending);

        let pending: Vec<String> = client
            .pending_calls()
            .into_iter()
            .map(|call| call.proc_name)
            .collect();
        assert_eq!(pending, vec!["fire", "aim"]);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_immediately() {
        let (client, transport) = client(0, 0);
        transport.close();

        let call = client.call_remote_proc("echo", vec![]);
        assert_eq!(call.state(), RpcState::Rejected);
        assert!(matches!(call.await, Err(RpcError::Transport(_))));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_and_dropped_calls() {
        let (client, _) = client(0, 0);
        let kept = client.call_remote_proc("a", vec![]);
        let dropped = client.call_remote_proc("b", vec![]);

        drop(dropped);
        assert_eq!(client.pending_count(), 1);

        assert_eq!(client.disconnect(), 1);
        assert!(matches!(kept.await, Err(RpcError::Disconnected { .. })));
    }
}
