//! Matching signer responses to outstanding requests.
//!
//! The correlator is owned by the engine driver task, which is the only
//! place it is mutated. Callers on other tasks hold the
//! [PendingReceiver] half and never touch the table directly.

use crate::rpc::*;
use crate::*;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Default call deadline.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// What an awaiting caller eventually receives.
pub type CallOutcome = Result<RpcResponse, RpcError>;

/// The awaitable half of a registered call.
pub type PendingReceiver = oneshot::Receiver<CallOutcome>;

/// A registered call awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    /// The request as sent.
    pub request: RpcRequest,
    /// When the call times out.
    pub deadline: Instant,
    waiter: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn resolve(self, outcome: CallOutcome) {
        // the caller may have stopped waiting
        let _ = self.waiter.send(outcome);
    }
}

/// Result of feeding a response to [Correlator::dispatch].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A pending call was resolved with the response.
    Fulfilled(RpcMethod),
    /// No call was waiting on that id: unknown, duplicate or late.
    Unmatched,
}

/// Far enough ahead to never fire, near enough to never overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + timeout`, saturating to a far future deadline.
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

fn new_request_id() -> String {
    nanoid::nanoid!()
}

/// Table of calls in flight, keyed by request id.
pub struct Correlator {
    pending: HashMap<String, PendingCall>,
    default_timeout: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_RPC_TIMEOUT)
    }
}

impl Correlator {
    /// A correlator applying `default_timeout` to calls without their own.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            default_timeout,
        }
    }

    /// Allocate an id, register the call and return the request to send
    /// along with the receiver the caller awaits.
    pub fn send(
        &mut self,
        method: RpcMethod,
        params: Vec<String>,
        timeout: Option<Duration>,
        now: Instant,
    ) -> (RpcRequest, PendingReceiver) {
        let mut id = new_request_id();
        while self.pending.contains_key(&id) {
            id = new_request_id();
        }
        let request = RpcRequest {
            id: id.clone(),
            method,
            params,
        };
        let (waiter, receiver) = oneshot::channel();
        let deadline =
            deadline_after(now, timeout.unwrap_or(self.default_timeout));
        trace!(%id, %method, "register rpc call");
        self.pending.insert(
            id,
            PendingCall {
                request: request.clone(),
                deadline,
                waiter,
            },
        );
        (request, receiver)
    }

    /// Resolve the call matching `response.id`, if one is still waiting.
    pub fn dispatch(&mut self, response: RpcResponse) -> DispatchOutcome {
        match self.pending.remove(&response.id) {
            Some(call) => {
                let method = call.request.method;
                trace!(id = %response.id, %method, "rpc call fulfilled");
                call.resolve(Ok(response));
                DispatchOutcome::Fulfilled(method)
            }
            None => {
                debug!(id = %response.id, "discarding unmatched rpc response");
                DispatchOutcome::Unmatched
            }
        }
    }

    /// Resolve every call whose deadline is at or before `now` with
    /// [RpcError::Timeout]. Returns how many expired.
    pub fn expire_overdue(&mut self, now: Instant) -> usize {
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in overdue.iter() {
            if let Some(call) = self.pending.remove(id) {
                debug!(
                    %id,
                    method = %call.request.method,
                    "rpc call timed out"
                );
                call.resolve(Err(RpcError::Timeout));
            }
        }
        overdue.len()
    }

    /// Resolve one call with `err`. False if it was not pending.
    pub fn fail(&mut self, id: &str, err: RpcError) -> bool {
        match self.pending.remove(id) {
            Some(call) => {
                call.resolve(Err(err));
                true
            }
            None => false,
        }
    }

    /// Resolve one call with [RpcError::Cancelled].
    pub fn cancel(&mut self, id: &str) -> bool {
        self.fail(id, RpcError::Cancelled)
    }

    /// Resolve every pending call with `err`.
    pub fn fail_all(&mut self, err: RpcError) {
        for (_, call) in self.pending.drain() {
            call.resolve(Err(err.clone()));
        }
    }

    /// Resolve every pending call with [RpcError::Cancelled].
    pub fn cancel_all(&mut self) {
        self.fail_all(RpcError::Cancelled)
    }

    /// The earliest deadline among pending calls.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|call| call.deadline).min()
    }

    /// The request registered under `id`.
    pub fn get(&self, id: &str) -> Option<&RpcRequest> {
        self.pending.get(id).map(|call| &call.request)
    }

    /// Number of calls in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if no call is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
