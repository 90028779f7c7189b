//! # Request/Response Correlator
//!
//! Tracks in-flight requests and resolves each one exactly once, either with the
//! peer's response or with a local timeout.
//!
//! ## Frames
//! ```text
//! REQUEST   [u16 target][u32 requestId][request body]
//! RESPONSE  [u32 requestId][u8 status][response body if status == Success]
//! ```
//!
//! ## Exactly-once resolution
//! The pending map is the only shared state. Both resolution paths (a response
//! arriving through the tick, a timeout firing from the tick clock or a tokio
//! timer) start by removing the entry under the map's mutex; whoever removes it
//! invokes the callback, the other path finds nothing and drops silently.
//! Callbacks always run outside the lock.
//!
//! Every entry is stamped with the session it was created in. `reset` bumps the
//! session, so a tokio timer left over from before a restart can never expire a
//! request of the new session even though request ids restart at 1.
//!
//! ## Answering
//! A request handler answers with a [`Reply`], which carries either a success
//! body or another status. A deferred handler gets a [`Responder`] instead and
//! answers from a later tick.

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::core::{NetDeserialize, NetSerialize, Reader, Writer};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{
    is_reserved, ConnectionId, MessageId, RequestId, StatusCode, REQUEST, RESPONSE,
};
use crate::transport::DeliveryMethod;
use crate::utils::metrics::Metrics;

/// Context handed to a request handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestData {
    /// Connection that sent the request (0 when the server is the sender)
    pub sender: ConnectionId,
    pub request_id: RequestId,
    pub target: MessageId,
}

/// What a request callback receives
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub request_id: RequestId,
    pub target: MessageId,
    /// Peer the request was sent to (0 for the server)
    pub sender: ConnectionId,
    pub status: StatusCode,
    /// Decoded body; only present when `status == Success`
    pub body: Option<T>,
}

impl<T> Response<T> {
    pub fn is_success(&self) -> bool {
        self.status == StatusCode::Success
    }
}

/// A request handler's answer
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    /// `Success` with a response body
    Success(T),
    /// Any other status; the response carries no body
    Status(StatusCode),
}

impl<T: NetSerialize> Reply<T> {
    /// Status byte and encoded body of the RESPONSE frame
    pub(crate) fn encode(&self) -> Result<(StatusCode, Writer)> {
        let mut body = Writer::new();
        match self {
            Reply::Success(value) => {
                body.put(value)?;
                Ok((StatusCode::Success, body))
            }
            Reply::Status(StatusCode::Success) => Err(ProtocolError::InvalidState(
                constants::ERR_SUCCESS_WITHOUT_BODY,
            )),
            Reply::Status(status) => Ok((*status, body)),
        }
    }
}

/// Answers one request after its handler has returned.
///
/// Any endpoint of the role that received the request can send the answer.
/// A responder dropped without answering leaves the requester to time out.
#[must_use = "the requester waits until this responder answers or times out"]
pub struct Responder<T> {
    data: RequestData,
    answered: bool,
    _response: PhantomData<fn(&T)>,
}

impl<T> std::fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("data", &self.data)
            .field("answered", &self.answered)
            .finish()
    }
}

impl<T: NetSerialize> Responder<T> {
    pub(crate) fn new(data: RequestData) -> Self {
        Self {
            data,
            answered: false,
            _response: PhantomData,
        }
    }

    pub fn data(&self) -> RequestData {
        self.data
    }

    /// Answer with `Success` and `response`
    pub fn respond<E: Endpoint>(self, endpoint: &mut E, response: &T) -> Result<()> {
        let mut body = Writer::new();
        body.put(response)?;
        self.finish(endpoint, StatusCode::Success, body.data())
    }

    /// Answer with a status other than `Success`
    pub fn respond_status<E: Endpoint>(self, endpoint: &mut E, status: StatusCode) -> Result<()> {
        if status == StatusCode::Success {
            return Err(ProtocolError::InvalidState(
                constants::ERR_SUCCESS_WITHOUT_BODY,
            ));
        }
        self.finish(endpoint, status, &[])
    }

    pub fn reply<E: Endpoint>(self, endpoint: &mut E, reply: Reply<T>) -> Result<()> {
        let (status, body) = reply.encode()?;
        self.finish(endpoint, status, body.data())
    }

    fn finish<E: Endpoint>(mut self, endpoint: &mut E, status: StatusCode, body: &[u8]) -> Result<()> {
        self.answered = true;
        trace!(
            request_id = self.data.request_id,
            target = self.data.target,
            ?status,
            "Deferred request answered"
        );
        send_response(endpoint, self.data.sender, self.data.request_id, status, body)
    }
}

impl<T> Drop for Responder<T> {
    fn drop(&mut self) {
        if !self.answered {
            debug!(
                request_id = self.data.request_id,
                target = self.data.target,
                sender = self.data.sender,
                "Request dropped without an answer"
            );
        }
    }
}

/// How request timeouts are driven
#[derive(Debug, Clone, Default)]
pub enum TimeoutScheduler {
    /// Deadlines on the correlator's elapsed clock, advanced by `tick`
    #[default]
    Tick,
    /// A `tokio::time::sleep` task per request, spawned on the given runtime
    Tokio(Handle),
}

enum Outcome<'a> {
    Completed {
        sender: ConnectionId,
        status: StatusCode,
        body: &'a [u8],
    },
    TimedOut,
}

type Resolver = Box<dyn for<'a> FnOnce(Outcome<'a>) -> Result<()> + Send>;

fn resolver<F>(f: F) -> Resolver
where
    F: for<'a> FnOnce(Outcome<'a>) -> Result<()> + Send + 'static,
{
    Box::new(f)
}

struct PendingRequest {
    peer: ConnectionId,
    target: MessageId,
    session: u64,
    created_at: Duration,
    deadline: Option<Duration>,
    timer: Option<AbortHandle>,
    resolve: Resolver,
}

impl PendingRequest {
    fn stop_timer(&self) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
    }
}

type PendingMap = HashMap<RequestId, PendingRequest>;

#[derive(Debug, Clone, Copy)]
struct ResponseType {
    request: TypeId,
    response: TypeId,
    request_name: &'static str,
    response_name: &'static str,
}

/// In-flight request tracker for one role
pub struct Correlator {
    pending: Arc<Mutex<PendingMap>>,
    response_types: HashMap<MessageId, ResponseType>,
    next_id: RequestId,
    session: u64,
    elapsed: Duration,
    scheduler: TimeoutScheduler,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("next_id", &self.next_id)
            .field("session", &self.session)
            .field("elapsed", &self.elapsed)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl Correlator {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            response_types: HashMap::new(),
            next_id: 1,
            session: 0,
            elapsed: Duration::ZERO,
            scheduler: TimeoutScheduler::Tick,
            metrics,
        }
    }

    pub fn set_scheduler(&mut self, scheduler: TimeoutScheduler) {
        self.scheduler = scheduler;
    }

    pub fn scheduler(&self) -> &TimeoutScheduler {
        &self.scheduler
    }

    /// Time accumulated through `tick` since the last reset
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Declare the request and response types used with `target`
    pub fn register_response_handler<Req: 'static, Resp: 'static>(
        &mut self,
        target: MessageId,
    ) -> Result<()> {
        if is_reserved(target) {
            return Err(ProtocolError::ReservedMessageId(target));
        }
        if self.response_types.contains_key(&target) {
            return Err(ProtocolError::DuplicateHandler {
                kind: "response",
                id: target,
            });
        }
        self.response_types.insert(
            target,
            ResponseType {
                request: TypeId::of::<Req>(),
                response: TypeId::of::<Resp>(),
                request_name: type_name::<Req>(),
                response_name: type_name::<Resp>(),
            },
        );
        Ok(())
    }

    pub fn unregister_response_handler(&mut self, target: MessageId) -> bool {
        self.response_types.remove(&target).is_some()
    }

    /// Check the caller's types against the registration for `target`
    pub fn check_types<Req: 'static, Resp: 'static>(&self, target: MessageId) -> Result<()> {
        let registered = self
            .response_types
            .get(&target)
            .ok_or(ProtocolError::UnregisteredRequest(target))?;

        if registered.request != TypeId::of::<Req>() {
            return Err(ProtocolError::RequestTypeMismatch {
                id: target,
                expected: registered.request_name,
                actual: type_name::<Req>(),
            });
        }
        if registered.response != TypeId::of::<Resp>() {
            return Err(ProtocolError::RequestTypeMismatch {
                id: target,
                expected: registered.response_name,
                actual: type_name::<Resp>(),
            });
        }
        Ok(())
    }

    /// Allocate a request id and start tracking it.
    ///
    /// A zero `timeout` disables the timeout; the request then stays pending
    /// until a response arrives or the correlator is reset.
    pub fn create_request<Resp, F>(
        &mut self,
        peer: ConnectionId,
        target: MessageId,
        timeout: Duration,
        callback: F,
    ) -> Result<RequestId>
    where
        Resp: NetDeserialize + 'static,
        F: FnOnce(Response<Resp>) + Send + 'static,
    {
        let mut pending = lock(&self.pending)?;
        let request_id = allocate_id(&mut self.next_id, &pending);

        let resolve = resolver(move |outcome| {
            let response = match outcome {
                Outcome::Completed {
                    sender,
                    status,
                    body,
                } => {
                    let body = if status == StatusCode::Success {
                        Some(Reader::new(body).get::<Resp>()?)
                    } else {
                        None
                    };
                    Response {
                        request_id,
                        target,
                        sender,
                        status,
                        body,
                    }
                }
                Outcome::TimedOut => Response {
                    request_id,
                    target,
                    sender: peer,
                    status: StatusCode::Timeout,
                    body: None,
                },
            };
            callback(response);
            Ok(())
        });

        let (deadline, timer) = match (&self.scheduler, timeout.is_zero()) {
            (_, true) => (None, None),
            (TimeoutScheduler::Tick, false) => (Some(self.elapsed + timeout), None),
            (TimeoutScheduler::Tokio(handle), false) => {
                let map = Arc::clone(&self.pending);
                let metrics = Arc::clone(&self.metrics);
                let session = self.session;
                // the entry is inserted before this guard drops, so the timer always finds it
                let task = handle.spawn(async move {
                    tokio::time::sleep(timeout).await;
                    expire(&map, &metrics, request_id, session);
                });
                (None, Some(task.abort_handle()))
            }
        };

        pending.insert(
            request_id,
            PendingRequest {
                peer,
                target,
                session: self.session,
                created_at: self.elapsed,
                deadline,
                timer,
                resolve,
            },
        );
        drop(pending);

        self.metrics.request_created();
        trace!(request_id, target, timeout_ms = timeout.as_millis() as u64, "Request created");
        Ok(request_id)
    }

    /// Resolve a request with a received response.
    ///
    /// Returns `Ok(false)` when the request is unknown, already resolved or was
    /// sent to another peer; the response is dropped. A body that fails to
    /// decode is an error and the callback is not invoked.
    pub fn handle_response(
        &self,
        sender: ConnectionId,
        request_id: RequestId,
        status: StatusCode,
        body: &[u8],
    ) -> Result<bool> {
        let entry = {
            let mut pending = lock(&self.pending)?;
            match pending.get(&request_id).map(|entry| entry.peer) {
                Some(peer) if peer != sender => {
                    warn!(
                        request_id,
                        sender,
                        peer,
                        "Dropping response from a peer the request was not sent to"
                    );
                    return Ok(false);
                }
                Some(_) => pending.remove(&request_id),
                None => None,
            }
        };
        let Some(entry) = entry else {
            debug!(request_id, sender, "Dropping response for unknown or expired request");
            return Ok(false);
        };

        entry.stop_timer();
        self.metrics.request_completed();
        trace!(
            request_id,
            target = entry.target,
            ?status,
            latency_ms = self.elapsed.saturating_sub(entry.created_at).as_millis() as u64,
            "Response received"
        );
        (entry.resolve)(Outcome::Completed {
            sender,
            status,
            body,
        })?;
        Ok(true)
    }

    /// Stop tracking a request without invoking its callback
    pub fn cancel(&self, request_id: RequestId) -> bool {
        match lock(&self.pending) {
            Ok(mut pending) => pending
                .remove(&request_id)
                .map(|entry| entry.stop_timer())
                .is_some(),
            Err(_) => false,
        }
    }

    pub fn is_pending(&self, request_id: RequestId) -> bool {
        lock(&self.pending)
            .map(|pending| pending.contains_key(&request_id))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).map(|pending| pending.len()).unwrap_or(0)
    }

    /// Advance the elapsed clock and expire requests whose deadline passed.
    ///
    /// Returns how many requests timed out.
    pub fn tick(&mut self, elapsed: Duration) -> Result<usize> {
        self.advance(elapsed);
        self.expire_due()
    }

    /// Move the elapsed clock forward without expiring anything.
    ///
    /// Requests created after this call take their deadline from the advanced
    /// clock, so the frame they were created in does not count against them.
    pub fn advance(&mut self, elapsed: Duration) {
        self.elapsed += elapsed;
    }

    /// Time out every request whose deadline is at or before the clock.
    ///
    /// Returns how many requests timed out.
    pub fn expire_due(&mut self) -> Result<usize> {
        let now = self.elapsed;

        let mut expired: Vec<(Duration, RequestId, PendingRequest)> = {
            let mut pending = lock(&self.pending)?;
            let due: Vec<RequestId> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
                .map(|(id, _)| *id)
                .collect();
            due.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (entry.created_at, id, entry)))
                .collect()
        };
        expired.sort_by_key(|(created_at, id, _)| (*created_at, *id));

        let count = expired.len();
        for (_, request_id, entry) in expired {
            self.metrics.request_timed_out();
            debug!(request_id, target = entry.target, "Request timed out");
            if let Err(err) = (entry.resolve)(Outcome::TimedOut) {
                warn!(request_id, error = %err, "Timeout callback failed");
            }
        }
        Ok(count)
    }

    /// Forget every pending request without invoking callbacks and restart
    /// request ids at 1
    pub fn reset(&mut self) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.stop_timer();
        }
        if !drained.is_empty() {
            debug!(dropped = drained.len(), "Pending requests cleared");
        }
        drop(drained);

        self.session = self.session.wrapping_add(1);
        self.next_id = 1;
        self.elapsed = Duration::ZERO;
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        if let Ok(pending) = self.pending.lock() {
            for entry in pending.values() {
                entry.stop_timer();
            }
        }
    }
}

fn lock(pending: &Mutex<PendingMap>) -> Result<MutexGuard<'_, PendingMap>> {
    pending.lock().map_err(|_| ProtocolError::LockPoisoned)
}

/// Next free id, never 0
fn allocate_id(next_id: &mut RequestId, pending: &PendingMap) -> RequestId {
    loop {
        let id = *next_id;
        *next_id = next_id.wrapping_add(1).max(1);
        if id != 0 && !pending.contains_key(&id) {
            return id;
        }
    }
}

/// Tokio timer path: expire `request_id` if it is still pending in `session`
fn expire(pending: &Mutex<PendingMap>, metrics: &Metrics, request_id: RequestId, session: u64) {
    let entry = match pending.lock() {
        Ok(mut pending) => {
            if pending
                .get(&request_id)
                .is_some_and(|entry| entry.session == session)
            {
                pending.remove(&request_id)
            } else {
                None
            }
        }
        Err(_) => {
            warn!(request_id, "Pending request map poisoned; timeout skipped");
            None
        }
    };

    if let Some(entry) = entry {
        metrics.request_timed_out();
        debug!(request_id, target = entry.target, "Request timed out");
        if let Err(err) = (entry.resolve)(Outcome::TimedOut) {
            warn!(request_id, error = %err, "Timeout callback failed");
        }
    }
}

/// A role that can send frames and owns a correlator
pub trait Endpoint {
    fn correlator(&self) -> &Correlator;

    fn correlator_mut(&mut self) -> &mut Correlator;

    /// Frame `[id][body]` and send it to `peer` (ignored by the client)
    fn send_frame<F>(
        &mut self,
        peer: ConnectionId,
        id: MessageId,
        delivery: DeliveryMethod,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Writer) -> Result<()>;
}

/// Send a typed request to `peer`.
///
/// When `target` has no response handler registered, or the registration uses
/// other types, `callback` is invoked right away with `Unregistered` and the
/// registration error is returned.
pub fn send_request<E, Req, Resp, F>(
    endpoint: &mut E,
    peer: ConnectionId,
    target: MessageId,
    request: &Req,
    timeout: Duration,
    callback: F,
) -> Result<RequestId>
where
    E: Endpoint,
    Req: NetSerialize + 'static,
    Resp: NetDeserialize + 'static,
    F: FnOnce(Response<Resp>) + Send + 'static,
{
    if let Err(err) = endpoint.correlator().check_types::<Req, Resp>(target) {
        warn!(target, error = %err, "Request not sent");
        callback(Response {
            request_id: 0,
            target,
            sender: peer,
            status: StatusCode::Unregistered,
            body: None,
        });
        return Err(err);
    }

    let request_id = endpoint
        .correlator_mut()
        .create_request(peer, target, timeout, callback)?;

    let sent = endpoint.send_frame(peer, REQUEST, DeliveryMethod::Reliable, |writer| {
        writer.put_u16(target);
        writer.put_u32(request_id);
        writer.put(request)
    });
    if let Err(err) = sent {
        endpoint.correlator().cancel(request_id);
        return Err(err);
    }
    Ok(request_id)
}

/// Send a RESPONSE frame for `request_id` to `peer`
pub(crate) fn send_response<E: Endpoint>(
    endpoint: &mut E,
    peer: ConnectionId,
    request_id: RequestId,
    status: StatusCode,
    body: &[u8],
) -> Result<()> {
    endpoint.send_frame(peer, RESPONSE, DeliveryMethod::Reliable, |writer| {
        writer.put_u32(request_id);
        writer.put_u8(status.as_u8());
        writer.put_raw(body);
        Ok(())
    })
}

/// Handle the payload of a RESPONSE frame
pub fn receive_response<E: Endpoint>(
    endpoint: &mut E,
    sender: ConnectionId,
    reader: &mut Reader<'_>,
) -> Result<()> {
    let request_id = reader.get_u32()?;
    let status = StatusCode::from_u8(reader.get_u8()?)?;
    endpoint
        .correlator()
        .handle_response(sender, request_id, status, reader.get_remaining())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Log<T> = Arc<Mutex<Vec<Response<T>>>>;

    fn correlator() -> Correlator {
        Correlator::new(Arc::new(Metrics::new()))
    }

    fn recorder<T: Send + 'static>() -> (Log<T>, impl Fn() -> Box<dyn FnOnce(Response<T>) + Send>) {
        let log: Log<T> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move || {
            let sink = Arc::clone(&sink);
            Box::new(move |response: Response<T>| sink.lock().unwrap().push(response))
                as Box<dyn FnOnce(Response<T>) + Send>
        };
        (log, make)
    }

    fn body_of(value: i32) -> Vec<u8> {
        let mut writer = Writer::new();
        writer.put_i32(value);
        writer.to_vec()
    }

    #[test]
    fn test_ids_start_at_one_and_reset() {
        let mut correlator = correlator();
        let first = correlator
            .create_request::<i32, _>(0, 1, Duration::ZERO, |_| {})
            .unwrap();
        let second = correlator
            .create_request::<i32, _>(0, 1, Duration::ZERO, |_| {})
            .unwrap();
        assert_eq!((first, second), (1, 2));

        correlator.reset();
        assert_eq!(correlator.pending_count(), 0);
        let again = correlator
            .create_request::<i32, _>(0, 1, Duration::ZERO, |_| {})
            .unwrap();
        assert_eq!(again, 1);
    }

    #[test]
    fn test_id_allocation_skips_zero() {
        let mut next = RequestId::MAX;
        let pending = PendingMap::new();
        assert_eq!(allocate_id(&mut next, &pending), RequestId::MAX);
        assert_eq!(allocate_id(&mut next, &pending), 1);
    }

    #[test]
    fn test_response_resolves_once() {
        let mut correlator = correlator();
        let (log, make) = recorder::<i32>();
        let id = correlator
            .create_request(3, 10, Duration::from_secs(1), make())
            .unwrap();

        let body = body_of(-7);
        assert!(correlator
            .handle_response(3, id, StatusCode::Success, &body)
            .unwrap());
        assert!(!correlator
            .handle_response(3, id, StatusCode::Success, &body)
            .unwrap());
        assert_eq!(correlator.tick(Duration::from_secs(5)).unwrap(), 0);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, StatusCode::Success);
        assert_eq!(log[0].body, Some(-7));
        assert_eq!(log[0].sender, 3);
    }

    #[test]
    fn test_timeout_fires_at_deadline_once() {
        let mut correlator = correlator();
        let (log, make) = recorder::<i32>();
        let id = correlator
            .create_request(0, 10, Duration::from_millis(100), make())
            .unwrap();

        assert_eq!(correlator.tick(Duration::from_millis(99)).unwrap(), 0);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(correlator.tick(Duration::from_millis(1)).unwrap(), 1);

        // late response is dropped
        assert!(!correlator
            .handle_response(0, id, StatusCode::Success, &body_of(1))
            .unwrap());

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, StatusCode::Timeout);
        assert_eq!(log[0].body, None);
    }

    #[test]
    fn test_request_created_after_advance_gets_full_timeout() {
        let mut correlator = correlator();
        let (log, make) = recorder::<i32>();
        correlator.advance(Duration::from_millis(10));
        correlator
            .create_request(0, 10, Duration::from_millis(50), make())
            .unwrap();
        assert_eq!(correlator.expire_due().unwrap(), 0);

        for _ in 0..4 {
            assert_eq!(correlator.tick(Duration::from_millis(10)).unwrap(), 0);
        }
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(correlator.tick(Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(log.lock().unwrap()[0].status, StatusCode::Timeout);
    }

    #[test]
    fn test_response_from_other_peer_is_ignored() {
        let mut correlator = correlator();
        let (log, make) = recorder::<i32>();
        let id = correlator
            .create_request(1, 10, Duration::ZERO, make())
            .unwrap();

        let body = body_of(4);
        assert!(!correlator
            .handle_response(2, id, StatusCode::Success, &body)
            .unwrap());
        assert!(correlator.is_pending(id));
        assert!(log.lock().unwrap().is_empty());

        assert!(correlator
            .handle_response(1, id, StatusCode::Success, &body)
            .unwrap());
        assert_eq!(log.lock().unwrap()[0].body, Some(4));
    }

    #[test]
    fn test_reply_encoding() {
        let (status, body) = Reply::Success(-7i32).encode().unwrap();
        assert_eq!(status, StatusCode::Success);
        assert_eq!(body.data(), body_of(-7).as_slice());

        let (status, body) = Reply::<i32>::Status(StatusCode::Timeout).encode().unwrap();
        assert_eq!(status, StatusCode::Timeout);
        assert!(body.data().is_empty());

        assert!(matches!(
            Reply::<i32>::Status(StatusCode::Success).encode(),
            Err(ProtocolError::InvalidState(_))
        ));
    }

    #[test]
    fn test_unregistered_status_has_no_body() {
        let mut correlator = correlator();
        let (log, make) = recorder::<i32>();
        let id = correlator
            .create_request(0, 10, Duration::ZERO, make())
            .unwrap();
        correlator
            .handle_response(0, id, StatusCode::Unregistered, &[])
            .unwrap();
        assert_eq!(log.lock().unwrap()[0].status, StatusCode::Unregistered);
        assert_eq!(log.lock().unwrap()[0].body, None);
    }

    #[test]
    fn test_malformed_body_is_error() {
        let mut correlator = correlator();
        let (log, make) = recorder::<i32>();
        let id = correlator
            .create_request(0, 10, Duration::ZERO, make())
            .unwrap();
        assert!(correlator
            .handle_response(0, id, StatusCode::Success, &[1, 2])
            .is_err());
        assert!(log.lock().unwrap().is_empty());
        assert!(!correlator.is_pending(id));
    }

    #[test]
    fn test_reset_drops_callbacks() {
        let mut correlator = correlator();
        let (log, make) = recorder::<i32>();
        correlator
            .create_request(0, 10, Duration::from_millis(10), make())
            .unwrap();
        correlator.reset();
        correlator.tick(Duration::from_secs(1)).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_type_registration() {
        let mut correlator = correlator();
        assert!(matches!(
            correlator.check_types::<i32, i32>(5),
            Err(ProtocolError::UnregisteredRequest(5))
        ));

        correlator.register_response_handler::<i32, u64>(5).unwrap();
        assert!(correlator.check_types::<i32, u64>(5).is_ok());
        assert!(matches!(
            correlator.check_types::<u8, u64>(5),
            Err(ProtocolError::RequestTypeMismatch { id: 5, .. })
        ));
        assert!(matches!(
            correlator.register_response_handler::<i32, u64>(5),
            Err(ProtocolError::DuplicateHandler { kind: "response", id: 5 })
        ));
        assert!(matches!(
            correlator.register_response_handler::<i32, u64>(REQUEST),
            Err(ProtocolError::ReservedMessageId(_))
        ));
        assert!(correlator.unregister_response_handler(5));
    }

    #[tokio::test]
    async fn test_tokio_timeout_fires() {
        let mut correlator = correlator();
        correlator.set_scheduler(TimeoutScheduler::Tokio(Handle::current()));
        let (log, make) = recorder::<i32>();
        correlator
            .create_request(0, 10, Duration::from_millis(20), make())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(correlator.pending_count(), 0);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, StatusCode::Timeout);
    }

    #[tokio::test]
    async fn test_stale_timer_ignores_new_session() {
        let mut correlator = correlator();
        correlator.set_scheduler(TimeoutScheduler::Tokio(Handle::current()));
        let (log, make) = recorder::<i32>();
        correlator
            .create_request(0, 10, Duration::from_millis(20), make())
            .unwrap();
        correlator.reset();

        let id = correlator
            .create_request(0, 10, Duration::ZERO, make())
            .unwrap();
        assert_eq!(id, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(correlator.is_pending(1));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_response_and_timeout_race_resolve_once() {
        let mut correlator = correlator();
        correlator.set_scheduler(TimeoutScheduler::Tokio(Handle::current()));

        let counters: Vec<Arc<AtomicUsize>> =
            (0..200).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut ids = Vec::new();
        for counter in &counters {
            let counter = Arc::clone(counter);
            let id = correlator
                .create_request::<i32, _>(0, 10, Duration::from_millis(1), move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            ids.push(id);
        }

        let body = body_of(5);
        for id in ids {
            correlator
                .handle_response(0, id, StatusCode::Success, &body)
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        for counter in &counters {
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }
}
