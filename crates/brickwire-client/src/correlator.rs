//! Request/response correlation.
//!
//! Every request that expects a response gets a sequence number from a
//! small cyclic counter (1..=15) and an entry in the pending table. The read
//! loop calls [`Correlator::route`] for each inbound packet; a response
//! whose sequence number, UID and function ID match an entry resumes the
//! waiting caller. Packets with sequence number 0 are unsolicited and are
//! handed back for callback dispatch.
//!
//! At most one entry exists per sequence number. A semaphore with one
//! permit per number makes callers wait for a free number instead of
//! failing.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use brickwire_protocol::{MAX_SEQUENCE_NUMBER, Packet, Uid};
use bytes::Bytes;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::transport::PacketWriter;

/// A request to send through the [`Correlator`].
#[derive(Debug, Clone)]
pub struct Request {
    pub uid: u32,
    pub function_id: u8,
    pub payload: Bytes,
    pub response_expected: bool,
    /// Payload length a successful response must have.
    pub expected_response_length: Option<usize>,
    /// Overrides the connection timeout.
    pub timeout: Option<Duration>,
}

impl Request {
    /// Creates a request with an empty payload that expects a response.
    pub fn new(uid: u32, function_id: u8) -> Self {
        Self {
            uid,
            function_id,
            payload: Bytes::new(),
            response_expected: true,
            expected_response_length: None,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    #[must_use]
    pub fn with_response_expected(mut self, response_expected: bool) -> Self {
        self.response_expected = response_expected;
        self
    }

    #[must_use]
    pub fn expect_response_length(mut self, length: usize) -> Self {
        self.expected_response_length = Some(length);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of [`Correlator::route`].
#[derive(Debug)]
pub enum Routed {
    /// Unsolicited packet, to be dispatched to callbacks.
    Callback(Packet),
    /// Resumed a waiting caller.
    Delivered,
    /// No caller was waiting for this packet.
    Dropped,
}

struct PendingRequest {
    id: u64,
    uid: u32,
    function_id: u8,
    reply: oneshot::Sender<ClientResult<Packet>>,
    _permit: OwnedSemaphorePermit,
}

struct PendingTable {
    entries: HashMap<u8, PendingRequest>,
    next_sequence: u8,
    next_id: u64,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_sequence: 1,
            next_id: 0,
        }
    }

    fn allocate(&mut self) -> Option<u8> {
        for _ in 0..MAX_SEQUENCE_NUMBER {
            let candidate = self.next_sequence;
            self.next_sequence = if candidate >= MAX_SEQUENCE_NUMBER {
                1
            } else {
                candidate + 1
            };
            if !self.entries.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Matches responses to outstanding requests.
pub struct Correlator {
    table: Mutex<PendingTable>,
    slots: Arc<Semaphore>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(PendingTable::new()),
            slots: Arc::new(Semaphore::new(MAX_SEQUENCE_NUMBER as usize)),
        }
    }

    /// Sends a request and waits for its response payload.
    ///
    /// Requests without `response_expected` go out with sequence number 0
    /// and return an empty payload as soon as they are written.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Timeout`] if no response arrives before the deadline
    /// - [`ClientError::ConnectionLost`] if [`Correlator::fail_all`] runs first
    /// - [`ClientError::Device`] if the response carries a nonzero error code
    /// - [`ClientError::WrongResponseLength`] if the payload size is off
    pub async fn call<W: PacketWriter>(
        &self,
        writer: &W,
        request: Request,
        default_timeout: Duration,
    ) -> ClientResult<Bytes> {
        let deadline = Instant::now() + request.timeout.unwrap_or(default_timeout);

        if !request.response_expected {
            let packet = Packet::new(request.uid, request.function_id, 0, false, request.payload)?;
            send_before(writer, &packet, deadline).await?;
            return Ok(Bytes::new());
        }

        let permit = match timeout_at(deadline, self.slots.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ClientError::ConnectionLost),
            Err(_) => return Err(ClientError::timeout(request.uid, request.function_id)),
        };

        let (reply, response) = oneshot::channel();
        let pending = {
            let mut table = self.lock();
            let sequence_number = table.allocate().ok_or_else(|| {
                ClientError::Io(io::Error::other("no free sequence number"))
            })?;
            let id = table.next_id;
            table.next_id += 1;
            table.entries.insert(
                sequence_number,
                PendingRequest {
                    id,
                    uid: request.uid,
                    function_id: request.function_id,
                    reply,
                    _permit: permit,
                },
            );
            PendingGuard {
                correlator: self,
                sequence_number,
                id,
            }
        };

        let packet = Packet::new(
            request.uid,
            request.function_id,
            pending.sequence_number,
            true,
            request.payload,
        )?;
        send_before(writer, &packet, deadline).await?;

        debug!(
            uid = %Uid::new(request.uid),
            function_id = request.function_id,
            sequence_number = pending.sequence_number,
            "request sent"
        );

        let packet = match timeout_at(deadline, response).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(ClientError::ConnectionLost),
            Err(_) => {
                debug!(
                    uid = %Uid::new(request.uid),
                    function_id = request.function_id,
                    sequence_number = pending.sequence_number,
                    "request timed out"
                );
                return Err(ClientError::timeout(request.uid, request.function_id));
            }
        };
        drop(pending);

        if !packet.error_code().is_ok() {
            return Err(ClientError::device(
                request.uid,
                request.function_id,
                packet.error_code(),
            ));
        }

        if let Some(expected) = request.expected_response_length
            && packet.payload.len() != expected
        {
            return Err(ClientError::WrongResponseLength {
                function_id: request.function_id,
                expected,
                received: packet.payload.len(),
            });
        }

        Ok(packet.payload)
    }

    /// Routes an inbound packet.
    pub fn route(&self, packet: Packet) -> Routed {
        let sequence_number = packet.sequence_number();
        if sequence_number == 0 {
            return Routed::Callback(packet);
        }

        let mut table = self.lock();
        let matches = table.entries.get(&sequence_number).is_some_and(|entry| {
            entry.uid == packet.uid() && entry.function_id == packet.function_id()
        });

        if !matches {
            debug!(
                uid = %Uid::new(packet.uid()),
                function_id = packet.function_id(),
                sequence_number,
                "dropping response without pending request"
            );
            return Routed::Dropped;
        }

        match table.entries.remove(&sequence_number) {
            Some(entry) => {
                // the caller may have given up between lookup and send
                let _ = entry.reply.send(Ok(packet));
                Routed::Delivered
            }
            None => Routed::Dropped,
        }
    }

    /// Fails every outstanding request with [`ClientError::ConnectionLost`].
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = self.lock().entries.drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.reply.send(Err(ClientError::ConnectionLost));
        }
        if count > 0 {
            debug!(count, "failed pending requests");
        }
        count
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        // a panic while holding the lock cannot leave the table inconsistent
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Writes `packet`, giving up at `deadline` if the socket stays blocked.
async fn send_before<W: PacketWriter>(
    writer: &W,
    packet: &Packet,
    deadline: Instant,
) -> ClientResult<()> {
    match timeout_at(deadline, writer.send(packet)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(
                uid = %Uid::new(packet.uid()),
                function_id = packet.function_id(),
                "request could not be written in time"
            );
            Err(ClientError::timeout(packet.uid(), packet.function_id()))
        }
    }
}

/// Removes a pending entry when its caller stops waiting.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    sequence_number: u8,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut table = self.correlator.lock();
        if table
            .entries
            .get(&self.sequence_number)
            .is_some_and(|entry| entry.id == self.id)
        {
            table.entries.remove(&self.sequence_number);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use brickwire_protocol::ErrorCode;

    use super::*;

    /// A socket whose send buffer never drains.
    struct StalledWriter;

    impl PacketWriter for StalledWriter {
        fn send(&self, _packet: &Packet) -> impl Future<Output = ClientResult<()>> + Send {
            std::future::pending()
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        sent: Mutex<Vec<Packet>>,
        fail: bool,
    }

    impl RecordingWriter {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<Packet> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl PacketWriter for RecordingWriter {
        fn send(&self, packet: &Packet) -> impl Future<Output = ClientResult<()>> + Send {
            let result = if self.fail {
                Err(ClientError::Io(io::Error::other("broken pipe")))
            } else {
                self.sent.lock().unwrap().push(packet.clone());
                Ok(())
            };
            std::future::ready(result)
        }
    }

    fn response_to(request: &Packet, payload: Vec<u8>) -> Packet {
        Packet::new(
            request.uid(),
            request.function_id(),
            request.sequence_number(),
            true,
            payload,
        )
        .unwrap()
    }

    async fn wait_for_sent(writer: &RecordingWriter, count: usize) -> Vec<Packet> {
        loop {
            let sent = writer.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::task::yield_now().await;
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn sequence_numbers_cycle_and_skip_in_use() {
        let mut table = PendingTable::new();
        let first: Vec<u8> = (0..15).filter_map(|_| table.allocate()).collect();
        assert_eq!(first, (1..=15).collect::<Vec<u8>>());
        assert_eq!(table.allocate(), Some(1));

        let semaphore = Arc::new(Semaphore::new(2));
        for sequence_number in [2u8, 3] {
            let (reply, _) = oneshot::channel();
            table.entries.insert(
                sequence_number,
                PendingRequest {
                    id: 0,
                    uid: 1,
                    function_id: 1,
                    reply,
                    _permit: semaphore.clone().try_acquire_owned().unwrap(),
                },
            );
        }
        assert_eq!(table.allocate(), Some(4));
    }

    #[tokio::test]
    async fn concurrent_calls_resume_on_their_own_response() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::default();

        let first = correlator.call(&writer, Request::new(10, 1), TIMEOUT);
        let second = correlator.call(&writer, Request::new(20, 2), TIMEOUT);
        let responder = async {
            let sent = wait_for_sent(&writer, 2).await;
            // answer in reverse order
            assert!(matches!(
                correlator.route(response_to(&sent[1], vec![2])),
                Routed::Delivered
            ));
            assert!(matches!(
                correlator.route(response_to(&sent[0], vec![1])),
                Routed::Delivered
            ));
        };

        let (first, second, ()) = tokio::join!(first, second, responder);
        assert_eq!(first.unwrap().as_ref(), &[1]);
        assert_eq!(second.unwrap().as_ref(), &[2]);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_and_frees_its_entry() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::default();

        let request = Request::new(5, 7).with_timeout(Duration::from_millis(100));
        let result = correlator.call(&writer, request, TIMEOUT).await;

        assert!(matches!(
            result,
            Err(ClientError::Timeout { function_id: 7, .. })
        ));
        assert_eq!(correlator.pending_count(), 0);

        // a late response is not mistaken for a newer request
        let late = response_to(&writer.sent()[0], vec![]);
        assert!(matches!(correlator.route(late), Routed::Dropped));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_write_still_honours_the_deadline() {
        let correlator = Correlator::new();
        let started = Instant::now();

        let request = Request::new(5, 1).with_timeout(Duration::from_millis(200));
        let result = correlator.call(&StalledWriter, request, TIMEOUT).await;

        assert!(matches!(
            result,
            Err(ClientError::Timeout { function_id: 1, .. })
        ));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200) && waited < Duration::from_millis(250));
        assert_eq!(correlator.pending_count(), 0);

        let request = Request::new(5, 2)
            .with_response_expected(false)
            .with_timeout(Duration::from_millis(50));
        let result = correlator.call(&StalledWriter, request, TIMEOUT).await;
        assert!(matches!(
            result,
            Err(ClientError::Timeout { function_id: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_sequence_number_is_reusable() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::default();

        for _ in 0..MAX_SEQUENCE_NUMBER {
            let request = Request::new(5, 7).with_timeout(Duration::from_millis(10));
            let _ = correlator.call(&writer, request, TIMEOUT).await;
        }

        let next = correlator.call(&writer, Request::new(5, 8), TIMEOUT);
        let responder = async {
            let sent = wait_for_sent(&writer, MAX_SEQUENCE_NUMBER as usize + 1).await;
            let last = sent.last().unwrap();
            assert_eq!(last.sequence_number(), 1);
            correlator.route(response_to(last, vec![9]));
        };

        let (result, ()) = tokio::join!(next, responder);
        assert_eq!(result.unwrap().as_ref(), &[9]);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_pending_call() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::default();

        let calls = async {
            tokio::join!(
                correlator.call(&writer, Request::new(1, 1), TIMEOUT),
                correlator.call(&writer, Request::new(2, 1), TIMEOUT),
                correlator.call(&writer, Request::new(3, 1), TIMEOUT),
            )
        };
        let teardown = async {
            wait_for_sent(&writer, 3).await;
            assert_eq!(correlator.fail_all(), 3);
        };

        let ((a, b, c), ()) = tokio::join!(calls, teardown);
        for result in [a, b, c] {
            assert!(matches!(result, Err(ClientError::ConnectionLost)));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_uses_sequence_zero() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::default();

        let request = Request::new(9, 3)
            .with_payload(vec![1, 2])
            .with_response_expected(false);
        let payload = correlator.call(&writer, request, TIMEOUT).await.unwrap();

        assert!(payload.is_empty());
        let sent = writer.sent();
        assert_eq!(sent[0].sequence_number(), 0);
        assert!(!sent[0].header.response_expected);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn device_error_code_is_surfaced() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::default();

        let call = correlator.call(&writer, Request::new(4, 12), TIMEOUT);
        let responder = async {
            let sent = wait_for_sent(&writer, 1).await;
            let response =
                response_to(&sent[0], vec![]).with_error_code(ErrorCode::FunctionNotSupported);
            correlator.route(response);
        };

        let (result, ()) = tokio::join!(call, responder);
        assert!(matches!(
            result,
            Err(ClientError::Device {
                function_id: 12,
                code: ErrorCode::FunctionNotSupported,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn wrong_response_length_is_rejected() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::default();

        let call = correlator.call(
            &writer,
            Request::new(4, 1).expect_response_length(4),
            TIMEOUT,
        );
        let responder = async {
            let sent = wait_for_sent(&writer, 1).await;
            correlator.route(response_to(&sent[0], vec![1, 2]));
        };

        let (result, ()) = tokio::join!(call, responder);
        assert!(matches!(
            result,
            Err(ClientError::WrongResponseLength {
                expected: 4,
                received: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn response_from_other_device_is_dropped() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::default();

        let call = correlator.call(&writer, Request::new(4, 1), TIMEOUT);
        let responder = async {
            let sent = wait_for_sent(&writer, 1).await;
            let stray = Packet::new(99, 1, sent[0].sequence_number(), true, Vec::new()).unwrap();
            assert!(matches!(correlator.route(stray), Routed::Dropped));
            assert_eq!(correlator.pending_count(), 1);
            correlator.route(response_to(&sent[0], vec![5]));
        };

        let (result, ()) = tokio::join!(call, responder);
        assert_eq!(result.unwrap().as_ref(), &[5]);
    }

    #[test]
    fn sequence_zero_is_a_callback() {
        let correlator = Correlator::new();
        let packet = Packet::new(3, 4, 0, false, vec![1]).unwrap();
        assert!(matches!(correlator.route(packet), Routed::Callback(_)));
    }

    #[tokio::test]
    async fn failed_write_leaves_no_entry() {
        let correlator = Correlator::new();
        let writer = RecordingWriter::failing();

        let result = correlator.call(&writer, Request::new(1, 1), TIMEOUT).await;
        assert!(matches!(result, Err(ClientError::Io(_))));
        assert_eq!(correlator.pending_count(), 0);
    }
}
