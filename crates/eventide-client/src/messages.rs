//! Payload message types for the Eventide TCP protocol.
//!
//! Every command pair has a request and/or response body defined here.
//! Bodies are serialized with bincode for efficient wire encoding and ride
//! inside a package's `data` field.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClientError, Result};

/// Serialize a payload body to bytes using bincode.
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Bytes> {
    bincode::serialize(msg)
        .map(Bytes::from)
        .map_err(|e| ClientError::Serialization(e.to_string()))
}

/// Deserialize a payload body using bincode.
pub fn decode_payload<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data).map_err(|e| ClientError::Serialization(e.to_string()))
}

// ============================================================================
// Events
// ============================================================================

/// An event supplied by the caller for appending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    /// Caller-assigned id, used by the server for idempotent writes.
    pub event_id: Uuid,
    /// Application event type.
    pub event_type: String,
    /// Whether `data` is JSON (affects server-side projections only).
    pub is_json: bool,
    /// Event body.
    pub data: Vec<u8>,
    /// Event metadata.
    pub metadata: Vec<u8>,
}

impl NewEvent {
    /// Creates an event with a fresh id.
    pub fn new(event_type: impl Into<String>, is_json: bool, data: Vec<u8>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            is_json,
            data,
            metadata: Vec::new(),
        }
    }
}

/// An event as stored by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Stream the event belongs to.
    pub event_stream_id: String,
    /// Server-assigned id.
    pub event_id: Uuid,
    /// Position of the event within its stream.
    pub event_number: i64,
    /// Application event type.
    pub event_type: String,
    /// Whether the body is JSON.
    pub is_json: bool,
    /// Event body.
    pub data: Vec<u8>,
    /// Event metadata.
    pub metadata: Vec<u8>,
    /// Creation time, milliseconds since the UNIX epoch.
    pub created_epoch_ms: i64,
}

/// An event plus the link event that resolved to it, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEvent {
    /// The target event.
    pub event: Option<RecordedEvent>,
    /// The link event, when the read resolved a link.
    pub link: Option<RecordedEvent>,
    /// Commit position in $all, when known.
    pub commit_position: Option<i64>,
}

impl ResolvedEvent {
    /// The event as it appeared in the stream that was read: the link when
    /// present, the target otherwise.
    pub fn original_event(&self) -> Option<&RecordedEvent> {
        self.link.as_ref().or(self.event.as_ref())
    }

    /// Event number of the original event.
    pub fn original_event_number(&self) -> Option<i64> {
        self.original_event().map(|e| e.event_number)
    }
}

/// A position in the $all stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    /// Commit position.
    pub commit: i64,
    /// Prepare position.
    pub prepare: i64,
}

impl Position {
    /// The beginning of the $all stream.
    pub const START: Position = Position {
        commit: 0,
        prepare: 0,
    };

    /// The current end of the $all stream.
    pub const END: Position = Position {
        commit: -1,
        prepare: -1,
    };
}

// ============================================================================
// Write operations (0x82..0x8B)
// ============================================================================

/// Outcome of a write-family operation as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    /// The write was committed.
    Success,
    /// The prepare phase timed out; safe to retry.
    PrepareTimeout,
    /// The commit phase timed out; safe to retry.
    CommitTimeout,
    /// Forwarding to the leader timed out; safe to retry.
    ForwardTimeout,
    /// The stream version did not match the expectation.
    WrongExpectedVersion,
    /// The stream has been deleted.
    StreamDeleted,
    /// The write was part of an invalid transaction.
    InvalidTransaction,
    /// The caller is not allowed to write the stream.
    AccessDenied,
}

/// Append a batch of events to a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEvents {
    /// Target stream.
    pub event_stream_id: String,
    /// Expected stream version; see [`ExpectedVersion`].
    pub expected_version: i64,
    /// Events to append.
    pub events: Vec<NewEvent>,
    /// Fail with NotHandled(NotLeader) rather than forwarding.
    pub require_leader: bool,
}

/// Result of an append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteEventsCompleted {
    /// Outcome.
    pub result: OperationResult,
    /// Server-supplied detail for failures.
    pub message: Option<String>,
    /// Number of the first appended event.
    pub first_event_number: i64,
    /// Number of the last appended event.
    pub last_event_number: i64,
    /// Log position of the commit, when successful.
    pub position: Option<Position>,
}

/// Soft- or hard-delete a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteStream {
    /// Target stream.
    pub event_stream_id: String,
    /// Expected stream version.
    pub expected_version: i64,
    /// Fail with NotHandled(NotLeader) rather than forwarding.
    pub require_leader: bool,
    /// Tombstone the stream permanently instead of soft-deleting.
    pub hard_delete: bool,
}

/// Result of a stream deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteStreamCompleted {
    /// Outcome.
    pub result: OperationResult,
    /// Server-supplied detail for failures.
    pub message: Option<String>,
    /// Log position of the delete, when successful.
    pub position: Option<Position>,
}

// ============================================================================
// Read operations (0xB0..0xB9)
// ============================================================================

/// Read a single event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadEvent {
    /// Target stream.
    pub event_stream_id: String,
    /// Event number to read; -1 reads the last event.
    pub event_number: i64,
    /// Resolve link events to their targets.
    pub resolve_link_tos: bool,
    /// Fail with NotHandled(NotLeader) rather than forwarding.
    pub require_leader: bool,
}

/// Outcome of a single-event read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadEventResult {
    /// Event found.
    Success,
    /// Stream exists but the event does not.
    NotFound,
    /// Stream does not exist.
    NoStream,
    /// Stream has been deleted.
    StreamDeleted,
    /// Unclassified server failure.
    Error,
    /// Caller may not read the stream.
    AccessDenied,
}

/// Result of a single-event read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadEventCompleted {
    /// Outcome.
    pub result: ReadEventResult,
    /// The event, when found.
    pub event: Option<ResolvedEvent>,
    /// Server-supplied detail for failures.
    pub error: Option<String>,
}

/// Outcome of a stream-slice read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadStreamResult {
    /// Slice read.
    Success,
    /// Stream does not exist.
    NoStream,
    /// Stream has been deleted.
    StreamDeleted,
    /// Nothing newer than the requested position.
    NotModified,
    /// Unclassified server failure.
    Error,
    /// Caller may not read the stream.
    AccessDenied,
}

/// Read a slice of a stream; direction is carried by the command opcode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadStreamEvents {
    /// Target stream.
    pub event_stream_id: String,
    /// First event number of the slice.
    pub from_event_number: i64,
    /// Maximum events to return.
    pub max_count: i32,
    /// Resolve link events to their targets.
    pub resolve_link_tos: bool,
    /// Fail with NotHandled(NotLeader) rather than forwarding.
    pub require_leader: bool,
}

/// Result of a stream-slice read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadStreamEventsCompleted {
    /// Outcome.
    pub result: ReadStreamResult,
    /// Events in the slice, in read order.
    pub events: Vec<ResolvedEvent>,
    /// Where the next slice starts.
    pub next_event_number: i64,
    /// Number of the last event in the stream.
    pub last_event_number: i64,
    /// Whether the slice reached the end of the stream.
    pub is_end_of_stream: bool,
    /// Server-supplied detail for failures.
    pub error: Option<String>,
}

/// Outcome of a $all-slice read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadAllResult {
    /// Slice read.
    Success,
    /// Nothing newer than the requested position.
    NotModified,
    /// Unclassified server failure.
    Error,
    /// Caller may not read $all.
    AccessDenied,
}

/// Read a slice of $all; direction is carried by the command opcode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadAllEvents {
    /// Commit position to read from.
    pub commit_position: i64,
    /// Prepare position to read from.
    pub prepare_position: i64,
    /// Maximum events to return.
    pub max_count: i32,
    /// Resolve link events to their targets.
    pub resolve_link_tos: bool,
    /// Fail with NotHandled(NotLeader) rather than forwarding.
    pub require_leader: bool,
}

/// Result of a $all-slice read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadAllEventsCompleted {
    /// Outcome.
    pub result: ReadAllResult,
    /// Position this slice was read from.
    pub commit_position: i64,
    /// Prepare position this slice was read from.
    pub prepare_position: i64,
    /// Events in the slice, in read order.
    pub events: Vec<ResolvedEvent>,
    /// Commit position where the next slice starts.
    pub next_commit_position: i64,
    /// Prepare position where the next slice starts.
    pub next_prepare_position: i64,
    /// Server-supplied detail for failures.
    pub error: Option<String>,
}

// ============================================================================
// Volatile subscriptions (0xC0..0xC4)
// ============================================================================

/// Open a volatile subscription. An empty stream id subscribes to $all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeToStream {
    /// Target stream; empty for $all.
    pub event_stream_id: String,
    /// Resolve link events to their targets.
    pub resolve_link_tos: bool,
}

/// Server confirmation that a subscription is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConfirmation {
    /// $all commit position at confirmation time.
    pub last_commit_position: i64,
    /// Last event number of the stream at confirmation time; `None` for $all.
    pub last_event_number: Option<i64>,
}

/// An event pushed to a volatile subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEventAppeared {
    /// The pushed event.
    pub event: ResolvedEvent,
}

/// Caller-initiated teardown of a subscription; empty body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeFromStream {}

/// Why the server dropped a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionDropCause {
    /// The client asked to unsubscribe.
    Unsubscribed,
    /// The caller may not read the stream.
    AccessDenied,
    /// The subscription target does not exist.
    NotFound,
    /// The persistent subscription group was deleted.
    PersistentSubscriptionDeleted,
    /// The consumer group is at its subscriber limit.
    SubscriberMaxCountReached,
}

/// Server notice that a subscription has ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDroppedBody {
    /// Why the server dropped it.
    pub reason: SubscriptionDropCause,
}

// ============================================================================
// Persistent subscriptions (0xC5..0xCF)
// ============================================================================

/// Join a persistent subscription consumer group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectToPersistentSubscription {
    /// Consumer group name.
    pub subscription_id: String,
    /// Stream the group is on.
    pub event_stream_id: String,
    /// In-flight credit granted to this consumer.
    pub allowed_in_flight_messages: i32,
}

/// Server confirmation for a persistent subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentSubscriptionConfirmationBody {
    /// $all commit position at confirmation time.
    pub last_commit_position: i64,
    /// Server-assigned subscription id, echoed on acks and naks.
    pub subscription_id: String,
    /// Last event number of the stream at confirmation time.
    pub last_event_number: Option<i64>,
}

/// An event pushed to a persistent subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentSubscriptionStreamEventAppeared {
    /// The pushed event.
    pub event: ResolvedEvent,
    /// How many times this event has been delivered to the group.
    pub retry_count: i32,
}

/// Acknowledge processed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentSubscriptionAckEvents {
    /// Server-assigned subscription id.
    pub subscription_id: String,
    /// Ids of the processed events.
    pub processed_event_ids: Vec<Uuid>,
}

/// What the server should do with a negatively acknowledged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NakAction {
    /// Let the server decide.
    Unknown,
    /// Route the event to the group's parked-messages stream; it is not
    /// redelivered until parked messages are replayed.
    Park,
    /// Redeliver the event.
    Retry,
    /// Discard the event.
    Skip,
    /// Stop the subscription.
    Stop,
}

/// Negatively acknowledge events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentSubscriptionNakEvents {
    /// Server-assigned subscription id.
    pub subscription_id: String,
    /// Ids of the rejected events.
    pub event_ids: Vec<Uuid>,
    /// What the server should do with them.
    pub action: NakAction,
    /// Caller-supplied reason.
    pub message: String,
}

/// Tunables for a persistent subscription group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentSubscriptionConfig {
    /// Resolve link events to their targets.
    pub resolve_link_tos: bool,
    /// Event number the group starts from; -1 starts at the end.
    pub start_from: i64,
    /// Time before an unacked delivery is retried, in milliseconds.
    pub message_timeout_ms: i32,
    /// Deliveries per event before it is parked.
    pub max_retry_count: i32,
    /// Events kept in the live buffer.
    pub live_buffer_size: i32,
    /// Events read per history batch.
    pub read_batch_size: i32,
    /// Events buffered ahead of consumers.
    pub buffer_size: i32,
    /// Checkpoint at most this often, in milliseconds.
    pub checkpoint_after_ms: i32,
    /// Minimum acks between checkpoints.
    pub checkpoint_min_count: i32,
    /// Maximum acks between checkpoints.
    pub checkpoint_max_count: i32,
    /// Consumers allowed on the group; 0 is unbounded.
    pub subscriber_max_count: i32,
    /// Server-side consumer dispatch strategy.
    pub named_consumer_strategy: String,
}

impl Default for PersistentSubscriptionConfig {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: -1,
            message_timeout_ms: 30_000,
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            buffer_size: 500,
            checkpoint_after_ms: 2_000,
            checkpoint_min_count: 10,
            checkpoint_max_count: 1_000,
            subscriber_max_count: 0,
            named_consumer_strategy: "RoundRobin".to_string(),
        }
    }
}

/// Create a persistent subscription group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePersistentSubscription {
    /// Consumer group name.
    pub subscription_group_name: String,
    /// Stream the group is on.
    pub event_stream_id: String,
    /// Group tunables.
    pub config: PersistentSubscriptionConfig,
}

/// Outcome of a persistent subscription creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreatePersistentSubscriptionResult {
    /// Group created.
    Success,
    /// A group with that name already exists on the stream.
    AlreadyExists,
    /// Unclassified server failure.
    Fail,
    /// Caller may not manage subscriptions.
    AccessDenied,
}

/// Result of a persistent subscription creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePersistentSubscriptionCompleted {
    /// Outcome.
    pub result: CreatePersistentSubscriptionResult,
    /// Server-supplied detail for failures.
    pub reason: Option<String>,
}

/// Update a persistent subscription group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePersistentSubscription {
    /// Consumer group name.
    pub subscription_group_name: String,
    /// Stream the group is on.
    pub event_stream_id: String,
    /// Replacement tunables.
    pub config: PersistentSubscriptionConfig,
}

/// Outcome of a persistent subscription update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdatePersistentSubscriptionResult {
    /// Group updated.
    Success,
    /// No such group on the stream.
    DoesNotExist,
    /// Unclassified server failure.
    Fail,
    /// Caller may not manage subscriptions.
    AccessDenied,
}

/// Result of a persistent subscription update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePersistentSubscriptionCompleted {
    /// Outcome.
    pub result: UpdatePersistentSubscriptionResult,
    /// Server-supplied detail for failures.
    pub reason: Option<String>,
}

/// Delete a persistent subscription group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePersistentSubscription {
    /// Consumer group name.
    pub subscription_group_name: String,
    /// Stream the group is on.
    pub event_stream_id: String,
}

/// Outcome of a persistent subscription deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletePersistentSubscriptionResult {
    /// Group deleted.
    Success,
    /// No such group on the stream.
    DoesNotExist,
    /// Unclassified server failure.
    Fail,
    /// Caller may not manage subscriptions.
    AccessDenied,
}

/// Result of a persistent subscription deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePersistentSubscriptionCompleted {
    /// Outcome.
    pub result: DeletePersistentSubscriptionResult,
    /// Server-supplied detail for failures.
    pub reason: Option<String>,
}

// ============================================================================
// Control messages (0xF1)
// ============================================================================

/// Why the server declined to handle a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotHandledReason {
    /// The node is still starting; retry.
    NotReady,
    /// The node is overloaded; retry.
    TooBusy,
    /// The node is not the leader; reconnect to the endpoint it names.
    NotLeader,
}

/// TCP endpoints of the leader, carried on NotHandled(NotLeader).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderEndpoints {
    /// Leader's external TCP address.
    pub external_tcp_address: String,
    /// Leader's external TCP port.
    pub external_tcp_port: u16,
    /// Leader's external secure TCP address, when TLS is offered.
    pub external_secure_tcp_address: Option<String>,
    /// Leader's external secure TCP port, when TLS is offered.
    pub external_secure_tcp_port: Option<u16>,
}

/// Server notice that it did not handle a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotHandledBody {
    /// Why it was not handled.
    pub reason: NotHandledReason,
    /// Leader endpoints, present when the reason is NotLeader.
    pub leader: Option<LeaderEndpoints>,
}

// ============================================================================
// Caller-facing results
// ============================================================================

/// Expected version of a stream when appending or deleting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No expectation; never conflicts.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last event number must equal this value.
    Exact(i64),
}

impl ExpectedVersion {
    /// Wire encoding of the expectation.
    pub fn as_i64(self) -> i64 {
        match self {
            ExpectedVersion::Any => -2,
            ExpectedVersion::NoStream => -1,
            ExpectedVersion::Exact(n) => n,
        }
    }
}

/// Result of a successful append.
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// Version to expect on the next append to the same stream.
    pub next_expected_version: i64,
    /// Log position of the commit, when reported.
    pub log_position: Option<Position>,
}

/// Result of a successful stream deletion.
#[derive(Debug, Clone)]
pub struct DeleteResult {
    /// Log position of the delete, when reported.
    pub log_position: Option<Position>,
}

/// Result of a single-event read.
#[derive(Debug, Clone)]
pub struct EventReadResult {
    /// Outcome; `Success`, `NotFound`, `NoStream`, or `StreamDeleted`.
    pub status: ReadEventResult,
    /// Stream that was read.
    pub stream: String,
    /// Event number that was requested.
    pub event_number: i64,
    /// The event, when found.
    pub event: Option<ResolvedEvent>,
}

/// Direction of a slice read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirection {
    /// Oldest to newest.
    Forward,
    /// Newest to oldest.
    Backward,
}

/// A slice of a stream.
#[derive(Debug, Clone)]
pub struct StreamEventsSlice {
    /// Stream that was read.
    pub stream: String,
    /// Direction of the read.
    pub direction: ReadDirection,
    /// Event number the slice started from.
    pub from_event_number: i64,
    /// Events in the slice.
    pub events: Vec<ResolvedEvent>,
    /// Where the next slice starts.
    pub next_event_number: i64,
    /// Number of the last event in the stream.
    pub last_event_number: i64,
    /// Whether the slice reached the end of the stream.
    pub is_end_of_stream: bool,
}

/// A slice of the $all stream.
#[derive(Debug, Clone)]
pub struct AllEventsSlice {
    /// Direction of the read.
    pub direction: ReadDirection,
    /// Position the slice was read from.
    pub from_position: Position,
    /// Position where the next slice starts.
    pub next_position: Position,
    /// Events in the slice.
    pub events: Vec<ResolvedEvent>,
}

impl AllEventsSlice {
    /// Whether the read reached the end of $all.
    pub fn is_end_of_all(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorded(stream: &str, number: i64) -> RecordedEvent {
        RecordedEvent {
            event_stream_id: stream.to_string(),
            event_id: Uuid::new_v4(),
            event_number: number,
            event_type: "test-event".to_string(),
            is_json: true,
            data: br#"{"n":1}"#.to_vec(),
            metadata: Vec::new(),
            created_epoch_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_write_events_roundtrip() {
        let msg = WriteEvents {
            event_stream_id: "orders-42".to_string(),
            expected_version: 3,
            events: vec![NewEvent::new("order-placed", true, b"{}".to_vec())],
            require_leader: true,
        };
        let bytes = encode_payload(&msg).unwrap();
        let decoded: WriteEvents = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.event_stream_id, msg.event_stream_id);
        assert_eq!(decoded.expected_version, 3);
        assert_eq!(decoded.events.len(), 1);
        assert!(decoded.require_leader);
    }

    #[test]
    fn test_write_events_completed_roundtrip() {
        let msg = WriteEventsCompleted {
            result: OperationResult::WrongExpectedVersion,
            message: Some("expected 3, stream at 7".to_string()),
            first_event_number: -1,
            last_event_number: -1,
            position: None,
        };
        let bytes = encode_payload(&msg).unwrap();
        let decoded: WriteEventsCompleted = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.result, OperationResult::WrongExpectedVersion);
        assert!(decoded.message.unwrap().contains("expected 3"));
    }

    #[test]
    fn test_read_stream_completed_roundtrip() {
        let msg = ReadStreamEventsCompleted {
            result: ReadStreamResult::Success,
            events: vec![
                ResolvedEvent {
                    event: Some(recorded("orders-42", 0)),
                    link: None,
                    commit_position: Some(100),
                },
                ResolvedEvent {
                    event: Some(recorded("orders-42", 1)),
                    link: None,
                    commit_position: Some(200),
                },
            ],
            next_event_number: 2,
            last_event_number: 1,
            is_end_of_stream: true,
            error: None,
        };
        let bytes = encode_payload(&msg).unwrap();
        let decoded: ReadStreamEventsCompleted = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.events.len(), 2);
        assert_eq!(decoded.events[1].original_event_number(), Some(1));
        assert!(decoded.is_end_of_stream);
    }

    #[test]
    fn test_not_handled_roundtrip() {
        let msg = NotHandledBody {
            reason: NotHandledReason::NotLeader,
            leader: Some(LeaderEndpoints {
                external_tcp_address: "10.0.0.3".to_string(),
                external_tcp_port: 1113,
                external_secure_tcp_address: None,
                external_secure_tcp_port: None,
            }),
        };
        let bytes = encode_payload(&msg).unwrap();
        let decoded: NotHandledBody = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.reason, NotHandledReason::NotLeader);
        assert_eq!(decoded.leader.unwrap().external_tcp_port, 1113);
    }

    #[test]
    fn test_nak_roundtrip() {
        let id = Uuid::new_v4();
        let msg = PersistentSubscriptionNakEvents {
            subscription_id: "orders::workers".to_string(),
            event_ids: vec![id],
            action: NakAction::Park,
            message: "poison message".to_string(),
        };
        let bytes = encode_payload(&msg).unwrap();
        let decoded: PersistentSubscriptionNakEvents = decode_payload(&bytes).unwrap();
        assert_eq!(decoded.action, NakAction::Park);
        assert_eq!(decoded.event_ids, vec![id]);
    }

    #[test]
    fn test_resolved_event_prefers_link() {
        let link = recorded("projection-stream", 9);
        let target = recorded("orders-42", 3);
        let resolved = ResolvedEvent {
            event: Some(target),
            link: Some(link),
            commit_position: None,
        };
        assert_eq!(resolved.original_event_number(), Some(9));
        assert_eq!(
            resolved.original_event().unwrap().event_stream_id,
            "projection-stream"
        );
    }

    #[test]
    fn test_expected_version_wire_values() {
        assert_eq!(ExpectedVersion::Any.as_i64(), -2);
        assert_eq!(ExpectedVersion::NoStream.as_i64(), -1);
        assert_eq!(ExpectedVersion::Exact(12).as_i64(), 12);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let err = decode_payload::<WriteEventsCompleted>(&[0xFF; 3]).unwrap_err();
        assert!(matches!(err, ClientError::Serialization(_)));
    }
}
