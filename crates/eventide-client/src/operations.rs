//! Concrete request/response operations.
//!
//! Each operation pairs a request payload with a mapper that turns the
//! server's completion message into a caller result, a retry, or a typed
//! failure. The scheduler drives retries and reconnects from the decisions;
//! the mappers encode the per-command decision table.

use bytes::Bytes;
use tokio::sync::oneshot;
use uuid::Uuid;

use eventide_wire::{Credentials, Package, TcpCommand};

use crate::error::{ClientError, Result};
use crate::messages::{
    decode_payload, encode_payload, AllEventsSlice, CreatePersistentSubscription,
    CreatePersistentSubscriptionCompleted, CreatePersistentSubscriptionResult, DeletePersistentSubscription,
    DeletePersistentSubscriptionCompleted, DeletePersistentSubscriptionResult, DeleteResult, DeleteStream,
    DeleteStreamCompleted, EventReadResult, ExpectedVersion, NewEvent, OperationResult,
    PersistentSubscriptionConfig, Position, ReadAllEvents, ReadAllEventsCompleted, ReadAllResult,
    ReadDirection, ReadEvent, ReadEventCompleted, ReadEventResult, ReadStreamEvents,
    ReadStreamEventsCompleted, ReadStreamResult, StreamEventsSlice, UpdatePersistentSubscription,
    UpdatePersistentSubscriptionCompleted, UpdatePersistentSubscriptionResult, WriteEvents,
    WriteEventsCompleted, WriteResult,
};
use crate::operation::{inspect_common, ClientOperation, CommonResponse, Inspection};

/// How a mapper resolved a command-specific completion message.
pub(crate) enum MappedOutcome<Out> {
    /// Operation succeeded with this result.
    Complete(Out),
    /// Operation failed terminally.
    Fail(ClientError),
    /// Transient server condition; retry the request.
    Retry(String),
}

type Mapper<Out> = Box<dyn FnMut(&Package) -> MappedOutcome<Out> + Send>;

/// A single request awaiting a single completion message.
pub(crate) struct RequestOperation<Out> {
    name: &'static str,
    command: TcpCommand,
    expected: TcpCommand,
    payload: Bytes,
    credentials: Option<Credentials>,
    completion: Option<oneshot::Sender<Result<Out>>>,
    mapper: Mapper<Out>,
}

impl<Out: Send + 'static> RequestOperation<Out> {
    fn new(
        name: &'static str,
        command: TcpCommand,
        expected: TcpCommand,
        payload: Bytes,
        credentials: Option<Credentials>,
        mapper: Mapper<Out>,
    ) -> (Self, oneshot::Receiver<Result<Out>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                name,
                command,
                expected,
                payload,
                credentials,
                completion: Some(tx),
                mapper,
            },
            rx,
        )
    }

    fn complete(&mut self, result: Result<Out>) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

impl<Out: Send + 'static> ClientOperation for RequestOperation<Out> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn request(
        &self,
        correlation_id: Uuid,
        default_credentials: Option<&Credentials>,
    ) -> Result<Package> {
        let credentials = self
            .credentials
            .clone()
            .or_else(|| default_credentials.cloned());
        Ok(Package::new(self.command, correlation_id, self.payload.clone())
            .with_credentials(credentials))
    }

    fn inspect(&mut self, package: &Package) -> Inspection {
        if let Some(common) = inspect_common(package) {
            return match common {
                CommonResponse::Fail(error) => {
                    let description = error.to_string();
                    self.complete(Err(error));
                    Inspection::end(description)
                }
                CommonResponse::Retry(description) => Inspection::retry(description),
                CommonResponse::Reconnect(endpoints, description) => {
                    Inspection::reconnect(endpoints, description)
                }
            };
        }

        if package.command != self.expected {
            let message = format!(
                "unexpected command {:?} in response to {}",
                package.command, self.name
            );
            self.complete(Err(ClientError::ServerError {
                message: message.clone(),
            }));
            return Inspection::end(message);
        }

        match (self.mapper)(package) {
            MappedOutcome::Complete(out) => {
                self.complete(Ok(out));
                Inspection::end("completed")
            }
            MappedOutcome::Fail(error) => {
                let description = error.to_string();
                self.complete(Err(error));
                Inspection::end(description)
            }
            MappedOutcome::Retry(description) => Inspection::retry(description),
        }
    }

    fn fail(&mut self, error: ClientError) {
        self.complete(Err(error));
    }
}

/// Builds an append operation.
pub(crate) fn write_events(
    stream: String,
    expected_version: ExpectedVersion,
    events: Vec<NewEvent>,
    require_leader: bool,
    credentials: Option<Credentials>,
) -> Result<(RequestOperation<WriteResult>, oneshot::Receiver<Result<WriteResult>>)> {
    let payload = encode_payload(&WriteEvents {
        event_stream_id: stream.clone(),
        expected_version: expected_version.as_i64(),
        events,
        require_leader,
    })?;
    let mapper = Box::new(move |package: &Package| {
        let completed: WriteEventsCompleted = match decode_payload(&package.data) {
            Ok(c) => c,
            Err(e) => return MappedOutcome::Fail(e),
        };
        match completed.result {
            OperationResult::Success => MappedOutcome::Complete(WriteResult {
                next_expected_version: completed.last_event_number,
                log_position: completed.position,
            }),
            OperationResult::PrepareTimeout => MappedOutcome::Retry("prepare timeout".to_string()),
            OperationResult::CommitTimeout => MappedOutcome::Retry("commit timeout".to_string()),
            OperationResult::ForwardTimeout => MappedOutcome::Retry("forward timeout".to_string()),
            OperationResult::WrongExpectedVersion => {
                MappedOutcome::Fail(ClientError::WrongExpectedVersion {
                    stream: stream.clone(),
                    expected: expected_version.as_i64(),
                })
            }
            OperationResult::StreamDeleted => MappedOutcome::Fail(ClientError::StreamDeleted {
                stream: stream.clone(),
            }),
            OperationResult::InvalidTransaction => {
                MappedOutcome::Fail(ClientError::InvalidTransaction)
            }
            OperationResult::AccessDenied => MappedOutcome::Fail(ClientError::AccessDenied {
                message: format!("write access denied on stream {stream}"),
            }),
        }
    });
    Ok(RequestOperation::new(
        "write-events",
        TcpCommand::WriteEvents,
        TcpCommand::WriteEventsCompleted,
        payload,
        credentials,
        mapper,
    ))
}

/// Builds a stream-deletion operation.
pub(crate) fn delete_stream(
    stream: String,
    expected_version: ExpectedVersion,
    hard_delete: bool,
    require_leader: bool,
    credentials: Option<Credentials>,
) -> Result<(RequestOperation<DeleteResult>, oneshot::Receiver<Result<DeleteResult>>)> {
    let payload = encode_payload(&DeleteStream {
        event_stream_id: stream.clone(),
        expected_version: expected_version.as_i64(),
        require_leader,
        hard_delete,
    })?;
    let mapper = Box::new(move |package: &Package| {
        let completed: DeleteStreamCompleted = match decode_payload(&package.data) {
            Ok(c) => c,
            Err(e) => return MappedOutcome::Fail(e),
        };
        match completed.result {
            OperationResult::Success => MappedOutcome::Complete(DeleteResult {
                log_position: completed.position,
            }),
            OperationResult::PrepareTimeout => MappedOutcome::Retry("prepare timeout".to_string()),
            OperationResult::CommitTimeout => MappedOutcome::Retry("commit timeout".to_string()),
            OperationResult::ForwardTimeout => MappedOutcome::Retry("forward timeout".to_string()),
            OperationResult::WrongExpectedVersion => {
                MappedOutcome::Fail(ClientError::WrongExpectedVersion {
                    stream: stream.clone(),
                    expected: expected_version.as_i64(),
                })
            }
            OperationResult::StreamDeleted => MappedOutcome::Fail(ClientError::StreamDeleted {
                stream: stream.clone(),
            }),
            OperationResult::InvalidTransaction => {
                MappedOutcome::Fail(ClientError::InvalidTransaction)
            }
            OperationResult::AccessDenied => MappedOutcome::Fail(ClientError::AccessDenied {
                message: format!("delete access denied on stream {stream}"),
            }),
        }
    });
    Ok(RequestOperation::new(
        "delete-stream",
        TcpCommand::DeleteStream,
        TcpCommand::DeleteStreamCompleted,
        payload,
        credentials,
        mapper,
    ))
}

/// Builds a single-event read operation.
pub(crate) fn read_event(
    stream: String,
    event_number: i64,
    resolve_link_tos: bool,
    require_leader: bool,
    credentials: Option<Credentials>,
) -> Result<(
    RequestOperation<EventReadResult>,
    oneshot::Receiver<Result<EventReadResult>>,
)> {
    let payload = encode_payload(&ReadEvent {
        event_stream_id: stream.clone(),
        event_number,
        resolve_link_tos,
        require_leader,
    })?;
    let mapper = Box::new(move |package: &Package| {
        let completed: ReadEventCompleted = match decode_payload(&package.data) {
            Ok(c) => c,
            Err(e) => return MappedOutcome::Fail(e),
        };
        match completed.result {
            ReadEventResult::Success
            | ReadEventResult::NotFound
            | ReadEventResult::NoStream
            | ReadEventResult::StreamDeleted => MappedOutcome::Complete(EventReadResult {
                status: completed.result,
                stream: stream.clone(),
                event_number,
                event: completed.event,
            }),
            ReadEventResult::Error => MappedOutcome::Fail(ClientError::ServerError {
                message: completed
                    .error
                    .unwrap_or_else(|| "read failed".to_string()),
            }),
            ReadEventResult::AccessDenied => MappedOutcome::Fail(ClientError::AccessDenied {
                message: format!("read access denied on stream {stream}"),
            }),
        }
    });
    Ok(RequestOperation::new(
        "read-event",
        TcpCommand::ReadEvent,
        TcpCommand::ReadEventCompleted,
        payload,
        credentials,
        mapper,
    ))
}

/// Builds a stream-slice read operation in the given direction.
pub(crate) fn read_stream_events(
    stream: String,
    from_event_number: i64,
    max_count: i32,
    direction: ReadDirection,
    resolve_link_tos: bool,
    require_leader: bool,
    credentials: Option<Credentials>,
) -> Result<(
    RequestOperation<StreamEventsSlice>,
    oneshot::Receiver<Result<StreamEventsSlice>>,
)> {
    let (command, expected, name) = match direction {
        ReadDirection::Forward => (
            TcpCommand::ReadStreamEventsForward,
            TcpCommand::ReadStreamEventsForwardCompleted,
            "read-stream-forward",
        ),
        ReadDirection::Backward => (
            TcpCommand::ReadStreamEventsBackward,
            TcpCommand::ReadStreamEventsBackwardCompleted,
            "read-stream-backward",
        ),
    };
    let payload = encode_payload(&ReadStreamEvents {
        event_stream_id: stream.clone(),
        from_event_number,
        max_count,
        resolve_link_tos,
        require_leader,
    })?;
    let mapper = Box::new(move |package: &Package| {
        let completed: ReadStreamEventsCompleted = match decode_payload(&package.data) {
            Ok(c) => c,
            Err(e) => return MappedOutcome::Fail(e),
        };
        match completed.result {
            ReadStreamResult::Success => MappedOutcome::Complete(StreamEventsSlice {
                stream: stream.clone(),
                direction,
                from_event_number,
                events: completed.events,
                next_event_number: completed.next_event_number,
                last_event_number: completed.last_event_number,
                is_end_of_stream: completed.is_end_of_stream,
            }),
            // an absent stream reads as an empty, exhausted slice
            ReadStreamResult::NoStream | ReadStreamResult::NotModified => {
                MappedOutcome::Complete(StreamEventsSlice {
                    stream: stream.clone(),
                    direction,
                    from_event_number,
                    events: Vec::new(),
                    next_event_number: from_event_number,
                    last_event_number: -1,
                    is_end_of_stream: true,
                })
            }
            ReadStreamResult::StreamDeleted => MappedOutcome::Fail(ClientError::StreamDeleted {
                stream: stream.clone(),
            }),
            ReadStreamResult::Error => MappedOutcome::Fail(ClientError::ServerError {
                message: completed
                    .error
                    .unwrap_or_else(|| "read failed".to_string()),
            }),
            ReadStreamResult::AccessDenied => MappedOutcome::Fail(ClientError::AccessDenied {
                message: format!("read access denied on stream {stream}"),
            }),
        }
    });
    Ok(RequestOperation::new(
        name, command, expected, payload, credentials, mapper,
    ))
}

/// Builds a $all-slice read operation in the given direction.
pub(crate) fn read_all_events(
    position: Position,
    max_count: i32,
    direction: ReadDirection,
    resolve_link_tos: bool,
    require_leader: bool,
    credentials: Option<Credentials>,
) -> Result<(
    RequestOperation<AllEventsSlice>,
    oneshot::Receiver<Result<AllEventsSlice>>,
)> {
    let (command, expected, name) = match direction {
        ReadDirection::Forward => (
            TcpCommand::ReadAllEventsForward,
            TcpCommand::ReadAllEventsForwardCompleted,
            "read-all-forward",
        ),
        ReadDirection::Backward => (
            TcpCommand::ReadAllEventsBackward,
            TcpCommand::ReadAllEventsBackwardCompleted,
            "read-all-backward",
        ),
    };
    let payload = encode_payload(&ReadAllEvents {
        commit_position: position.commit,
        prepare_position: position.prepare,
        max_count,
        resolve_link_tos,
        require_leader,
    })?;
    let mapper = Box::new(move |package: &Package| {
        let completed: ReadAllEventsCompleted = match decode_payload(&package.data) {
            Ok(c) => c,
            Err(e) => return MappedOutcome::Fail(e),
        };
        match completed.result {
            ReadAllResult::Success | ReadAllResult::NotModified => {
                MappedOutcome::Complete(AllEventsSlice {
                    direction,
                    from_position: Position {
                        commit: completed.commit_position,
                        prepare: completed.prepare_position,
                    },
                    next_position: Position {
                        commit: completed.next_commit_position,
                        prepare: completed.next_prepare_position,
                    },
                    events: completed.events,
                })
            }
            ReadAllResult::Error => MappedOutcome::Fail(ClientError::ServerError {
                message: completed
                    .error
                    .unwrap_or_else(|| "read failed".to_string()),
            }),
            ReadAllResult::AccessDenied => MappedOutcome::Fail(ClientError::AccessDenied {
                message: "read access denied on $all".to_string(),
            }),
        }
    });
    Ok(RequestOperation::new(
        name, command, expected, payload, credentials, mapper,
    ))
}

/// Builds a persistent subscription group creation operation.
pub(crate) fn create_persistent_subscription(
    stream: String,
    group: String,
    config: PersistentSubscriptionConfig,
    credentials: Option<Credentials>,
) -> Result<(RequestOperation<()>, oneshot::Receiver<Result<()>>)> {
    let payload = encode_payload(&CreatePersistentSubscription {
        subscription_group_name: group.clone(),
        event_stream_id: stream.clone(),
        config,
    })?;
    let mapper = Box::new(move |package: &Package| {
        let completed: CreatePersistentSubscriptionCompleted = match decode_payload(&package.data)
        {
            Ok(c) => c,
            Err(e) => return MappedOutcome::Fail(e),
        };
        match completed.result {
            CreatePersistentSubscriptionResult::Success => MappedOutcome::Complete(()),
            CreatePersistentSubscriptionResult::AlreadyExists => {
                MappedOutcome::Fail(ClientError::ServerError {
                    message: format!("subscription group {group} on {stream} already exists"),
                })
            }
            CreatePersistentSubscriptionResult::Fail => {
                MappedOutcome::Fail(ClientError::ServerError {
                    message: completed
                        .reason
                        .unwrap_or_else(|| "create failed".to_string()),
                })
            }
            CreatePersistentSubscriptionResult::AccessDenied => {
                MappedOutcome::Fail(ClientError::AccessDenied {
                    message: format!("create denied for group {group} on {stream}"),
                })
            }
        }
    });
    Ok(RequestOperation::new(
        "create-persistent-subscription",
        TcpCommand::CreatePersistentSubscription,
        TcpCommand::CreatePersistentSubscriptionCompleted,
        payload,
        credentials,
        mapper,
    ))
}

/// Builds a persistent subscription group update operation.
pub(crate) fn update_persistent_subscription(
    stream: String,
    group: String,
    config: PersistentSubscriptionConfig,
    credentials: Option<Credentials>,
) -> Result<(RequestOperation<()>, oneshot::Receiver<Result<()>>)> {
    let payload = encode_payload(&UpdatePersistentSubscription {
        subscription_group_name: group.clone(),
        event_stream_id: stream.clone(),
        config,
    })?;
    let mapper = Box::new(move |package: &Package| {
        let completed: UpdatePersistentSubscriptionCompleted = match decode_payload(&package.data)
        {
            Ok(c) => c,
            Err(e) => return MappedOutcome::Fail(e),
        };
        match completed.result {
            UpdatePersistentSubscriptionResult::Success => MappedOutcome::Complete(()),
            UpdatePersistentSubscriptionResult::DoesNotExist => {
                MappedOutcome::Fail(ClientError::ServerError {
                    message: format!("subscription group {group} on {stream} does not exist"),
                })
            }
            UpdatePersistentSubscriptionResult::Fail => {
                MappedOutcome::Fail(ClientError::ServerError {
                    message: completed
                        .reason
                        .unwrap_or_else(|| "update failed".to_string()),
                })
            }
            UpdatePersistentSubscriptionResult::AccessDenied => {
                MappedOutcome::Fail(ClientError::AccessDenied {
                    message: format!("update denied for group {group} on {stream}"),
                })
            }
        }
    });
    Ok(RequestOperation::new(
        "update-persistent-subscription",
        TcpCommand::UpdatePersistentSubscription,
        TcpCommand::UpdatePersistentSubscriptionCompleted,
        payload,
        credentials,
        mapper,
    ))
}

/// Builds a persistent subscription group deletion operation.
pub(crate) fn delete_persistent_subscription(
    stream: String,
    group: String,
    credentials: Option<Credentials>,
) -> Result<(RequestOperation<()>, oneshot::Receiver<Result<()>>)> {
    let payload = encode_payload(&DeletePersistentSubscription {
        subscription_group_name: group.clone(),
        event_stream_id: stream.clone(),
    })?;
    let mapper = Box::new(move |package: &Package| {
        let completed: DeletePersistentSubscriptionCompleted = match decode_payload(&package.data)
        {
            Ok(c) => c,
            Err(e) => return MappedOutcome::Fail(e),
        };
        match completed.result {
            DeletePersistentSubscriptionResult::Success => MappedOutcome::Complete(()),
            DeletePersistentSubscriptionResult::DoesNotExist => {
                MappedOutcome::Fail(ClientError::ServerError {
                    message: format!("subscription group {group} on {stream} does not exist"),
                })
            }
            DeletePersistentSubscriptionResult::Fail => {
                MappedOutcome::Fail(ClientError::ServerError {
                    message: completed
                        .reason
                        .unwrap_or_else(|| "delete failed".to_string()),
                })
            }
            DeletePersistentSubscriptionResult::AccessDenied => {
                MappedOutcome::Fail(ClientError::AccessDenied {
                    message: format!("delete denied for group {group} on {stream}"),
                })
            }
        }
    });
    Ok(RequestOperation::new(
        "delete-persistent-subscription",
        TcpCommand::DeletePersistentSubscription,
        TcpCommand::DeletePersistentSubscriptionCompleted,
        payload,
        credentials,
        mapper,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{NotHandledBody, NotHandledReason};
    use crate::operation::InspectionDecision;

    fn respond(command: TcpCommand, payload: Bytes) -> Package {
        Package::new(command, Uuid::new_v4(), payload)
    }

    #[test]
    fn test_write_success_completes() {
        let (mut op, mut rx) = write_events(
            "orders-1".to_string(),
            ExpectedVersion::Exact(3),
            vec![NewEvent::new("order-placed", true, b"{}".to_vec())],
            false,
            None,
        )
        .unwrap();

        let completed = WriteEventsCompleted {
            result: OperationResult::Success,
            message: None,
            first_event_number: 4,
            last_event_number: 4,
            position: Some(Position {
                commit: 100,
                prepare: 100,
            }),
        };
        let inspection = op.inspect(&respond(
            TcpCommand::WriteEventsCompleted,
            encode_payload(&completed).unwrap(),
        ));
        assert_eq!(inspection.decision, InspectionDecision::EndOperation);
        let result = rx.try_recv().unwrap().unwrap();
        assert_eq!(result.next_expected_version, 4);
    }

    #[test]
    fn test_write_transient_results_retry_without_completing() {
        let (mut op, mut rx) = write_events(
            "orders-1".to_string(),
            ExpectedVersion::Any,
            vec![NewEvent::new("order-placed", true, b"{}".to_vec())],
            false,
            None,
        )
        .unwrap();

        for result in [
            OperationResult::PrepareTimeout,
            OperationResult::CommitTimeout,
            OperationResult::ForwardTimeout,
        ] {
            let completed = WriteEventsCompleted {
                result,
                message: None,
                first_event_number: -1,
                last_event_number: -1,
                position: None,
            };
            let inspection = op.inspect(&respond(
                TcpCommand::WriteEventsCompleted,
                encode_payload(&completed).unwrap(),
            ));
            assert_eq!(inspection.decision, InspectionDecision::Retry);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_write_wrong_expected_version_is_terminal() {
        let (mut op, mut rx) = write_events(
            "orders-1".to_string(),
            ExpectedVersion::Exact(3),
            vec![NewEvent::new("order-placed", true, b"{}".to_vec())],
            false,
            None,
        )
        .unwrap();

        let completed = WriteEventsCompleted {
            result: OperationResult::WrongExpectedVersion,
            message: None,
            first_event_number: -1,
            last_event_number: -1,
            position: None,
        };
        let inspection = op.inspect(&respond(
            TcpCommand::WriteEventsCompleted,
            encode_payload(&completed).unwrap(),
        ));
        assert_eq!(inspection.decision, InspectionDecision::EndOperation);
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(
            err,
            ClientError::WrongExpectedVersion {
                expected: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_not_handled_too_busy_retries() {
        let (mut op, mut rx) = write_events(
            "orders-1".to_string(),
            ExpectedVersion::Any,
            vec![NewEvent::new("order-placed", true, b"{}".to_vec())],
            false,
            None,
        )
        .unwrap();

        let body = NotHandledBody {
            reason: NotHandledReason::TooBusy,
            leader: None,
        };
        let inspection = op.inspect(&respond(
            TcpCommand::NotHandled,
            encode_payload(&body).unwrap(),
        ));
        assert_eq!(inspection.decision, InspectionDecision::Retry);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unexpected_command_fails_operation() {
        let (mut op, mut rx) = read_event("orders-1".to_string(), 0, false, false, None).unwrap();
        let inspection = op.inspect(&respond(TcpCommand::Pong, Bytes::new()));
        assert_eq!(inspection.decision, InspectionDecision::EndOperation);
        assert!(matches!(
            rx.try_recv().unwrap().unwrap_err(),
            ClientError::ServerError { .. }
        ));
    }

    #[test]
    fn test_read_no_stream_reads_as_empty_slice() {
        let (mut op, mut rx) = read_stream_events(
            "missing".to_string(),
            0,
            100,
            ReadDirection::Forward,
            false,
            false,
            None,
        )
        .unwrap();
        let completed = ReadStreamEventsCompleted {
            result: ReadStreamResult::NoStream,
            events: Vec::new(),
            next_event_number: 0,
            last_event_number: -1,
            is_end_of_stream: true,
            error: None,
        };
        let inspection = op.inspect(&respond(
            TcpCommand::ReadStreamEventsForwardCompleted,
            encode_payload(&completed).unwrap(),
        ));
        assert_eq!(inspection.decision, InspectionDecision::EndOperation);
        let slice = rx.try_recv().unwrap().unwrap();
        assert!(slice.events.is_empty());
        assert!(slice.is_end_of_stream);
    }

    #[test]
    fn test_fail_resolves_receiver() {
        let (mut op, mut rx) = delete_stream(
            "orders-1".to_string(),
            ExpectedVersion::Any,
            false,
            false,
            None,
        )
        .unwrap();
        op.fail(ClientError::ConnectionClosed);
        assert!(matches!(
            rx.try_recv().unwrap().unwrap_err(),
            ClientError::ConnectionClosed
        ));
    }

    #[test]
    fn test_request_uses_operation_credentials_over_defaults() {
        let (op, _rx) = write_events(
            "orders-1".to_string(),
            ExpectedVersion::Any,
            vec![NewEvent::new("order-placed", true, b"{}".to_vec())],
            false,
            Some(Credentials::new("writer", "secret")),
        )
        .unwrap();
        let defaults = Credentials::new("default", "default");
        let package = op.request(Uuid::new_v4(), Some(&defaults)).unwrap();
        assert_eq!(package.credentials.unwrap().login, "writer");

        let (op, _rx) = write_events(
            "orders-1".to_string(),
            ExpectedVersion::Any,
            vec![NewEvent::new("order-placed", true, b"{}".to_vec())],
            false,
            None,
        )
        .unwrap();
        let package = op.request(Uuid::new_v4(), Some(&defaults)).unwrap();
        assert_eq!(package.credentials.unwrap().login, "default");
        assert!(package.flags.authenticated);
    }
}
