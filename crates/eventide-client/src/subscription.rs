//! Volatile subscriptions and the types shared by every subscription kind.
//!
//! A subscription is a long-lived operation: once the server confirms it the
//! scheduler keeps it in the Subscribed state until an explicit drop. Pushed
//! events flow through the operation into a channel; a pump task delivers
//! them to the caller's handlers in arrival order.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use eventide_wire::{Credentials, Package, TcpCommand};

use crate::error::{ClientError, Result};
use crate::messages::{
    decode_payload, encode_payload, ResolvedEvent, StreamEventAppeared, SubscribeToStream,
    SubscriptionConfirmation, SubscriptionDropCause, SubscriptionDroppedBody,
    UnsubscribeFromStream,
};
use crate::operation::{inspect_common, ClientOperation, CommonResponse, Inspection};
use crate::scheduler::SchedulerHandle;

/// Why a subscription ended, delivered to the caller's drop handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionDropReason {
    /// The caller unsubscribed.
    UserInitiated,
    /// The server rejected the credentials.
    NotAuthenticated,
    /// The caller may not read the stream.
    AccessDenied,
    /// The subscribe request itself failed.
    SubscribingError,
    /// The server reported an unclassified failure.
    ServerError,
    /// The connection closed terminally.
    ConnectionClosed,
    /// A catch-up history read failed.
    CatchUpError,
    /// The catch-up live queue overflowed a slow consumer.
    ProcessingQueueOverflow,
    /// The caller's event handler panicked.
    EventHandlerException,
    /// The consumer group is at its subscriber limit.
    MaxSubscribersReached,
    /// The persistent subscription group was deleted.
    PersistentSubscriptionDeleted,
    /// The subscription target does not exist.
    NotFound,
    /// Cause not recognized.
    Unknown,
}

impl SubscriptionDropReason {
    pub(crate) fn from_cause(cause: SubscriptionDropCause) -> Self {
        match cause {
            SubscriptionDropCause::Unsubscribed => SubscriptionDropReason::UserInitiated,
            SubscriptionDropCause::AccessDenied => SubscriptionDropReason::AccessDenied,
            SubscriptionDropCause::NotFound => SubscriptionDropReason::NotFound,
            SubscriptionDropCause::PersistentSubscriptionDeleted => {
                SubscriptionDropReason::PersistentSubscriptionDeleted
            }
            SubscriptionDropCause::SubscriberMaxCountReached => {
                SubscriptionDropReason::MaxSubscribersReached
            }
        }
    }

    pub(crate) fn from_error(error: &ClientError) -> Self {
        match error {
            ClientError::ConnectionClosed => SubscriptionDropReason::ConnectionClosed,
            ClientError::NotAuthenticated { .. } => SubscriptionDropReason::NotAuthenticated,
            ClientError::AccessDenied { .. } => SubscriptionDropReason::AccessDenied,
            ClientError::BadRequest { .. } => SubscriptionDropReason::SubscribingError,
            _ => SubscriptionDropReason::ServerError,
        }
    }
}

/// Handler invoked for every event a subscription delivers.
pub type EventAppeared = Arc<dyn Fn(ResolvedEvent) + Send + Sync>;

/// Handler invoked exactly once when a subscription ends.
pub type SubscriptionDropped =
    Arc<dyn Fn(SubscriptionDropReason, Option<ClientError>) + Send + Sync>;

/// Handler invoked exactly once when a catch-up subscription goes live.
pub type LiveProcessingStarted = Arc<dyn Fn() + Send + Sync>;

/// What a subscription operation pushes to its consumer.
pub(crate) enum SubscriptionNotice {
    /// An event, in server arrival order.
    Event(ResolvedEvent),
    /// Terminal drop; nothing follows.
    Dropped {
        /// Why.
        reason: SubscriptionDropReason,
        /// Causing error, when there was one.
        error: Option<ClientError>,
    },
}

/// The long-lived SubscribeToStream operation.
pub(crate) struct SubscribeToStreamOperation {
    stream_id: String,
    resolve_link_tos: bool,
    credentials: Option<Credentials>,
    confirmation: Option<oneshot::Sender<Result<SubscriptionConfirmation>>>,
    notices: mpsc::UnboundedSender<SubscriptionNotice>,
}

/// Builds a volatile subscription operation plus its confirmation and
/// notice channels. An empty stream id subscribes to $all.
pub(crate) fn subscribe_to_stream(
    stream_id: String,
    resolve_link_tos: bool,
    credentials: Option<Credentials>,
) -> (
    SubscribeToStreamOperation,
    oneshot::Receiver<Result<SubscriptionConfirmation>>,
    mpsc::UnboundedReceiver<SubscriptionNotice>,
) {
    let (confirm_tx, confirm_rx) = oneshot::channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    (
        SubscribeToStreamOperation {
            stream_id,
            resolve_link_tos,
            credentials,
            confirmation: Some(confirm_tx),
            notices: notice_tx,
        },
        confirm_rx,
        notice_rx,
    )
}

impl SubscribeToStreamOperation {
    fn drop_with(&mut self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        if let Some(tx) = self.confirmation.take() {
            let error = error.unwrap_or_else(|| ClientError::ServerError {
                message: format!("subscription dropped before confirmation: {reason:?}"),
            });
            let _ = tx.send(Err(error));
            return;
        }
        let _ = self.notices.send(SubscriptionNotice::Dropped { reason, error });
    }
}

impl ClientOperation for SubscribeToStreamOperation {
    fn name(&self) -> &'static str {
        "subscribe-to-stream"
    }

    fn request(
        &self,
        correlation_id: Uuid,
        default_credentials: Option<&Credentials>,
    ) -> Result<Package> {
        let payload = encode_payload(&SubscribeToStream {
            event_stream_id: self.stream_id.clone(),
            resolve_link_tos: self.resolve_link_tos,
        })?;
        let credentials = self
            .credentials
            .clone()
            .or_else(|| default_credentials.cloned());
        Ok(
            Package::new(TcpCommand::SubscribeToStream, correlation_id, payload)
                .with_credentials(credentials),
        )
    }

    fn inspect(&mut self, package: &Package) -> Inspection {
        if let Some(common) = inspect_common(package) {
            return match common {
                CommonResponse::Fail(error) => {
                    let description = error.to_string();
                    let reason = SubscriptionDropReason::from_error(&error);
                    self.drop_with(reason, Some(error));
                    Inspection::end(description)
                }
                CommonResponse::Retry(description) => Inspection::retry(description),
                CommonResponse::Reconnect(endpoints, description) => {
                    Inspection::reconnect(endpoints, description)
                }
            };
        }

        match package.command {
            TcpCommand::SubscriptionConfirmation => {
                match decode_payload::<SubscriptionConfirmation>(&package.data) {
                    Ok(confirmation) => {
                        debug!(
                            stream = %self.stream_id,
                            last_commit_position = confirmation.last_commit_position,
                            "subscription confirmed"
                        );
                        if let Some(tx) = self.confirmation.take() {
                            let _ = tx.send(Ok(confirmation));
                        }
                        Inspection::subscribed("subscription confirmed")
                    }
                    Err(e) => {
                        self.drop_with(SubscriptionDropReason::SubscribingError, Some(e));
                        Inspection::end("undecodable subscription confirmation")
                    }
                }
            }
            TcpCommand::StreamEventAppeared => {
                match decode_payload::<StreamEventAppeared>(&package.data) {
                    Ok(appeared) => {
                        if self
                            .notices
                            .send(SubscriptionNotice::Event(appeared.event))
                            .is_err()
                        {
                            // consumer hung up without unsubscribing
                            return Inspection::end("subscription consumer gone");
                        }
                        Inspection::do_nothing("event delivered")
                    }
                    Err(e) => {
                        self.drop_with(SubscriptionDropReason::ServerError, Some(e));
                        Inspection::end("undecodable pushed event")
                    }
                }
            }
            TcpCommand::SubscriptionDropped => {
                let reason = match decode_payload::<SubscriptionDroppedBody>(&package.data) {
                    Ok(body) => SubscriptionDropReason::from_cause(body.reason),
                    Err(_) => SubscriptionDropReason::Unknown,
                };
                debug!(stream = %self.stream_id, reason = ?reason, "subscription dropped by server");
                self.drop_with(reason, None);
                Inspection::end("subscription dropped")
            }
            other => {
                let error = ClientError::ServerError {
                    message: format!("unexpected command {other:?} on a subscription"),
                };
                let description = error.to_string();
                self.drop_with(SubscriptionDropReason::ServerError, Some(error));
                Inspection::end(description)
            }
        }
    }

    fn fail(&mut self, error: ClientError) {
        let reason = SubscriptionDropReason::from_error(&error);
        self.drop_with(reason, Some(error));
    }
}

/// A live volatile subscription held by the caller.
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    stream_id: String,
    correlation_id: Uuid,
    last_commit_position: i64,
    last_event_number: Option<i64>,
    scheduler: SchedulerHandle,
    _pump: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(
        stream_id: String,
        correlation_id: Uuid,
        confirmation: &SubscriptionConfirmation,
        scheduler: SchedulerHandle,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            stream_id,
            correlation_id,
            last_commit_position: confirmation.last_commit_position,
            last_event_number: confirmation.last_event_number,
            scheduler,
            _pump: pump,
        }
    }

    /// Stream this subscription is on; empty for $all.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// $all commit position at confirmation time.
    pub fn last_commit_position(&self) -> i64 {
        self.last_commit_position
    }

    /// Last event number of the stream at confirmation time.
    pub fn last_event_number(&self) -> Option<i64> {
        self.last_event_number
    }

    /// Asks the server to drop the subscription. The drop handler fires when
    /// the server confirms.
    pub fn unsubscribe(&self) {
        send_unsubscribe(&self.scheduler, self.correlation_id);
    }
}

/// Sends the unsubscribe package for a subscription's correlation id.
pub(crate) fn send_unsubscribe(scheduler: &SchedulerHandle, correlation_id: Uuid) {
    match encode_payload(&UnsubscribeFromStream {}) {
        Ok(payload) => scheduler.send_package(Package::new(
            TcpCommand::UnsubscribeFromStream,
            correlation_id,
            payload,
        )),
        Err(e) => warn!(error = %e, "failed to encode unsubscribe request"),
    }
}

/// Pumps notices into the caller's handlers. Delivery order is server
/// arrival order; a handler panic drops the subscription with
/// [`SubscriptionDropReason::EventHandlerException`].
pub(crate) fn start_pump(
    mut notices: mpsc::UnboundedReceiver<SubscriptionNotice>,
    scheduler: SchedulerHandle,
    correlation_id: Uuid,
    event_appeared: EventAppeared,
    dropped: Option<SubscriptionDropped>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                SubscriptionNotice::Event(event) => {
                    let handler = Arc::clone(&event_appeared);
                    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                        warn!("event handler panicked; dropping subscription");
                        send_unsubscribe(&scheduler, correlation_id);
                        if let Some(dropped) = &dropped {
                            dropped(SubscriptionDropReason::EventHandlerException, None);
                        }
                        return;
                    }
                }
                SubscriptionNotice::Dropped { reason, error } => {
                    if let Some(dropped) = &dropped {
                        dropped(reason, error);
                    }
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::InspectionDecision;
    use bytes::Bytes;

    fn confirmed_operation() -> (
        SubscribeToStreamOperation,
        mpsc::UnboundedReceiver<SubscriptionNotice>,
    ) {
        let (mut op, mut confirm_rx, notice_rx) =
            subscribe_to_stream("orders-1".to_string(), true, None);
        let confirmation = SubscriptionConfirmation {
            last_commit_position: 1000,
            last_event_number: Some(41),
        };
        let package = Package::new(
            TcpCommand::SubscriptionConfirmation,
            Uuid::new_v4(),
            encode_payload(&confirmation).unwrap(),
        );
        let inspection = op.inspect(&package);
        assert_eq!(inspection.decision, InspectionDecision::Subscribed);
        assert_eq!(
            confirm_rx.try_recv().unwrap().unwrap().last_event_number,
            Some(41)
        );
        (op, notice_rx)
    }

    fn pushed_event(number: i64) -> Package {
        let appeared = StreamEventAppeared {
            event: ResolvedEvent {
                event: Some(crate::messages::RecordedEvent {
                    event_stream_id: "orders-1".to_string(),
                    event_id: Uuid::new_v4(),
                    event_number: number,
                    event_type: "order-placed".to_string(),
                    is_json: true,
                    data: b"{}".to_vec(),
                    metadata: Vec::new(),
                    created_epoch_ms: 0,
                }),
                link: None,
                commit_position: Some(number * 100),
            },
        };
        Package::new(
            TcpCommand::StreamEventAppeared,
            Uuid::new_v4(),
            encode_payload(&appeared).unwrap(),
        )
    }

    #[test]
    fn test_confirmation_then_events_in_order() {
        let (mut op, mut notices) = confirmed_operation();
        for n in [42, 43, 44] {
            let inspection = op.inspect(&pushed_event(n));
            assert_eq!(inspection.decision, InspectionDecision::DoNothing);
        }
        for n in [42, 43, 44] {
            match notices.try_recv().unwrap() {
                SubscriptionNotice::Event(event) => {
                    assert_eq!(event.original_event_number(), Some(n))
                }
                _ => panic!("expected an event"),
            }
        }
    }

    #[test]
    fn test_server_drop_reaches_consumer() {
        let (mut op, mut notices) = confirmed_operation();
        let body = SubscriptionDroppedBody {
            reason: SubscriptionDropCause::AccessDenied,
        };
        let package = Package::new(
            TcpCommand::SubscriptionDropped,
            Uuid::new_v4(),
            encode_payload(&body).unwrap(),
        );
        let inspection = op.inspect(&package);
        assert_eq!(inspection.decision, InspectionDecision::EndOperation);
        match notices.try_recv().unwrap() {
            SubscriptionNotice::Dropped { reason, .. } => {
                assert_eq!(reason, SubscriptionDropReason::AccessDenied)
            }
            _ => panic!("expected a drop"),
        }
    }

    #[test]
    fn test_unconfirmed_failure_fails_the_subscribe_call() {
        let (mut op, mut confirm_rx, _notices) =
            subscribe_to_stream("orders-1".to_string(), false, None);
        let package = Package::new(
            TcpCommand::NotAuthenticatedException,
            Uuid::new_v4(),
            Bytes::from_static(b"bad credentials"),
        );
        let inspection = op.inspect(&package);
        assert_eq!(inspection.decision, InspectionDecision::EndOperation);
        let err = confirm_rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, ClientError::NotAuthenticated { .. }));
    }

    #[test]
    fn test_connection_close_maps_to_drop_reason() {
        let (mut op, mut notices) = confirmed_operation();
        op.fail(ClientError::ConnectionClosed);
        match notices.try_recv().unwrap() {
            SubscriptionNotice::Dropped { reason, .. } => {
                assert_eq!(reason, SubscriptionDropReason::ConnectionClosed)
            }
            _ => panic!("expected a drop"),
        }
    }

    #[test]
    fn test_second_confirmation_after_resend_stays_subscribed() {
        let (mut op, _notices) = confirmed_operation();
        let confirmation = SubscriptionConfirmation {
            last_commit_position: 2000,
            last_event_number: Some(50),
        };
        let package = Package::new(
            TcpCommand::SubscriptionConfirmation,
            Uuid::new_v4(),
            encode_payload(&confirmation).unwrap(),
        );
        let inspection = op.inspect(&package);
        assert_eq!(inspection.decision, InspectionDecision::Subscribed);
    }

    #[test]
    fn test_consumer_gone_ends_operation() {
        let (mut op, notices) = confirmed_operation();
        drop(notices);
        let inspection = op.inspect(&pushed_event(42));
        assert_eq!(inspection.decision, InspectionDecision::EndOperation);
    }
}
