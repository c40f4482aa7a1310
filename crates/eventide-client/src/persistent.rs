//! Persistent subscriptions: server-side consumer groups with acks.
//!
//! The server owns the durable cursor and the group; the client connects
//! with an in-flight credit (`buffer_size`) and either auto-acks after the
//! handler returns or leaves ack/nak to the caller. Every delivered event
//! carries its retry count. Nak actions follow the server contract: Park
//! routes an event to the group's parked-messages stream, out of delivery
//! until an explicit replay.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use eventide_wire::{Credentials, Package, TcpCommand};

use crate::catchup::OperationParams;
use crate::error::{ClientError, Result};
use crate::messages::{
    decode_payload, encode_payload, ConnectToPersistentSubscription, NakAction,
    PersistentSubscriptionAckEvents, PersistentSubscriptionConfirmationBody,
    PersistentSubscriptionNakEvents, PersistentSubscriptionStreamEventAppeared, ResolvedEvent,
    SubscriptionDroppedBody,
};
use crate::operation::{inspect_common, ClientOperation, CommonResponse, Inspection};
use crate::scheduler::SchedulerHandle;
use crate::subscription::{send_unsubscribe, SubscriptionDropReason, SubscriptionDropped};

/// Tunables for joining a persistent subscription group.
#[derive(Debug, Clone, Copy)]
pub struct PersistentSubscriptionSettings {
    /// In-flight credit granted to this consumer (default: 10).
    pub buffer_size: i32,
    /// Ack each event as soon as its handler returns (default: true).
    ///
    /// When false the caller must ack or nak every delivered event or the
    /// subscription stalls once the credit is spent.
    pub auto_ack: bool,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            auto_ack: true,
        }
    }
}

/// Handler invoked for every delivered event with its retry count.
pub type PersistentEventAppeared = Arc<dyn Fn(ResolvedEvent, i32) + Send + Sync>;

/// What the connect operation pushes to the pump.
enum PersistentNotice {
    Event {
        event: ResolvedEvent,
        retry_count: i32,
    },
    Dropped {
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
    },
}

/// The long-lived ConnectToPersistentSubscription operation.
struct ConnectOperation {
    group: String,
    stream_id: String,
    buffer_size: i32,
    credentials: Option<Credentials>,
    confirmation: Option<oneshot::Sender<Result<PersistentSubscriptionConfirmationBody>>>,
    notices: mpsc::UnboundedSender<PersistentNotice>,
}

impl ConnectOperation {
    fn drop_with(&mut self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        if let Some(tx) = self.confirmation.take() {
            let error = error.unwrap_or_else(|| ClientError::ServerError {
                message: format!("persistent subscription dropped before confirmation: {reason:?}"),
            });
            let _ = tx.send(Err(error));
            return;
        }
        let _ = self.notices.send(PersistentNotice::Dropped { reason, error });
    }
}

impl ClientOperation for ConnectOperation {
    fn name(&self) -> &'static str {
        "connect-to-persistent-subscription"
    }

    fn request(
        &self,
        correlation_id: Uuid,
        default_credentials: Option<&Credentials>,
    ) -> Result<Package> {
        let payload = encode_payload(&ConnectToPersistentSubscription {
            subscription_id: self.group.clone(),
            event_stream_id: self.stream_id.clone(),
            allowed_in_flight_messages: self.buffer_size,
        })?;
        let credentials = self
            .credentials
            .clone()
            .or_else(|| default_credentials.cloned());
        Ok(Package::new(
            TcpCommand::ConnectToPersistentSubscription,
            correlation_id,
            payload,
        )
        .with_credentials(credentials))
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
            TcpCommand::PersistentSubscriptionConfirmation => {
                match decode_payload::<PersistentSubscriptionConfirmationBody>(&package.data) {
                    Ok(confirmation) => {
                        debug!(
                            group = %self.group,
                            stream = %self.stream_id,
                            subscription_id = %confirmation.subscription_id,
                            "persistent subscription confirmed"
                        );
                        if let Some(tx) = self.confirmation.take() {
                            let _ = tx.send(Ok(confirmation));
                        }
                        Inspection::subscribed("persistent subscription confirmed")
                    }
                    Err(e) => {
                        self.drop_with(SubscriptionDropReason::SubscribingError, Some(e));
                        Inspection::end("undecodable persistent confirmation")
                    }
                }
            }
            TcpCommand::PersistentSubscriptionStreamEventAppeared => {
                match decode_payload::<PersistentSubscriptionStreamEventAppeared>(&package.data) {
                    Ok(appeared) => {
                        if self
                            .notices
                            .send(PersistentNotice::Event {
                                event: appeared.event,
                                retry_count: appeared.retry_count,
                            })
                            .is_err()
                        {
                            return Inspection::end("persistent consumer gone");
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
                debug!(group = %self.group, reason = ?reason, "persistent subscription dropped by server");
                self.drop_with(reason, None);
                Inspection::end("subscription dropped")
            }
            other => {
                let error = ClientError::ServerError {
                    message: format!("unexpected command {other:?} on a persistent subscription"),
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

/// A live persistent subscription held by the caller.
#[derive(Debug)]
pub struct PersistentSubscription {
    stream_id: String,
    group: String,
    subscription_id: String,
    correlation_id: Uuid,
    scheduler: SchedulerHandle,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    _pump: JoinHandle<()>,
}

impl PersistentSubscription {
    /// Stream the consumer group is on.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Consumer group name.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Server-assigned subscription id.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Events delivered but neither acked nor naked yet.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Acknowledges processed events, releasing their in-flight credit.
    pub fn ack(&self, event_ids: &[Uuid]) {
        ack_events(
            &self.scheduler,
            self.correlation_id,
            &self.subscription_id,
            &self.in_flight,
            event_ids,
        );
    }

    /// Negatively acknowledges events with the given action.
    pub fn nak(&self, event_ids: &[Uuid], action: NakAction, message: impl Into<String>) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for id in event_ids {
                in_flight.remove(id);
            }
        }
        match encode_payload(&PersistentSubscriptionNakEvents {
            subscription_id: self.subscription_id.clone(),
            event_ids: event_ids.to_vec(),
            action,
            message: message.into(),
        }) {
            Ok(payload) => self.scheduler.send_package(Package::new(
                TcpCommand::PersistentSubscriptionNakEvents,
                self.correlation_id,
                payload,
            )),
            Err(e) => warn!(error = %e, "failed to encode nak"),
        }
    }

    /// Asks the server to drop the subscription.
    pub fn stop(&self) {
        send_unsubscribe(&self.scheduler, self.correlation_id);
    }
}

fn ack_events(
    scheduler: &SchedulerHandle,
    correlation_id: Uuid,
    subscription_id: &str,
    in_flight: &Arc<Mutex<HashSet<Uuid>>>,
    event_ids: &[Uuid],
) {
    {
        let mut in_flight = in_flight.lock().unwrap();
        for id in event_ids {
            in_flight.remove(id);
        }
    }
    match encode_payload(&PersistentSubscriptionAckEvents {
        subscription_id: subscription_id.to_string(),
        processed_event_ids: event_ids.to_vec(),
    }) {
        Ok(payload) => scheduler.send_package(Package::new(
            TcpCommand::PersistentSubscriptionAckEvents,
            correlation_id,
            payload,
        )),
        Err(e) => warn!(error = %e, "failed to encode ack"),
    }
}

/// Joins a persistent subscription group and starts its delivery pump.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn connect(
    scheduler: SchedulerHandle,
    params: OperationParams,
    stream_id: String,
    group: String,
    settings: PersistentSubscriptionSettings,
    credentials: Option<Credentials>,
    event_appeared: PersistentEventAppeared,
    dropped: Option<SubscriptionDropped>,
) -> Result<PersistentSubscription> {
    let correlation_id = Uuid::new_v4();
    let (confirm_tx, confirm_rx) = oneshot::channel();
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let op = ConnectOperation {
        group: group.clone(),
        stream_id: stream_id.clone(),
        buffer_size: settings.buffer_size,
        credentials,
        confirmation: Some(confirm_tx),
        notices: notice_tx,
    };
    scheduler.enqueue(
        correlation_id,
        Box::new(op),
        params.max_retries,
        params.timeout,
    );
    let confirmation = confirm_rx
        .await
        .map_err(|_| ClientError::ConnectionClosed)??;

    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let pump = start_pump(
        notice_rx,
        scheduler.clone(),
        correlation_id,
        confirmation.subscription_id.clone(),
        Arc::clone(&in_flight),
        settings,
        event_appeared,
        dropped,
    );

    Ok(PersistentSubscription {
        stream_id,
        group,
        subscription_id: confirmation.subscription_id,
        correlation_id,
        scheduler,
        in_flight,
        _pump: pump,
    })
}

#[allow(clippy::too_many_arguments)]
fn start_pump(
    mut notices: mpsc::UnboundedReceiver<PersistentNotice>,
    scheduler: SchedulerHandle,
    correlation_id: Uuid,
    subscription_id: String,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    settings: PersistentSubscriptionSettings,
    event_appeared: PersistentEventAppeared,
    dropped: Option<SubscriptionDropped>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            match notice {
                PersistentNotice::Event { event, retry_count } => {
                    let event_id = event.original_event().map(|e| e.event_id);
                    if let Some(id) = event_id {
                        let mut set = in_flight.lock().unwrap();
                        set.insert(id);
                        if set.len() > settings.buffer_size.max(0) as usize {
                            warn!(
                                in_flight = set.len(),
                                buffer_size = settings.buffer_size,
                                "in-flight events exceed the subscription's credit"
                            );
                        }
                    }
                    let handler = Arc::clone(&event_appeared);
                    if catch_unwind(AssertUnwindSafe(|| handler(event, retry_count))).is_err() {
                        warn!("event handler panicked; dropping persistent subscription");
                        send_unsubscribe(&scheduler, correlation_id);
                        if let Some(dropped) = &dropped {
                            dropped(SubscriptionDropReason::EventHandlerException, None);
                        }
                        return;
                    }
                    if settings.auto_ack {
                        if let Some(id) = event_id {
                            ack_events(
                                &scheduler,
                                correlation_id,
                                &subscription_id,
                                &in_flight,
                                &[id],
                            );
                        }
                    }
                }
                PersistentNotice::Dropped { reason, error } => {
                    if let Some(dropped) = &dropped {
                        dropped(reason, error);
                    }
                    return;
                }
            }
        }
    })
}
