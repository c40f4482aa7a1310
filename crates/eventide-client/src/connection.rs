//! The public connection facade.
//!
//! A [`Connection`] owns one scheduler (and through it one socket). Methods
//! translate arguments into command payloads, hand them to the scheduler,
//! and await the operation's future. Operations enqueued while the
//! connection is still being established are held and written once the
//! transport is up.

use std::sync::Arc;

use tokio::sync::oneshot;
use uuid::Uuid;

use eventide_wire::Credentials;

use crate::catchup::{self, CatchUpSettings, CatchUpSubscription, OperationParams};
use crate::discovery::{discoverer_for, EndpointDiscoverer};
use crate::error::{ClientError, Result};
use crate::messages::{
    AllEventsSlice, DeleteResult, EventReadResult, ExpectedVersion, NewEvent,
    PersistentSubscriptionConfig, Position, ReadDirection, StreamEventsSlice, WriteResult,
};
use crate::operation::ClientOperation;
use crate::operations;
use crate::persistent::{
    self, PersistentEventAppeared, PersistentSubscription, PersistentSubscriptionSettings,
};
use crate::scheduler::{self, SchedulerHandle};
use crate::settings::{ClusterSettings, ConnectionSettings};
use crate::subscription::{
    self, EventAppeared, LiveProcessingStarted, Subscription, SubscriptionDropped,
};

/// A logical connection to an EventStore-style server or cluster.
///
/// Clones share the same scheduler and socket. Dropping every clone does not
/// close the connection while subscriptions are alive; close with
/// [`Connection::close`] to fail outstanding work deterministically.
#[derive(Clone)]
pub struct Connection {
    settings: ConnectionSettings,
    handle: SchedulerHandle,
}

impl Connection {
    /// Creates a connection and starts establishing it in the background.
    ///
    /// Endpoint discovery runs per the cluster settings now and again on
    /// every reconnect.
    pub fn connect(settings: ConnectionSettings, cluster: ClusterSettings) -> Result<Connection> {
        let discoverer = discoverer_for(&cluster)?;
        Ok(Self::with_discoverer(settings, discoverer))
    }

    /// Creates a connection with a caller-supplied discoverer.
    pub fn with_discoverer(
        settings: ConnectionSettings,
        discoverer: Arc<dyn EndpointDiscoverer>,
    ) -> Connection {
        let handle = scheduler::start(settings.clone(), discoverer);
        Connection { settings, handle }
    }

    /// Closes the connection. Every pending and active operation fails with
    /// a connection-closed error and every subscription drops with reason
    /// ConnectionClosed.
    pub fn close(&self) {
        self.handle.close();
    }

    /// Appends a batch of events to a stream.
    pub async fn append_to_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
        credentials: Option<Credentials>,
    ) -> Result<WriteResult> {
        let (op, rx) = operations::write_events(
            stream.to_string(),
            expected_version,
            events,
            false,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Soft-deletes (or with `hard_delete` tombstones) a stream.
    pub async fn delete_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        hard_delete: bool,
        credentials: Option<Credentials>,
    ) -> Result<DeleteResult> {
        let (op, rx) = operations::delete_stream(
            stream.to_string(),
            expected_version,
            hard_delete,
            false,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Reads a single event; -1 reads the last event of the stream.
    pub async fn read_event(
        &self,
        stream: &str,
        event_number: i64,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
    ) -> Result<EventReadResult> {
        let (op, rx) = operations::read_event(
            stream.to_string(),
            event_number,
            resolve_link_tos,
            false,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Reads a forward slice of a stream.
    pub async fn read_stream_events_forward(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: i32,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
    ) -> Result<StreamEventsSlice> {
        let (op, rx) = operations::read_stream_events(
            stream.to_string(),
            from_event_number,
            max_count,
            ReadDirection::Forward,
            resolve_link_tos,
            false,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Reads a backward slice of a stream; -1 starts at the end.
    pub async fn read_stream_events_backward(
        &self,
        stream: &str,
        from_event_number: i64,
        max_count: i32,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
    ) -> Result<StreamEventsSlice> {
        let (op, rx) = operations::read_stream_events(
            stream.to_string(),
            from_event_number,
            max_count,
            ReadDirection::Backward,
            resolve_link_tos,
            false,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Reads a forward slice of $all.
    pub async fn read_all_events_forward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
    ) -> Result<AllEventsSlice> {
        let (op, rx) = operations::read_all_events(
            position,
            max_count,
            ReadDirection::Forward,
            resolve_link_tos,
            false,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Reads a backward slice of $all.
    pub async fn read_all_events_backward(
        &self,
        position: Position,
        max_count: i32,
        resolve_link_tos: bool,
        credentials: Option<Credentials>,
    ) -> Result<AllEventsSlice> {
        let (op, rx) = operations::read_all_events(
            position,
            max_count,
            ReadDirection::Backward,
            resolve_link_tos,
            false,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Opens a volatile subscription on a stream (empty stream id for $all).
    ///
    /// Resolves once the server confirms; events then flow to
    /// `event_appeared` in arrival order until an unsubscribe or a drop.
    pub async fn subscribe_to_stream(
        &self,
        stream: &str,
        resolve_link_tos: bool,
        event_appeared: EventAppeared,
        dropped: Option<SubscriptionDropped>,
        credentials: Option<Credentials>,
    ) -> Result<Subscription> {
        let correlation_id = Uuid::new_v4();
        let (op, confirm_rx, notices) =
            subscription::subscribe_to_stream(stream.to_string(), resolve_link_tos, credentials);
        self.handle.enqueue(
            correlation_id,
            Box::new(op),
            self.settings.max_retries,
            self.settings.operation_timeout,
        );
        let confirmation = confirm_rx
            .await
            .map_err(|_| ClientError::ConnectionClosed)??;
        let pump = subscription::start_pump(
            notices,
            self.handle.clone(),
            correlation_id,
            event_appeared,
            dropped,
        );
        Ok(Subscription::new(
            stream.to_string(),
            correlation_id,
            &confirmation,
            self.handle.clone(),
            pump,
        ))
    }

    /// Starts a catch-up subscription on a stream from `last_checkpoint`
    /// (the last event number already processed; `None` starts at the
    /// beginning).
    pub fn subscribe_to_stream_from(
        &self,
        stream: &str,
        last_checkpoint: Option<i64>,
        settings: CatchUpSettings,
        event_appeared: EventAppeared,
        live_started: Option<LiveProcessingStarted>,
        dropped: Option<SubscriptionDropped>,
        credentials: Option<Credentials>,
    ) -> CatchUpSubscription {
        catchup::start_stream(
            self.handle.clone(),
            self.operation_params(),
            stream.to_string(),
            last_checkpoint,
            settings,
            credentials,
            event_appeared,
            live_started,
            dropped,
        )
    }

    /// Starts a catch-up subscription on $all from `last_checkpoint`.
    pub fn subscribe_to_all_from(
        &self,
        last_checkpoint: Option<Position>,
        settings: CatchUpSettings,
        event_appeared: EventAppeared,
        live_started: Option<LiveProcessingStarted>,
        dropped: Option<SubscriptionDropped>,
        credentials: Option<Credentials>,
    ) -> CatchUpSubscription {
        catchup::start_all(
            self.handle.clone(),
            self.operation_params(),
            last_checkpoint,
            settings,
            credentials,
            event_appeared,
            live_started,
            dropped,
        )
    }

    /// Joins a persistent subscription consumer group.
    pub async fn connect_to_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
        event_appeared: PersistentEventAppeared,
        dropped: Option<SubscriptionDropped>,
        credentials: Option<Credentials>,
    ) -> Result<PersistentSubscription> {
        persistent::connect(
            self.handle.clone(),
            self.operation_params(),
            stream.to_string(),
            group.to_string(),
            settings,
            credentials,
            event_appeared,
            dropped,
        )
        .await
    }

    /// Creates a persistent subscription group on a stream.
    pub async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        config: PersistentSubscriptionConfig,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let (op, rx) = operations::create_persistent_subscription(
            stream.to_string(),
            group.to_string(),
            config,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Updates a persistent subscription group.
    pub async fn update_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        config: PersistentSubscriptionConfig,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let (op, rx) = operations::update_persistent_subscription(
            stream.to_string(),
            group.to_string(),
            config,
            credentials,
        )?;
        self.execute(op, rx).await
    }

    /// Deletes a persistent subscription group.
    pub async fn delete_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let (op, rx) = operations::delete_persistent_subscription(
            stream.to_string(),
            group.to_string(),
            credentials,
        )?;
        self.execute(op, rx).await
    }

    async fn execute<Out>(
        &self,
        op: impl ClientOperation + 'static,
        rx: oneshot::Receiver<Result<Out>>,
    ) -> Result<Out> {
        self.handle.enqueue(
            Uuid::new_v4(),
            Box::new(op),
            self.settings.max_retries,
            self.settings.operation_timeout,
        );
        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    fn operation_params(&self) -> OperationParams {
        OperationParams {
            max_retries: self.settings.max_retries,
            timeout: self.settings.operation_timeout,
        }
    }
}
