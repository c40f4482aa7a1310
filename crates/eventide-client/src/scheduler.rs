//! Operation scheduler: the central actor of a logical connection.
//!
//! One scheduler task owns the transport connection and the table of
//! in-flight operations keyed by correlation id. Commands arrive on a
//! channel, transport events on another, and a periodic tick drives
//! deadline sweeps and heartbeats; the task processes all three as one
//! serialized stream, so the socket and the operation table need no locks.
//!
//! Callers hold a [`SchedulerHandle`] and interact through futures; only the
//! scheduler's own loop touches the socket and the table.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use eventide_wire::{Package, TcpCommand};

use crate::discovery::EndpointDiscoverer;
use crate::error::ClientError;
use crate::heartbeat::{HeartbeatAction, HeartbeatMonitor};
use crate::node::NodeEndpoints;
use crate::operation::{ClientOperation, InspectionDecision, OperationItem, OperationState};
use crate::settings::ConnectionSettings;
use crate::transport::{TransportConnection, TransportEvent};

/// Commands callers send to the scheduler task.
pub(crate) enum SchedulerCommand {
    /// Admit an operation, or fail it fast when the queue is full.
    Enqueue {
        /// Correlation id chosen by the caller (subscription handles need it).
        correlation_id: Uuid,
        /// The operation.
        op: Box<dyn ClientOperation>,
        /// Retry budget; negative means unlimited.
        max_retries: i32,
        /// Per-attempt response timeout.
        timeout: Duration,
    },
    /// Write a raw package on the current connection (acks, naks,
    /// unsubscribes). Dropped silently when disconnected.
    SendPackage(Package),
    /// Tear everything down, failing all outstanding work.
    Close,
}

/// Cloneable handle to a running scheduler task.
#[derive(Clone, Debug)]
pub(crate) struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Enqueues an operation. If the scheduler is gone the operation fails
    /// immediately with a connection-closed error.
    pub(crate) fn enqueue(
        &self,
        correlation_id: Uuid,
        op: Box<dyn ClientOperation>,
        max_retries: i32,
        timeout: Duration,
    ) {
        let command = SchedulerCommand::Enqueue {
            correlation_id,
            op,
            max_retries,
            timeout,
        };
        if let Err(returned) = self.tx.send(command) {
            if let SchedulerCommand::Enqueue { mut op, .. } = returned.0 {
                op.fail(ClientError::ConnectionClosed);
            }
        }
    }

    /// Sends a raw package on the current connection, best effort.
    pub(crate) fn send_package(&self, package: Package) {
        let _ = self.tx.send(SchedulerCommand::SendPackage(package));
    }

    /// Closes the connection, failing all outstanding work.
    pub(crate) fn close(&self) {
        let _ = self.tx.send(SchedulerCommand::Close);
    }
}

enum ConnState {
    /// A connect task is in flight (or about to be).
    Connecting,
    /// The transport is up.
    Connected(TransportConnection),
    /// Terminally closed.
    Closed,
}

/// The scheduler actor. Constructed by [`start`], consumed by its own task.
struct OperationScheduler {
    settings: ConnectionSettings,
    discoverer: Arc<dyn EndpointDiscoverer>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    state: ConnState,
    operations: HashMap<Uuid, OperationItem>,
    pending: VecDeque<OperationItem>,
    heartbeat: HeartbeatMonitor,
    reconnection_attempts: i32,
    forced_target: Option<NodeEndpoints>,
    last_endpoint: Option<SocketAddr>,
    closed: bool,
}

/// Spawns a scheduler task and returns its handle.
pub(crate) fn start(
    settings: ConnectionSettings,
    discoverer: Arc<dyn EndpointDiscoverer>,
) -> SchedulerHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let heartbeat = HeartbeatMonitor::new(settings.heartbeat_interval, settings.heartbeat_timeout);
    let scheduler = OperationScheduler {
        settings,
        discoverer,
        event_tx,
        state: ConnState::Connecting,
        operations: HashMap::new(),
        pending: VecDeque::new(),
        heartbeat,
        reconnection_attempts: 0,
        forced_target: None,
        last_endpoint: None,
        closed: false,
    };
    tokio::spawn(scheduler.run(cmd_rx, event_rx));
    SchedulerHandle { tx: cmd_tx }
}

impl OperationScheduler {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<SchedulerCommand>,
        mut event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        self.spawn_connect(Duration::ZERO);
        let mut tick = tokio::time::interval(self.settings.operation_timeout_check_period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // every handle dropped: tear down
                    None => self.terminal_close().await,
                },
                event = event_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                _ = tick.tick() => self.on_tick().await,
            }
            if self.closed {
                break;
            }
        }
        debug!("scheduler stopped");
    }

    async fn handle_command(&mut self, command: SchedulerCommand) {
        match command {
            SchedulerCommand::Enqueue {
                correlation_id,
                mut op,
                max_retries,
                timeout,
            } => {
                if self.closed {
                    op.fail(ClientError::ConnectionClosed);
                    return;
                }
                let queued = self.pending.len() + self.active_count();
                if queued >= self.settings.max_queue_size {
                    warn!(
                        limit = self.settings.max_queue_size,
                        operation = op.name(),
                        "operation queue full"
                    );
                    op.fail(ClientError::QueueFull {
                        limit: self.settings.max_queue_size,
                    });
                    return;
                }
                trace!(operation = op.name(), correlation_id = %correlation_id, "operation admitted");
                self.pending
                    .push_back(OperationItem::new(correlation_id, op, max_retries, timeout));
                self.pump_pending().await;
            }
            SchedulerCommand::SendPackage(package) => {
                self.try_send(package).await;
            }
            SchedulerCommand::Close => {
                info!("closing connection");
                self.terminal_close().await;
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { connection } => {
                if self.closed || !matches!(self.state, ConnState::Connecting) {
                    // raced a close or a forced reconnect; discard
                    connection.close().await;
                    return;
                }
                info!(peer = %connection.peer(), connection_id = %connection.id(), "connection established");
                self.last_endpoint = Some(connection.peer());
                self.heartbeat.reset(Instant::now());
                self.state = ConnState::Connected(connection);
                self.reconnection_attempts = 0;
                self.authenticate().await;
                self.resend_tracked().await;
                self.pump_pending().await;
            }
            TransportEvent::ConnectFailed { error } => {
                if self.closed {
                    return;
                }
                warn!(error = %error, "connect attempt failed");
                self.on_connection_lost().await;
            }
            TransportEvent::Package {
                connection_id,
                package,
            } => {
                if !self.is_current(connection_id) {
                    return;
                }
                self.heartbeat.on_package_received(Instant::now());
                self.dispatch(package).await;
            }
            TransportEvent::Closed {
                connection_id,
                error,
            } => {
                if !self.is_current(connection_id) {
                    return;
                }
                match &error {
                    Some(e) => warn!(error = %e, "connection lost"),
                    None => debug!("connection closed by peer"),
                }
                self.drop_current_connection().await;
                self.on_connection_lost().await;
            }
        }
    }

    /// Routes an inbound package: operations first, then connection-level
    /// commands; anything else is dropped silently.
    async fn dispatch(&mut self, package: Package) {
        let correlation_id = package.correlation_id;
        if self.operations.contains_key(&correlation_id) {
            self.dispatch_to_operation(correlation_id, package).await;
            return;
        }
        match package.command {
            TcpCommand::HeartbeatRequest => {
                let reply = Package::new(
                    TcpCommand::HeartbeatResponse,
                    correlation_id,
                    package.data.clone(),
                );
                self.try_send(reply).await;
            }
            TcpCommand::Ping => {
                let reply = Package::new(TcpCommand::Pong, correlation_id, package.data.clone());
                self.try_send(reply).await;
            }
            TcpCommand::HeartbeatResponse | TcpCommand::Pong => {
                // liveness already recorded on receipt
            }
            TcpCommand::Authenticated => debug!("authenticated with the server"),
            TcpCommand::NotAuthenticatedException => {
                warn!("server refused the default credentials")
            }
            other => {
                trace!(command = ?other, correlation_id = %correlation_id, "package for unknown correlation id dropped")
            }
        }
    }

    async fn dispatch_to_operation(&mut self, correlation_id: Uuid, package: Package) {
        let Some(mut item) = self.operations.remove(&correlation_id) else {
            return;
        };
        let inspection = item.op.inspect(&package);
        trace!(
            operation = item.op.name(),
            correlation_id = %correlation_id,
            decision = ?inspection.decision,
            description = %inspection.description,
            "inspected response"
        );
        match inspection.decision {
            InspectionDecision::DoNothing => {
                self.operations.insert(correlation_id, item);
            }
            InspectionDecision::EndOperation => {
                item.state = OperationState::Completed;
                drop(item);
                self.pump_pending().await;
            }
            InspectionDecision::Retry => {
                self.retry_item(item).await;
            }
            InspectionDecision::Subscribed => {
                item.state = OperationState::Subscribed;
                self.operations.insert(correlation_id, item);
            }
            InspectionDecision::Reconnect(endpoints) => {
                item.state = OperationState::Created;
                self.operations.insert(correlation_id, item);
                debug!(tcp = %endpoints.tcp_endpoint, "reconnecting to the endpoint named by the server");
                self.forced_target = Some(endpoints);
                self.drop_current_connection().await;
                self.on_connection_lost().await;
            }
        }
    }

    /// Retries an operation, failing it when its budget is spent.
    async fn retry_item(&mut self, mut item: OperationItem) {
        if item.retries_exhausted() {
            warn!(
                operation = item.op.name(),
                attempts = item.attempts(),
                "retries exhausted"
            );
            item.op.fail(ClientError::RetriesExhausted {
                attempts: item.attempts(),
            });
            item.state = OperationState::Failed;
            drop(item);
            self.pump_pending().await;
            return;
        }
        item.begin_retry(Instant::now());
        item.state = OperationState::Active;
        let package = match item
            .op
            .request(item.correlation_id, self.settings.default_credentials.as_ref())
        {
            Ok(package) => package,
            Err(e) => {
                item.op.fail(e);
                self.pump_pending().await;
                return;
            }
        };
        trace!(
            operation = item.op.name(),
            attempt = item.attempts(),
            "retrying operation"
        );
        self.operations.insert(item.correlation_id, item);
        self.try_send(package).await;
    }

    /// Admits pending operations up to the concurrency bound.
    async fn pump_pending(&mut self) {
        if self.closed {
            return;
        }
        while self.active_count() < self.settings.max_concurrent_items {
            if !matches!(self.state, ConnState::Connected(_)) {
                return;
            }
            let Some(mut item) = self.pending.pop_front() else {
                return;
            };
            let package = match item
                .op
                .request(item.correlation_id, self.settings.default_credentials.as_ref())
            {
                Ok(package) => package,
                Err(e) => {
                    item.op.fail(e);
                    continue;
                }
            };
            item.state = OperationState::Active;
            item.deadline = Instant::now() + item.timeout;
            self.operations.insert(item.correlation_id, item);
            self.try_send(package).await;
        }
    }

    /// Re-sends every tracked operation on a fresh connection, preserving
    /// correlation ids. Subscribed operations go back to Active and await a
    /// fresh confirmation.
    async fn resend_tracked(&mut self) {
        if self.operations.is_empty() {
            return;
        }
        debug!(count = self.operations.len(), "resending tracked operations");
        let now = Instant::now();
        let mut packages = Vec::with_capacity(self.operations.len());
        for item in self.operations.values_mut() {
            match item
                .op
                .request(item.correlation_id, self.settings.default_credentials.as_ref())
            {
                Ok(package) => {
                    item.state = OperationState::Active;
                    item.deadline = now + item.timeout;
                    packages.push(package);
                }
                Err(e) => {
                    item.op.fail(e);
                    item.state = OperationState::Failed;
                }
            }
        }
        self.operations
            .retain(|_, item| item.state != OperationState::Failed);
        for package in packages {
            if !self.try_send(package).await {
                break;
            }
        }
    }

    async fn on_tick(&mut self) {
        if self.closed {
            return;
        }
        let now = Instant::now();

        if matches!(self.state, ConnState::Connected(_)) {
            match self.heartbeat.check(now) {
                HeartbeatAction::SendProbe => {
                    let probe =
                        Package::new(TcpCommand::HeartbeatRequest, Uuid::new_v4(), Bytes::new());
                    self.try_send(probe).await;
                }
                HeartbeatAction::TimedOut => {
                    warn!("heartbeat timed out, dropping connection");
                    self.drop_current_connection().await;
                    self.on_connection_lost().await;
                }
                HeartbeatAction::None => {}
            }
        }

        let expired: Vec<Uuid> = self
            .operations
            .iter()
            .filter(|(_, item)| item.state == OperationState::Active && now >= item.deadline)
            .map(|(id, _)| *id)
            .collect();
        for correlation_id in expired {
            if let Some(item) = self.operations.remove(&correlation_id) {
                debug!(operation = item.op.name(), "operation deadline elapsed");
                self.retry_item(item).await;
            }
        }
    }

    /// Sends a package on the current connection; on failure drops the
    /// connection and enters the reconnect path. Returns whether the send
    /// went through.
    async fn try_send(&mut self, package: Package) -> bool {
        let result = match &self.state {
            ConnState::Connected(conn) => conn.send(&package).await,
            _ => return false,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "send failed");
                self.drop_current_connection().await;
                self.on_connection_lost().await;
                false
            }
        }
    }

    /// Validates default credentials once per established connection.
    async fn authenticate(&mut self) {
        if let Some(credentials) = self.settings.default_credentials.clone() {
            debug!("authenticating with default credentials");
            let package = Package::authenticated(
                TcpCommand::Authenticate,
                Uuid::new_v4(),
                Bytes::new(),
                credentials,
            );
            self.try_send(package).await;
        }
    }

    /// Enters the reconnect path, or closes terminally when the budget is spent.
    async fn on_connection_lost(&mut self) {
        if self.closed {
            return;
        }
        self.reconnection_attempts += 1;
        let budget = self.settings.max_reconnections;
        if budget >= 0 && self.reconnection_attempts > budget {
            warn!(
                attempts = self.reconnection_attempts,
                "reconnection budget exhausted"
            );
            self.terminal_close().await;
            return;
        }
        debug!(attempt = self.reconnection_attempts, "reconnecting");
        self.spawn_connect(self.settings.reconnection_delay);
    }

    /// Fails every outstanding operation and subscription and stops the task.
    async fn terminal_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let previous = std::mem::replace(&mut self.state, ConnState::Closed);
        if let ConnState::Connected(conn) = previous {
            conn.close().await;
        }
        let outstanding = self.operations.len() + self.pending.len();
        if outstanding > 0 {
            debug!(count = outstanding, "failing outstanding operations");
        }
        for (_, mut item) in self.operations.drain() {
            item.state = OperationState::Failed;
            item.op.fail(ClientError::ConnectionClosed);
        }
        while let Some(mut item) = self.pending.pop_front() {
            item.state = OperationState::Failed;
            item.op.fail(ClientError::ConnectionClosed);
        }
    }

    async fn drop_current_connection(&mut self) {
        if let ConnState::Connected(conn) =
            std::mem::replace(&mut self.state, ConnState::Connecting)
        {
            conn.close().await;
        }
    }

    /// Spawns a connect task: optional delay, discovery (unless the server
    /// named an explicit endpoint), then the socket connect. The outcome
    /// arrives back on the event channel.
    fn spawn_connect(&mut self, delay: Duration) {
        if self.closed {
            return;
        }
        self.state = ConnState::Connecting;
        let discoverer = Arc::clone(&self.discoverer);
        let settings = self.settings.clone();
        let events = self.event_tx.clone();
        let failed = self.last_endpoint;
        let target = self.forced_target.take();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let endpoints = match target {
                Some(endpoints) => Ok(endpoints),
                None => discoverer.discover(failed).await,
            };
            let event = match endpoints {
                Ok(endpoints) => {
                    match TransportConnection::connect(&endpoints, &settings, events.clone()).await
                    {
                        Ok(connection) => TransportEvent::Connected { connection },
                        Err(error) => TransportEvent::ConnectFailed { error },
                    }
                }
                Err(error) => TransportEvent::ConnectFailed { error },
            };
            let _ = events.send(event);
        });
    }

    fn active_count(&self) -> usize {
        self.operations
            .values()
            .filter(|item| item.state == OperationState::Active)
            .count()
    }

    fn is_current(&self, connection_id: Uuid) -> bool {
        matches!(&self.state, ConnState::Connected(conn) if conn.id() == connection_id)
    }
}
