//! Catch-up subscriptions: read history, then hand off to live pushes.
//!
//! State machine per subscription: Idle → ReadingHistory → CatchingUp →
//! Live → Dropped. The live subscribe request is issued first; pushed events
//! that arrive while history is still being read are buffered in a bounded
//! queue, and overflowing that queue drops the subscription rather than
//! growing without bound under a slow consumer. Across the history→live
//! handoff no event is delivered twice and none is skipped, enforced by
//! deduplicating against the last delivered position.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use eventide_wire::Credentials;

use crate::error::ClientError;
use crate::messages::{Position, ReadDirection, ResolvedEvent};
use crate::operations;
use crate::scheduler::SchedulerHandle;
use crate::subscription::{
    self, send_unsubscribe, EventAppeared, LiveProcessingStarted, SubscriptionDropReason,
    SubscriptionDropped, SubscriptionNotice,
};

/// Tunables for a catch-up subscription.
#[derive(Debug, Clone)]
pub struct CatchUpSettings {
    /// Events per history read batch (default: 500).
    pub read_batch_size: i32,
    /// Live events buffered while history is read; overflow drops the
    /// subscription (default: 10000).
    pub max_live_queue_size: usize,
    /// Resolve link events to their targets (default: true).
    pub resolve_link_tos: bool,
}

impl Default for CatchUpSettings {
    fn default() -> Self {
        Self {
            read_batch_size: 500,
            max_live_queue_size: 10_000,
            resolve_link_tos: true,
        }
    }
}

/// Per-operation knobs the catch-up task inherits from the connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OperationParams {
    pub max_retries: i32,
    pub timeout: Duration,
}

/// What a catch-up subscription follows and where it resumes from.
enum Target {
    /// A single stream, resuming after the given event number.
    Stream {
        stream_id: String,
        checkpoint: Option<i64>,
    },
    /// The $all stream, resuming after the given position.
    All { checkpoint: Option<Position> },
}

/// Tracks the last delivered position to deduplicate across the handoff.
enum Progress {
    Stream { last_event_number: i64 },
    All { last_commit: i64 },
}

impl Progress {
    fn should_deliver(&self, event: &ResolvedEvent) -> bool {
        match self {
            Progress::Stream { last_event_number } => event
                .original_event_number()
                .map(|n| n > *last_event_number)
                .unwrap_or(false),
            Progress::All { last_commit } => event
                .commit_position
                .map(|c| c > *last_commit)
                .unwrap_or(false),
        }
    }

    fn record(&mut self, event: &ResolvedEvent) {
        match self {
            Progress::Stream { last_event_number } => {
                if let Some(n) = event.original_event_number() {
                    *last_event_number = n;
                }
            }
            Progress::All { last_commit } => {
                if let Some(c) = event.commit_position {
                    *last_commit = c;
                }
            }
        }
    }
}

/// A running catch-up subscription held by the caller.
pub struct CatchUpSubscription {
    stream_id: String,
    correlation_id: Uuid,
    scheduler: SchedulerHandle,
    _task: JoinHandle<()>,
}

impl CatchUpSubscription {
    /// Stream this subscription follows; empty for $all.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Asks the server to drop the subscription; the drop handler fires with
    /// reason UserInitiated once the server confirms.
    pub fn stop(&self) {
        send_unsubscribe(&self.scheduler, self.correlation_id);
    }
}

/// Starts a catch-up subscription on a stream, resuming after `checkpoint`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn start_stream(
    scheduler: SchedulerHandle,
    params: OperationParams,
    stream_id: String,
    checkpoint: Option<i64>,
    settings: CatchUpSettings,
    credentials: Option<Credentials>,
    event_appeared: EventAppeared,
    live_started: Option<LiveProcessingStarted>,
    dropped: Option<SubscriptionDropped>,
) -> CatchUpSubscription {
    start(
        scheduler,
        params,
        Target::Stream {
            stream_id: stream_id.clone(),
            checkpoint,
        },
        stream_id,
        settings,
        credentials,
        event_appeared,
        live_started,
        dropped,
    )
}

/// Starts a catch-up subscription on $all, resuming after `checkpoint`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn start_all(
    scheduler: SchedulerHandle,
    params: OperationParams,
    checkpoint: Option<Position>,
    settings: CatchUpSettings,
    credentials: Option<Credentials>,
    event_appeared: EventAppeared,
    live_started: Option<LiveProcessingStarted>,
    dropped: Option<SubscriptionDropped>,
) -> CatchUpSubscription {
    start(
        scheduler,
        params,
        Target::All { checkpoint },
        String::new(),
        settings,
        credentials,
        event_appeared,
        live_started,
        dropped,
    )
}

#[allow(clippy::too_many_arguments)]
fn start(
    scheduler: SchedulerHandle,
    params: OperationParams,
    target: Target,
    stream_id: String,
    settings: CatchUpSettings,
    credentials: Option<Credentials>,
    event_appeared: EventAppeared,
    live_started: Option<LiveProcessingStarted>,
    dropped: Option<SubscriptionDropped>,
) -> CatchUpSubscription {
    let correlation_id = Uuid::new_v4();
    let task = tokio::spawn(run(
        scheduler.clone(),
        params,
        correlation_id,
        target,
        settings,
        credentials,
        event_appeared,
        live_started,
        dropped,
    ));
    CatchUpSubscription {
        stream_id,
        correlation_id,
        scheduler,
        _task: task,
    }
}

struct Engine {
    scheduler: SchedulerHandle,
    correlation_id: Uuid,
    event_appeared: EventAppeared,
    dropped: Option<SubscriptionDropped>,
}

impl Engine {
    fn drop_subscription(&self, reason: SubscriptionDropReason, error: Option<ClientError>) {
        debug!(reason = ?reason, "catch-up subscription dropped");
        if let Some(dropped) = &self.dropped {
            dropped(reason, error);
        }
    }

    /// Delivers one event; `false` means the handler panicked and the
    /// subscription was dropped.
    fn deliver(&self, event: ResolvedEvent) -> bool {
        let handler = Arc::clone(&self.event_appeared);
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            warn!("event handler panicked; dropping catch-up subscription");
            send_unsubscribe(&self.scheduler, self.correlation_id);
            self.drop_subscription(SubscriptionDropReason::EventHandlerException, None);
            return false;
        }
        true
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    scheduler: SchedulerHandle,
    params: OperationParams,
    correlation_id: Uuid,
    target: Target,
    settings: CatchUpSettings,
    credentials: Option<Credentials>,
    event_appeared: EventAppeared,
    live_started: Option<LiveProcessingStarted>,
    dropped: Option<SubscriptionDropped>,
) {
    let engine = Engine {
        scheduler: scheduler.clone(),
        correlation_id,
        event_appeared,
        dropped,
    };

    // subscribe first; pushed events buffer while history is read
    let subscribe_stream = match &target {
        Target::Stream { stream_id, .. } => stream_id.clone(),
        Target::All { .. } => String::new(),
    };
    let (op, confirm_rx, mut notices) = subscription::subscribe_to_stream(
        subscribe_stream,
        settings.resolve_link_tos,
        credentials.clone(),
    );
    scheduler.enqueue(
        correlation_id,
        Box::new(op),
        params.max_retries,
        params.timeout,
    );
    let confirmation = match confirm_rx.await {
        Ok(Ok(confirmation)) => confirmation,
        Ok(Err(e)) => {
            let reason = SubscriptionDropReason::from_error(&e);
            engine.drop_subscription(reason, Some(e));
            return;
        }
        Err(_) => {
            engine.drop_subscription(
                SubscriptionDropReason::ConnectionClosed,
                Some(ClientError::ConnectionClosed),
            );
            return;
        }
    };

    // where live pushes begin, per the confirmation snapshot
    let (mut progress, mut cursor) = match &target {
        Target::Stream { checkpoint, .. } => (
            Progress::Stream {
                last_event_number: checkpoint.unwrap_or(-1),
            },
            StreamCursor::Stream {
                next: checkpoint.map(|c| c + 1).unwrap_or(0),
                end: confirmation.last_event_number.unwrap_or(-1),
            },
        ),
        Target::All { checkpoint } => (
            Progress::All {
                last_commit: checkpoint.map(|p| p.commit).unwrap_or(-1),
            },
            StreamCursor::All {
                next: checkpoint.unwrap_or(Position::START),
                end: confirmation.last_commit_position,
            },
        ),
    };

    let mut live_queue: VecDeque<ResolvedEvent> = VecDeque::new();

    // ReadingHistory / CatchingUp: batch reads, buffering live pushes
    loop {
        match drain_notices(&mut notices, &mut live_queue, settings.max_live_queue_size) {
            DrainOutcome::Open => {}
            DrainOutcome::Overflowed => {
                send_unsubscribe(&scheduler, correlation_id);
                engine.drop_subscription(SubscriptionDropReason::ProcessingQueueOverflow, None);
                return;
            }
            DrainOutcome::Dropped { reason, error } => {
                engine.drop_subscription(reason, error);
                return;
            }
        }

        if cursor.caught_up() {
            break;
        }

        let batch = match read_batch(&scheduler, &params, &target, &cursor, &settings, &credentials)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                send_unsubscribe(&scheduler, correlation_id);
                engine.drop_subscription(SubscriptionDropReason::CatchUpError, Some(e));
                return;
            }
        };
        for event in batch.events {
            if progress.should_deliver(&event) {
                progress.record(&event);
                if !engine.deliver(event) {
                    return;
                }
            }
        }
        cursor.advance(batch.next, batch.end_reached);
        if batch.end_reached {
            break;
        }
    }

    // pushes that landed during the last read still count against the bound
    match drain_notices(&mut notices, &mut live_queue, settings.max_live_queue_size) {
        DrainOutcome::Open => {}
        DrainOutcome::Overflowed => {
            send_unsubscribe(&scheduler, correlation_id);
            engine.drop_subscription(SubscriptionDropReason::ProcessingQueueOverflow, None);
            return;
        }
        DrainOutcome::Dropped { reason, error } => {
            engine.drop_subscription(reason, error);
            return;
        }
    }

    // drain the buffered live queue in order, deduplicating on the handoff
    while let Some(event) = live_queue.pop_front() {
        if progress.should_deliver(&event) {
            progress.record(&event);
            if !engine.deliver(event) {
                return;
            }
        }
    }

    debug!("catch-up subscription is live");
    if let Some(live_started) = &live_started {
        live_started();
    }

    // Live: deliver pushes directly
    loop {
        match notices.recv().await {
            Some(SubscriptionNotice::Event(event)) => {
                if progress.should_deliver(&event) {
                    progress.record(&event);
                    if !engine.deliver(event) {
                        return;
                    }
                }
            }
            Some(SubscriptionNotice::Dropped { reason, error }) => {
                engine.drop_subscription(reason, error);
                return;
            }
            None => {
                engine.drop_subscription(
                    SubscriptionDropReason::ConnectionClosed,
                    Some(ClientError::ConnectionClosed),
                );
                return;
            }
        }
    }
}

/// History read cursor for either target kind.
enum StreamCursor {
    Stream { next: i64, end: i64 },
    All { next: Position, end: i64 },
}

impl StreamCursor {
    /// Whether the next historical read would start past the subscription's
    /// starting point.
    fn caught_up(&self) -> bool {
        match self {
            StreamCursor::Stream { next, end } => *next > *end,
            StreamCursor::All { next, end } => next.commit > *end,
        }
    }

    fn advance(&mut self, to: CursorPosition, _end_reached: bool) {
        match (self, to) {
            (StreamCursor::Stream { next, .. }, CursorPosition::Stream(n)) => *next = n,
            (StreamCursor::All { next, .. }, CursorPosition::All(p)) => *next = p,
            _ => {}
        }
    }
}

enum CursorPosition {
    Stream(i64),
    All(Position),
}

struct Batch {
    events: Vec<ResolvedEvent>,
    next: CursorPosition,
    end_reached: bool,
}

async fn read_batch(
    scheduler: &SchedulerHandle,
    params: &OperationParams,
    target: &Target,
    cursor: &StreamCursor,
    settings: &CatchUpSettings,
    credentials: &Option<Credentials>,
) -> crate::error::Result<Batch> {
    match (target, cursor) {
        (Target::Stream { stream_id, .. }, StreamCursor::Stream { next, .. }) => {
            let (op, rx) = operations::read_stream_events(
                stream_id.clone(),
                *next,
                settings.read_batch_size,
                ReadDirection::Forward,
                settings.resolve_link_tos,
                false,
                credentials.clone(),
            )?;
            scheduler.enqueue(
                Uuid::new_v4(),
                Box::new(op),
                params.max_retries,
                params.timeout,
            );
            let slice = rx.await.map_err(|_| ClientError::ConnectionClosed)??;
            Ok(Batch {
                events: slice.events,
                next: CursorPosition::Stream(slice.next_event_number),
                end_reached: slice.is_end_of_stream,
            })
        }
        (Target::All { .. }, StreamCursor::All { next, .. }) => {
            let (op, rx) = operations::read_all_events(
                *next,
                settings.read_batch_size,
                ReadDirection::Forward,
                settings.resolve_link_tos,
                false,
                credentials.clone(),
            )?;
            scheduler.enqueue(
                Uuid::new_v4(),
                Box::new(op),
                params.max_retries,
                params.timeout,
            );
            let slice = rx.await.map_err(|_| ClientError::ConnectionClosed)??;
            let end_reached = slice.is_end_of_all();
            Ok(Batch {
                events: slice.events,
                next: CursorPosition::All(slice.next_position),
                end_reached,
            })
        }
        _ => Err(ClientError::ServerError {
            message: "catch-up cursor does not match its target".to_string(),
        }),
    }
}

enum DrainOutcome {
    Open,
    Overflowed,
    Dropped {
        reason: SubscriptionDropReason,
        error: Option<ClientError>,
    },
}

/// Moves buffered pushes into the live queue, enforcing its bound.
fn drain_notices(
    notices: &mut mpsc::UnboundedReceiver<SubscriptionNotice>,
    live_queue: &mut VecDeque<ResolvedEvent>,
    max_live_queue_size: usize,
) -> DrainOutcome {
    loop {
        match notices.try_recv() {
            Ok(SubscriptionNotice::Event(event)) => {
                live_queue.push_back(event);
                if live_queue.len() > max_live_queue_size {
                    return DrainOutcome::Overflowed;
                }
            }
            Ok(SubscriptionNotice::Dropped { reason, error }) => {
                return DrainOutcome::Dropped { reason, error };
            }
            Err(mpsc::error::TryRecvError::Empty) => return DrainOutcome::Open,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                return DrainOutcome::Dropped {
                    reason: SubscriptionDropReason::ConnectionClosed,
                    error: Some(ClientError::ConnectionClosed),
                };
            }
        }
    }
}
