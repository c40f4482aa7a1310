//! Catch-up subscription behavior against a scripted server: history→live
//! handoff without loss or duplication, checkpoint resume, queue overflow,
//! and user-initiated stop.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use common::{connect, fast_settings, wait_until, MockServer, Reply};
use eventide_client::catchup::CatchUpSettings;
use eventide_client::messages::{
    decode_payload, encode_payload, ReadStreamEvents, ReadStreamEventsCompleted, ReadStreamResult,
    RecordedEvent, ResolvedEvent, StreamEventAppeared, SubscriptionConfirmation,
    SubscriptionDropCause, SubscriptionDroppedBody,
};
use eventide_client::subscription::SubscriptionDropReason;
use eventide_client::{Package, TcpCommand};

fn resolved(number: i64) -> ResolvedEvent {
    ResolvedEvent {
        event: Some(RecordedEvent {
            event_stream_id: "orders".to_string(),
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
    }
}

fn confirmation(correlation: Uuid, last_event_number: i64) -> Package {
    let body = SubscriptionConfirmation {
        last_commit_position: last_event_number * 100,
        last_event_number: Some(last_event_number),
    };
    Package::new(
        TcpCommand::SubscriptionConfirmation,
        correlation,
        encode_payload(&body).unwrap(),
    )
}

fn pushed(correlation: Uuid, number: i64) -> Package {
    let body = StreamEventAppeared {
        event: resolved(number),
    };
    Package::new(
        TcpCommand::StreamEventAppeared,
        correlation,
        encode_payload(&body).unwrap(),
    )
}

fn dropped_by_server(correlation: Uuid) -> Package {
    let body = SubscriptionDroppedBody {
        reason: SubscriptionDropCause::Unsubscribed,
    };
    Package::new(
        TcpCommand::SubscriptionDropped,
        correlation,
        encode_payload(&body).unwrap(),
    )
}

fn history_slice(request: &Package, stream_end: i64) -> Package {
    let body: ReadStreamEvents = decode_payload(&request.data).unwrap();
    let events: Vec<ResolvedEvent> = (body.from_event_number..=stream_end)
        .take(body.max_count as usize)
        .map(resolved)
        .collect();
    let completed = ReadStreamEventsCompleted {
        result: ReadStreamResult::Success,
        next_event_number: stream_end + 1,
        last_event_number: stream_end,
        is_end_of_stream: true,
        events,
        error: None,
    };
    Package::new(
        TcpCommand::ReadStreamEventsForwardCompleted,
        request.correlation_id,
        encode_payload(&completed).unwrap(),
    )
}

struct Recorder {
    delivered: Arc<Mutex<Vec<i64>>>,
    live_started: Arc<AtomicUsize>,
    drops: Arc<Mutex<Vec<SubscriptionDropReason>>>,
}

impl Recorder {
    fn new() -> Self {
        Self {
            delivered: Arc::new(Mutex::new(Vec::new())),
            live_started: Arc::new(AtomicUsize::new(0)),
            drops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn handlers(
        &self,
    ) -> (
        eventide_client::subscription::EventAppeared,
        eventide_client::subscription::LiveProcessingStarted,
        eventide_client::subscription::SubscriptionDropped,
    ) {
        let delivered = Arc::clone(&self.delivered);
        let live = Arc::clone(&self.live_started);
        let drops = Arc::clone(&self.drops);
        (
            Arc::new(move |event: ResolvedEvent| {
                delivered
                    .lock()
                    .unwrap()
                    .push(event.original_event_number().unwrap());
            }),
            Arc::new(move || {
                live.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(move |reason, _error| {
                drops.lock().unwrap().push(reason);
            }),
        )
    }
}

#[tokio::test]
async fn test_history_and_live_deliver_each_event_exactly_once_in_order() {
    // stream holds 0..=4 at subscribe time; 4 and 5 also arrive as pushes
    let sub: Arc<Mutex<Option<Uuid>>> = Arc::new(Mutex::new(None));
    let script_sub = Arc::clone(&sub);
    let server = MockServer::start(Arc::new(move |request: &Package| match request.command {
        TcpCommand::SubscribeToStream => {
            *script_sub.lock().unwrap() = Some(request.correlation_id);
            Reply::Packages(vec![
                confirmation(request.correlation_id, 4),
                pushed(request.correlation_id, 4),
                pushed(request.correlation_id, 5),
            ])
        }
        TcpCommand::ReadStreamEventsForward => {
            Reply::Packages(vec![history_slice(request, 4)])
        }
        TcpCommand::UnsubscribeFromStream => {
            Reply::Packages(vec![dropped_by_server(request.correlation_id)])
        }
        _ => Reply::Packages(Vec::new()),
    }))
    .await;
    let conn = connect(&server, fast_settings());

    let recorder = Recorder::new();
    let (on_event, on_live, on_drop) = recorder.handlers();
    let subscription = conn.subscribe_to_stream_from(
        "orders",
        None,
        CatchUpSettings::default(),
        on_event,
        Some(on_live),
        Some(on_drop),
        None,
    );

    let delivered = Arc::clone(&recorder.delivered);
    assert!(
        wait_until(
            move || delivered.lock().unwrap().len() >= 6,
            Duration::from_secs(3)
        )
        .await
    );
    assert_eq!(*recorder.delivered.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(recorder.live_started.load(Ordering::SeqCst), 1);

    subscription.stop();
    let drops = Arc::clone(&recorder.drops);
    assert!(
        wait_until(
            move || !drops.lock().unwrap().is_empty(),
            Duration::from_secs(3)
        )
        .await
    );
    assert_eq!(
        recorder.drops.lock().unwrap()[0],
        SubscriptionDropReason::UserInitiated
    );
    conn.close();
}

#[tokio::test]
async fn test_checkpoint_resume_skips_already_processed_events() {
    let server = MockServer::start(Arc::new(move |request: &Package| match request.command {
        TcpCommand::SubscribeToStream => Reply::Packages(vec![
            confirmation(request.correlation_id, 4),
            pushed(request.correlation_id, 5),
        ]),
        TcpCommand::ReadStreamEventsForward => {
            let body: ReadStreamEvents = decode_payload(&request.data).unwrap();
            // resuming after checkpoint 2, history must be read from 3
            assert_eq!(body.from_event_number, 3);
            Reply::Packages(vec![history_slice(request, 4)])
        }
        _ => Reply::Packages(Vec::new()),
    }))
    .await;
    let conn = connect(&server, fast_settings());

    let recorder = Recorder::new();
    let (on_event, on_live, on_drop) = recorder.handlers();
    let _subscription = conn.subscribe_to_stream_from(
        "orders",
        Some(2),
        CatchUpSettings::default(),
        on_event,
        Some(on_live),
        Some(on_drop),
        None,
    );

    let delivered = Arc::clone(&recorder.delivered);
    assert!(
        wait_until(
            move || delivered.lock().unwrap().len() >= 3,
            Duration::from_secs(3)
        )
        .await
    );
    assert_eq!(*recorder.delivered.lock().unwrap(), vec![3, 4, 5]);
    conn.close();
}

#[tokio::test]
async fn test_live_queue_overflow_drops_the_subscription() {
    let reads = Arc::new(AtomicUsize::new(0));
    let script_reads = Arc::clone(&reads);
    let server = MockServer::start(Arc::new(move |request: &Package| match request.command {
        TcpCommand::SubscribeToStream => {
            let mut packages = vec![confirmation(request.correlation_id, 49)];
            for n in 50..55 {
                packages.push(pushed(request.correlation_id, n));
            }
            Reply::Packages(packages)
        }
        TcpCommand::ReadStreamEventsForward => {
            if script_reads.fetch_add(1, Ordering::SeqCst) == 0 {
                // stall the first read so the pushes pile up
                Reply::Packages(Vec::new())
            } else {
                Reply::Packages(vec![history_slice(request, 49)])
            }
        }
        TcpCommand::UnsubscribeFromStream => {
            Reply::Packages(vec![dropped_by_server(request.correlation_id)])
        }
        _ => Reply::Packages(Vec::new()),
    }))
    .await;
    let conn = connect(&server, fast_settings());

    let recorder = Recorder::new();
    let (on_event, on_live, on_drop) = recorder.handlers();
    let settings = CatchUpSettings {
        max_live_queue_size: 2,
        ..CatchUpSettings::default()
    };
    let _subscription = conn.subscribe_to_stream_from(
        "orders",
        None,
        settings,
        on_event,
        Some(on_live),
        Some(on_drop),
        None,
    );

    let drops = Arc::clone(&recorder.drops);
    assert!(
        wait_until(
            move || !drops.lock().unwrap().is_empty(),
            Duration::from_secs(3)
        )
        .await
    );
    assert_eq!(
        recorder.drops.lock().unwrap()[0],
        SubscriptionDropReason::ProcessingQueueOverflow
    );
    assert_eq!(recorder.live_started.load(Ordering::SeqCst), 0);
    conn.close();
}

#[tokio::test]
async fn test_empty_stream_goes_live_immediately() {
    let server = MockServer::start(Arc::new(move |request: &Package| match request.command {
        TcpCommand::SubscribeToStream => {
            Reply::Packages(vec![confirmation(request.correlation_id, -1)])
        }
        TcpCommand::UnsubscribeFromStream => {
            Reply::Packages(vec![dropped_by_server(request.correlation_id)])
        }
        _ => Reply::Packages(Vec::new()),
    }))
    .await;
    let conn = connect(&server, fast_settings());

    let recorder = Recorder::new();
    let (on_event, on_live, on_drop) = recorder.handlers();
    let subscription = conn.subscribe_to_stream_from(
        "orders",
        None,
        CatchUpSettings::default(),
        on_event,
        Some(on_live),
        Some(on_drop),
        None,
    );

    let live = Arc::clone(&recorder.live_started);
    assert!(
        wait_until(
            move || live.load(Ordering::SeqCst) == 1,
            Duration::from_secs(3)
        )
        .await
    );
    // no history reads were needed
    assert_eq!(server.count(TcpCommand::ReadStreamEventsForward), 0);
    assert!(recorder.delivered.lock().unwrap().is_empty());

    subscription.stop();
    let drops = Arc::clone(&recorder.drops);
    assert!(
        wait_until(
            move || !drops.lock().unwrap().is_empty(),
            Duration::from_secs(3)
        )
        .await
    );
    assert_eq!(
        recorder.drops.lock().unwrap()[0],
        SubscriptionDropReason::UserInitiated
    );
    conn.close();
}
