use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tuya_dp::convert::Scale;
use tuya_dp::protocol::{decode, encode};
use tuya_dp::{
    AckMode, AdapterConfig, ClusterCommand, CommandError, Converter, DatapointFrame, DeviceDpSchema,
    DeviceDpSchemaEntry, DeviceEvent, DpDevice, DpType, HealthWarning, InboundPayload, MemoryStore,
    OutboundCommand, SchemaError, Transport, TuyaDpError, TypedValue,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Clone, Default)]
struct MockTransport {
    sent: Arc<Mutex<Vec<(Instant, OutboundCommand)>>>,
}

impl MockTransport {
    fn sent(&self) -> Vec<(Instant, OutboundCommand)> {
        self.sent.lock().clone()
    }
}

impl Transport for MockTransport {
    async fn transmit(&self, command: OutboundCommand) -> Result<(), CommandError> {
        self.sent.lock().push((Instant::now(), command));
        Ok(())
    }
}

fn schema() -> Arc<DeviceDpSchema> {
    Arc::new(
        DeviceDpSchema::builder("scenario_device")
            .ack_mode(AckMode::TransactionId)
            .entry(DeviceDpSchemaEntry::new(1, "alarm_motion", DpType::Bool))
            .entry(
                DeviceDpSchemaEntry::new(2, "measure_temperature", DpType::Value)
                    .with_converter(Converter::Scale(Scale::divide_by(10))),
            )
            .entry(DeviceDpSchemaEntry::new(4, "manual_feed", DpType::Value))
            .build()
            .unwrap(),
    )
}

fn start(store: Arc<MemoryStore>) -> (DpDevice, MockTransport) {
    init_logger();
    let transport = MockTransport::default();
    let device = DpDevice::builder("scenario", transport.clone(), schema())
        .store(store)
        .config(AdapterConfig::default())
        .initial_transaction_id(0)
        .build();
    (device, transport)
}

fn report(bytes: Vec<u8>) -> InboundPayload {
    InboundPayload::new(ClusterCommand::DataReport, None, bytes)
}

/// Collect events until an update for `field` arrives.
async fn events_until<S>(events: &mut S, field: &str) -> Vec<DeviceEvent>
where
    S: futures_util::Stream<Item = DeviceEvent> + Unpin,
{
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let done = matches!(&event, DeviceEvent::Update(u) if u.field == field);
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn bool_frame_reaches_the_store() {
    let store = Arc::new(MemoryStore::new());
    let (device, _) = start(store.clone());
    let mut events = Box::pin(device.stream());

    let bytes = vec![0x01, 0x01, 0x00, 0x01, 0x01];
    let frame = decode(&bytes).unwrap();
    assert_eq!(frame.dp_id(), 1);
    assert_eq!(frame.dp_type(), DpType::Bool);

    device.deliver(report(bytes)).await.unwrap();
    events_until(&mut events, "alarm_motion").await;
    assert_eq!(store.get("alarm_motion"), Some(TypedValue::Bool(true)));
    device.stop().await;
}

#[tokio::test(start_paused = true)]
async fn value_frame_is_scaled_by_schema_divisor() {
    let store = Arc::new(MemoryStore::new());
    let (device, _) = start(store.clone());
    let mut events = Box::pin(device.stream());

    device
        .deliver(report(vec![0x02, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x64]))
        .await
        .unwrap();
    events_until(&mut events, "measure_temperature").await;
    assert_eq!(store.get("measure_temperature"), Some(TypedValue::Decimal(10.0)));
    device.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_reports_are_suppressed_inside_the_window() {
    let store = Arc::new(MemoryStore::new());
    let (device, _) = start(store.clone());
    let mut events = Box::pin(device.stream());
    let motion = || encode(&DatapointFrame::bool(1, true));

    // 50ms apart: one update
    device.deliver(report(motion())).await.unwrap();
    tokio::time::advance(Duration::from_millis(50)).await;
    device.deliver(report(motion())).await.unwrap();
    device
        .deliver(report(encode(&DatapointFrame::value(2, 1))))
        .await
        .unwrap();
    let seen = events_until(&mut events, "measure_temperature").await;
    let motion_updates = seen
        .iter()
        .filter(|e| matches!(e, DeviceEvent::Update(u) if u.field == "alarm_motion"))
        .count();
    assert_eq!(motion_updates, 1);

    // 500ms apart: two updates
    tokio::time::advance(Duration::from_secs(1)).await;
    device.deliver(report(motion())).await.unwrap();
    tokio::time::advance(Duration::from_millis(500)).await;
    device.deliver(report(motion())).await.unwrap();
    device
        .deliver(report(encode(&DatapointFrame::value(2, 2))))
        .await
        .unwrap();
    let seen = events_until(&mut events, "measure_temperature").await;
    let motion_updates = seen
        .iter()
        .filter(|e| matches!(e, DeviceEvent::Update(u) if u.field == "alarm_motion"))
        .count();
    assert_eq!(motion_updates, 2);

    // 1 + 1 temperature markers, 1 + 2 motion updates
    assert_eq!(store.write_count(), 5);
    device.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unacked_command_is_retried_once_then_times_out() {
    let store = Arc::new(MemoryStore::new());
    let (device, transport) = start(store);
    let mut events = Box::pin(device.stream());
    let started = Instant::now();

    let err = device.set("manual_feed", 2).await.unwrap_err();
    assert_eq!(
        err,
        TuyaDpError::Command(CommandError::Timeout {
            dp_id: 4,
            attempts: 2
        })
    );

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1.payload, sent[1].1.payload);
    assert_ne!(sent[0].1.transaction_id, sent[1].1.transaction_id);
    assert!(sent[1].0 - sent[0].0 >= Duration::from_secs(5));
    assert!(Instant::now() - started >= Duration::from_secs(10));

    assert_eq!(
        events.next().await,
        Some(DeviceEvent::Health(HealthWarning::CommandFailed {
            dp_id: 4,
            attempts: 2
        }))
    );
    device.stop().await;
}

#[tokio::test(start_paused = true)]
async fn ack_after_retry_still_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let (device, transport) = start(store);

    let handle = device.clone();
    let pending = tokio::spawn(async move { handle.set("manual_feed", 2).await });

    // First transmission goes unanswered
    tokio::time::sleep(Duration::from_millis(5100)).await;
    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    let retry_id = sent[1].1.transaction_id.unwrap();

    device.acknowledge(retry_id).await.unwrap();
    let delivery = pending.await.unwrap().unwrap();
    assert_eq!(
        delivery,
        tuya_dp::Delivery::Acked {
            transaction_id: retry_id,
            attempts: 2
        }
    );
    device.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unmapped_dp_is_logged_and_skipped() {
    let store = Arc::new(MemoryStore::new());
    let (device, _) = start(store.clone());
    let mut events = Box::pin(device.stream());

    let mut payload = encode(&DatapointFrame::value(99, 12));
    payload.extend(encode(&DatapointFrame::bool(1, true)));
    device.deliver(report(payload)).await.unwrap();

    let seen = events_until(&mut events, "alarm_motion").await;
    assert_eq!(
        seen[0],
        DeviceEvent::Unmapped(SchemaError::UnmappedDp {
            dp_id: 99,
            type_tag: 2
        })
    );
    assert_eq!(seen.len(), 2);
    assert_eq!(store.write_count(), 1);

    let unmapped = device.unmapped().await.unwrap();
    assert_eq!(unmapped.len(), 1);
    assert_eq!(unmapped[0].dp_id, 99);
    device.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_type_keeps_raw_bytes_and_later_frames_process() {
    let store = Arc::new(MemoryStore::new());
    let (device, _) = start(store.clone());
    let mut events = Box::pin(device.stream());

    let mut payload = vec![0x07, 0x09, 0x00, 0x02, 0xAB, 0xCD];
    payload.extend(encode(&DatapointFrame::bool(1, false)));
    device.deliver(report(payload)).await.unwrap();

    let seen = events_until(&mut events, "alarm_motion").await;
    match &seen[0] {
        DeviceEvent::UnknownType(frame) => {
            assert_eq!(frame.dp_id, 7);
            assert_eq!(frame.type_tag, 9);
            assert_eq!(frame.payload, vec![0xAB, 0xCD]);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(store.get("alarm_motion"), Some(TypedValue::Bool(false)));
    device.stop().await;
}

#[tokio::test(start_paused = true)]
async fn store_failures_do_not_stop_processing() {
    init_logger();
    let store = Arc::new(MemoryStore::with_capabilities(["measure_temperature"]));
    let device = DpDevice::builder("restricted", MockTransport::default(), schema())
        .store(store.clone())
        .build();
    let mut events = Box::pin(device.stream());

    let mut payload = encode(&DatapointFrame::bool(1, true));
    payload.extend(encode(&DatapointFrame::value(2, 55)));
    device.deliver(report(payload)).await.unwrap();

    events_until(&mut events, "measure_temperature").await;
    assert!(store.get("alarm_motion").is_none());
    assert_eq!(store.get("measure_temperature"), Some(TypedValue::Decimal(5.5)));
    device.stop().await;
}

#[tokio::test(start_paused = true)]
async fn burst_larger_than_queue_is_not_dropped() {
    let store = Arc::new(MemoryStore::new());
    let (device, _) = start(store.clone());
    let mut events = Box::pin(device.stream());

    for i in 0..40 {
        device
            .deliver(report(encode(&DatapointFrame::value(2, i))))
            .await
            .unwrap();
    }
    let mut updates = 0;
    while updates < 40 {
        if let Some(DeviceEvent::Update(_)) = events.next().await {
            updates += 1;
        }
    }
    assert_eq!(store.write_count(), 40);
    device.stop().await;
}
