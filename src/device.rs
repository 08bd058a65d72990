//! Per-device datapoint adapter.
//! One background task per device owns the transaction table, the
//! dispatcher and the health monitor; handles talk to it over channels.

use crate::config::AdapterConfig;
use crate::convert::TypedValue;
use crate::dispatch::{Dispatch, Dispatcher, UnmappedDp};
use crate::error::{CommandError, DecodeError, Result, SchemaError, TuyaDpError, UnknownFrame};
use crate::health::{HealthMonitor, HealthWarning};
use crate::protocol::{ClusterCommand, DatapointFrame, Envelope, FrameReader, encode};
use crate::schema::DeviceDpSchema;
use crate::store::CapabilityStore;
use crate::timesync;
use crate::transaction::{AckMode, Expired, Issued, PendingCommand, Transmission, TransactionManager};
use futures_core::stream::Stream;
use log::{debug, error, info, warn};
use std::future::{Future, pending};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Outbound payload handed to the cluster transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    /// Id to embed as the envelope sequence number, if the command is tracked
    pub transaction_id: Option<u8>,
    pub command: ClusterCommand,
    /// Encoded datapoint frames (or the raw body for non-datapoint commands)
    pub payload: Vec<u8>,
}

impl OutboundCommand {
    /// Full cluster payload as framed for `command`.
    ///
    /// Datapoint commands carry `[sequence u16][frames]`, time sync carries
    /// `[payload size u16][time]` and a data query has no body.
    pub fn to_cluster_payload(&self) -> Vec<u8> {
        let prefix = match self.command {
            ClusterCommand::DataQuery => return Vec::new(),
            ClusterCommand::TimeSync => self.payload.len() as u16,
            _ => self.transaction_id.unwrap_or(0) as u16,
        };
        let mut data = Vec::with_capacity(2 + self.payload.len());
        data.extend_from_slice(&prefix.to_be_bytes());
        data.extend_from_slice(&self.payload);
        data
    }
}

/// A payload received from the device side of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPayload {
    pub command: ClusterCommand,
    /// Echoed transaction id, when the transport knows it
    pub transaction_id: Option<u8>,
    /// Concatenated datapoint frames
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

impl InboundPayload {
    pub fn new(command: ClusterCommand, transaction_id: Option<u8>, payload: Vec<u8>) -> Self {
        Self {
            command,
            transaction_id,
            payload,
            received_at: Instant::now(),
        }
    }

    /// Build from an undissected cluster payload (`[sequence][frames]`).
    ///
    /// Sequences above 255 cannot name a transaction and are dropped.
    pub fn from_cluster(command: ClusterCommand, data: &[u8]) -> std::result::Result<Self, DecodeError> {
        let (sequence, body) = Envelope::split(data)?;
        let transaction_id = u8::try_from(sequence).ok();
        if transaction_id.is_none() {
            debug!("sequence {:#06x} is not a transaction id", sequence);
        }
        Ok(Self::new(command, transaction_id, body.to_vec()))
    }
}

/// Sends commands towards the device. Supplied by the hosting application.
pub trait Transport: Send + Sync + 'static {
    fn transmit(
        &self,
        command: OutboundCommand,
    ) -> impl Future<Output = std::result::Result<(), CommandError>> + Send;
}

/// How a command was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acked { transaction_id: u8, attempts: u32 },
    /// Transmitted to a device that never acknowledges
    Unconfirmed,
}

impl Delivery {
    /// Fails with `NoAckSupport` when delivery could not be confirmed.
    pub fn guarantee(self) -> std::result::Result<Self, CommandError> {
        match self {
            Delivery::Acked { .. } => Ok(self),
            Delivery::Unconfirmed => Err(CommandError::NoAckSupport),
        }
    }

    pub fn is_acked(&self) -> bool {
        matches!(self, Delivery::Acked { .. })
    }
}

/// Events published on the device stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Update(crate::dispatch::CapabilityUpdate),
    Health(HealthWarning),
    Unmapped(SchemaError),
    /// Frame with an unknown type tag, raw payload retained
    UnknownType(UnknownFrame),
}

type Responder = oneshot::Sender<std::result::Result<Delivery, CommandError>>;

/// Internal commands for the background device task.
enum DeviceCommand {
    Send {
        frame: DatapointFrame,
        resp_tx: Responder,
    },
    Query {
        resp_tx: oneshot::Sender<std::result::Result<(), CommandError>>,
    },
    Acknowledge {
        transaction_id: u8,
    },
    Unmapped {
        resp_tx: oneshot::Sender<Vec<UnmappedDp>>,
    },
}

impl DeviceCommand {
    fn cancel(self) {
        match self {
            DeviceCommand::Send { resp_tx, .. } => {
                let _ = resp_tx.send(Err(CommandError::Cancelled));
            }
            DeviceCommand::Query { resp_tx } => {
                let _ = resp_tx.send(Err(CommandError::Cancelled));
            }
            DeviceCommand::Acknowledge { .. } | DeviceCommand::Unmapped { .. } => {}
        }
    }
}

/// Builder for [`DpDevice`].
pub struct DeviceBuilder<T> {
    id: String,
    transport: T,
    schema: Arc<DeviceDpSchema>,
    store: Option<Arc<dyn CapabilityStore>>,
    config: AdapterConfig,
    initial_transaction_id: Option<u8>,
}

impl<T: Transport> DeviceBuilder<T> {
    pub fn new<I: Into<String>>(id: I, transport: T, schema: Arc<DeviceDpSchema>) -> Self {
        Self {
            id: id.into(),
            transport,
            schema,
            store: None,
            config: AdapterConfig::default(),
            initial_transaction_id: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn CapabilityStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: AdapterConfig) -> Self {
        self.config = config;
        self
    }

    /// Start transaction ids at a fixed value instead of a random one.
    pub fn initial_transaction_id(mut self, id: u8) -> Self {
        self.initial_transaction_id = Some(id);
        self
    }

    /// Spawn the device task. Must be called from within a tokio runtime.
    pub fn build(self) -> DpDevice {
        let ack_mode = self
            .config
            .ack_mode
            .or(self.schema.ack_mode())
            .unwrap_or_default();
        let initial_id = self.initial_transaction_id.unwrap_or_else(rand::random::<u8>);

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.queue_depth());
        let (broadcast_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();

        let task = DeviceTask {
            id: self.id.clone(),
            transport: self.transport,
            store: self.store,
            transactions: TransactionManager::new(ack_mode, self.config.command_timeout())
                .with_initial_id(initial_id)
                .with_echo_window(self.config.echo_window()),
            dispatcher: Dispatcher::new(self.schema.clone())
                .with_quiescence(self.config.quiescence()),
            health: HealthMonitor::new(self.config.corruption_threshold),
            attempts: self.config.attempts(),
            broadcast_tx: broadcast_tx.clone(),
        };

        info!(
            "Starting device {} (model {}, ack mode {:?})",
            self.id,
            self.schema.model(),
            ack_mode
        );
        let time_sync = self.config.time_sync_interval();
        let token = cancel_token.clone();
        tokio::spawn(task.run(rx, inbound_rx, token, time_sync));

        DpDevice {
            id: Arc::from(self.id),
            schema: self.schema,
            ack_mode,
            tx,
            inbound_tx,
            broadcast_tx,
            cancel_token,
        }
    }
}

/// Handle to a running device adapter. Cheap to clone.
#[derive(Clone)]
pub struct DpDevice {
    id: Arc<str>,
    schema: Arc<DeviceDpSchema>,
    ack_mode: AckMode,
    tx: mpsc::Sender<DeviceCommand>,
    inbound_tx: mpsc::Sender<InboundPayload>,
    broadcast_tx: broadcast::Sender<DeviceEvent>,
    cancel_token: CancellationToken,
}

impl DpDevice {
    // -------------------------------------------------------------------------
    // Public API
    // -------------------------------------------------------------------------

    pub fn builder<I: Into<String>, T: Transport>(
        id: I,
        transport: T,
        schema: Arc<DeviceDpSchema>,
    ) -> DeviceBuilder<T> {
        DeviceBuilder::new(id, transport, schema)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn schema(&self) -> &Arc<DeviceDpSchema> {
        &self.schema
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    /// Set a named field, waiting for the ack (or for transmission on
    /// devices that never acknowledge).
    pub async fn set<V: Into<TypedValue>>(&self, field: &str, value: V) -> Result<Delivery> {
        let entry = self
            .schema
            .lookup_field(field)
            .ok_or_else(|| CommandError::UnknownField(field.to_string()))?;
        let frame = entry.encode(&value.into())?;
        self.send_frame(frame).await
    }

    /// Set a value by dp id using the schema's converter for it.
    pub async fn set_dp<V: Into<TypedValue>>(&self, dp_id: u8, value: V) -> Result<Delivery> {
        let entry = self
            .schema
            .lookup(dp_id)
            .ok_or(CommandError::UnknownDp(dp_id))?;
        let frame = entry.encode(&value.into())?;
        self.send_frame(frame).await
    }

    /// Send a prebuilt frame, bypassing the schema.
    pub async fn send_frame(&self, frame: DatapointFrame) -> Result<Delivery> {
        debug!("{}: send dp {} ({:?})", self.id, frame.dp_id(), frame.dp_type());
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send_to_task(DeviceCommand::Send { frame, resp_tx }).await?;
        resp_rx
            .await
            .map_err(|_| CommandError::Cancelled)?
            .map_err(TuyaDpError::from)
    }

    /// Ask the device to report every datapoint.
    pub async fn query(&self) -> Result<()> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send_to_task(DeviceCommand::Query { resp_tx }).await?;
        resp_rx
            .await
            .map_err(|_| CommandError::Cancelled)?
            .map_err(TuyaDpError::from)
    }

    /// Queue an inbound payload. Waits (with a warning) if the queue is full.
    pub async fn deliver(&self, inbound: InboundPayload) -> Result<()> {
        match self.inbound_tx.try_send(inbound) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(inbound)) => {
                warn!(
                    "{}: inbound queue full ({} payloads), waiting",
                    self.id,
                    self.inbound_tx.max_capacity()
                );
                self.inbound_tx
                    .send(inbound)
                    .await
                    .map_err(|_| CommandError::Cancelled.into())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CommandError::Cancelled.into()),
        }
    }

    /// Report an ack received out of band (e.g. a ZCL default response).
    pub async fn acknowledge(&self, transaction_id: u8) -> Result<()> {
        self.send_to_task(DeviceCommand::Acknowledge { transaction_id })
            .await
    }

    /// Dps reported by the device that its schema does not map.
    pub async fn unmapped(&self) -> Result<Vec<UnmappedDp>> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send_to_task(DeviceCommand::Unmapped { resp_tx }).await?;
        resp_rx
            .await
            .map_err(|_| CommandError::Cancelled.into())
    }

    /// Returns a Stream of events from the device.
    pub fn stream(&self) -> impl Stream<Item = DeviceEvent> + Send + 'static {
        let mut rx = self.broadcast_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Device event stream lagged by {} events", n);
                        continue;
                    }
                }
            }
        }
    }

    /// Stop the device task and wait for its teardown.
    ///
    /// In-flight commands resolve with `CommandError::Cancelled`; nothing is
    /// retried after this returns.
    pub async fn stop(&self) {
        info!("Stopping device {}", self.id);
        self.cancel_token.cancel();
        self.tx.closed().await;
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send_to_task(&self, cmd: DeviceCommand) -> Result<()> {
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(cmd).await {
            cmd.cancel();
            return Err(CommandError::Cancelled.into());
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------
// Background Task
// -------------------------------------------------------------------------

struct DeviceTask<T> {
    id: String,
    transport: T,
    store: Option<Arc<dyn CapabilityStore>>,
    transactions: TransactionManager<Responder>,
    dispatcher: Dispatcher,
    health: HealthMonitor,
    attempts: u32,
    broadcast_tx: broadcast::Sender<DeviceEvent>,
}

impl<T: Transport> DeviceTask<T> {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<DeviceCommand>,
        mut inbound_rx: mpsc::Receiver<InboundPayload>,
        cancel_token: CancellationToken,
        time_sync: Option<tokio::time::Duration>,
    ) {
        let mut sync_interval = time_sync.map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        debug!("Background task for device {} started", self.id);

        loop {
            let deadline = self.transactions.next_deadline();

            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    debug!("Background task for {} received stop signal", self.id);
                    break;
                }
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.process_command(cmd).await,
                    None => break,
                },
                inbound = inbound_rx.recv() => match inbound {
                    Some(inbound) => self.process_inbound(inbound).await,
                    None => break,
                },
                _ = async {
                    match deadline {
                        Some(at) => sleep_until(at).await,
                        None => pending::<()>().await,
                    }
                } => self.process_expired().await,
                _ = async {
                    match sync_interval.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => pending::<()>().await,
                    }
                } => self.push_time_sync().await,
            }
        }

        self.teardown(&mut rx, &mut inbound_rx);
        debug!("Background task for device {} exited", self.id);
    }

    fn teardown(
        &mut self,
        rx: &mut mpsc::Receiver<DeviceCommand>,
        inbound_rx: &mut mpsc::Receiver<InboundPayload>,
    ) {
        let cancelled = self.transactions.cancel_all();
        if !cancelled.is_empty() {
            info!(
                "{}: discarding {} in-flight command(s)",
                self.id,
                cancelled.len()
            );
        }
        for command in cancelled {
            let _ = command.waiter.send(Err(CommandError::Cancelled));
        }

        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            cmd.cancel();
        }
        inbound_rx.close();
        let mut dropped = 0;
        while inbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("{}: discarded {} queued inbound payload(s) on stop", self.id, dropped);
        }
    }

    async fn process_command(&mut self, cmd: DeviceCommand) {
        match cmd {
            DeviceCommand::Send { frame, resp_tx } => self.issue(frame, resp_tx).await,
            DeviceCommand::Query { resp_tx } => {
                let result = self
                    .transport
                    .transmit(OutboundCommand {
                        transaction_id: None,
                        command: ClusterCommand::DataQuery,
                        payload: Vec::new(),
                    })
                    .await;
                let _ = resp_tx.send(result);
            }
            DeviceCommand::Acknowledge { transaction_id } => {
                match self.transactions.acknowledge(transaction_id) {
                    Some(command) => Self::settle(command),
                    None => debug!(
                        "{}: ack for unknown transaction {}",
                        self.id, transaction_id
                    ),
                }
            }
            DeviceCommand::Unmapped { resp_tx } => {
                let _ = resp_tx.send(self.dispatcher.unmapped());
            }
        }
    }

    async fn issue(&mut self, frame: DatapointFrame, resp_tx: Responder) {
        if self.transactions.is_saturated() {
            let _ = resp_tx.send(Err(CommandError::Saturated));
            return;
        }

        let bytes = encode(&frame);
        let issued = self.transactions.issue(
            frame.dp_id(),
            bytes,
            self.attempts,
            resp_tx,
            Instant::now(),
        );
        match issued {
            Ok(Issued::Awaiting(transmission)) => self.transmit(transmission).await,
            Ok(Issued::Unconfirmed(transmission, resp_tx)) => {
                let result = self
                    .transport
                    .transmit(Self::data_request(transmission))
                    .await
                    .map(|()| Delivery::Unconfirmed);
                let _ = resp_tx.send(result);
            }
            Err(e) => error!("{}: failed to issue command: {}", self.id, e),
        }
    }

    /// Transmit a tracked command. A failed send is left to the retry timer.
    async fn transmit(&mut self, transmission: Transmission) {
        let transaction_id = transmission.transaction_id;
        debug!(
            "{}: tx {} -> {}",
            self.id,
            transaction_id,
            hex::encode(&transmission.frame)
        );
        if let Err(e) = self
            .transport
            .transmit(Self::data_request(transmission))
            .await
        {
            warn!("{}: transmit of tx {} failed: {}", self.id, transaction_id, e);
        }
    }

    fn data_request(transmission: Transmission) -> OutboundCommand {
        OutboundCommand {
            transaction_id: Some(transmission.transaction_id),
            command: ClusterCommand::DataRequest,
            payload: transmission.frame,
        }
    }

    fn settle(command: PendingCommand<Responder>) {
        let _ = command.waiter.send(Ok(Delivery::Acked {
            transaction_id: command.transaction_id,
            attempts: command.attempts,
        }));
    }

    async fn process_expired(&mut self) {
        for outcome in self.transactions.expire(Instant::now()) {
            match outcome {
                Expired::Retry(transmission) => self.transmit(transmission).await,
                Expired::Failed(command) => {
                    let warning = self.health.command_failed(command.dp_id, command.attempts);
                    let _ = command.waiter.send(Err(CommandError::Timeout {
                        dp_id: command.dp_id,
                        attempts: command.attempts,
                    }));
                    self.publish(DeviceEvent::Health(warning));
                }
            }
        }
    }

    async fn process_inbound(&mut self, inbound: InboundPayload) {
        debug!(
            "{}: {} seq={:?} payload={}",
            self.id,
            inbound.command,
            inbound.transaction_id,
            hex::encode(&inbound.payload)
        );

        match inbound.command {
            ClusterCommand::TimeSync => {
                self.push_time_sync().await;
                return;
            }
            command if !command.carries_datapoints() => {
                debug!("{}: ignoring {}", self.id, command);
                return;
            }
            _ => {}
        }

        if inbound.command == ClusterCommand::DataResponse
            && self.transactions.ack_mode() == AckMode::TransactionId
        {
            if let Some(command) = inbound
                .transaction_id
                .and_then(|tid| self.transactions.acknowledge(tid))
            {
                Self::settle(command);
            }
        }

        for item in FrameReader::new(&inbound.payload) {
            match item {
                Ok(frame) => self.process_frame(&frame, inbound.received_at),
                Err(DecodeError::UnknownType(unknown)) => {
                    warn!(
                        "{}: unknown dp type 0x{:02X} for dp {}, payload={}",
                        self.id,
                        unknown.type_tag,
                        unknown.dp_id,
                        hex::encode(&unknown.payload)
                    );
                    self.publish(DeviceEvent::UnknownType(unknown));
                }
                Err(e @ DecodeError::Truncated { .. }) => {
                    warn!("{}: {}", self.id, e);
                    if let Some(warning) = e.dp_id().and_then(|dp| self.health.record_truncated(dp)) {
                        self.publish(DeviceEvent::Health(warning));
                    }
                }
                Err(e) => warn!("{}: skipping frame: {}", self.id, e),
            }
        }
    }

    fn process_frame(&mut self, frame: &DatapointFrame, observed_at: Instant) {
        let dp_id = frame.dp_id();
        self.health.record_success(dp_id);

        if let Some(command) = self.transactions.acknowledge_dp(dp_id, observed_at) {
            Self::settle(command);
        }

        match self.dispatcher.dispatch(frame, observed_at) {
            Dispatch::Update(update) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.set_value(&update.field, &update.value) {
                        warn!("{}: store rejected {}: {}", self.id, update.field, e);
                    }
                }
                self.publish(DeviceEvent::Update(update));
            }
            Dispatch::Unmapped(err) => self.publish(DeviceEvent::Unmapped(err)),
            Dispatch::Suppressed | Dispatch::Rejected { .. } => {}
        }
    }

    async fn push_time_sync(&mut self) {
        let payload = timesync::current_payload();
        debug!("{}: time sync {}", self.id, hex::encode(&payload));
        if let Err(e) = self
            .transport
            .transmit(OutboundCommand {
                transaction_id: None,
                command: ClusterCommand::TimeSync,
                payload,
            })
            .await
        {
            warn!("{}: time sync failed: {}", self.id, e);
        }
    }

    fn publish(&self, event: DeviceEvent) {
        // No subscribers is not an error
        let _ = self.broadcast_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::{Converter, Scale};
    use crate::protocol::DpType;
    use crate::schema::DeviceDpSchemaEntry;
    use crate::store::MemoryStore;
    use futures_util::StreamExt;
    use parking_lot::Mutex;
    use tokio::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<OutboundCommand>>>,
    }

    impl Transport for RecordingTransport {
        async fn transmit(&self, command: OutboundCommand) -> std::result::Result<(), CommandError> {
            self.sent.lock().push(command);
            Ok(())
        }
    }

    fn schema(ack_mode: AckMode) -> Arc<DeviceDpSchema> {
        Arc::new(
            DeviceDpSchema::builder("test")
                .ack_mode(ack_mode)
                .entry(DeviceDpSchemaEntry::new(1, "onoff", DpType::Bool))
                .entry(
                    DeviceDpSchemaEntry::new(2, "measure_temperature", DpType::Value)
                        .with_converter(Converter::Scale(Scale::divide_by(10))),
                )
                .entry(DeviceDpSchemaEntry::new(4, "portion", DpType::Value))
                .build()
                .unwrap(),
        )
    }

    fn report(frames: &[DatapointFrame]) -> InboundPayload {
        let payload = frames.iter().flat_map(encode).collect();
        InboundPayload::new(ClusterCommand::DataReport, None, payload)
    }

    #[tokio::test(start_paused = true)]
    async fn set_resolves_on_matching_ack() {
        let transport = RecordingTransport::default();
        let device = DpDevice::builder("dev", transport.clone(), schema(AckMode::TransactionId))
            .initial_transaction_id(10)
            .build();

        let handle = device.clone();
        let pending = tokio::spawn(async move { handle.set("portion", 3).await });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].transaction_id, Some(10));
        assert_eq!(sent[0].command, ClusterCommand::DataRequest);
        assert_eq!(sent[0].payload, encode(&DatapointFrame::value(4, 3)));

        let ack = InboundPayload::new(
            ClusterCommand::DataResponse,
            Some(10),
            encode(&DatapointFrame::value(4, 3)),
        );
        device.deliver(ack).await.unwrap();

        let delivery = pending.await.unwrap().unwrap();
        assert_eq!(
            delivery,
            Delivery::Acked {
                transaction_id: 10,
                attempts: 1
            }
        );
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fire_and_forget_is_unconfirmed() {
        let transport = RecordingTransport::default();
        let device = DpDevice::builder("dev", transport.clone(), schema(AckMode::None)).build();

        let delivery = device.set("onoff", true).await.unwrap();
        assert_eq!(delivery, Delivery::Unconfirmed);
        assert_eq!(delivery.guarantee(), Err(CommandError::NoAckSupport));
        assert_eq!(transport.sent.lock().len(), 1);
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_field_is_rejected_before_sending() {
        let transport = RecordingTransport::default();
        let device = DpDevice::builder("dev", transport.clone(), schema(AckMode::None)).build();
        let err = device.set("volume", 3).await.unwrap_err();
        assert_eq!(err, TuyaDpError::Command(CommandError::UnknownField("volume".into())));
        assert!(transport.sent.lock().is_empty());
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reports_reach_store_and_stream() {
        let transport = RecordingTransport::default();
        let store = Arc::new(MemoryStore::new());
        let device = DpDevice::builder("dev", transport, schema(AckMode::TransactionId))
            .store(store.clone())
            .build();
        let mut events = Box::pin(device.stream());

        device
            .deliver(report(&[DatapointFrame::bool(1, true), DatapointFrame::value(2, 215)]))
            .await
            .unwrap();

        for _ in 0..2 {
            assert!(matches!(events.next().await, Some(DeviceEvent::Update(_))));
        }
        assert_eq!(store.get("onoff"), Some(TypedValue::Bool(true)));
        assert_eq!(store.get("measure_temperature"), Some(TypedValue::Decimal(21.5)));
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_truncation_raises_health_warning() {
        let transport = RecordingTransport::default();
        let device = DpDevice::builder("dev", transport, schema(AckMode::TransactionId)).build();
        let mut events = Box::pin(device.stream());

        // dp 2 declares four payload bytes but carries two
        for _ in 0..3 {
            device
                .deliver(InboundPayload::new(
                    ClusterCommand::DataReport,
                    None,
                    vec![0x02, 0x02, 0x00, 0x04, 0x00, 0x00],
                ))
                .await
                .unwrap();
        }

        assert_eq!(
            events.next().await,
            Some(DeviceEvent::Health(HealthWarning::PersistentCorruption {
                dp_id: 2,
                consecutive: 3
            }))
        );
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn time_sync_request_is_answered() {
        let transport = RecordingTransport::default();
        let device = DpDevice::builder("dev", transport.clone(), schema(AckMode::TransactionId)).build();
        let mut events = Box::pin(device.stream());

        device
            .deliver(InboundPayload::new(ClusterCommand::TimeSync, None, vec![0x00, 0x01]))
            .await
            .unwrap();
        // A later report proves the request was processed
        device.deliver(report(&[DatapointFrame::bool(1, true)])).await.unwrap();
        events.next().await;

        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, ClusterCommand::TimeSync);
        assert_eq!(sent[0].payload.len(), 8);
        assert_eq!(&sent[0].to_cluster_payload()[..2], &[0x00, 0x08]);
        device.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_in_flight_commands() {
        let transport = RecordingTransport::default();
        let device = DpDevice::builder("dev", transport.clone(), schema(AckMode::TransactionId)).build();

        let handle = device.clone();
        let pending = tokio::spawn(async move { handle.set("onoff", true).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        device.stop().await;

        assert_eq!(
            pending.await.unwrap(),
            Err(TuyaDpError::Command(CommandError::Cancelled))
        );
        // No retry after teardown
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.sent.lock().len(), 1);
        assert!(device.set("onoff", false).await.is_err());
    }

    #[test]
    fn cluster_payload_carries_sequence() {
        let cmd = OutboundCommand {
            transaction_id: Some(0x2A),
            command: ClusterCommand::DataRequest,
            payload: vec![0x01, 0x01, 0x00, 0x01, 0x01],
        };
        assert_eq!(
            cmd.to_cluster_payload(),
            vec![0x00, 0x2A, 0x01, 0x01, 0x00, 0x01, 0x01]
        );

        let inbound =
            InboundPayload::from_cluster(ClusterCommand::DataResponse, &cmd.to_cluster_payload())
                .unwrap();
        assert_eq!(inbound.transaction_id, Some(0x2A));
        assert_eq!(inbound.payload, cmd.payload);
    }

    #[test]
    fn wide_sequence_is_not_a_transaction_id() {
        let data = [0x01, 0x05, 0x01, 0x01, 0x00, 0x01, 0x01];
        let inbound = InboundPayload::from_cluster(ClusterCommand::DataResponse, &data).unwrap();
        assert_eq!(inbound.transaction_id, None);
        assert_eq!(inbound.payload, data[2..].to_vec());

        let inbound =
            InboundPayload::from_cluster(ClusterCommand::DataResponse, &[0x00, 0xFF]).unwrap();
        assert_eq!(inbound.transaction_id, Some(0xFF));
    }

    #[test]
    fn time_sync_and_query_framing() {
        let time = vec![0x2E, 0x5C, 0x3A, 0x80, 0x2E, 0x5C, 0x48, 0x90];
        let sync = OutboundCommand {
            transaction_id: Some(7),
            command: ClusterCommand::TimeSync,
            payload: time.clone(),
        };
        let data = sync.to_cluster_payload();
        assert_eq!(&data[..2], &[0x00, 0x08]);
        assert_eq!(&data[2..], time.as_slice());

        let query = OutboundCommand {
            transaction_id: None,
            command: ClusterCommand::DataQuery,
            payload: Vec::new(),
        };
        assert!(query.to_cluster_payload().is_empty());
    }
}
