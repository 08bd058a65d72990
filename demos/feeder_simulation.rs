use futures_util::StreamExt;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tuya_dp::protocol::{FrameReader, encode};
use tuya_dp::{
    AdapterConfig, ClusterCommand, CommandError, ConverterRegistry, DatapointFrame, DeviceEvent,
    DpDevice, InboundPayload, Manager, OutboundCommand, SchemaCatalog, Transport,
};

/// Transport that hands commands to an in-process feeder MCU.
struct SimulatedRadio {
    tx: mpsc::Sender<OutboundCommand>,
}

impl Transport for SimulatedRadio {
    async fn transmit(&self, command: OutboundCommand) -> Result<(), CommandError> {
        self.tx
            .send(command)
            .await
            .map_err(|e| CommandError::Transport(e.to_string()))
    }
}

/// Acks every data request and reports the resulting state.
async fn feeder_mcu(mut rx: mpsc::Receiver<OutboundCommand>, manager: Manager, id: String) {
    while let Some(cmd) = rx.recv().await {
        info!(
            "MCU <- {} {}",
            cmd.command,
            hex::encode(cmd.to_cluster_payload())
        );
        if cmd.command != ClusterCommand::DataRequest {
            continue;
        }

        let mut report = Vec::new();
        for frame in FrameReader::new(&cmd.payload).flatten() {
            report.extend(encode(&frame));
            if frame.dp_id() == 3 {
                // Portions dispensed: feeding state, then weight
                report.extend(encode(&DatapointFrame::enumeration(4, 2)));
                let portions = i32::from_be_bytes(
                    frame.payload().try_into().unwrap_or([0, 0, 0, 0]),
                );
                report.extend(encode(&DatapointFrame::value(17, portions * 6)));
            }
        }

        sleep(Duration::from_millis(120)).await;
        let response = InboundPayload::new(ClusterCommand::DataResponse, cmd.transaction_id, report);
        if let Err(e) = manager.route(&id, response).await {
            warn!("MCU could not respond: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let catalog = SchemaCatalog::builtin(&ConverterRegistry::builtin())?;
    let schema = catalog.require("_TZE200_wfxuhoea")?;
    let config = AdapterConfig::from_json(r#"{ "command_timeout_ms": 2000, "attempts": 3 }"#)?;

    let (tx, rx) = mpsc::channel(16);
    let device = DpDevice::builder("feeder-1", SimulatedRadio { tx }, schema)
        .config(config)
        .build();

    let manager = Manager::new();
    manager.add(device.clone()).await?;
    tokio::spawn(feeder_mcu(rx, manager.clone(), device.id().to_string()));

    let mut events = Box::pin(manager.stream());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event.event {
                DeviceEvent::Update(update) => {
                    info!("{}: {} = {}", event.device_id, update.field, update.value)
                }
                other => warn!("{}: {:?}", event.device_id, other),
            }
        }
    });

    let delivery = device.set("manual_feed", 2).await?;
    info!("manual_feed delivered: {:?}", delivery);

    let delivery = device.set("child_lock", true).await?;
    info!("child_lock delivered: {:?}", delivery);

    // Food level alarm arriving unsolicited, twice in quick succession
    for _ in 0..2 {
        manager
            .route(
                "feeder-1",
                InboundPayload::new(
                    ClusterCommand::DataReport,
                    None,
                    encode(&DatapointFrame::enumeration(18, 1)),
                ),
            )
            .await?;
    }

    sleep(Duration::from_millis(500)).await;
    manager.shutdown().await;
    Ok(())
}
