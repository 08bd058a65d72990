//! Fleet-level handle over many device adapters.
//! Routes inbound cluster payloads by device id and merges device event
//! streams. Each device keeps its own state; the manager only holds handles.

use crate::device::{DeviceEvent, DpDevice, InboundPayload};
use crate::error::{Result, TuyaDpError};
use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;

const MANAGER_EVENT_CAPACITY: usize = 256;

type EventStream = Pin<Box<dyn Stream<Item = DeviceEvent> + Send>>;

/// Represents an event from any device managed by [`Manager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerEvent {
    pub device_id: String,
    pub event: DeviceEvent,
}

enum Control {
    Watch(String, EventStream),
    Unwatch(String),
}

/// A high-level manager for multiple datapoint devices.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    devices: RwLock<HashMap<String, DpDevice>>,
    control_tx: mpsc::UnboundedSender<Control>,
    event_tx: broadcast::Sender<ManagerEvent>,
    cancel_token: CancellationToken,
}

impl Manager {
    /// Create a new Manager. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(MANAGER_EVENT_CAPACITY);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();

        tokio::spawn(forward_events(
            control_rx,
            event_tx.clone(),
            cancel_token.clone(),
        ));

        Self {
            inner: Arc::new(ManagerInner {
                devices: RwLock::new(HashMap::new()),
                control_tx,
                event_tx,
                cancel_token,
            }),
        }
    }

    /// Returns a Stream of events from all managed devices.
    pub fn stream(&self) -> impl Stream<Item = ManagerEvent> + Send + 'static {
        let mut rx = self.inner.event_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
    }

    /// Add a running device. Fails if a device with the same id exists.
    pub async fn add(&self, device: DpDevice) -> Result<()> {
        let mut devices = self.inner.devices.write().await;
        let id = device.id().to_string();
        if devices.contains_key(&id) {
            return Err(TuyaDpError::DuplicateDevice(id));
        }

        // Subscribe now so no event published after `add` returns is missed
        let stream: EventStream = Box::pin(device.stream());
        if self
            .inner
            .control_tx
            .send(Control::Watch(id.clone(), stream))
            .is_err()
        {
            warn!("Event forwarder is gone; device {} will not be streamed", id);
        }

        devices.insert(id.clone(), device);
        info!("Device {} added to manager", id);
        Ok(())
    }

    /// Remove a device and stop it.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let device = self.inner.devices.write().await.remove(id);
        match device {
            Some(device) => {
                let _ = self.inner.control_tx.send(Control::Unwatch(id.to_string()));
                device.stop().await;
                info!("Device {} removed from manager", id);
                Ok(())
            }
            None => {
                warn!("Attempted to remove non-existent device {}", id);
                Err(TuyaDpError::DeviceNotFound(id.to_string()))
            }
        }
    }

    /// Hand an inbound payload to the device it belongs to.
    pub async fn route(&self, id: &str, inbound: InboundPayload) -> Result<()> {
        let device = self
            .get(id)
            .await
            .ok_or_else(|| TuyaDpError::DeviceNotFound(id.to_string()))?;
        device.deliver(inbound).await
    }

    /// Get a device by ID.
    pub async fn get(&self, id: &str) -> Option<DpDevice> {
        self.inner.devices.read().await.get(id).cloned()
    }

    /// Ids of all managed devices, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.devices.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop every managed device and the event forwarder.
    pub async fn shutdown(self) {
        let devices: Vec<DpDevice> = self
            .inner
            .devices
            .write()
            .await
            .drain()
            .map(|(_, device)| device)
            .collect();
        for device in devices {
            device.stop().await;
        }
        self.inner.cancel_token.cancel();
        info!("Manager shut down");
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn forward_events(
    mut control_rx: mpsc::UnboundedReceiver<Control>,
    event_tx: broadcast::Sender<ManagerEvent>,
    cancel_token: CancellationToken,
) {
    let mut streams: StreamMap<String, EventStream> = StreamMap::new();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            control = control_rx.recv() => match control {
                Some(Control::Watch(id, stream)) => {
                    debug!("Forwarding events for device {}", id);
                    streams.insert(id, stream);
                }
                Some(Control::Unwatch(id)) => {
                    streams.remove(&id);
                }
                None => break,
            },
            Some((device_id, event)) = streams.next(), if !streams.is_empty() => {
                let _ = event_tx.send(ManagerEvent { device_id, event });
            }
        }
    }
    debug!("Manager event forwarder exited");
}
