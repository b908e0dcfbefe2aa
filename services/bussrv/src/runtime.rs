//! Service runtime
//!
//! Wires the transport, dispatcher and configured devices together and owns
//! their teardown order: watchdogs before subscriptions, subscriptions
//! before the connection (which the refcount then closes on its own).

use std::sync::Arc;

use buslink::{BusTransport, Dispatcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::devices::{build_device, DeviceContext, DeviceRuntime, StateEvent};
use crate::error::Result;

/// A running service instance
pub struct Runtime {
    transport: BusTransport,
    dispatcher: Arc<Dispatcher>,
    devices: Vec<DeviceRuntime>,
    cancel: CancellationToken,
    dispatch_task: JoinHandle<()>,
}

impl Runtime {
    /// Build the transport, dispatcher and every configured device.
    /// Returns the runtime together with the state-event stream for the
    /// external collaborator.
    pub async fn build(
        config: &AppConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StateEvent>)> {
        config.validate()?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let transport = BusTransport::new(config.gateway.transport_config(), frames_tx)?;
        let dispatcher = Arc::new(Dispatcher::new(transport.clone()));

        let cancel = CancellationToken::new();
        let dispatch_task = dispatcher.clone().spawn(frames_rx, cancel.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = DeviceContext {
            transport: transport.clone(),
            dispatcher: Arc::clone(&dispatcher),
            events: events_tx,
        };

        let mut devices = Vec::with_capacity(config.devices.len());
        for device_config in &config.devices {
            let device = build_device(device_config, &ctx).await?;
            info!(
                "device attached: {} ({}, slave {})",
                device_config.id,
                device_config.model.hardware_model(),
                device_config.slave
            );
            devices.push(device);
        }

        Ok((
            Self {
                transport,
                dispatcher,
                devices,
                cancel,
                dispatch_task,
            },
            events_rx,
        ))
    }

    pub fn transport(&self) -> &BusTransport {
        &self.transport
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Attached devices, in configuration order
    pub fn devices(&self) -> &[DeviceRuntime] {
        &self.devices
    }

    /// Detach every device and stop the dispatcher. The last unsubscribe
    /// drives the transport refcount to zero and closes the socket.
    pub async fn shutdown(mut self) {
        for device in self.devices.drain(..) {
            let id = device.id().to_string();
            device.detach().await;
            info!("device detached: {}", id);
        }
        self.cancel.cancel();
        let _ = self.dispatch_task.await;

        let stats = self.transport.stats();
        info!(
            "bus runtime stopped: {} frame(s) in, {} byte(s) out",
            stats.frames_received, stats.bytes_sent
        );
    }
}
