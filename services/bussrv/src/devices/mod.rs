//! Device handlers
//!
//! Concrete devices on the shared bus. Each device attaches by subscribing
//! its frame handler(s) with the dispatcher and arming its watchdog; state
//! changes are pushed to the collaborator over the event channel.

pub mod curtain;
pub mod switch;

use std::sync::Arc;

use buslink::{BusTransport, Dispatcher, SubscriptionHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{DeviceConfig, DeviceModel};
use crate::error::Result;
use crate::watchdog::Watchdog;

use curtain::CurtainPosition;
use switch::{SwitchBank, SwitchButton};

/// Everything a device needs at construction; passed explicitly, never
/// looked up ambiently.
#[derive(Clone)]
pub struct DeviceContext {
    pub transport: BusTransport,
    pub dispatcher: Arc<Dispatcher>,
    pub events: mpsc::UnboundedSender<StateEvent>,
}

/// A state change pushed to the external collaborator
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StateEvent {
    pub device: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub change: StateChange,
}

/// What changed
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateChange {
    Switch { button: u8, on: bool },
    Curtain { position: u8, moving: bool },
}

/// Concrete device behind a [`DeviceRuntime`]
pub enum Device {
    WallSwitch {
        bank: Arc<SwitchBank>,
        buttons: Vec<Arc<SwitchButton>>,
    },
    Curtain(Arc<CurtainPosition>),
}

/// An attached device: its subscriptions and watchdogs, and how to detach
/// them again.
pub struct DeviceRuntime {
    id: String,
    device: Device,
    subscriptions: Vec<SubscriptionHandle>,
    watchdogs: Vec<Watchdog>,
    dispatcher: Arc<Dispatcher>,
}

impl DeviceRuntime {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Tear the device down: watchdogs are stopped (with join semantics)
    /// before the subscriptions go away, so no probe can outlive its
    /// subscription.
    pub async fn detach(self) {
        for watchdog in self.watchdogs {
            watchdog.stop().await;
        }
        for handle in self.subscriptions {
            self.dispatcher.unsubscribe(handle).await;
        }
        debug!("device detached: {}", self.id);
    }
}

/// Construct and attach one device. The model is resolved exactly once,
/// here; everything downstream works through the handler traits.
pub async fn build_device(config: &DeviceConfig, ctx: &DeviceContext) -> Result<DeviceRuntime> {
    match config.model {
        DeviceModel::WallSwitch => switch::attach(config, ctx).await,
        DeviceModel::Curtain => curtain::attach(config, ctx).await,
    }
}
