//! Wall-switch bank
//!
//! One shared holding register per slave carries the on/off bits of every
//! button on the panel. The handler reconciles three sources of change:
//! presses on the physical panel, our own writes, and third-party traffic
//! observed on the shared bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buslink::{
    BusTransport, Command, Frame, FrameHandler, RoutingKey, RoutingMode, DEFAULT_REGISTER_STATE,
    FC_READ_HOLDING, FC_WRITE_SINGLE, SWITCH_REGISTER,
};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::DeviceConfig;
use crate::devices::{Device, DeviceContext, DeviceRuntime, StateChange, StateEvent};
use crate::error::{BusSrvError, Result};
use crate::watchdog::Watchdog;

/// Wait between the state read and the toggling write
const WRITE_SETTLE: Duration = Duration::from_millis(100);
/// Pause between watchdog probe attempts
const PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// Identify value for a button: slave address and button index concatenated
/// as decimal digits, the correlation scheme the panels expect.
pub fn button_identify(slave_id: u16, index: u8) -> Result<u16> {
    let identify = u32::from(slave_id) * 10 + u32::from(index);
    u16::try_from(identify).map_err(|_| {
        BusSrvError::Device(format!(
            "identify {identify} (slave {slave_id}, button {index}) exceeds the wire field"
        ))
    })
}

/// Extract one button's state from the shared register.
///
/// Button order runs LSB-first through the low byte: bit 0 is button 1,
/// bit 7 is button 8.
pub fn button_is_on(register_value: u16, index: u8) -> bool {
    let bits = register_value % 256;
    (bits >> (index - 1)) & 1 == 1
}

/// Register state shared by every button of the slave
#[derive(Debug)]
struct BankState {
    register_value: u16,
    /// Button named by the last confirmed press or local write
    active_button: Option<u8>,
}

/// Shared per-slave state and bus access for a wall-switch panel
pub struct SwitchBank {
    device_id: String,
    slave_id: u16,
    has_relay: bool,
    state: Mutex<BankState>,
    transport: BusTransport,
    events: mpsc::UnboundedSender<StateEvent>,
}

impl SwitchBank {
    fn new(config: &DeviceConfig, ctx: &DeviceContext) -> Self {
        Self {
            device_id: config.id.clone(),
            slave_id: config.slave,
            has_relay: config.has_relay,
            state: Mutex::new(BankState {
                register_value: DEFAULT_REGISTER_STATE,
                active_button: None,
            }),
            transport: ctx.transport.clone(),
            events: ctx.events.clone(),
        }
    }

    pub fn slave_id(&self) -> u16 {
        self.slave_id
    }

    /// Current cached register value
    pub async fn register_value(&self) -> u16 {
        self.state.lock().await.register_value
    }

    /// Button named by the last confirmed press, if any
    pub async fn active_button(&self) -> Option<u8> {
        self.state.lock().await.active_button
    }

    /// Relay-less panels pad state replies with an extra byte: a trailing
    /// pair reading exactly 256 marks such a record. Drop the first of the
    /// two trailing bytes so the record reads like the relay-equipped
    /// variant.
    fn realign(&self, frame: &Frame) -> (Vec<u8>, u16) {
        let payload = frame.payload.as_ref();
        let n = payload.len();
        if !self.has_relay
            && n >= 2
            && u16::from_be_bytes([payload[n - 2], payload[n - 1]]) == 256
        {
            let mut adjusted = payload.to_vec();
            adjusted.remove(n - 2);
            (adjusted, frame.declared_len() - 1)
        } else {
            (payload.to_vec(), frame.declared_len())
        }
    }

    fn publish(&self, button: u8, on: bool) {
        let event = StateEvent {
            device: self.device_id.clone(),
            at: Utc::now(),
            change: StateChange::Switch { button, on },
        };
        let _ = self.events.send(event);
    }
}

/// One button of a bank; subscribes individually so that replies can be
/// correlated per button.
pub struct SwitchButton {
    bank: Arc<SwitchBank>,
    index: u8,
    identify: u16,
    is_on: AtomicBool,
}

impl SwitchButton {
    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn identify(&self) -> u16 {
        self.identify
    }

    pub fn is_on(&self) -> bool {
        self.is_on.load(Ordering::SeqCst)
    }

    pub async fn turn_on(&self) -> Result<()> {
        self.toggle(true).await
    }

    pub async fn turn_off(&self) -> Result<()> {
        self.toggle(false).await
    }

    /// Read-modify-write against the shared register. The panel's only
    /// write primitive XORs the raw button index into the register, so
    /// callers get toggle semantics, not set.
    async fn toggle(&self, on: bool) -> Result<()> {
        let bank = &self.bank;
        bank.state.lock().await.active_button = Some(self.index);

        let read = Command::read_registers(bank.slave_id, self.identify, SWITCH_REGISTER, 1);
        bank.transport.send_command(&read).await?;
        // Give the reply a moment to refresh the cached register
        tokio::time::sleep(WRITE_SETTLE).await;

        let value = {
            let state = bank.state.lock().await;
            state.register_value ^ u16::from(self.index)
        };
        let write = Command::write_register(bank.slave_id, self.identify, SWITCH_REGISTER, value);
        bank.transport.send_command(&write).await?;

        bank.state.lock().await.register_value = value;
        self.is_on.store(on, Ordering::SeqCst);
        bank.publish(self.index, on);
        Ok(())
    }
}

#[async_trait]
impl FrameHandler for SwitchButton {
    async fn on_frame(&self, frame: &Frame) {
        let bank = &self.bank;
        if frame.slave_id != bank.slave_id {
            // Bus traffic for somebody else that passed the relaxed filter
            return;
        }

        // Realign before anything else: relay-less state replies would
        // otherwise be mistaken for press echoes below
        let (payload, length) = bank.realign(frame);

        let mut state = bank.state.lock().await;

        // Manual press detection: a length-6 read record whose trailing byte
        // is a single set bit names the pressed button; a trailing zero is
        // the secondary echo of the same press.
        if frame.function_code == FC_READ_HOLDING && length == 6 {
            match payload.last().copied() {
                Some(0) => return,
                Some(byte) if byte.is_power_of_two() => {
                    let pressed = byte.trailing_zeros() as u8 + 1;
                    if state.active_button != Some(pressed) {
                        debug!("slave {} button {} pressed", bank.slave_id, pressed);
                    }
                    state.active_button = Some(pressed);
                },
                _ => {},
            }
        }

        // Register refreshes apply no matter which button initiated them, so
        // state changed by other bus clients is reflected too
        let mut refreshed = false;
        if (frame.function_code == FC_READ_HOLDING && length == 5)
            || frame.function_code == FC_WRITE_SINGLE
        {
            if payload.len() >= 2 {
                state.register_value =
                    u16::from_be_bytes([payload[payload.len() - 2], payload[payload.len() - 1]]);
                refreshed = true;
            }
        }

        // A press of this very button was just confirmed: fetch the
        // authoritative register (the reply lands in the branch above)
        let follow_up = frame.function_code == FC_READ_HOLDING
            && length == 6
            && state.active_button == Some(self.index);

        let register_value = state.register_value;
        drop(state);

        if follow_up {
            let read = Command::read_registers(bank.slave_id, self.identify, SWITCH_REGISTER, 1);
            if let Err(e) = bank.transport.send_command(&read).await {
                warn!("slave {} state readback failed: {}", bank.slave_id, e);
            }
        }

        if refreshed {
            let on = button_is_on(register_value, self.index);
            self.is_on.store(on, Ordering::SeqCst);
            bank.publish(self.index, on);
        }
    }
}

/// Attach a wall-switch panel: one bank, one subscription per button, one
/// probe watchdog for the slave.
pub async fn attach(config: &DeviceConfig, ctx: &DeviceContext) -> Result<DeviceRuntime> {
    let bank = Arc::new(SwitchBank::new(config, ctx));
    let mut subscriptions = Vec::with_capacity(config.buttons as usize);
    let mut buttons = Vec::with_capacity(config.buttons as usize);

    for index in 1..=config.buttons {
        let identify = button_identify(config.slave, index)?;
        let button = Arc::new(SwitchButton {
            bank: Arc::clone(&bank),
            index,
            identify,
            is_on: AtomicBool::new(false),
        });
        let handle = ctx
            .dispatcher
            .subscribe(
                format!("{}-{}", config.id, index),
                RoutingKey {
                    identify,
                    slave_id: config.slave,
                },
                RoutingMode::Bank,
                button.clone(),
            )
            .await;
        subscriptions.push(handle);
        buttons.push(button);
    }

    let watchdog = spawn_probe(&bank, button_identify(config.slave, 1)?);

    Ok(DeviceRuntime {
        id: config.id.clone(),
        device: Device::WallSwitch { bank, buttons },
        subscriptions,
        watchdogs: vec![watchdog],
        dispatcher: Arc::clone(&ctx.dispatcher),
    })
}

/// Probe loop keeping the cached register fresh: every few seconds, while
/// the transport is up, send one register read. After the first successful
/// probe a read cycle is underway and the task retires; the next attach
/// re-arms it.
fn spawn_probe(bank: &Arc<SwitchBank>, identify: u16) -> Watchdog {
    let transport = bank.transport.clone();
    let slave_id = bank.slave_id;
    let read = Command::read_registers(slave_id, identify, SWITCH_REGISTER, 1);

    Watchdog::spawn(format!("switch-{slave_id}"), move |cancel| async move {
        loop {
            if transport.is_connected() {
                // Stagger probes by slave so banks do not collide on the
                // half-duplex line
                let stagger = Duration::from_millis(100 + u64::from(slave_id) * 100);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(stagger) => {},
                }
                let send_timeout = Duration::from_secs(2 * u64::from(slave_id));
                match timeout(send_timeout, transport.send_command(&read)).await {
                    Ok(Ok(())) => {
                        debug!("slave {} probe sent, watchdog retires", slave_id);
                        return;
                    },
                    Ok(Err(e)) => warn!("slave {} probe failed: {}", slave_id, e),
                    Err(_) => warn!("slave {} probe timed out", slave_id),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(PROBE_INTERVAL) => {},
            }
        }
    })
}
