//! Motorized curtain
//!
//! Tracks percentage-open position (0 = closed, 100 = open) from command
//! acknowledgements and status replies, with a 1-second poll while motion is
//! pending.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buslink::{
    BusTransport, Command, CurtainAction, Frame, FrameHandler, RoutingKey, RoutingMode,
    CURTAIN_IDENTIFY, FC_CURTAIN,
};
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::DeviceConfig;
use crate::devices::{Device, DeviceContext, DeviceRuntime, StateChange, StateEvent};
use crate::error::Result;
use crate::watchdog::Watchdog;

/// Optimistic-update delay after a control frame
const SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Status poll period while watching for motion to finish
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Per-probe send timeout; a miss is logged and the poll continues
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Shortest status payload carrying a position byte
const MIN_PAYLOAD: usize = 3;

#[derive(Debug)]
struct CurtainState {
    position: u8,
    destination: u8,
    moving: bool,
    watching: bool,
}

/// Position tracker and command surface for one curtain motor
pub struct CurtainPosition {
    device_id: String,
    slave_id: u16,
    state: Mutex<CurtainState>,
    transport: BusTransport,
    events: mpsc::UnboundedSender<StateEvent>,
}

impl CurtainPosition {
    fn new(config: &DeviceConfig, ctx: &DeviceContext) -> Self {
        Self {
            device_id: config.id.clone(),
            slave_id: config.slave,
            state: Mutex::new(CurtainState {
                position: 100,
                destination: 100,
                moving: false,
                watching: true,
            }),
            transport: ctx.transport.clone(),
            events: ctx.events.clone(),
        }
    }

    pub fn slave_id(&self) -> u16 {
        self.slave_id
    }

    /// Current percentage open
    pub async fn position(&self) -> u8 {
        self.state.lock().await.position
    }

    pub async fn destination(&self) -> u8 {
        self.state.lock().await.destination
    }

    pub async fn is_moving(&self) -> bool {
        self.state.lock().await.moving
    }

    pub async fn is_watching(&self) -> bool {
        self.state.lock().await.watching
    }

    pub async fn open(&self) -> Result<()> {
        self.command(CurtainAction::Open).await
    }

    pub async fn close(&self) -> Result<()> {
        self.command(CurtainAction::Close).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.command(CurtainAction::Stop).await
    }

    pub async fn set_position(&self, target: u8) -> Result<()> {
        self.command(CurtainAction::SetPosition(target)).await
    }

    /// Send a control frame, wait out the settle delay, then apply the
    /// optimistic local update and re-arm the status poll.
    async fn command(&self, action: CurtainAction) -> Result<()> {
        debug!("curtain {}: {:?}", self.slave_id, action);
        self.transport
            .send_command(&Command::curtain(self.slave_id, action))
            .await?;
        tokio::time::sleep(SETTLE_DELAY).await;

        let (position, moving) = {
            let mut state = self.state.lock().await;
            match action {
                CurtainAction::Open => {
                    state.position = 100;
                    state.moving = false;
                },
                CurtainAction::Close => {
                    state.position = 0;
                    state.moving = false;
                },
                CurtainAction::Stop => {
                    state.moving = false;
                },
                CurtainAction::SetPosition(target) => {
                    state.position = target;
                    state.destination = target;
                    state.moving = true;
                },
                CurtainAction::Query => {},
            }
            state.watching = true;
            (state.position, state.moving)
        };
        self.publish(position, moving);
        Ok(())
    }

    fn publish(&self, position: u8, moving: bool) {
        let event = StateEvent {
            device: self.device_id.clone(),
            at: Utc::now(),
            change: StateChange::Curtain { position, moving },
        };
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl FrameHandler for CurtainPosition {
    async fn on_frame(&self, frame: &Frame) {
        if frame.function_code != FC_CURTAIN {
            return;
        }
        if frame.payload.len() < MIN_PAYLOAD {
            warn!("curtain {}: status record too short", self.slave_id);
            return;
        }
        // Replies carry the slave address byte-swapped
        if frame.slave_id.swap_bytes() != self.slave_id {
            return;
        }
        let Some(last) = frame.trailing_byte() else {
            return;
        };

        let length = frame.declared_len();
        let (position, moving) = {
            let mut state = self.state.lock().await;
            // Two status encodings, selected by the declared length
            let derived = if length == 6 {
                100u8.saturating_sub(last)
            } else if length > 10 {
                last
            } else {
                state.position
            };

            if derived != state.position {
                if state.moving {
                    // Trust the commanded target over a noisy intermediate
                    // reading while the motor is still running
                    state.position = state.destination;
                } else {
                    state.position = derived;
                }
            } else {
                // Same reading twice: motion has settled, stop polling
                // until the next command
                state.watching = false;
                state.moving = false;
            }
            (state.position, state.moving)
        };
        self.publish(position, moving);
    }
}

/// Attach a curtain: one subscription on the curtain identify, one poll
/// watchdog.
pub async fn attach(config: &DeviceConfig, ctx: &DeviceContext) -> Result<DeviceRuntime> {
    let curtain = Arc::new(CurtainPosition::new(config, ctx));
    let handle = ctx
        .dispatcher
        .subscribe(
            config.id.clone(),
            RoutingKey {
                identify: CURTAIN_IDENTIFY,
                slave_id: config.slave,
            },
            RoutingMode::Device,
            curtain.clone(),
        )
        .await;

    let watchdog = spawn_poll(&curtain);

    Ok(DeviceRuntime {
        id: config.id.clone(),
        device: Device::Curtain(Arc::clone(&curtain)),
        subscriptions: vec![handle],
        watchdogs: vec![watchdog],
        dispatcher: Arc::clone(&ctx.dispatcher),
    })
}

/// Status poll: while the transport is up and the curtain is watching for
/// motion to finish, request a status record every second.
fn spawn_poll(curtain: &Arc<CurtainPosition>) -> Watchdog {
    let curtain = Arc::clone(curtain);
    let slave_id = curtain.slave_id;
    let probe = Command::curtain(slave_id, CurtainAction::Query);

    Watchdog::spawn(format!("curtain-{slave_id}"), move |cancel| async move {
        loop {
            if curtain.transport.is_connected() && curtain.is_watching().await {
                match timeout(PROBE_TIMEOUT, curtain.transport.send_command(&probe)).await {
                    Ok(Ok(())) => {},
                    Ok(Err(e)) => warn!("curtain {} probe failed: {}", slave_id, e),
                    Err(_) => warn!("curtain {} probe timed out", slave_id),
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(POLL_INTERVAL) => {},
            }
        }
    })
}
