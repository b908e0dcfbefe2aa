//! RS-485 Shared-Bus Device Service
//!
//! Runs a set of logical devices — wall-switch panels and motorized
//! curtains — over one shared RS-485 line reached through a TCP gateway.
//! The heavy lifting (framing, connection sharing, frame routing) lives in
//! the `buslink` library; this crate adds configuration, the concrete
//! device handlers with their watchdog polls, and the service runtime.
//!
//! ```text
//! ┌──────────────┐    ┌─────────────┐    ┌──────────────────┐
//! │  AppConfig   │───►│   Runtime   │───►│ Devices          │
//! │  (YAML+env)  │    │             │    │  SwitchBank      │
//! └──────────────┘    │ BusTransport│    │  CurtainPosition │
//!                     │ Dispatcher  │    └──────────────────┘
//!                     └─────────────┘             │
//!                                                 ▼
//!                                          StateEvent stream
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod runtime;
pub mod shutdown;
pub mod watchdog;

pub use config::{AppConfig, DeviceConfig, DeviceModel, GatewayConfig};
pub use devices::{Device, DeviceRuntime, StateChange, StateEvent};
pub use error::{BusSrvError, Result};
pub use runtime::Runtime;
pub use watchdog::Watchdog;
