//! Bluetooth Module
//!
//! Drives a left/right pair of display peripherals as one logical device.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     DisplayService                       │
//! │   (command channel + event stream for the application)   │
//! └──────────────┬──────────────────────────┬───────────────┘
//!                │                          │
//!                ▼                          ▼
//!   ┌────────────────────────┐     ┌─────────────────┐
//!   │ ConnectionOrchestrator │────▶│ DeviceRegistry  │
//!   │ reuse → bonded → scan  │     └────────┬────────┘
//!   └───────────┬────────────┘              │
//!               │                           ▼
//!        ┌──────┴──────┐          ┌──────────────────┐
//!        │   Scanner   │          │ CompositeDevice  │
//!        └─────────────┘          │  left  │  right  │
//!                                 └───┬────┴────┬────┘
//!                                     ▼         ▼
//!                               ┌──────────────────────┐
//!                               │    DeviceSession     │
//!                               │ queue │ heartbeat    │
//!                               └──────────┬───────────┘
//!                                          ▼
//!                    ┌──────────────────────────────────────┐
//!                    │ PeripheralLink  +  BondingCoordinator │
//!                    └──────────────────┬───────────────────┘
//!                                       ▼
//!                             ┌───────────────────┐
//!                             │  BleHal (platform │
//!                             │  or simulated)    │
//!                             └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, opcodes, command encoding and notification decoding
//! - [`hal`] - Platform BLE abstraction
//! - [`simulated`] - In-process BLE stack
//! - [`error`] - Device error taxonomy
//! - [`connection`] - Single peripheral link
//! - [`bonding`] - OS bonding workflow
//! - [`session`] - Request queue, heartbeat and telemetry for one side
//! - [`composite`] - Pairing and the logical left/right device
//! - [`scanner`] - Bounded scan windows
//! - [`registry`] - Known logical devices
//! - [`orchestrator`] - Reconnection ladder
//! - [`service`] - Application-facing coordinator

pub mod bonding;
pub mod composite;
pub mod connection;
pub mod error;
pub mod hal;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod scanner;
pub mod service;
pub mod session;
pub mod simulated;

// Re-export main service for convenience
pub use service::{DisplayCommand, DisplayHandle, DisplayResponse, DisplayService};
