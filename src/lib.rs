//! Connection management for a dual-sided BLE wearable display.
//!
//! The two peripherals (left and right) are discovered, bonded and connected
//! together and exposed as a single logical device.

pub mod domain;
pub mod infrastructure;

pub use infrastructure::bluetooth::{DisplayCommand, DisplayHandle, DisplayResponse, DisplayService};
