//! Stepcast harness
//!
//! A virtual BLE controller implementing every stepcast transport trait. It
//! answers the address query from a script, records service and advertising
//! calls, collects notifications, and lets callers inject power, connection
//! and request events as a real adapter would.

pub mod virtual_controller;

pub use virtual_controller::{
    DeliveredNotification, HciScript, RecordedCall, VirtualController, VirtualControllerConfig,
};
