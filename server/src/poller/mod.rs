// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Scheduled subscription management and change detection.
//!
//! [`BasePoller`] is the generic engine: per-object id sets, batched upstream
//! fetches, fingerprint-based change detection and one downstream batch per
//! round. [`SensorPoller`] specializes it for sensor-by-id reads;
//! [`ObjectPoller`] treats whole object snapshots as its unit of change.
//! The WebSocket-driven variant lives in [`crate::wsgate::WsPoller`].

mod base;
mod object;
mod sensor;

pub use base::{BasePoller, ItemFetcher};
pub use object::{ObjectCallback, ObjectPoller, StatusHook};
pub use sensor::{SensorFetcher, SensorPoller, SensorPollerUpdate};
