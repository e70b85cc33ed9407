//! BeatXP Connect
//!
//! Discovers a BeatXP fitness band over BLE, unlocks it, and streams step
//! and heart rate telemetry to an [`EventSink`](domain::events::EventSink).

pub mod domain;
pub mod infrastructure;
