//! Bluetooth Module
//!
//! BLE client for the BeatXP fitness band.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      BandService                         │
//! │   (coordinator - owns the scan gate and one session)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │  Session   │  │ Protocol │
//! │           │  │            │  │          │
//! │ - dedup   │  │ - unlock   │  │ - UUIDs  │
//! │ - timeout │  │ - op queue │  │ - decode │
//! └─────┬─────┘  └─────┬──────┘  └──────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────┐
//! │ Transport (WinRT/simulator) │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Band UUIDs, commands, and payload decoding
//! - [`scanner`] - Deduplicated, time-bounded device discovery
//! - [`session`] - Connection state machine and GATT operation queue
//! - [`transport`] - Platform seam: requests and callback events
//! - [`service`] - Main service coordinator
//! - [`simulator`] - In-process simulated band

pub mod protocol;
pub mod scanner;
pub mod service;
pub mod session;
pub mod simulator;
pub mod transport;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::BandService;
