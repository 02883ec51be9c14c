//! Bluetooth Module
//!
//! Talks to the ring over BLE and feeds decoded samples to a telemetry sink.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      RingService                         │
//! │      (Orchestrator - selector/session cycles, retry)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌───────────┐
//! │  Scanner  │  │ Connection │  │ Protocol  │
//! │           │  │            │  │           │
//! │ - Device  │  │ - GATT     │  │ - UUIDs   │
//! │   select  │  │   session  │  │ - Decoder │
//! └─────┬─────┘  └─────┬──────┘  └───────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────┐
//! │  Transport (btleplug/mock)  │
//! └─────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - GATT identifiers and the packet decoder
//! - [`transport`] - BLE transport traits
//! - [`btle`] - btleplug implementation of the transport
//! - [`scanner`] - device selection
//! - [`connection`] - GATT session state machine
//! - [`keepalive`] - periodic reads while streaming
//! - [`service`] - orchestrator

pub mod btle;
pub mod connection;
pub mod keepalive;
#[cfg(test)]
pub mod mock;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;

pub use btle::BtleTransport;
pub use service::RingService;
