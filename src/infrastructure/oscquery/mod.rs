//! OSCQuery Module
//!
//! Publishes ring telemetry as the `/ring/X`, `/ring/Y` and `/ring/press`
//! nodes of an OSCQuery namespace.
//!
//! - [`publisher`] - node values, updated by the GATT session
//! - [`server`] - HTTP namespace queries and WebSocket LISTEN streaming
//! - [`osc`] - OSC message encoding for the WebSocket stream

pub mod osc;
pub mod publisher;
pub mod server;

pub use publisher::TelemetryPublisher;
pub use server::OscQueryServer;
