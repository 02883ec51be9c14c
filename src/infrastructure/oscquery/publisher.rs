//! Telemetry Publisher
//!
//! Owns the published nodes. All three live in one `watch` value so a reader
//! never sees X from one sample and press from another.

use crate::domain::models::TelemetrySample;
use crate::infrastructure::bluetooth::connection::TelemetrySink;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

/// Latest value of every node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RingSnapshot {
    pub x: i32,
    pub y: i32,
    pub press: bool,
    /// Bumped on every publish; survives reconnects
    pub revision: u64,
}

/// One published node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingNode {
    X,
    Y,
    Press,
}

impl RingNode {
    pub const ALL: [RingNode; 3] = [RingNode::X, RingNode::Y, RingNode::Press];

    pub fn name(&self) -> &'static str {
        match self {
            Self::X => "X",
            Self::Y => "Y",
            Self::Press => "press",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Self::X => "/ring/X",
            Self::Y => "/ring/Y",
            Self::Press => "/ring/press",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::X => "Ring pointer X",
            Self::Y => "Ring pointer Y",
            Self::Press => "Ring button (1 = pressed)",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|node| node.path() == path)
    }

    /// Press is published as 0/1
    pub fn value(&self, snapshot: &RingSnapshot) -> i32 {
        match self {
            Self::X => snapshot.x,
            Self::Y => snapshot.y,
            Self::Press => snapshot.press as i32,
        }
    }
}

#[derive(Clone)]
pub struct TelemetryPublisher {
    tx: Arc<watch::Sender<RingSnapshot>>,
}

impl TelemetryPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(RingSnapshot::default());
        Self { tx: Arc::new(tx) }
    }

    /// Copy of the current values
    pub fn snapshot(&self) -> RingSnapshot {
        *self.tx.borrow()
    }

    /// Live updates; each change is a whole snapshot
    pub fn subscribe(&self) -> watch::Receiver<RingSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for TelemetryPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for TelemetryPublisher {
    fn publish(&self, sample: &TelemetrySample) {
        self.tx.send_modify(|snapshot| {
            *snapshot = RingSnapshot {
                x: sample.x,
                y: sample.y,
                press: sample.press,
                revision: snapshot.revision + 1,
            };
        });
    }
}
