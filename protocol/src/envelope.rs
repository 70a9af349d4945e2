//! Monotonic frame-id assignment for one run's SSE stream.

use crate::frame::{FrameKind, SseFrame};
use serde_json::Value;

/// Assigns strictly increasing ids to frames for a single run's stream, so a
/// reconnecting client's `Last-Event-ID` can be compared against what was
/// already sent (`spec.md` §6: accepted but not required to resume exactly).
pub struct FrameSequencer {
    next_id: u64,
}

impl FrameSequencer {
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self, kind: FrameKind, agent_id: Option<String>, data: Value) -> SseFrame {
        let id = self.next_id;
        self.next_id += 1;
        SseFrame::new(id, kind, agent_id, data)
    }
}

impl Default for FrameSequencer {
    fn default() -> Self {
        Self::new()
    }
}
