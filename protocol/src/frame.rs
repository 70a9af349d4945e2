//! `SseFrame`: one `event`+`data` record on the run's server-sent event stream.

use serde::Serialize;
use serde_json::Value;

/// The `event:` line value — one of the eight kinds named in `spec.md` §6.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Connected,
    Log,
    Status,
    OutputChunk,
    Output,
    Delegation,
    Error,
    Completed,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Connected => "connected",
            FrameKind::Log => "log",
            FrameKind::Status => "status",
            FrameKind::OutputChunk => "output_chunk",
            FrameKind::Output => "output",
            FrameKind::Delegation => "delegation",
            FrameKind::Error => "error",
            FrameKind::Completed => "completed",
        }
    }
}

/// One SSE frame: `id: N\nevent: <kind>\ndata: {"type","agent_id","data"}\n\n`.
#[derive(Clone, Debug)]
pub struct SseFrame {
    pub id: u64,
    pub kind: FrameKind,
    pub agent_id: Option<String>,
    pub data: Value,
}

#[derive(Serialize)]
struct FrameData<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    agent_id: &'a Option<String>,
    data: &'a Value,
}

impl SseFrame {
    pub fn new(id: u64, kind: FrameKind, agent_id: Option<String>, data: Value) -> Self {
        Self {
            id,
            kind,
            agent_id,
            data,
        }
    }

    /// Renders the frame as the literal bytes written to the SSE response body.
    pub fn to_sse_text(&self) -> String {
        let wrapped = FrameData {
            kind: self.kind.as_str(),
            agent_id: &self.agent_id,
            data: &self.data,
        };
        let json = serde_json::to_string(&wrapped).expect("frame data serialization is infallible");
        format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.kind.as_str(),
            json
        )
    }
}

/// A `: keepalive` comment line, sent every 20s of idle time (`spec.md` §6).
pub fn keepalive_comment() -> &'static str {
    ": keepalive\n\n"
}
