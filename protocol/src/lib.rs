//! SSE frame wire format for the run orchestrator's event stream (`spec.md` §6).
//!
//! Defines the wire shape of one `event:`/`data:` record and a sequencer that
//! assigns monotonically increasing frame ids, in the idiom of an
//! envelope/sequencing helper: payload types stay decoupled from the
//! line-numbering concern so either can change independently.

pub mod envelope;
pub mod frame;

pub use envelope::FrameSequencer;
pub use frame::{FrameKind, SseFrame};
