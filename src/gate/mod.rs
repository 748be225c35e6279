//! Text-side filtering: the transcript gate in front of the dialogue backend
//! and reply cleanup behind it.
pub mod reply;
pub mod text;
pub mod transcript;

pub use reply::{is_backend_clarify, sanitize_reply};
pub use transcript::{GateContext, GateDecision, GateRejection, TranscriptGate};
