pub mod barge_in;
pub mod playback;

pub use barge_in::{BargeInProbe, BargeInVerdict};
pub use playback::{PlaybackReport, PlaybackResult, PlaybackSupervisor, PrearmSource};
