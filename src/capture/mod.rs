//! Everything between the capture provider and a finished utterance: source
//! selection, the carried pre-buffer, streaming segmentation and the
//! fixed-duration fallback.
pub mod fixed;
pub mod prebuffer;
pub mod segmenter;
pub mod selector;

pub use prebuffer::RollingPrebuffer;
pub use segmenter::{AbortReason, EndReason, SegmentOutcome, Segmenter, SegmenterDriver, Utterance};
pub use selector::{SourceSelectionState, SourceSelector};
