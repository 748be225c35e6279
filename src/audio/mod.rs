pub mod analysis;
pub mod resample;
pub mod tone;
pub mod vad;
pub mod wav;
