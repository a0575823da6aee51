//! Application layer - Generic services that use ports.

pub mod transcoder;

pub use transcoder::TranscodeService;
