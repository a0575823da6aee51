//! Ports - Trait definitions the domain and application depend on.

pub mod codecs;
pub mod segments;

pub use codecs::CodecRegistry;
pub use segments::SegmentProducer;
