//! Audio/Video pipeline: demux, decode, convert, encode and mux one segment.

pub mod assembler;
pub mod convert;
pub mod pipeline;
pub mod source;
pub mod target;
pub mod timing;
pub mod writer;


pub use assembler::SegmentAssembler;
