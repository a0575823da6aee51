//! Adapters - Concrete implementations of ports and inbound surfaces.

pub mod ffmpeg;
pub mod http;
