//! On-the-fly segment transcoder.
//!
//! Hexagonal Architecture:
//! - domain/: Media pipeline (source, timing, pipelines, writer, assembler) and jobs
//! - ports/: Trait definitions (codec lookup, segment production)
//! - adapters/: libav* codec registry and the HTTP surface
//! - application/: Bounded blocking transcode service
//! - config: Environment configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use domain::av::SegmentAssembler;
pub use domain::jobs::{ContainerFormat, Job, MediaKind, NO_WINDOW};
