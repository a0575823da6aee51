//! Error taxonomy of the transcoding pipeline.
//!
//! Every variant here is fatal for the request that raised it. Per-packet
//! decode and encode failures never become a `TranscodeError`: the stream
//! pipeline logs them and skips the affected sample.

use crate::domain::jobs::MediaKind;
use ffmpeg_next as ffmpeg;

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("could not open source {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("no {kind} stream in source")]
    StreamNotFound { kind: MediaKind },

    #[error("seek to {seconds:.3}s failed: {source}")]
    Seek {
        seconds: f64,
        #[source]
        source: ffmpeg::Error,
    },

    #[error("no decoder for {codec:?}")]
    DecoderUnavailable { codec: ffmpeg::codec::Id },

    #[error("encoder '{name}' unavailable: {reason}")]
    EncoderUnavailable { name: String, reason: String },

    #[error(transparent)]
    Mux(#[from] MuxError),
}

impl TranscodeError {
    pub(crate) fn encoder(name: &str, reason: impl Into<String>) -> Self {
        TranscodeError::EncoderUnavailable {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Container-level failures raised by the container writer.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("could not allocate {format} output: {reason}")]
    Alloc { format: &'static str, reason: String },

    #[error("could not add output stream: {0}")]
    Stream(#[source] ffmpeg::Error),

    #[error("could not write header: {0}")]
    Header(#[source] ffmpeg::Error),

    #[error("could not write sample: {0}")]
    Write(#[source] ffmpeg::Error),

    #[error("could not write trailer: {0}")]
    Trailer(#[source] ffmpeg::Error),

    #[error("{operation} called in state {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}
