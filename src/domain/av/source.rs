//! Media source: the demuxing side of the pipeline.

use super::timing::{seconds_to_micros, TimeBase};
use crate::domain::error::TranscodeError;
use crate::domain::jobs::MediaKind;
use ffmpeg_next as ffmpeg;
use ffmpeg::media::Type;
use ffmpeg::{codec, format, Packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl From<StreamKind> for MediaKind {
    fn from(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Video => MediaKind::Video,
            StreamKind::Audio => MediaKind::Audio,
        }
    }
}

/// Read-only description of one input stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: StreamKind,
    pub time_base: TimeBase,
    pub codec_id: codec::Id,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Streams picked for one job. Iterates video first, then audio.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectedStreams {
    pub video: Option<StreamDescriptor>,
    pub audio: Option<StreamDescriptor>,
}

impl SelectedStreams {
    pub fn iter(&self) -> impl Iterator<Item = &StreamDescriptor> {
        self.video.iter().chain(self.audio.iter())
    }
}

/// Pick the first video and first audio stream the job asks for.
///
/// Video and combined jobs need a video stream. Combined jobs carry audio only
/// when the source has some; audio jobs need an audio stream.
pub fn select_streams(
    descriptors: &[StreamDescriptor],
    media: MediaKind,
) -> Result<SelectedStreams, TranscodeError> {
    let first = |kind: StreamKind| descriptors.iter().find(|d| d.kind == kind).cloned();

    let video = if media.wants_video() {
        Some(first(StreamKind::Video).ok_or(TranscodeError::StreamNotFound {
            kind: MediaKind::Video,
        })?)
    } else {
        None
    };

    let audio = match media {
        MediaKind::Audio => Some(first(StreamKind::Audio).ok_or(
            TranscodeError::StreamNotFound {
                kind: MediaKind::Audio,
            },
        )?),
        MediaKind::Combined => first(StreamKind::Audio),
        MediaKind::Video => None,
    };

    Ok(SelectedStreams { video, audio })
}

/// An open input container. Dropping it closes the input handle.
pub struct MediaSource {
    input: format::context::Input,
    descriptors: Vec<StreamDescriptor>,
    seeked: bool,
}

impl MediaSource {
    /// Open `url` and describe its streams.
    pub fn open(url: &str) -> Result<Self, TranscodeError> {
        let input = format::input(&url).map_err(|source| TranscodeError::Open {
            url: url.to_string(),
            source,
        })?;

        let descriptors = input.streams().filter_map(|s| describe(&s)).collect::<Vec<_>>();

        tracing::debug!(
            url,
            streams = descriptors.len(),
            "opened source"
        );

        Ok(Self {
            input,
            descriptors,
            seeked: false,
        })
    }

    pub fn descriptors(&self) -> &[StreamDescriptor] {
        &self.descriptors
    }

    pub fn select_streams(&self, media: MediaKind) -> Result<SelectedStreams, TranscodeError> {
        select_streams(&self.descriptors, media)
    }

    /// Codec parameters of the input stream at `index`.
    pub fn parameters(&self, index: usize) -> Option<codec::Parameters> {
        self.input.stream(index).map(|s| s.parameters())
    }

    /// Seek to the closest keyframe at or before `seconds`.
    ///
    /// The upper seek bound is the target itself, so the first delivered
    /// frame never lies after the requested start. Only one seek is allowed
    /// per source, and it must happen before any packet is read.
    pub fn seek(&mut self, seconds: f64) -> Result<(), TranscodeError> {
        if self.seeked {
            return Err(TranscodeError::Seek {
                seconds,
                source: ffmpeg::Error::Bug,
            });
        }
        self.seeked = true;

        // The demuxer already sits at the start of the file.
        if seconds <= 0.0 {
            return Ok(());
        }

        let target = seconds_to_micros(seconds);
        self.input
            .seek(target, ..target)
            .map_err(|source| TranscodeError::Seek { seconds, source })
    }

    /// Demuxed packets with the index of the stream they belong to.
    pub fn packets(&mut self) -> impl Iterator<Item = (usize, Packet)> + '_ {
        self.input
            .packets()
            .map(|(stream, packet)| (stream.index(), packet))
    }
}

fn describe(stream: &format::stream::Stream) -> Option<StreamDescriptor> {
    let parameters = stream.parameters();
    let kind = match parameters.medium() {
        Type::Video => StreamKind::Video,
        Type::Audio => StreamKind::Audio,
        _ => return None,
    };

    // SAFETY: the parameters are owned by the open input and outlive this read.
    let (width, height, sample_rate, channels) = unsafe {
        let par = parameters.as_ptr();
        (
            (*par).width.max(0) as u32,
            (*par).height.max(0) as u32,
            (*par).sample_rate.max(0) as u32,
            (*par).ch_layout.nb_channels.max(0) as u16,
        )
    };

    Some(StreamDescriptor {
        index: stream.index(),
        kind,
        time_base: stream.time_base().into(),
        codec_id: parameters.id(),
        width,
        height,
        sample_rate,
        channels,
    })
}
