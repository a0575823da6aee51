//! Encode targets: the fixed output parameters of one request's encoders.
//!
//! Video is always YUV420P at the job's geometry with a `1/fps` time base.
//! Audio is always 48 kHz stereo in the encoder's first supported sample
//! format, with a `1/48000` time base.

use super::source::StreamKind;
use super::timing::TimeBase;
use crate::domain::error::TranscodeError;
use crate::domain::jobs::Job;
use crate::ports::CodecRegistry;
use ffmpeg_next as ffmpeg;
use ffmpeg::media::Type;
use ffmpeg::{codec, encoder, format, ChannelLayout, Dictionary, Rational};

pub const AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const AUDIO_LAYOUT: ChannelLayout = ChannelLayout::STEREO;
pub const VIDEO_PIXEL_FORMAT: format::Pixel = format::Pixel::YUV420P;

/// Fallback when an encoder does not advertise its sample formats.
const DEFAULT_SAMPLE_FORMAT: format::Sample = format::Sample::F32(format::sample::Type::Planar);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetFormat {
    Video {
        width: u32,
        height: u32,
        pixel: format::Pixel,
        frame_rate: Rational,
    },
    Audio {
        sample_rate: u32,
        layout: ChannelLayout,
        sample: format::Sample,
    },
}

/// A resolved encoder plus every parameter it will be opened with.
#[derive(Clone)]
pub struct EncodeTarget {
    pub name: String,
    pub codec: ffmpeg::Codec,
    pub time_base: TimeBase,
    /// Bits per second.
    pub bit_rate: usize,
    pub format: TargetFormat,
}

impl std::fmt::Debug for EncodeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeTarget")
            .field("name", &self.name)
            .field("time_base", &self.time_base)
            .field("bit_rate", &self.bit_rate)
            .field("format", &self.format)
            .finish()
    }
}

/// An opened encoder, ready to take frames.
pub enum OpenedEncoder {
    Video(encoder::video::Encoder),
    Audio(encoder::audio::Encoder),
}

impl EncodeTarget {
    /// Look up the job's encoder for `kind` and derive its parameters.
    pub fn resolve<R: CodecRegistry + ?Sized>(
        job: &Job,
        kind: StreamKind,
        registry: &R,
    ) -> Result<Self, TranscodeError> {
        let (name, medium) = match kind {
            StreamKind::Video => (job.video_codec.as_str(), Type::Video),
            StreamKind::Audio => (job.audio_codec.as_str(), Type::Audio),
        };

        let codec = registry
            .find_encoder(name)
            .ok_or_else(|| TranscodeError::encoder(name, "not registered"))?;
        if !codec.is_encoder() || codec.medium() != medium {
            return Err(TranscodeError::encoder(
                name,
                format!("not a {:?} encoder", medium).to_lowercase(),
            ));
        }

        match kind {
            StreamKind::Video => {
                let frame_rate = Rational::from(job.fps);
                if frame_rate.numerator() <= 0 || frame_rate.denominator() <= 0 {
                    return Err(TranscodeError::InvalidJob(format!(
                        "frame rate {} is not representable",
                        job.fps
                    )));
                }

                Ok(Self {
                    name: name.to_string(),
                    codec,
                    time_base: TimeBase::new(frame_rate.denominator(), frame_rate.numerator()),
                    bit_rate: job.bitrate as usize * 1000,
                    format: TargetFormat::Video {
                        width: job.width,
                        height: job.height,
                        pixel: VIDEO_PIXEL_FORMAT,
                        frame_rate,
                    },
                })
            }
            StreamKind::Audio => {
                let sample = codec
                    .audio()
                    .ok()
                    .and_then(|audio| audio.formats())
                    .and_then(|mut formats| formats.next())
                    .unwrap_or(DEFAULT_SAMPLE_FORMAT);

                Ok(Self {
                    name: name.to_string(),
                    codec,
                    time_base: TimeBase::new(1, AUDIO_SAMPLE_RATE as i32),
                    bit_rate: job.audio_bitrate as usize * 1000,
                    format: TargetFormat::Audio {
                        sample_rate: AUDIO_SAMPLE_RATE,
                        layout: AUDIO_LAYOUT,
                        sample,
                    },
                })
            }
        }
    }

    /// Open the encoder.
    ///
    /// `global_header` must match what the output muxer asks for, otherwise
    /// MP4 ends up without codec extradata in its header.
    pub fn open(&self, global_header: bool) -> Result<OpenedEncoder, TranscodeError> {
        let mut context = codec::context::Context::new_with_codec(self.codec);
        if global_header {
            context.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut options = Dictionary::new();
        options.set("flags", "+bitexact");

        let fail = |e: ffmpeg::Error| TranscodeError::encoder(&self.name, e.to_string());

        match self.format {
            TargetFormat::Video {
                width,
                height,
                pixel,
                frame_rate,
            } => {
                let mut video = context.encoder().video().map_err(fail)?;
                video.set_width(width);
                video.set_height(height);
                video.set_format(pixel);
                video.set_time_base(Rational::from(self.time_base));
                video.set_frame_rate(Some(frame_rate));
                video.set_bit_rate(self.bit_rate);

                let opened = video.open_as_with(self.codec, options).map_err(fail)?;
                Ok(OpenedEncoder::Video(opened))
            }
            TargetFormat::Audio {
                sample_rate,
                layout,
                sample,
            } => {
                let mut audio = context.encoder().audio().map_err(fail)?;
                audio.set_rate(sample_rate as i32);
                audio.set_channel_layout(layout);
                audio.set_format(sample);
                audio.set_time_base(Rational::from(self.time_base));
                audio.set_bit_rate(self.bit_rate);

                let opened = audio.open_as_with(self.codec, options).map_err(fail)?;
                Ok(OpenedEncoder::Audio(opened))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::jobs::{fixtures::job, MediaKind};
    use crate::ports::codecs::MockCodecRegistry;

    fn builtin(id: codec::Id) -> ffmpeg::Codec {
        crate::adapters::ffmpeg::init().unwrap();
        encoder::find(id).unwrap_or_else(|| panic!("{:?} encoder is built in", id))
    }

    #[test]
    fn test_unknown_encoder_is_unavailable() {
        let mut registry = MockCodecRegistry::new();
        registry
            .expect_find_encoder()
            .withf(|name| name == "libx264")
            .times(1)
            .returning(|_| None);

        let result = EncodeTarget::resolve(&job(MediaKind::Video), StreamKind::Video, &registry);
        match result {
            Err(TranscodeError::EncoderUnavailable { name, .. }) => assert_eq!(name, "libx264"),
            other => panic!("expected EncoderUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_codec_for_video_stream_is_rejected() {
        let aac = builtin(codec::Id::AAC);
        let mut registry = MockCodecRegistry::new();
        registry.expect_find_encoder().returning(move |_| Some(aac));

        let result = EncodeTarget::resolve(&job(MediaKind::Video), StreamKind::Video, &registry);
        assert!(matches!(
            result,
            Err(TranscodeError::EncoderUnavailable { .. })
        ));
    }

    #[test]
    fn test_audio_target_is_fixed_48k_stereo() {
        let aac = builtin(codec::Id::AAC);
        let mut registry = MockCodecRegistry::new();
        registry
            .expect_find_encoder()
            .withf(|name| name == "aac")
            .returning(move |_| Some(aac));

        let target =
            EncodeTarget::resolve(&job(MediaKind::Audio), StreamKind::Audio, &registry).unwrap();

        assert_eq!(target.time_base, TimeBase::new(1, 48_000));
        assert_eq!(target.bit_rate, 128_000);
        match target.format {
            TargetFormat::Audio {
                sample_rate,
                layout,
                sample,
            } => {
                assert_eq!(sample_rate, 48_000);
                assert_eq!(layout, ChannelLayout::STEREO);
                // The native AAC encoder only takes planar float.
                assert_eq!(sample, format::Sample::F32(format::sample::Type::Planar));
            }
            _ => panic!("expected an audio target"),
        }

        let opened = target.open(false).unwrap();
        assert!(matches!(opened, OpenedEncoder::Audio(ref e) if e.frame_size() > 0));
    }

    #[test]
    fn test_video_target_follows_job() {
        let mpeg4 = builtin(codec::Id::MPEG4);
        let mut registry = MockCodecRegistry::new();
        registry.expect_find_encoder().returning(move |_| Some(mpeg4));

        let mut j = job(MediaKind::Combined);
        j.video_codec = "mpeg4".to_string();
        let target = EncodeTarget::resolve(&j, StreamKind::Video, &registry).unwrap();

        assert_eq!(target.time_base, TimeBase::new(1, 25));
        assert_eq!(target.bit_rate, 800_000);
        assert_eq!(
            target.format,
            TargetFormat::Video {
                width: 640,
                height: 360,
                pixel: format::Pixel::YUV420P,
                frame_rate: Rational::new(25, 1),
            }
        );

        assert!(matches!(target.open(true).unwrap(), OpenedEncoder::Video(_)));
    }
}
