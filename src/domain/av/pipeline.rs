//! Per-stream decode, convert and encode chain.

use super::convert::{AudioConverter, AudioFifo, VideoConverter};
use super::source::{MediaSource, StreamDescriptor, StreamKind};
use super::target::{EncodeTarget, OpenedEncoder, TargetFormat};
use super::timing::{FrameClock, TimeBase, TimeWindow};
use super::writer::ContainerWriter;
use crate::domain::error::{MuxError, TranscodeError};
use crate::domain::jobs::Job;
use crate::ports::CodecRegistry;
use ffmpeg_next as ffmpeg;
use ffmpeg::{codec, decoder, encoder, frame, Packet, Rational};

/// Encoders with a variable frame size take any chunk; feed them this many.
const DEFAULT_AUDIO_FRAME_SIZE: usize = 1024;

pub enum Decoder {
    Video(decoder::Video),
    Audio(decoder::Audio),
}

/// Open a decoder for `descriptor` with the source's codec parameters.
pub fn configure_decoder<R: CodecRegistry + ?Sized>(
    source: &MediaSource,
    descriptor: &StreamDescriptor,
    registry: &R,
) -> Result<Decoder, TranscodeError> {
    let unavailable = || TranscodeError::DecoderUnavailable {
        codec: descriptor.codec_id,
    };
    let log_and_fail = |e: ffmpeg::Error| {
        tracing::warn!(stream = descriptor.index, error = %e, "could not open decoder");
        unavailable()
    };

    let codec = registry
        .find_decoder(descriptor.codec_id)
        .ok_or_else(unavailable)?;
    let parameters = source.parameters(descriptor.index).ok_or_else(unavailable)?;

    let mut context = codec::context::Context::from_parameters(parameters).map_err(log_and_fail)?;
    // SAFETY: the context is exclusively owned and not opened yet.
    unsafe {
        (*context.as_mut_ptr()).pkt_timebase = Rational::from(descriptor.time_base).into();
    }

    let opened = context.decoder().open_as(codec).map_err(log_and_fail)?;
    match descriptor.kind {
        StreamKind::Video => Ok(Decoder::Video(opened.video().map_err(log_and_fail)?)),
        StreamKind::Audio => Ok(Decoder::Audio(opened.audio().map_err(log_and_fail)?)),
    }
}

/// Resolve and open the job's encoder for `descriptor`'s kind.
pub fn configure_encoder<R: CodecRegistry + ?Sized>(
    job: &Job,
    descriptor: &StreamDescriptor,
    registry: &R,
    global_header: bool,
) -> Result<(EncodeTarget, OpenedEncoder), TranscodeError> {
    let target = EncodeTarget::resolve(job, descriptor.kind, registry)?;
    let encoder = target.open(global_header)?;

    tracing::debug!(
        stream = descriptor.index,
        encoder = %target.name,
        time_base = %target.time_base,
        bit_rate = target.bit_rate,
        "opened encoder"
    );

    Ok((target, encoder))
}

enum Stage {
    Video {
        decoder: decoder::Video,
        converter: VideoConverter,
        encoder: encoder::video::Encoder,
        clock: FrameClock,
    },
    Audio {
        decoder: decoder::Audio,
        converter: AudioConverter,
        fifo: AudioFifo,
        encoder: encoder::audio::Encoder,
        frame_size: usize,
        next_sample: i64,
    },
}

/// Decoder, converter and encoder for one selected input stream.
///
/// Decoded frames before the window start are keyframe pre-roll and are
/// dropped, as are frames at or past the window end. Video frames keep their
/// source spacing re-based to the first frame inside the window, so output
/// starts at tick 0; audio is re-clocked from a running sample counter
/// starting at zero.
pub struct StreamPipeline {
    input_index: usize,
    window: TimeWindow,
    target: EncodeTarget,
    stage: Stage,
}

impl StreamPipeline {
    pub fn new(
        descriptor: &StreamDescriptor,
        window: TimeWindow,
        decoder: Decoder,
        target: EncodeTarget,
        encoder: OpenedEncoder,
    ) -> Result<Self, TranscodeError> {
        let stage = match (decoder, encoder, target.format) {
            (
                Decoder::Video(decoder),
                OpenedEncoder::Video(encoder),
                TargetFormat::Video {
                    width,
                    height,
                    pixel,
                    ..
                },
            ) => Stage::Video {
                decoder,
                converter: VideoConverter::new(width, height, pixel),
                encoder,
                clock: FrameClock::new(window, target.time_base),
            },
            (
                Decoder::Audio(decoder),
                OpenedEncoder::Audio(encoder),
                TargetFormat::Audio {
                    sample_rate,
                    layout,
                    sample,
                },
            ) => {
                let frame_size = match encoder.frame_size() as usize {
                    0 => DEFAULT_AUDIO_FRAME_SIZE,
                    n => n,
                };
                Stage::Audio {
                    decoder,
                    converter: AudioConverter::new(sample, layout, sample_rate),
                    fifo: AudioFifo::new(sample, layout, sample_rate),
                    encoder,
                    frame_size,
                    next_sample: 0,
                }
            }
            _ => {
                return Err(TranscodeError::InvalidJob(format!(
                    "stream {} mixes video and audio codecs",
                    descriptor.index
                )))
            }
        };

        Ok(Self {
            input_index: descriptor.index,
            window,
            target,
            stage,
        })
    }

    pub fn input_index(&self) -> usize {
        self.input_index
    }

    /// Time base of the packets this pipeline emits.
    pub fn encoder_time_base(&self) -> TimeBase {
        self.target.time_base
    }

    /// Declare this pipeline's output stream on `writer`.
    pub fn declare(&self, writer: &mut ContainerWriter) -> Result<usize, MuxError> {
        match &self.stage {
            Stage::Video { encoder, .. } => {
                writer.add_stream(self.target.codec, encoder, self.target.time_base)
            }
            Stage::Audio { encoder, .. } => {
                writer.add_stream(self.target.codec, encoder, self.target.time_base)
            }
        }
    }

    /// Feed one demuxed packet and collect whatever the encoder produced.
    pub fn process(&mut self, packet: &Packet) -> Vec<Packet> {
        let sent = match &mut self.stage {
            Stage::Video { decoder, .. } => decoder.send_packet(packet),
            Stage::Audio { decoder, .. } => decoder.send_packet(packet),
        };
        if let Err(e) = sent {
            tracing::warn!(stream = self.input_index, error = %e, "decode failed, skipping packet");
            return Vec::new();
        }

        let mut out = Vec::new();
        self.drain_decoder(&mut out);
        out
    }

    /// Drain decoder, converter and encoder at the end of the stream.
    pub fn flush(&mut self) -> Vec<Packet> {
        let mut out = Vec::new();

        let eof = match &mut self.stage {
            Stage::Video { decoder, .. } => decoder.send_eof(),
            Stage::Audio { decoder, .. } => decoder.send_eof(),
        };
        match eof {
            Ok(()) => self.drain_decoder(&mut out),
            Err(e) => tracing::warn!(stream = self.input_index, error = %e, "decoder flush failed"),
        }

        let input_index = self.input_index;
        if let Stage::Audio {
            converter,
            fifo,
            encoder,
            frame_size,
            next_sample,
            ..
        } = &mut self.stage
        {
            match converter.flush() {
                Ok(frames) => frames.iter().for_each(|f| fifo.push(f)),
                Err(e) => tracing::warn!(stream = input_index, error = %e, "resampler flush failed"),
            }
            drain_fifo(input_index, fifo, encoder, *frame_size, next_sample, true, &mut out);
        }

        let eof = match &mut self.stage {
            Stage::Video { encoder, .. } => encoder.send_eof(),
            Stage::Audio { encoder, .. } => encoder.send_eof(),
        };
        match eof {
            Ok(()) => match &mut self.stage {
                Stage::Video { encoder, .. } => receive_packets(encoder, &mut out),
                Stage::Audio { encoder, .. } => receive_packets(encoder, &mut out),
            },
            Err(e) => tracing::warn!(stream = input_index, error = %e, "encoder flush failed"),
        }

        out
    }

    fn drain_decoder(&mut self, out: &mut Vec<Packet>) {
        let window = self.window;
        let input_index = self.input_index;

        match &mut self.stage {
            Stage::Video {
                decoder,
                converter,
                encoder,
                clock,
            } => {
                let mut decoded = frame::Video::empty();
                while decoder.receive_frame(&mut decoded).is_ok() {
                    let ts = decoded.timestamp().or(decoded.pts());
                    if !admits(&window, ts) {
                        continue;
                    }

                    // Several source frames can land on one output tick when the
                    // source runs faster than the target rate.
                    let Some(pts) = clock.tick(ts) else {
                        continue;
                    };

                    let mut scaled = match converter.convert(&decoded) {
                        Ok(scaled) => scaled,
                        Err(e) => {
                            tracing::warn!(stream = input_index, error = %e, "scaling failed, skipping frame");
                            continue;
                        }
                    };
                    scaled.set_pts(Some(pts));

                    match encoder.send_frame(&scaled) {
                        Ok(()) => receive_packets(encoder, out),
                        Err(e) => {
                            tracing::warn!(stream = input_index, error = %e, "encode failed, skipping frame")
                        }
                    }
                }
            }
            Stage::Audio {
                decoder,
                converter,
                fifo,
                encoder,
                frame_size,
                next_sample,
            } => {
                let mut decoded = frame::Audio::empty();
                while decoder.receive_frame(&mut decoded).is_ok() {
                    let ts = decoded.timestamp().or(decoded.pts());
                    if !admits(&window, ts) {
                        continue;
                    }

                    match converter.convert(&decoded) {
                        Ok(Some(converted)) => fifo.push(&converted),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!(stream = input_index, error = %e, "resampling failed, skipping frame");
                            continue;
                        }
                    }
                    drain_fifo(input_index, fifo, encoder, *frame_size, next_sample, false, out);
                }
            }
        }
    }
}

/// Frames without a timestamp are kept.
fn admits(window: &TimeWindow, ts: Option<i64>) -> bool {
    match ts {
        Some(ts) => ts >= window.start_pts && ts < window.end_pts,
        None => true,
    }
}

fn drain_fifo(
    input_index: usize,
    fifo: &mut AudioFifo,
    encoder: &mut encoder::audio::Encoder,
    frame_size: usize,
    next_sample: &mut i64,
    flush: bool,
    out: &mut Vec<Packet>,
) {
    while fifo.len() >= frame_size || (flush && !fifo.is_empty()) {
        let chunk = fifo.pop_frame(frame_size, *next_sample);
        *next_sample += frame_size as i64;

        match encoder.send_frame(&chunk) {
            Ok(()) => receive_packets(encoder, out),
            Err(e) => tracing::warn!(stream = input_index, error = %e, "encode failed, skipping frame"),
        }
    }
}

fn receive_packets(encoder: &mut encoder::Encoder, out: &mut Vec<Packet>) {
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        out.push(std::mem::replace(&mut packet, Packet::empty()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::timing::compute_bounds;

    #[test]
    fn test_frames_outside_window_are_dropped() {
        let window = compute_bounds(TimeBase::new(1, 1000), 2.0, 1.0);
        assert!(!admits(&window, Some(1999)));
        assert!(admits(&window, Some(2000)));
        assert!(admits(&window, Some(2999)));
        assert!(!admits(&window, Some(3000)));
        assert!(admits(&window, None));
    }
}
