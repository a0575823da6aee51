//! Conversion stage between decoders and encoders.
//!
//! Scalers and resamplers are built lazily from the first decoded frame, since
//! only then is the real source format known, and rebuilt if it changes
//! mid-stream. Audio is re-chunked through [`AudioFifo`] because most audio
//! encoders only accept frames of exactly `frame_size` samples.

use ffmpeg_next as ffmpeg;
use ffmpeg::format::{Pixel, Sample};
use ffmpeg::software::{resampling, scaling};
use ffmpeg::{frame, ChannelLayout};

/// Headroom added to each resampler output buffer on top of the rate-scaled
/// input length, so the resampler never accumulates a backlog.
const RESAMPLE_HEADROOM: usize = 256;

struct Scaler {
    context: scaling::Context,
    source: (Pixel, u32, u32),
}

/// Scales decoded video to the target geometry and pixel format.
pub struct VideoConverter {
    width: u32,
    height: u32,
    pixel: Pixel,
    scaler: Option<Scaler>,
}

impl VideoConverter {
    pub fn new(width: u32, height: u32, pixel: Pixel) -> Self {
        Self {
            width,
            height,
            pixel,
            scaler: None,
        }
    }

    pub fn convert(&mut self, input: &frame::Video) -> Result<frame::Video, ffmpeg::Error> {
        let source = (input.format(), input.width(), input.height());

        let stale = self.scaler.as_ref().map_or(true, |s| s.source != source);
        if stale {
            let context = scaling::Context::get(
                source.0,
                source.1,
                source.2,
                self.pixel,
                self.width,
                self.height,
                scaling::Flags::BILINEAR,
            )?;
            self.scaler = Some(Scaler { context, source });
        }

        let mut output = frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.context.run(input, &mut output)?;
        }
        Ok(output)
    }
}

struct Resampler {
    context: resampling::Context,
    source: (Sample, ChannelLayout, u32),
}

/// Resamples decoded audio to the target rate, layout and sample format.
pub struct AudioConverter {
    sample: Sample,
    layout: ChannelLayout,
    rate: u32,
    resampler: Option<Resampler>,
}

impl AudioConverter {
    pub fn new(sample: Sample, layout: ChannelLayout, rate: u32) -> Self {
        Self {
            sample,
            layout,
            rate,
            resampler: None,
        }
    }

    /// Convert one decoded frame. Returns `None` when the resampler buffered
    /// everything and produced no output yet.
    pub fn convert(&mut self, input: &frame::Audio) -> Result<Option<frame::Audio>, ffmpeg::Error> {
        let source = (input.format(), source_layout(input), input.rate());

        let stale = self.resampler.as_ref().map_or(true, |r| r.source != source);
        if stale {
            let context = resampling::Context::get(
                source.0,
                source.1,
                source.2,
                self.sample,
                self.layout,
                self.rate,
            )?;
            self.resampler = Some(Resampler { context, source });
        }

        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(None);
        };

        let capacity = scaled_capacity(input.samples(), source.2, self.rate);
        let mut output = frame::Audio::new(self.sample, capacity, self.layout);
        resampler.context.run(input, &mut output)?;

        Ok((output.samples() > 0).then_some(output))
    }

    /// Drain the samples the resampler still holds.
    pub fn flush(&mut self) -> Result<Vec<frame::Audio>, ffmpeg::Error> {
        let mut frames = Vec::new();
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(frames);
        };

        loop {
            let mut output = frame::Audio::new(self.sample, RESAMPLE_HEADROOM * 4, self.layout);
            resampler.context.flush(&mut output)?;
            if output.samples() == 0 {
                break;
            }
            frames.push(output);
        }
        Ok(frames)
    }
}

/// Decoders may leave the layout unspecified; fall back to the default layout
/// for the channel count.
fn source_layout(input: &frame::Audio) -> ChannelLayout {
    let layout = input.channel_layout();
    if layout.is_empty() {
        ChannelLayout::default(input.channels() as i32)
    } else {
        layout
    }
}

fn scaled_capacity(samples: usize, from_rate: u32, to_rate: u32) -> usize {
    if from_rate == 0 {
        return samples + RESAMPLE_HEADROOM;
    }
    let scaled = (samples as u64 * to_rate as u64).div_ceil(from_rate as u64);
    scaled as usize + RESAMPLE_HEADROOM
}

/// Sample FIFO for one fixed sample format and layout.
///
/// Stores raw bytes per plane, so it works for planar and packed formats
/// alike: planar formats keep one plane per channel, packed formats a single
/// interleaved plane.
pub struct AudioFifo {
    sample: Sample,
    layout: ChannelLayout,
    rate: u32,
    /// Bytes one sample occupies in each plane.
    stride: usize,
    planes: Vec<Vec<u8>>,
}

impl AudioFifo {
    pub fn new(sample: Sample, layout: ChannelLayout, rate: u32) -> Self {
        let channels = layout.channels().max(1) as usize;
        let (plane_count, stride) = if sample.is_planar() {
            (channels, sample.bytes())
        } else {
            (1, sample.bytes() * channels)
        };

        Self {
            sample,
            layout,
            rate,
            stride,
            planes: vec![Vec::new(); plane_count],
        }
    }

    /// Buffered samples per channel.
    pub fn len(&self) -> usize {
        match (self.planes.first(), self.stride) {
            (Some(plane), stride) if stride > 0 => plane.len() / stride,
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a frame already converted to this FIFO's format.
    pub fn push(&mut self, input: &frame::Audio) {
        let bytes = input.samples() * self.stride;
        if bytes == 0 {
            return;
        }
        for (index, plane) in self.planes.iter_mut().enumerate() {
            plane.extend_from_slice(&input.data(index)[..bytes]);
        }
    }

    /// Append raw plane data. Every plane must hold the same number of samples.
    pub fn push_planes(&mut self, planes: &[&[u8]]) {
        for (plane, data) in self.planes.iter_mut().zip(planes) {
            plane.extend_from_slice(data);
        }
    }

    /// Remove `n` samples from the front, padding with silence when fewer are
    /// buffered.
    pub fn take_planes(&mut self, n: usize) -> Vec<Vec<u8>> {
        let wanted = n * self.stride;
        let silence = silence_byte(self.sample);

        self.planes
            .iter_mut()
            .map(|plane| {
                let available = plane.len().min(wanted);
                let mut out: Vec<u8> = plane.drain(..available).collect();
                out.resize(wanted, silence);
                out
            })
            .collect()
    }

    /// Pop one encoder-sized frame stamped with `pts`.
    pub fn pop_frame(&mut self, n: usize, pts: i64) -> frame::Audio {
        let planes = self.take_planes(n);

        let mut output = frame::Audio::new(self.sample, n, self.layout);
        output.set_rate(self.rate);
        output.set_pts(Some(pts));
        for (index, data) in planes.iter().enumerate() {
            output.data_mut(index)[..data.len()].copy_from_slice(data);
        }
        output
    }
}

/// Unsigned 8-bit audio is centered on 0x80, everything else on zero.
fn silence_byte(sample: Sample) -> u8 {
    match sample {
        Sample::U8(_) => 0x80,
        _ => 0,
    }
}
