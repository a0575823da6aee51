//! Container writer muxing encoded packets into an in-memory buffer.
//!
//! The output context writes through a libavformat dynamic buffer instead of
//! a file or socket, so a finished segment never touches the disk.

use super::timing::{rescale, TimeBase};
use crate::domain::error::MuxError;
use crate::domain::jobs::ContainerFormat;
use ffmpeg_next as ffmpeg;
use ffmpeg::{codec, ffi, format, Dictionary, Packet};
use std::ffi::CStr;
use std::{fmt, ptr, slice};

/// Fragment on every keyframe and write an empty moov so the header stands on
/// its own as an init segment.
const FRAGMENTED_MOVFLAGS: &str = "frag_keyframe+empty_moov+default_base_moof";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterMode {
    /// Header only: the init segment.
    HeaderOnly,
    /// Header, samples and trailer.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Created,
    HeaderWritten,
    SamplesWriting,
    TrailerWritten,
    Closed,
}

impl WriterState {
    pub fn name(&self) -> &'static str {
        match self {
            WriterState::Created => "created",
            WriterState::HeaderWritten => "header-written",
            WriterState::SamplesWriting => "samples-writing",
            WriterState::TrailerWritten => "trailer-written",
            WriterState::Closed => "closed",
        }
    }
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct ContainerWriter {
    format: ContainerFormat,
    mode: WriterMode,
    output: format::context::Output,
    state: WriterState,
    /// Muxer-chosen time base per output stream, known once the header is out.
    stream_time_bases: Vec<TimeBase>,
}

fn muxer_name(format: ContainerFormat) -> &'static CStr {
    match format {
        ContainerFormat::FragmentedMp4 => c"mp4",
        ContainerFormat::MpegTs => c"mpegts",
    }
}

impl ContainerWriter {
    pub fn new(format: ContainerFormat, mode: WriterMode) -> Result<Self, MuxError> {
        let alloc_error = |code: i32| MuxError::Alloc {
            format: format.muxer(),
            reason: ffmpeg::Error::from(code).to_string(),
        };

        // SAFETY: the context pointer is checked before being wrapped, and
        // `Output` takes ownership of it from here on.
        let output = unsafe {
            let mut context = ptr::null_mut();
            let ret = ffi::avformat_alloc_output_context2(
                &mut context,
                ptr::null(),
                muxer_name(format).as_ptr(),
                ptr::null(),
            );
            if ret < 0 || context.is_null() {
                return Err(alloc_error(ret));
            }
            let mut output = format::context::Output::wrap(context);

            let ret = ffi::avio_open_dyn_buf(&mut (*output.as_mut_ptr()).pb);
            if ret < 0 {
                return Err(alloc_error(ret));
            }
            output
        };

        Ok(Self {
            format,
            mode,
            output,
            state: WriterState::Created,
            stream_time_bases: Vec::new(),
        })
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Whether encoders feeding this muxer must put codec extradata in a
    /// global header.
    pub fn requires_global_header(&self) -> bool {
        self.output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER)
    }

    /// Declare an output stream carrying `encoder`'s codec parameters.
    pub fn add_stream<E: AsRef<codec::Context>>(
        &mut self,
        codec: ffmpeg::Codec,
        encoder: &E,
        time_base: TimeBase,
    ) -> Result<usize, MuxError> {
        self.ensure(&[WriterState::Created], "add_stream")?;

        let added = match self.output.add_stream(codec) {
            Ok(mut stream) => {
                stream.set_time_base(time_base);
                stream.set_parameters(encoder);
                Ok(stream.index())
            }
            Err(e) => Err(MuxError::Stream(e)),
        };
        added.map_err(|e| self.fail(e))
    }

    pub fn write_header(&mut self) -> Result<(), MuxError> {
        self.ensure(&[WriterState::Created], "write_header")?;

        let mut options = Dictionary::new();
        options.set("fflags", "+bitexact");
        if self.format == ContainerFormat::FragmentedMp4 {
            options.set("movflags", FRAGMENTED_MOVFLAGS);
        }

        if let Err(e) = self.output.write_header_with(options) {
            return Err(self.fail(MuxError::Header(e)));
        }

        self.stream_time_bases = self
            .output
            .streams()
            .map(|s| TimeBase::from(s.time_base()))
            .collect();
        self.state = WriterState::HeaderWritten;
        Ok(())
    }

    /// Mux one encoded packet.
    ///
    /// Timestamps and duration are rebased from `from` (the encoder time base)
    /// to the output stream's time base; the byte position hint is cleared.
    pub fn write_sample(
        &mut self,
        stream: usize,
        mut packet: Packet,
        from: TimeBase,
    ) -> Result<(), MuxError> {
        self.ensure(
            &[WriterState::HeaderWritten, WriterState::SamplesWriting],
            "write_sample",
        )?;

        let Some(&to) = self.stream_time_bases.get(stream) else {
            return Err(self.fail(MuxError::Write(ffmpeg::Error::StreamNotFound)));
        };

        rebase(&mut packet, stream, from, to);
        if let Err(e) = packet.write_interleaved(&mut self.output) {
            return Err(self.fail(MuxError::Write(e)));
        }
        self.state = WriterState::SamplesWriting;
        Ok(())
    }

    pub fn write_trailer(&mut self) -> Result<(), MuxError> {
        self.ensure(
            &[WriterState::HeaderWritten, WriterState::SamplesWriting],
            "write_trailer",
        )?;

        if let Err(e) = self.output.write_trailer() {
            return Err(self.fail(MuxError::Trailer(e)));
        }
        self.state = WriterState::TrailerWritten;
        Ok(())
    }

    /// Hand off the muxed bytes.
    ///
    /// Only a header-only writer after its header, or a full writer after its
    /// trailer, has complete output.
    pub fn finish(mut self) -> Result<Vec<u8>, MuxError> {
        let ready = match self.mode {
            WriterMode::HeaderOnly => WriterState::HeaderWritten,
            WriterMode::Full => WriterState::TrailerWritten,
        };
        self.ensure(&[ready], "finish")?;

        let bytes = self.release_buffer();
        self.state = WriterState::Closed;
        Ok(bytes)
    }

    fn ensure(
        &mut self,
        allowed: &[WriterState],
        operation: &'static str,
    ) -> Result<(), MuxError> {
        if allowed.contains(&self.state) {
            return Ok(());
        }
        let state = self.state.name();
        Err(self.fail(MuxError::InvalidState { operation, state }))
    }

    fn fail(&mut self, error: MuxError) -> MuxError {
        self.state = WriterState::Closed;
        error
    }

    /// Detach the dynamic buffer from the output context and copy it out.
    ///
    /// `Output`'s own drop would hand `pb` to `avio_close`, which must never
    /// see a dynamic buffer, so `pb` is always nulled here.
    fn release_buffer(&mut self) -> Vec<u8> {
        // SAFETY: `pb` was opened by `avio_open_dyn_buf` in `new` and is only
        // closed here, after which it is nulled.
        unsafe {
            let context = self.output.as_mut_ptr();
            if (*context).pb.is_null() {
                return Vec::new();
            }

            let mut buffer = ptr::null_mut();
            let size = ffi::avio_close_dyn_buf((*context).pb, &mut buffer);
            (*context).pb = ptr::null_mut();

            let bytes = if size > 0 && !buffer.is_null() {
                slice::from_raw_parts(buffer, size as usize).to_vec()
            } else {
                Vec::new()
            };
            ffi::av_free(buffer.cast());
            bytes
        }
    }
}

/// Point `packet` at `stream` and move its timing from `from` to `to`.
/// Missing timestamps stay missing.
fn rebase(packet: &mut Packet, stream: usize, from: TimeBase, to: TimeBase) {
    packet.set_stream(stream);
    packet.set_pts(packet.pts().map(|ts| rescale(ts, from, to)));
    packet.set_dts(packet.dts().map(|ts| rescale(ts, from, to)));
    packet.set_duration(rescale(packet.duration(), from, to));
    packet.set_position(-1);
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        self.release_buffer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aac() -> (ffmpeg::Codec, ffmpeg::encoder::audio::Encoder) {
        crate::adapters::ffmpeg::init().unwrap();
        let codec = ffmpeg::encoder::find(codec::Id::AAC).expect("aac encoder is built in");
        let mut audio = codec::context::Context::new_with_codec(codec)
            .encoder()
            .audio()
            .unwrap();
        audio.set_rate(48_000);
        audio.set_channel_layout(ffmpeg::ChannelLayout::STEREO);
        audio.set_format(format::Sample::F32(format::sample::Type::Planar));
        audio.set_time_base(ffmpeg::Rational::new(1, 48_000));
        audio.set_bit_rate(128_000);
        let encoder = audio.open_as(codec).unwrap();
        (codec, encoder)
    }

    #[test]
    fn test_rebase_keeps_missing_pts_and_rescales_duration() {
        let mut packet = Packet::empty();
        packet.set_pts(None);
        packet.set_dts(Some(7_200));
        packet.set_duration(3_600);
        packet.set_position(4_096);

        rebase(&mut packet, 1, TimeBase::new(1, 90_000), TimeBase::new(1, 25));

        assert_eq!(packet.stream(), 1);
        assert_eq!(packet.pts(), None);
        assert_eq!(packet.dts(), Some(2));
        assert_eq!(packet.duration(), 1);
        assert_eq!(packet.position(), -1);
    }

    #[test]
    fn test_rebase_rounds_to_nearest_output_tick() {
        let mut packet = Packet::empty();
        packet.set_pts(Some(1_001));
        packet.set_dts(Some(1_001));
        packet.set_duration(1_001);

        // 1001/30000 s is 0.0333.. s, a third of the way to 1/10 s.
        rebase(&mut packet, 0, TimeBase::new(1, 30_000), TimeBase::new(1, 10));
        assert_eq!(packet.pts(), Some(0));
        assert_eq!(packet.dts(), Some(0));
        assert_eq!(packet.duration(), 0);

        packet.set_pts(Some(90_000));
        rebase(&mut packet, 0, TimeBase::new(1, 90_000), TimeBase::new(1, 48_000));
        assert_eq!(packet.pts(), Some(48_000));
    }

    #[test]
    fn test_out_of_order_calls_are_rejected() {
        crate::adapters::ffmpeg::init().unwrap();
        let mut writer =
            ContainerWriter::new(ContainerFormat::FragmentedMp4, WriterMode::Full).unwrap();
        assert_eq!(writer.state(), WriterState::Created);

        let result = writer.write_trailer();
        assert!(matches!(
            result,
            Err(MuxError::InvalidState {
                operation: "write_trailer",
                state: "created"
            })
        ));
        assert_eq!(writer.state(), WriterState::Closed);

        // Nothing recovers a closed writer.
        assert!(matches!(
            writer.write_header(),
            Err(MuxError::InvalidState { state: "closed", .. })
        ));
    }

    #[test]
    fn test_sample_before_header_is_rejected() {
        crate::adapters::ffmpeg::init().unwrap();
        let mut writer =
            ContainerWriter::new(ContainerFormat::MpegTs, WriterMode::Full).unwrap();
        let result = writer.write_sample(0, Packet::empty(), TimeBase::new(1, 25));
        assert!(matches!(
            result,
            Err(MuxError::InvalidState {
                operation: "write_sample",
                ..
            })
        ));
    }

    #[test]
    fn test_header_without_streams_fails_and_closes() {
        crate::adapters::ffmpeg::init().unwrap();
        let mut writer =
            ContainerWriter::new(ContainerFormat::FragmentedMp4, WriterMode::HeaderOnly).unwrap();
        assert!(matches!(writer.write_header(), Err(MuxError::Header(_))));
        assert_eq!(writer.state(), WriterState::Closed);
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_mp4_needs_global_header_but_ts_does_not() {
        crate::adapters::ffmpeg::init().unwrap();
        let mp4 =
            ContainerWriter::new(ContainerFormat::FragmentedMp4, WriterMode::Full).unwrap();
        let ts =
            ContainerWriter::new(ContainerFormat::MpegTs, WriterMode::Full).unwrap();
        assert!(mp4.requires_global_header());
        assert!(!ts.requires_global_header());
    }

    #[test]
    fn test_header_only_writer_yields_init_segment() {
        let (codec, encoder) = aac();
        let mut writer =
            ContainerWriter::new(ContainerFormat::FragmentedMp4, WriterMode::HeaderOnly).unwrap();
        let index = writer
            .add_stream(codec, &encoder, TimeBase::new(1, 48_000))
            .unwrap();
        assert_eq!(index, 0);
        writer.write_header().unwrap();

        let bytes = writer.finish().unwrap();
        assert!(bytes.len() > 8);
        assert_eq!(&bytes[4..8], b"ftyp");
    }

    #[test]
    fn test_streams_cannot_be_added_after_header() {
        let (codec, encoder) = aac();
        let mut writer =
            ContainerWriter::new(ContainerFormat::FragmentedMp4, WriterMode::Full).unwrap();
        writer
            .add_stream(codec, &encoder, TimeBase::new(1, 48_000))
            .unwrap();
        writer.write_header().unwrap();
        assert!(matches!(
            writer.add_stream(codec, &encoder, TimeBase::new(1, 48_000)),
            Err(MuxError::InvalidState { .. })
        ));
    }
}
