//! libav* backed implementations of the codec port.

use crate::ports::CodecRegistry;
use ffmpeg_next as ffmpeg;

/// Initialize libavformat/libavcodec and the network protocols.
///
/// Safe to call more than once. The binary calls it at startup, tests call it
/// before touching a source.
pub fn init() -> Result<(), ffmpeg::Error> {
    ffmpeg::init()?;
    ffmpeg::format::network::init();
    Ok(())
}

/// Codec lookup against the codecs compiled into the linked libavcodec.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegCodecRegistry;

impl FfmpegCodecRegistry {
    pub fn new() -> Self {
        Self
    }
}

impl CodecRegistry for FfmpegCodecRegistry {
    fn find_decoder(&self, id: ffmpeg::codec::Id) -> Option<ffmpeg::Codec> {
        ffmpeg::decoder::find(id)
    }

    fn find_encoder(&self, name: &str) -> Option<ffmpeg::Codec> {
        ffmpeg::encoder::find_by_name(name)
    }
}
