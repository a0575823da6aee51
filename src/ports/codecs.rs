use ffmpeg_next as ffmpeg;

/// Lookup of the codecs available to the pipeline.
///
/// The pipeline never reaches into libavcodec's global registry directly, so
/// tests can hand it a registry that pretends a codec is missing.
#[cfg_attr(test, mockall::automock)]
pub trait CodecRegistry: Send + Sync {
    /// Decoder able to read streams coded with `id`.
    fn find_decoder(&self, id: ffmpeg::codec::Id) -> Option<ffmpeg::Codec>;

    /// Encoder registered under `name` (e.g. `libx264`, `aac`).
    fn find_encoder(&self, name: &str) -> Option<ffmpeg::Codec>;
}
