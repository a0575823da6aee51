//! Segment assembler: one request from source locator to muxed bytes.

use super::pipeline::{configure_decoder, configure_encoder, StreamPipeline};
use super::source::MediaSource;
use super::target::{EncodeTarget, OpenedEncoder};
use super::timing::{compute_bounds, Admission, WindowTracker};
use super::writer::{ContainerWriter, WriterMode};
use crate::domain::error::{MuxError, TranscodeError};
use crate::domain::jobs::Job;
use crate::ports::{CodecRegistry, SegmentProducer};
use std::time::Instant;

/// Produces init and media segments for jobs.
///
/// Stateless apart from the codec registry: every call opens its own source,
/// pipelines and writer, and releases them before returning.
#[derive(Clone)]
pub struct SegmentAssembler<R> {
    registry: R,
}

impl<R: CodecRegistry> SegmentAssembler<R> {
    pub fn new(registry: R) -> Self {
        Self { registry }
    }

    /// Header-only output for `job`. Empty on any failure.
    pub fn produce_init_segment(&self, job: &Job) -> Vec<u8> {
        self.try_produce_init_segment(job)
            .unwrap_or_else(|e| failed(job, &e))
    }

    /// The segment `[start, start + duration)` of `job`. Empty on any failure.
    pub fn produce_segment(&self, job: &Job) -> Vec<u8> {
        self.try_produce_segment(job)
            .unwrap_or_else(|e| failed(job, &e))
    }

    pub fn try_produce_init_segment(&self, job: &Job) -> Result<Vec<u8>, TranscodeError> {
        self.run(job, WriterMode::HeaderOnly)
    }

    pub fn try_produce_segment(&self, job: &Job) -> Result<Vec<u8>, TranscodeError> {
        self.run(job, WriterMode::Full)
    }

    fn run(&self, job: &Job, mode: WriterMode) -> Result<Vec<u8>, TranscodeError> {
        let span = tracing::info_span!(
            "segment",
            url = %job.url,
            media = %job.media,
            format = job.format.muxer(),
            start = job.start,
            duration = job.duration,
        );
        let _enter = span.enter();
        let started = Instant::now();

        job.validate()?;
        let window = job.window();
        if mode == WriterMode::Full && window.is_none() {
            return Err(TranscodeError::InvalidJob(
                "segment job without a time window".into(),
            ));
        }

        // 1. Open the source and pick its streams
        let mut source = MediaSource::open(&job.url)?;
        let selected = source.select_streams(job.media)?;
        for descriptor in selected.iter() {
            tracing::debug!(
                index = descriptor.index,
                kind = ?descriptor.kind,
                codec = ?descriptor.codec_id,
                time_base = %descriptor.time_base,
                "selected stream"
            );
        }

        // 2. Declare output streams
        let mut writer = ContainerWriter::new(job.format, mode)?;
        let global_header = writer.requires_global_header();

        let bytes = match mode {
            WriterMode::HeaderOnly => {
                for descriptor in selected.iter() {
                    let (target, encoder) =
                        configure_encoder(job, descriptor, &self.registry, global_header)?;
                    declare(&mut writer, &target, &encoder)?;
                }
                writer.write_header()?;
                writer.finish()?
            }
            WriterMode::Full => {
                let (start, duration) = window.ok_or_else(|| {
                    TranscodeError::InvalidJob("segment job without a time window".into())
                })?;

                let mut tracker = WindowTracker::new();
                let mut pipelines = Vec::new();
                for descriptor in selected.iter() {
                    let window = compute_bounds(descriptor.time_base, start, duration);
                    tracing::debug!(
                        index = descriptor.index,
                        start_pts = window.start_pts,
                        end_pts = window.end_pts,
                        "computed bounds"
                    );

                    let decoder = configure_decoder(&source, descriptor, &self.registry)?;
                    let (target, encoder) =
                        configure_encoder(job, descriptor, &self.registry, global_header)?;
                    let pipeline = StreamPipeline::new(descriptor, window, decoder, target, encoder)?;
                    let output_index = pipeline.declare(&mut writer)?;

                    tracker.track(descriptor.index, window);
                    pipelines.push((output_index, pipeline));
                }

                // 3. Position the source on the keyframe before the window
                source.seek(start)?;
                writer.write_header()?;

                // 4. Read, decode, encode and mux until every stream hit its end bound
                let mut samples = 0usize;
                for (index, packet) in source.packets() {
                    if tracker.admit(index, packet.pts()) == Admission::Accept {
                        if let Some((output_index, pipeline)) =
                            pipelines.iter_mut().find(|(_, p)| p.input_index() == index)
                        {
                            let time_base = pipeline.encoder_time_base();
                            for encoded in pipeline.process(&packet) {
                                writer.write_sample(*output_index, encoded, time_base)?;
                                samples += 1;
                            }
                        }
                    }

                    if tracker.all_finished() {
                        break;
                    }
                }

                // 5. Drain every pipeline and close the container
                for (output_index, pipeline) in pipelines.iter_mut() {
                    let time_base = pipeline.encoder_time_base();
                    for encoded in pipeline.flush() {
                        writer.write_sample(*output_index, encoded, time_base)?;
                        samples += 1;
                    }
                }
                writer.write_trailer()?;

                tracing::debug!(samples, "muxed samples");
                writer.finish()?
            }
        };

        tracing::info!(
            bytes = bytes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "produced {}",
            match mode {
                WriterMode::HeaderOnly => "init segment",
                WriterMode::Full => "segment",
            }
        );
        Ok(bytes)
    }
}

impl<R: CodecRegistry> SegmentProducer for SegmentAssembler<R> {
    fn produce_init_segment(&self, job: &Job) -> Vec<u8> {
        SegmentAssembler::produce_init_segment(self, job)
    }

    fn produce_segment(&self, job: &Job) -> Vec<u8> {
        SegmentAssembler::produce_segment(self, job)
    }
}

fn declare(
    writer: &mut ContainerWriter,
    target: &EncodeTarget,
    encoder: &OpenedEncoder,
) -> Result<usize, MuxError> {
    match encoder {
        OpenedEncoder::Video(e) => writer.add_stream(target.codec, e, target.time_base),
        OpenedEncoder::Audio(e) => writer.add_stream(target.codec, e, target.time_base),
    }
}

fn failed(job: &Job, error: &TranscodeError) -> Vec<u8> {
    tracing::error!(url = %job.url, media = %job.media, error = %error, "transcode failed");
    Vec::new()
}
