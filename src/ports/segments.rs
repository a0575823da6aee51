use crate::domain::jobs::Job;

/// Blocking producer of muxed segments.
///
/// Implementations never fail loudly: an empty buffer means the job could not
/// be served.
#[cfg_attr(test, mockall::automock)]
pub trait SegmentProducer: Send + Sync {
    /// Header-only output (init segment) for `job`.
    fn produce_init_segment(&self, job: &Job) -> Vec<u8>;

    /// Media segment covering `job`'s time window.
    fn produce_segment(&self, job: &Job) -> Vec<u8>;
}
