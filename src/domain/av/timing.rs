//! Time window mapping between wall-clock seconds and stream timestamps.
//!
//! Every conversion here is integer-only. Seconds are quantized once to the
//! microsecond domain and from there on timestamps only move through exact
//! rational rescales, so thousands of rebased samples never drift.

use ffmpeg_next as ffmpeg;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Microsecond time base, the same unit libavformat uses for seeking.
pub const MICROSECONDS: TimeBase = TimeBase::new(1, 1_000_000);

/// Rational unit in which a stream expresses its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }
}

impl fmt::Display for TimeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl From<ffmpeg::Rational> for TimeBase {
    fn from(r: ffmpeg::Rational) -> Self {
        Self::new(r.numerator(), r.denominator())
    }
}

impl From<TimeBase> for ffmpeg::Rational {
    fn from(tb: TimeBase) -> Self {
        ffmpeg::Rational::new(tb.num, tb.den)
    }
}

/// Convert `ts` from one time base to another.
///
/// Computes `ts * from.num * to.den / (from.den * to.num)` in 128-bit integers,
/// rounding to the nearest tick with ties away from zero. Results outside the
/// `i64` range saturate.
pub fn rescale(ts: i64, from: TimeBase, to: TimeBase) -> i64 {
    let num = ts as i128 * from.num as i128 * to.den as i128;
    let den = from.den as i128 * to.num as i128;
    if den == 0 {
        return ts;
    }

    let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
    let half = den / 2;
    let rounded = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };

    rounded.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Quantize a duration in seconds to whole microseconds.
pub fn seconds_to_micros(seconds: f64) -> i64 {
    (seconds * 1_000_000.0).round() as i64
}

/// Half-open `[start_pts, end_pts)` window in one stream's native time base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_pts: i64,
    pub end_pts: i64,
    pub time_base: TimeBase,
}

impl TimeWindow {
    /// Window length expressed in another time base.
    pub fn length_in(&self, to: TimeBase) -> i64 {
        rescale(self.end_pts.saturating_sub(self.start_pts), self.time_base, to)
    }
}

/// Compute the sample bounds of `[start, start + duration)` for one stream.
pub fn compute_bounds(
    time_base: TimeBase,
    start_seconds: f64,
    duration_seconds: f64,
) -> TimeWindow {
    let start_us = seconds_to_micros(start_seconds);
    let end_us = start_us.saturating_add(seconds_to_micros(duration_seconds));

    TimeWindow {
        start_pts: rescale(start_us, MICROSECONDS, time_base),
        end_pts: rescale(end_us, MICROSECONDS, time_base),
        time_base,
    }
}

/// Output clock of one video stream.
///
/// The first frame admitted into the window maps to tick 0 and later frames
/// keep their source spacing. Ticks are strictly increasing and stay below the
/// window length.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    time_base: TimeBase,
    to: TimeBase,
    length: i64,
    origin: Option<i64>,
    last: Option<i64>,
}

impl FrameClock {
    pub fn new(window: TimeWindow, to: TimeBase) -> Self {
        Self {
            time_base: window.time_base,
            to,
            length: window.length_in(to),
            origin: None,
            last: None,
        }
    }

    /// Output tick for a frame with source timestamp `ts`, or `None` when the
    /// frame falls on an already used tick or past the window length.
    /// Untimed frames take the tick after the previous one.
    pub fn tick(&mut self, ts: Option<i64>) -> Option<i64> {
        let pts = match ts {
            Some(ts) => {
                let origin = *self.origin.get_or_insert(ts);
                rescale(ts.saturating_sub(origin), self.time_base, self.to)
            }
            None => self.last.map_or(0, |last| last.saturating_add(1)),
        };

        if pts < 0 || pts >= self.length || self.last.is_some_and(|last| pts <= last) {
            return None;
        }
        self.last = Some(pts);
        Some(pts)
    }
}

/// A sample belongs to the segment iff its source PTS is before the end bound.
pub fn is_within_window(pts: i64, end_pts: i64) -> bool {
    pts < end_pts
}

/// What the read loop should do with a demuxed packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Feed the packet to its stream pipeline.
    Accept,
    /// The packet belongs to a stream that is not being transcoded.
    Ignore,
    /// The packet's stream already reached its end bound.
    Finished,
}

#[derive(Debug)]
struct TrackedStream {
    index: usize,
    window: TimeWindow,
    finished: bool,
}

/// Per-stream window termination shared by one outer read loop.
#[derive(Debug, Default)]
pub struct WindowTracker {
    streams: Vec<TrackedStream>,
}

impl WindowTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, index: usize, window: TimeWindow) {
        self.streams.push(TrackedStream {
            index,
            window,
            finished: false,
        });
    }

    pub fn window(&self, index: usize) -> Option<&TimeWindow> {
        self.streams
            .iter()
            .find(|s| s.index == index)
            .map(|s| &s.window)
    }

    /// Decide whether a packet with source timestamp `pts` is part of the segment.
    ///
    /// The first packet at or past the end bound finishes its stream; other
    /// streams keep reading. Packets without a timestamp are always accepted
    /// while their stream is open.
    pub fn admit(&mut self, index: usize, pts: Option<i64>) -> Admission {
        let Some(stream) = self.streams.iter_mut().find(|s| s.index == index) else {
            return Admission::Ignore;
        };

        if stream.finished {
            return Admission::Finished;
        }

        match pts {
            Some(pts) if !is_within_window(pts, stream.window.end_pts) => {
                stream.finished = true;
                Admission::Finished
            }
            _ => Admission::Accept,
        }
    }

    pub fn all_finished(&self) -> bool {
        !self.streams.is_empty() && self.streams.iter().all(|s| s.finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPEGTS: TimeBase = TimeBase::new(1, 90_000);
    const FPS_25: TimeBase = TimeBase::new(1, 25);

    #[test]
    fn test_rescale_even_division_is_exact() {
        // One 25 fps frame is 3600 ticks at 90 kHz.
        assert_eq!(rescale(3600, MPEGTS, FPS_25), 1);
        assert_eq!(rescale(90_000, MPEGTS, FPS_25), 25);
        assert_eq!(rescale(25, FPS_25, MPEGTS), 90_000);
    }

    #[test]
    fn test_rescale_rounds_to_nearest() {
        // 1800 ticks is exactly half a frame: ties go away from zero.
        assert_eq!(rescale(1800, MPEGTS, FPS_25), 1);
        assert_eq!(rescale(1799, MPEGTS, FPS_25), 0);
        assert_eq!(rescale(-1800, MPEGTS, FPS_25), -1);
        assert_eq!(rescale(-1799, MPEGTS, FPS_25), 0);
    }

    #[test]
    fn test_rescale_is_monotonic() {
        let from = TimeBase::new(1001, 30_000);
        let to = TimeBase::new(1, 12_800);
        let mut previous = i64::MIN;
        for pts in -500..5_000 {
            let out = rescale(pts, from, to);
            assert!(out >= previous, "rescale({pts}) went backwards");
            previous = out;
        }
    }

    #[test]
    fn test_rescale_round_trip_within_one_tick() {
        let source = TimeBase::new(1, 48_000);
        let output = TimeBase::new(1, 44_100);
        for pts in (0..2_000_000).step_by(997) {
            let back = rescale(rescale(pts, source, output), output, source);
            assert!((back - pts).abs() <= 1, "{pts} came back as {back}");
        }
    }

    #[test]
    fn test_rescale_does_not_overflow() {
        let huge = rescale(i64::MAX / 2, TimeBase::new(1, 1), TimeBase::new(1, 90_000));
        assert_eq!(huge, i64::MAX);
    }

    #[test]
    fn test_rescale_ignores_degenerate_base() {
        assert_eq!(rescale(42, TimeBase::new(0, 1), TimeBase::new(1, 25)), 0);
        assert_eq!(rescale(42, TimeBase::new(1, 25), TimeBase::new(0, 1)), 42);
    }

    #[test]
    fn test_compute_bounds_per_time_base() {
        let video = compute_bounds(MPEGTS, 3.3, 5.8);
        assert_eq!(video.start_pts, 297_000);
        assert_eq!(video.end_pts, 819_000);

        let audio = compute_bounds(TimeBase::new(1, 48_000), 3.3, 5.8);
        assert_eq!(audio.start_pts, 158_400);
        assert_eq!(audio.end_pts, 436_800);
    }

    #[test]
    fn test_window_length_in_output_base() {
        let window = compute_bounds(MPEGTS, 2.0, 4.0);
        assert_eq!(window.length_in(FPS_25), 100);
    }

    #[test]
    fn test_huge_start_saturates_instead_of_overflowing() {
        let window = compute_bounds(MPEGTS, 99_999_999_999_999_999_999.0, 1.0);
        assert!(window.end_pts >= window.start_pts);
        assert_eq!(window.length_in(FPS_25), 0);

        let mut clock = FrameClock::new(window, FPS_25);
        assert_eq!(clock.tick(Some(i64::MIN)), None);
    }

    #[test]
    fn test_first_frame_after_unaligned_start_is_tick_zero() {
        // 3.3 s falls between two 25 fps frames of a 1/12800 stream: the first
        // frame inside the window sits at 3.32 s.
        let mp4 = TimeBase::new(1, 12_800);
        let window = compute_bounds(mp4, 3.3, 5.8);
        assert_eq!(window.start_pts, 42_240);

        let mut clock = FrameClock::new(window, FPS_25);
        assert_eq!(clock.tick(Some(42_496)), Some(0));
        assert_eq!(clock.tick(Some(42_496 + 512)), Some(1));
        assert_eq!(clock.tick(Some(42_496 + 2 * 512)), Some(2));
    }

    #[test]
    fn test_frame_clock_drops_duplicate_ticks() {
        // 50 fps source into a 25 fps clock.
        let window = compute_bounds(TimeBase::new(1, 12_800), 0.0, 2.0);
        let mut clock = FrameClock::new(window, FPS_25);
        let ticks: Vec<_> = (0..5).map(|i| clock.tick(Some(i * 256))).collect();
        assert_eq!(ticks, vec![Some(0), Some(1), None, Some(2), None]);
    }

    #[test]
    fn test_frame_clock_stays_below_window_length() {
        let window = compute_bounds(MPEGTS, 0.0, 1.0);
        let mut clock = FrameClock::new(window, FPS_25);
        assert_eq!(clock.tick(Some(0)), Some(0));
        assert_eq!(clock.tick(Some(86_400)), Some(24));
        // Rounds to tick 25, which is the window length.
        assert_eq!(clock.tick(Some(89_999)), None);
    }

    #[test]
    fn test_frame_clock_numbers_untimed_frames() {
        let window = compute_bounds(MPEGTS, 0.0, 1.0);
        let mut clock = FrameClock::new(window, FPS_25);
        assert_eq!(clock.tick(None), Some(0));
        assert_eq!(clock.tick(None), Some(1));
    }

    #[test]
    fn test_window_is_half_open() {
        let window = compute_bounds(MPEGTS, 0.0, 1.0);
        assert!(is_within_window(window.end_pts - 1, window.end_pts));
        assert!(!is_within_window(window.end_pts, window.end_pts));
    }

    #[test]
    fn test_tracker_finishes_streams_independently() {
        let mut tracker = WindowTracker::new();
        tracker.track(0, compute_bounds(MPEGTS, 0.0, 1.0));
        tracker.track(1, compute_bounds(TimeBase::new(1, 48_000), 0.0, 1.0));

        assert_eq!(tracker.admit(0, Some(89_999)), Admission::Accept);
        assert_eq!(tracker.admit(0, Some(90_000)), Admission::Finished);
        assert!(!tracker.all_finished());

        // Video is done but audio keeps flowing through the same loop.
        assert_eq!(tracker.admit(1, Some(47_999)), Admission::Accept);
        assert_eq!(tracker.admit(0, Some(10)), Admission::Finished);
        assert_eq!(tracker.admit(1, Some(48_000)), Admission::Finished);
        assert!(tracker.all_finished());
    }

    #[test]
    fn test_tracker_passes_untimed_packets_and_ignores_unknown_streams() {
        let mut tracker = WindowTracker::new();
        tracker.track(0, compute_bounds(MPEGTS, 0.0, 1.0));

        assert_eq!(tracker.admit(0, None), Admission::Accept);
        assert_eq!(tracker.admit(3, Some(0)), Admission::Ignore);
        assert!(!tracker.all_finished());
    }

    #[test]
    fn test_empty_tracker_is_never_finished() {
        assert!(!WindowTracker::new().all_finished());
    }
}
