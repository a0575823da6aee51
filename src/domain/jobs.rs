use crate::domain::error::TranscodeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for `start` and `duration` meaning "no trimming, header only".
pub const NO_WINDOW: f64 = -1.0;

/// Latest window end, in seconds, whose microsecond value still fits an `i64`.
pub const MAX_WINDOW_END: f64 = 1.0e12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
    Combined,
}

impl MediaKind {
    pub fn wants_video(&self) -> bool {
        matches!(self, MediaKind::Video | MediaKind::Combined)
    }

    pub fn wants_audio(&self) -> bool {
        matches!(self, MediaKind::Audio | MediaKind::Combined)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Video => write!(f, "video"),
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Combined => write!(f, "combined"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerFormat {
    FragmentedMp4,
    MpegTs,
}

impl ContainerFormat {
    /// libavformat muxer name.
    pub fn muxer(&self) -> &'static str {
        match self {
            ContainerFormat::FragmentedMp4 => "mp4",
            ContainerFormat::MpegTs => "mpegts",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::FragmentedMp4 => "mp4",
            ContainerFormat::MpegTs => "ts",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "mp4" => Some(ContainerFormat::FragmentedMp4),
            "ts" => Some(ContainerFormat::MpegTs),
            _ => None,
        }
    }
}

/// One transcode request. Built once by the caller and only borrowed afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub url: String,
    /// Target video bitrate in kbps.
    pub bitrate: u32,
    /// Target audio bitrate in kbps.
    pub audio_bitrate: u32,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Window start in seconds, or [`NO_WINDOW`].
    pub start: f64,
    /// Window length in seconds, or [`NO_WINDOW`].
    pub duration: f64,
    pub media: MediaKind,
    pub format: ContainerFormat,
    pub video_codec: String,
    pub audio_codec: String,
}

impl Job {
    /// `(start, duration)` when the job asks for a bounded segment.
    pub fn window(&self) -> Option<(f64, f64)> {
        if self.start >= 0.0 && self.duration > 0.0 {
            Some((self.start, self.duration))
        } else {
            None
        }
    }

    pub fn is_init(&self) -> bool {
        self.start == NO_WINDOW && self.duration == NO_WINDOW
    }

    pub fn content_type(&self) -> &'static str {
        match (self.media, self.format) {
            (MediaKind::Audio, _) => "audio/mp4",
            (_, ContainerFormat::MpegTs) => "video/mp2t",
            (_, ContainerFormat::FragmentedMp4) => "video/mp4",
        }
    }

    pub fn file_extension(&self) -> &'static str {
        self.format.extension()
    }

    /// Check the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), TranscodeError> {
        if self.url.is_empty() {
            return Err(TranscodeError::InvalidJob("empty source url".into()));
        }

        if !self.is_init() && self.window().is_none() {
            return Err(TranscodeError::InvalidJob(format!(
                "start {} and duration {} must both be set or both be {}",
                self.start, self.duration, NO_WINDOW
            )));
        }

        if let Some((start, duration)) = self.window() {
            if !(start + duration <= MAX_WINDOW_END) {
                return Err(TranscodeError::InvalidJob(format!(
                    "window {}+{} ends past {} seconds",
                    start, duration, MAX_WINDOW_END
                )));
            }
        }

        if self.media.wants_video() {
            if self.width == 0 || self.height == 0 {
                return Err(TranscodeError::InvalidJob(format!(
                    "video geometry {}x{} is empty",
                    self.width, self.height
                )));
            }
            if !(self.fps > 0.0) {
                return Err(TranscodeError::InvalidJob(format!(
                    "frame rate {} is not positive",
                    self.fps
                )));
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::job;
    use super::*;

    #[test]
    fn test_window_requires_both_values() {
        let mut j = job(MediaKind::Video);
        assert_eq!(j.window(), Some((3.3, 5.8)));
        assert!(j.validate().is_ok());

        j.duration = NO_WINDOW;
        assert_eq!(j.window(), None);
        assert!(!j.is_init());
        assert!(matches!(j.validate(), Err(TranscodeError::InvalidJob(_))));

        j.start = NO_WINDOW;
        assert!(j.is_init());
        assert!(j.validate().is_ok());
    }

    #[test]
    fn test_zero_duration_is_rejected() {
        let mut j = job(MediaKind::Combined);
        j.duration = 0.0;
        assert!(j.validate().is_err());
    }

    #[test]
    fn test_unrepresentable_window_is_rejected() {
        let mut j = job(MediaKind::Combined);
        j.start = 99_999_999_999_999_999_999.0;
        j.duration = 1.0;
        assert!(matches!(j.validate(), Err(TranscodeError::InvalidJob(_))));

        j.start = f64::INFINITY;
        assert!(j.validate().is_err());

        j.start = MAX_WINDOW_END - 10.0;
        j.duration = 10.0;
        assert!(j.validate().is_ok());
    }

    #[test]
    fn test_video_jobs_need_geometry_but_audio_jobs_do_not() {
        let mut video = job(MediaKind::Video);
        video.width = 0;
        assert!(video.validate().is_err());

        let mut audio = job(MediaKind::Audio);
        audio.width = 0;
        audio.height = 0;
        audio.fps = 0.0;
        assert!(audio.validate().is_ok());
    }

    #[test]
    fn test_content_type_follows_media_and_format() {
        let mut combined = job(MediaKind::Combined);
        assert_eq!(combined.content_type(), "video/mp4");
        combined.format = ContainerFormat::MpegTs;
        assert_eq!(combined.content_type(), "video/mp2t");
        assert_eq!(combined.file_extension(), "ts");

        assert_eq!(job(MediaKind::Video).content_type(), "video/mp4");
        assert_eq!(job(MediaKind::Audio).content_type(), "audio/mp4");
    }

    #[test]
    fn test_media_kind_selection() {
        assert!(MediaKind::Combined.wants_video() && MediaKind::Combined.wants_audio());
        assert!(MediaKind::Video.wants_video() && !MediaKind::Video.wants_audio());
        assert!(!MediaKind::Audio.wants_video() && MediaKind::Audio.wants_audio());
    }

    #[test]
    fn test_format_extension_round_trip() {
        assert_eq!(ContainerFormat::from_extension("ts"), Some(ContainerFormat::MpegTs));
        assert_eq!(ContainerFormat::from_extension("mp4"), Some(ContainerFormat::FragmentedMp4));
        assert_eq!(ContainerFormat::from_extension("mkv"), None);
        assert_eq!(ContainerFormat::MpegTs.muxer(), "mpegts");
    }

    #[test]
    fn test_job_serializes() {
        let j = job(MediaKind::Audio);
        let json = serde_json::to_string(&j).unwrap();
        assert!(json.contains("\"media\":\"Audio\""));
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, j);
    }
}
