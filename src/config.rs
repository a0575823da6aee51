//! Server configuration loaded from the environment.

use std::env;
use std::str::FromStr;

/// Configuration for the segment server.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerConfig {
    /// HTTP server bind address
    pub addr: String,
    /// HTTP server port
    pub port: u16,
    /// Encoder name used for every video stream
    pub video_codec: String,
    /// Encoder name used for every audio stream
    pub audio_codec: String,
    /// Output frame rate
    pub fps: f64,
    /// Audio bitrate in kbps for combined and video routes
    pub audio_bitrate_kbps: u32,
    /// Upper bound on transcodes running at once
    pub max_concurrent_jobs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl ServerConfig {
    pub fn defaults() -> Self {
        Self {
            addr: String::from("0.0.0.0"),
            port: 8080,
            video_codec: String::from("libx264"),
            audio_codec: String::from("aac"),
            fps: 25.0,
            audio_bitrate_kbps: 128,
            max_concurrent_jobs: 4,
        }
    }

    /// Load configuration from environment variables (and `.env`).
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup. Unparsable or out-of-range
    /// numbers fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::defaults();

        Self {
            addr: lookup("ADDR").unwrap_or(defaults.addr),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            video_codec: lookup("VIDEO_CODEC")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.video_codec),
            audio_codec: lookup("AUDIO_CODEC")
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.audio_codec),
            fps: parsed::<f64, _>(&lookup, "FPS")
                .filter(|fps| fps.is_finite() && *fps > 0.0)
                .unwrap_or(defaults.fps),
            audio_bitrate_kbps: parsed(&lookup, "AUDIO_BITRATE_KBPS")
                .unwrap_or(defaults.audio_bitrate_kbps),
            max_concurrent_jobs: parsed::<usize, _>(&lookup, "MAX_CONCURRENT_JOBS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_jobs),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

fn parsed<T: FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_empty_environment_gives_defaults() {
        let c = config(&[]);
        assert_eq!(c, ServerConfig::defaults());
        assert_eq!(c.bind_address(), "0.0.0.0:8080");
        assert_eq!(c.video_codec, "libx264");
        assert_eq!(c.audio_codec, "aac");
    }

    #[test]
    fn test_values_are_read_from_environment() {
        let c = config(&[
            ("ADDR", "127.0.0.1"),
            ("PORT", "3000"),
            ("VIDEO_CODEC", "libx265"),
            ("FPS", "29.97"),
            ("AUDIO_BITRATE_KBPS", "192"),
            ("MAX_CONCURRENT_JOBS", "8"),
        ]);
        assert_eq!(c.bind_address(), "127.0.0.1:3000");
        assert_eq!(c.video_codec, "libx265");
        assert_eq!(c.fps, 29.97);
        assert_eq!(c.audio_bitrate_kbps, 192);
        assert_eq!(c.max_concurrent_jobs, 8);
    }

    #[test]
    fn test_invalid_numbers_fall_back() {
        let c = config(&[
            ("PORT", "http"),
            ("FPS", "-1"),
            ("MAX_CONCURRENT_JOBS", "0"),
            ("VIDEO_CODEC", ""),
        ]);
        let defaults = ServerConfig::defaults();
        assert_eq!(c.port, defaults.port);
        assert_eq!(c.fps, defaults.fps);
        assert_eq!(c.max_concurrent_jobs, defaults.max_concurrent_jobs);
        assert_eq!(c.video_codec, defaults.video_codec);
    }
}
