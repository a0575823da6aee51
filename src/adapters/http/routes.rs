//! Path parameter parsing for the segment routes.

use crate::domain::jobs::{ContainerFormat, MAX_WINDOW_END};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::Regex;

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Invalid request")]
    NotRouted,
    #[error("source locator is not valid base64: {0}")]
    Locator(#[from] base64::DecodeError),
    #[error("source locator is not valid UTF-8")]
    LocatorEncoding,
    #[error("source locator is empty")]
    EmptyLocator,
    #[error("invalid bitrate {0:?}")]
    Bitrate(String),
    #[error("invalid geometry {0:?}, expected WIDTHxHEIGHT")]
    Geometry(String),
    #[error("invalid window {0:?}, expected START:DURATION")]
    Window(String),
    #[error("unsupported segment name {0:?}")]
    SegmentName(String),
    #[error("route pattern failed to compile: {0}")]
    Pattern(#[from] regex::Error),
}

impl RouteError {
    pub fn status(&self) -> StatusCode {
        match self {
            RouteError::Pattern(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        tracing::warn!(error = %self, "rejected request");
        (self.status(), self.to_string()).into_response()
    }
}

/// Decode the URL-safe base64 source locator. Padding is optional.
pub fn decode_locator(raw: &str) -> Result<String, RouteError> {
    let bytes = URL_SAFE_NO_PAD.decode(raw.trim_end_matches('='))?;
    let url = String::from_utf8(bytes).map_err(|_| RouteError::LocatorEncoding)?;
    if url.trim().is_empty() {
        return Err(RouteError::EmptyLocator);
    }
    Ok(url)
}

/// Bitrate in kbps, strictly positive.
pub fn parse_bitrate(raw: &str) -> Result<u32, RouteError> {
    match raw.parse::<u32>() {
        Ok(kbps) if kbps > 0 => Ok(kbps),
        _ => Err(RouteError::Bitrate(raw.to_string())),
    }
}

/// `640x360` into `(640, 360)`.
pub fn parse_geometry(raw: &str) -> Result<(u32, u32), RouteError> {
    let re = Regex::new(r"^(\d{1,5})x(\d{1,5})$")?;
    let invalid = || RouteError::Geometry(raw.to_string());

    let caps = re.captures(raw).ok_or_else(invalid)?;
    let width: u32 = caps[1].parse().map_err(|_| invalid())?;
    let height: u32 = caps[2].parse().map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// `3.3:5.8` into `(start, duration)` seconds. The duration must be positive.
pub fn parse_window(raw: &str) -> Result<(f64, f64), RouteError> {
    let re = Regex::new(r"^(\d+(?:\.\d+)?):(\d+(?:\.\d+)?)$")?;
    let invalid = || RouteError::Window(raw.to_string());

    let caps = re.captures(raw).ok_or_else(invalid)?;
    let start: f64 = caps[1].parse().map_err(|_| invalid())?;
    let duration: f64 = caps[2].parse().map_err(|_| invalid())?;
    if duration <= 0.0 || !(start + duration <= MAX_WINDOW_END) {
        return Err(invalid());
    }
    Ok((start, duration))
}

/// `segment.ts` or `segment.mp4` into the container to produce.
pub fn parse_segment_name(raw: &str) -> Result<ContainerFormat, RouteError> {
    let re = Regex::new(r"^segment\.([a-z0-9]+)$")?;
    re.captures(raw)
        .and_then(|caps| ContainerFormat::from_extension(&caps[1]))
        .ok_or_else(|| RouteError::SegmentName(raw.to_string()))
}
