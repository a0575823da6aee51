//! HTTP inbound adapter.
//!
//! Every route names a source (base64 URL-safe locator), a media kind and a
//! rendition, and answers with the muxed bytes produced for that request.
//! Transcode failures still answer `200` with an empty body; only malformed
//! paths are rejected with `400`.

mod routes;

pub use routes::RouteError;

use crate::application::TranscodeService;
use crate::config::ServerConfig;
use crate::domain::jobs::{ContainerFormat, Job, MediaKind, NO_WINDOW};
use crate::ports::SegmentProducer;
use axum::extract::{Path, State};
use axum::http::{header, Method};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub struct AppState<P> {
    service: TranscodeService<P>,
    config: Arc<ServerConfig>,
}

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            config: self.config.clone(),
        }
    }
}

impl<P> AppState<P>
where
    P: SegmentProducer + 'static,
{
    pub fn new(service: TranscodeService<P>, config: ServerConfig) -> Self {
        Self {
            service,
            config: Arc::new(config),
        }
    }

    /// Job skeleton carrying the server-wide encoder settings.
    fn job(&self, url: String, media: MediaKind, format: ContainerFormat) -> Job {
        Job {
            url,
            bitrate: 0,
            audio_bitrate: self.config.audio_bitrate_kbps,
            width: 0,
            height: 0,
            fps: self.config.fps,
            start: NO_WINDOW,
            duration: NO_WINDOW,
            media,
            format,
            video_codec: self.config.video_codec.clone(),
            audio_codec: self.config.audio_codec.clone(),
        }
    }

    async fn serve(&self, job: Job) -> Response {
        let content_type = job.content_type();
        tracing::info!(
            url = %job.url,
            media = %job.media,
            format = job.file_extension(),
            start = job.start,
            duration = job.duration,
            "serving {}",
            if job.is_init() { "init segment" } else { "segment" }
        );

        let body = if job.is_init() {
            self.service.init_segment(job).await
        } else {
            self.service.segment(job).await
        };

        ([(header::CONTENT_TYPE, content_type)], body).into_response()
    }
}

/// Build the segment router over `state`.
pub fn router<P>(state: AppState<P>) -> Router
where
    P: SegmentProducer + 'static,
{
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::RANGE]);

    Router::new()
        .route("/health", get(health))
        .route(
            "/:locator/combined/:bitrate/:geometry/:window/:name",
            get(combined_segment::<P>),
        )
        .route("/:locator/video/:bitrate/:geometry/init.mp4", get(video_init::<P>))
        .route(
            "/:locator/video/:bitrate/:geometry/:window/:name",
            get(video_segment::<P>),
        )
        .route("/:locator/audio/:bitrate/init.mp4", get(audio_init::<P>))
        .route("/:locator/audio/:bitrate/:window/:name", get(audio_segment::<P>))
        .fallback(not_routed)
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn not_routed() -> RouteError {
    RouteError::NotRouted
}

async fn combined_segment<P: SegmentProducer + 'static>(
    State(state): State<AppState<P>>,
    Path((locator, bitrate, geometry, window, name)): Path<(String, String, String, String, String)>,
) -> Result<Response, RouteError> {
    let format = routes::parse_segment_name(&name)?;
    let (width, height) = routes::parse_geometry(&geometry)?;
    let (start, duration) = routes::parse_window(&window)?;

    let mut job = state.job(routes::decode_locator(&locator)?, MediaKind::Combined, format);
    job.bitrate = routes::parse_bitrate(&bitrate)?;
    job.width = width;
    job.height = height;
    job.start = start;
    job.duration = duration;

    Ok(state.serve(job).await)
}

async fn video_init<P: SegmentProducer + 'static>(
    State(state): State<AppState<P>>,
    Path((locator, bitrate, geometry)): Path<(String, String, String)>,
) -> Result<Response, RouteError> {
    let (width, height) = routes::parse_geometry(&geometry)?;

    let mut job = state.job(
        routes::decode_locator(&locator)?,
        MediaKind::Video,
        ContainerFormat::FragmentedMp4,
    );
    job.bitrate = routes::parse_bitrate(&bitrate)?;
    job.width = width;
    job.height = height;

    Ok(state.serve(job).await)
}

async fn video_segment<P: SegmentProducer + 'static>(
    State(state): State<AppState<P>>,
    Path((locator, bitrate, geometry, window, name)): Path<(String, String, String, String, String)>,
) -> Result<Response, RouteError> {
    let format = mp4_only(&name)?;
    let (width, height) = routes::parse_geometry(&geometry)?;
    let (start, duration) = routes::parse_window(&window)?;

    let mut job = state.job(routes::decode_locator(&locator)?, MediaKind::Video, format);
    job.bitrate = routes::parse_bitrate(&bitrate)?;
    job.width = width;
    job.height = height;
    job.start = start;
    job.duration = duration;

    Ok(state.serve(job).await)
}

async fn audio_init<P: SegmentProducer + 'static>(
    State(state): State<AppState<P>>,
    Path((locator, bitrate)): Path<(String, String)>,
) -> Result<Response, RouteError> {
    let mut job = state.job(
        routes::decode_locator(&locator)?,
        MediaKind::Audio,
        ContainerFormat::FragmentedMp4,
    );
    job.audio_bitrate = routes::parse_bitrate(&bitrate)?;

    Ok(state.serve(job).await)
}

async fn audio_segment<P: SegmentProducer + 'static>(
    State(state): State<AppState<P>>,
    Path((locator, bitrate, window, name)): Path<(String, String, String, String)>,
) -> Result<Response, RouteError> {
    let format = mp4_only(&name)?;
    let (start, duration) = routes::parse_window(&window)?;

    let mut job = state.job(routes::decode_locator(&locator)?, MediaKind::Audio, format);
    job.audio_bitrate = routes::parse_bitrate(&bitrate)?;
    job.start = start;
    job.duration = duration;

    Ok(state.serve(job).await)
}

// Single-kind segments are only served as fragmented MP4.
fn mp4_only(name: &str) -> Result<ContainerFormat, RouteError> {
    match routes::parse_segment_name(name)? {
        ContainerFormat::FragmentedMp4 => Ok(ContainerFormat::FragmentedMp4),
        ContainerFormat::MpegTs => Err(RouteError::SegmentName(name.to_string())),
    }
}
