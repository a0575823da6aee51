use ffmpeg_next::util::log::{self, Level};
use otf_segments::adapters::ffmpeg::{self, FfmpegCodecRegistry};
use otf_segments::adapters::http::{self, AppState};
use otf_segments::application::TranscodeService;
use otf_segments::config::ServerConfig;
use otf_segments::SegmentAssembler;

#[tokio::main]
async fn main() {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt::init();

    // 1. libav* setup
    if let Err(e) = ffmpeg::init() {
        eprintln!("Failed to initialize ffmpeg: {:?}", e);
        std::process::exit(1);
    }
    log::set_level(Level::Error);

    // 2. Application Services
    let assembler = SegmentAssembler::new(FfmpegCodecRegistry::new());
    let service = TranscodeService::new(assembler, config.max_concurrent_jobs);
    tracing::info!(
        video_codec = %config.video_codec,
        audio_codec = %config.audio_codec,
        fps = config.fps,
        max_concurrent_jobs = config.max_concurrent_jobs,
        "segment service ready"
    );

    // 3. HTTP Layer
    let bind_address = config.bind_address();
    let app = http::router(AppState::new(service, config));

    // 4. Start Server
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .expect("Failed to bind TCP listener");
    tracing::info!("Listening at {}", bind_address);
    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
