use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vcap_streamer::config::AppConfig;
use vcap_streamer::stream::{Memsink, MemsinkConfig, SinkKind, Stream, StreamHandle};
use vcap_streamer::video::mock::MockDriver;
use vcap_streamer::video::{Device, JpegEncoderFactory};
use vcap_streamer::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// vcap-streamer command line arguments
#[derive(Parser, Debug)]
#[command(name = "vcap-streamer")]
#[command(version, about = "V4L2 capture to MJPEG and shared memory", long_about = None)]
struct CliArgs {
    /// JSON configuration file
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture device (overrides config)
    #[arg(short = 'd', long, value_name = "PATH")]
    device: Option<String>,

    /// Resolution as WIDTHxHEIGHT (overrides config)
    #[arg(short = 'r', long, value_name = "WxH")]
    resolution: Option<String>,

    /// Pixel format (overrides config)
    #[arg(short = 'm', long, value_name = "FORMAT")]
    format: Option<String>,

    /// Desired FPS, 0 for driver default (overrides config)
    #[arg(short = 'f', long)]
    fps: Option<u32>,

    /// JPEG quality (overrides config)
    #[arg(short = 'q', long)]
    quality: Option<u32>,

    /// Encoder workers, 0 for one per CPU (overrides config)
    #[arg(short = 'w', long)]
    workers: Option<usize>,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Disable the HTTP server
    #[arg(long)]
    no_http: bool,

    /// Shared memory object for JPEG frames, e.g. /vcap::jpeg
    #[arg(long, value_name = "NAME")]
    jpeg_sink: Option<String>,

    /// Shared memory object for raw frames
    #[arg(long, value_name = "NAME")]
    raw_sink: Option<String>,

    /// Capture from a generated test pattern instead of a device
    #[arg(long)]
    test_pattern: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting vcap-streamer v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    apply_cli_overrides(&mut config, &args)?;
    config.validate()?;

    let device_config = config.device_config()?;
    let stream_config = config.stream_config()?;
    tracing::info!(
        "Capture: {} {}x{} {} quality={}",
        device_config.path.display(),
        device_config.resolution.width,
        device_config.resolution.height,
        device_config.format,
        config.encoder.quality
    );

    let device = if args.test_pattern {
        let (driver, mock) = MockDriver::new();
        let fps = device_config.fps.max(1);
        mock.set_frame_interval(Duration::from_secs(1) / fps);
        tracing::info!("Using generated test pattern at {} fps", fps);
        Device::with_driver(device_config, Box::new(driver))
    } else {
        Device::new(device_config)
    };

    let factory = JpegEncoderFactory::shared(config.encoder.quality);
    let mut stream = Stream::new(stream_config, device, factory)?;

    for (kind, sink) in [
        (SinkKind::Raw, &config.sinks.raw),
        (SinkKind::Jpeg, &config.sinks.jpeg),
    ] {
        if let Some(sink) = sink {
            stream = stream.with_sink(Memsink::open_server(kind, sink.clone())?);
        }
    }
    if config.sinks.h264.is_some() {
        tracing::warn!("H264 sink configured but no H264 encoder is available, skipping");
    }

    let handle = stream.handle();
    let capture = std::thread::Builder::new()
        .name("stream".to_string())
        .spawn(move || stream.run())
        .context("Failed to spawn stream thread")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            tracing::info!("Shutdown signal received");
            handle.loop_break();
            shutdown.cancel();
        });
    }

    // The capture thread can also end by itself on a fatal device error
    let watcher = {
        let shutdown = shutdown.clone();
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            let result = capture.join();
            handle.loop_break();
            shutdown.cancel();
            result
        })
    };

    if config.http.enabled {
        serve_http(&config, handle.clone(), shutdown.clone()).await?;
    } else {
        shutdown.cancelled().await;
    }

    handle.loop_break();
    match watcher.await? {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!("Stream loop failed: {}", e);
            return Err(e.into());
        }
        Err(_) => anyhow::bail!("Stream thread panicked"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn serve_http(
    config: &AppConfig,
    handle: StreamHandle,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ip: IpAddr = config
        .http
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.http.bind_address))?;
    let addr = SocketAddr::new(ip, config.http.port);

    let app = web::create_router(web::WebState::new(handle));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn apply_cli_overrides(config: &mut AppConfig, args: &CliArgs) -> anyhow::Result<()> {
    if let Some(device) = &args.device {
        config.device.path = device.clone();
    }
    if let Some(resolution) = &args.resolution {
        let (width, height) = parse_resolution(resolution)
            .with_context(|| format!("Invalid resolution: {}", resolution))?;
        config.device.width = width;
        config.device.height = height;
    }
    if let Some(format) = &args.format {
        config.device.format = format.clone();
    }
    if let Some(fps) = args.fps {
        config.device.fps = fps;
    }
    if let Some(quality) = args.quality {
        config.encoder.quality = quality;
    }
    if let Some(workers) = args.workers {
        config.encoder.workers = workers;
    }
    if let Some(address) = &args.address {
        config.http.bind_address = address.clone();
    }
    if let Some(port) = args.http_port {
        config.http.port = port;
    }
    if args.no_http {
        config.http.enabled = false;
    }
    if let Some(object) = &args.jpeg_sink {
        config.sinks.jpeg = Some(sink_config(object, config.sinks.jpeg.take()));
    }
    if let Some(object) = &args.raw_sink {
        config.sinks.raw = Some(sink_config(object, config.sinks.raw.take()));
    }
    Ok(())
}

fn sink_config(object: &str, existing: Option<MemsinkConfig>) -> MemsinkConfig {
    MemsinkConfig {
        object: object.to_string(),
        ..existing.unwrap_or_default()
    }
}

fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (width, height) = s.split_once(['x', 'X'])?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "vcap_streamer=error,tower_http=error",
        LogLevel::Warn => "vcap_streamer=warn,tower_http=warn",
        LogLevel::Info => "vcap_streamer=info,tower_http=info",
        LogLevel::Verbose => "vcap_streamer=debug,tower_http=info",
        LogLevel::Debug => "vcap_streamer=debug,tower_http=debug",
        LogLevel::Trace => "vcap_streamer=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
