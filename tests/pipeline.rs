//! End-to-end runs of the capture pipeline against the mock driver

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use vcap_streamer::error::DeviceError;
use vcap_streamer::stream::{
    Memsink, MemsinkClient, MemsinkConfig, SinkKind, Stream, StreamConfig, StreamHandle,
    StreamState,
};
use vcap_streamer::video::mock::{Idle, MockDriver, MockHandle, MockStep};
use vcap_streamer::video::{Device, DeviceConfig, JpegEncoderFactory, Resolution};
use vcap_streamer::{web, AppError};

fn device_config() -> DeviceConfig {
    DeviceConfig {
        resolution: Resolution::new(160, 120),
        timeout: Duration::from_millis(50),
        ..Default::default()
    }
}

fn stream_config() -> StreamConfig {
    StreamConfig {
        workers: 2,
        error_delay: Duration::from_millis(50),
        offline_threshold: Duration::from_millis(50),
        blank_interval: Duration::from_millis(200),
        ..Default::default()
    }
}

fn build(config: StreamConfig, device: DeviceConfig) -> (Stream, MockHandle) {
    let (driver, mock) = MockDriver::new();
    let device = Device::with_driver(device, Box::new(driver));
    let stream = Stream::new(config, device, JpegEncoderFactory::shared(80)).unwrap();
    (stream, mock)
}

fn spawn(mut stream: Stream) -> (StreamHandle, JoinHandle<Result<(), AppError>>) {
    let handle = stream.handle();
    (handle, std::thread::spawn(move || stream.run()))
}

fn wait_for(what: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if what() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn sink_object(kind: &str) -> String {
    format!("/vcap-test-{}-{}", kind, uuid::Uuid::new_v4().simple())
}

#[test]
fn captured_fps_follows_the_device_rate() {
    let (stream, mock) = build(stream_config(), device_config());
    mock.set_frame_interval(Duration::from_millis(20));
    let (handle, thread) = spawn(stream);

    // Two full windows so the published value covers a complete second
    std::thread::sleep(Duration::from_millis(2200));
    let fps = handle.captured_fps();
    assert!((20..=55).contains(&fps), "captured fps {}", fps);

    handle.loop_break();
    thread.join().unwrap().unwrap();
    assert_eq!(handle.captured_fps(), 0);
}

#[test]
fn blank_frames_follow_the_throttle() {
    let device = DeviceConfig {
        persistent: true,
        ..device_config()
    };
    let (stream, mock) = build(stream_config(), device);
    mock.set_idle(Idle::Timeout);
    let (handle, thread) = spawn(stream);
    let ring = handle.ring();

    assert!(wait_for(|| ring.published() >= 1));
    let first = Instant::now();
    let start = ring.published();
    std::thread::sleep(Duration::from_millis(1000));
    let served = ring.published() - start;
    let elapsed = first.elapsed();

    // One blank frame per 200 ms at most
    let limit = (elapsed.as_millis() / 200) as u64 + 1;
    assert!(served >= 2 && served <= limit, "{} blank frames in {:?}", served, elapsed);
    assert!(ring.latest().is_some_and(|f| !f.online && f.is_valid_jpeg()));
    assert_eq!(handle.state(), StreamState::NoSignal);

    handle.loop_break();
    thread.join().unwrap().unwrap();
}

#[test]
fn double_release_is_rejected() {
    let (driver, mock) = MockDriver::new();
    let mut device = Device::with_driver(device_config(), Box::new(driver));
    device.open().unwrap();
    mock.push([MockStep::Frame]);

    let buffer = device.grab_buffer().unwrap();
    device.release_buffer(&buffer).unwrap();
    assert!(matches!(
        device.release_buffer(&buffer),
        Err(DeviceError::NotGrabbed { .. })
    ));
    device.close();
}

#[test]
fn jpeg_sink_client_reads_frames() {
    let object = sink_object("jpeg");
    let sink = Memsink::open_server(
        SinkKind::Jpeg,
        MemsinkConfig {
            object: object.clone(),
            remove: true,
            ..Default::default()
        },
    )
    .unwrap();

    let (stream, mock) = build(stream_config(), device_config());
    mock.set_frame_interval(Duration::from_millis(10));
    let (handle, thread) = spawn(stream.with_sink(sink));

    let mut client = MemsinkClient::open(&object, Duration::from_millis(500)).unwrap();
    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.len() < 3 && Instant::now() < deadline {
        match client.get(false) {
            Ok(Some(frame)) => received.push(frame),
            _ => std::thread::sleep(Duration::from_millis(5)),
        }
    }
    assert!(received.len() >= 3);
    assert!(received.windows(2).all(|w| w[1].id > w[0].id));
    let frame = &received[0];
    assert_eq!(frame.resolution, Resolution::new(160, 120));
    assert!(frame.online);
    assert_eq!(&frame.data[..2], &[0xff, 0xd8]);
    assert!(wait_for(|| handle.has_clients()));

    handle.loop_break();
    thread.join().unwrap().unwrap();
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> Vec<u8> {
    let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    );
    socket.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    socket.read_to_end(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn http_snapshot_and_state() {
    let (stream, mock) = build(stream_config(), device_config());
    mock.set_frame_interval(Duration::from_millis(10));
    let (handle, thread) = spawn(stream);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = web::create_router(web::WebState::new(handle.clone()));
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let deadline = Instant::now() + Duration::from_secs(5);
    while !handle.is_online() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Nobody is watching yet, so nothing was encoded
    assert_eq!(handle.ring().published(), 0);

    let snapshot = http_get(addr, "/snapshot").await;
    let text = String::from_utf8_lossy(&snapshot);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.to_lowercase().contains("content-type: image/jpeg"));
    assert!(handle.ring().published() >= 1);

    let state = http_get(addr, "/state").await;
    let text = String::from_utf8_lossy(&state);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.contains("\"state\":\"streaming\""));
    assert!(text.contains("\"http_clients\":0"));

    server.abort();
    handle.loop_break();
    tokio::task::spawn_blocking(move || thread.join().unwrap().unwrap())
        .await
        .unwrap();
}

/// Read a `/stream` response until `parts` JPEG parts arrived
async fn read_mjpeg_parts(addr: std::net::SocketAddr, parts: usize) -> Vec<u8> {
    let mut socket = tokio::net::TcpStream::connect(addr).await.unwrap();
    socket
        .write_all(b"GET /stream HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut received = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    while count_parts(&received) < parts {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&chunk[..n]);
    }
    received
}

fn count_parts(data: &[u8]) -> usize {
    data.windows(9).filter(|w| w == b"--frame\r\n").count()
}

#[tokio::test]
async fn http_mjpeg_clients_are_counted() {
    let (stream, mock) = build(stream_config(), device_config());
    mock.set_frame_interval(Duration::from_millis(10));
    let (handle, thread) = spawn(stream);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = web::WebState::new(handle.clone());
    let clients = state.clients.clone();
    let app = web::create_router(state);
    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let readers = futures::future::join_all((0..2).map(|_| read_mjpeg_parts(addr, 3))).await;
    for body in &readers {
        let text = String::from_utf8_lossy(body);
        assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
        assert!(count_parts(body) >= 3);
    }

    // Both bodies are dropped once the sockets close
    let deadline = Instant::now() + Duration::from_secs(5);
    while (handle.http_clients() > 0 || clients.count() > 0) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handle.http_clients(), 0);
    assert_eq!(clients.count(), 0);

    server.abort();
    handle.loop_break();
    tokio::task::spawn_blocking(move || thread.join().unwrap().unwrap())
        .await
        .unwrap();
}
