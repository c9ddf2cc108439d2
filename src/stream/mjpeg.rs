//! MJPEG over HTTP, one axum server per camera
//!
//! Each server runs on its own thread with a current-thread runtime. A single
//! encoder task turns the freshest stream frame into a multipart part every
//! push interval and publishes it on a watch channel; every viewer of
//! `GET /<camera>` forwards the latest part into its response body, so a slow
//! viewer skips frames instead of queueing them.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::{BufMut, Bytes, BytesMut};
use image::imageops::{self, FilterType};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::capture::frame::encode_jpeg;
use crate::error::StreamError;
use crate::events::{Component, EventSender, PipelineEvent};
use crate::pipeline::CameraSlots;
use crate::utils::{StopFlag, Worker, DEFAULT_JOIN_TIMEOUT};
use crate::StreamingConfig;

/// Multipart boundary parameter; each part is delimited by `--` + boundary
pub const BOUNDARY: &str = "--frameboundary";

const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=--frameboundary";

/// How often the shutdown signal re-checks the stop flag
const STOP_POLL: Duration = Duration::from_millis(10);
/// Grace period for open responses to end after a stop
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// One multipart part carrying a JPEG
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(128 + jpeg.len());
    buf.put_slice(b"--");
    buf.put_slice(BOUNDARY.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n");
    buf.put_slice(format!("Content-Length: {}\r\n", jpeg.len()).as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Serves the latest frame of one camera to any number of viewers
pub struct StreamServer {
    camera: String,
    port: u16,
    slots: Arc<CameraSlots>,
    config: StreamingConfig,
    events: EventSender,
    clients: Arc<AtomicUsize>,
    local_addr: Option<SocketAddr>,
    worker: Option<Worker>,
}

impl StreamServer {
    pub fn new(camera: &str, port: u16, slots: Arc<CameraSlots>, config: StreamingConfig, events: EventSender) -> Self {
        Self {
            camera: camera.to_string(),
            port,
            slots,
            config,
            events,
            clients: Arc::new(AtomicUsize::new(0)),
            local_addr: None,
            worker: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Bound address while streaming
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    #[instrument(skip(self), fields(camera = %self.camera, port = self.port))]
    pub fn start_streaming(&mut self) -> Result<SocketAddr, StreamError> {
        if self.is_streaming() {
            return Err(StreamError::AlreadyStreaming(self.port));
        }
        if let Some(mut stale) = self.worker.take() {
            stale.stop(DEFAULT_JOIN_TIMEOUT);
        }

        // Bound here so a taken port is reported to the caller
        let port = self.port;
        let listener = TcpListener::bind((self.config.bind_address.as_str(), port))
            .map_err(|source| StreamError::PortBindFailed { port, source })?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let (parts_tx, parts) = watch::channel(None);
        let viewers = ViewerState {
            camera: Arc::from(self.camera.as_str()),
            parts,
            events: self.events.clone(),
            clients: self.clients.clone(),
            write_timeout: Duration::from_millis(self.config.write_timeout_ms.max(1)),
        };
        let encoder = PartEncoder {
            slots: self.slots.clone(),
            target: (self.config.width, self.config.height),
            quality: self.config.jpeg_quality,
            cached: None,
        };
        let push_interval = Duration::from_millis(self.config.push_interval_ms.max(1));
        self.worker = Some(Worker::spawn(format!("stream-{}", self.camera), move |stop| {
            serve(listener, viewers, encoder, parts_tx, push_interval, stop)
        })?);
        self.local_addr = Some(addr);

        info!(%addr, "Streaming started");
        self.events.publish(PipelineEvent::StreamingStarted {
            camera: self.camera.clone(),
            addr,
        });
        Ok(addr)
    }

    /// Disconnect every client and close the listener. Idempotent.
    pub fn stop_streaming(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        worker.stop(DEFAULT_JOIN_TIMEOUT);
        self.local_addr = None;
        info!(camera = %self.camera, "Streaming stopped");
        self.events.publish(PipelineEvent::StreamingStopped {
            camera: self.camera.clone(),
        });
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

/// Shared by every request handler of one server
#[derive(Clone)]
struct ViewerState {
    camera: Arc<str>,
    parts: watch::Receiver<Option<Bytes>>,
    events: EventSender,
    clients: Arc<AtomicUsize>,
    write_timeout: Duration,
}

impl ViewerState {
    fn fail(&self, message: String) {
        error!(camera = %self.camera, %message, "Stream server failed");
        self.events.publish(PipelineEvent::StreamingFailed {
            camera: self.camera.to_string(),
            message: message.clone(),
        });
        self.events.error(Component::Streamer, format!("{}: {message}", self.camera));
    }
}

/// Counts a viewer from admission until its response ends
struct ViewerGuard {
    state: ViewerState,
    peer: SocketAddr,
}

impl ViewerGuard {
    fn admit(state: &ViewerState, peer: SocketAddr) -> Self {
        let count = state.clients.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("chersonesos_stream_clients", "camera" => state.camera.to_string()).set(count as f64);
        info!(camera = %state.camera, %peer, "Viewer connected");
        state.events.publish(PipelineEvent::ClientConnected {
            camera: state.camera.to_string(),
            peer,
        });
        Self {
            state: state.clone(),
            peer,
        }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        let count = self.state.clients.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!("chersonesos_stream_clients", "camera" => self.state.camera.to_string()).set(count as f64);
        debug!(camera = %self.state.camera, peer = %self.peer, "Viewer disconnected");
        self.state.events.publish(PipelineEvent::ClientDisconnected {
            camera: self.state.camera.to_string(),
            peer: self.peer,
        });
    }
}

/// Thread body: run the HTTP server and the encoder until stopped
fn serve(
    listener: TcpListener,
    viewers: ViewerState,
    encoder: PartEncoder,
    parts_tx: watch::Sender<Option<Bytes>>,
    push_interval: Duration,
    stop: StopFlag,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            viewers.fail(format!("runtime: {e}"));
            return;
        }
    };

    runtime.block_on(async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                viewers.fail(e.to_string());
                return;
            }
        };
        let app = Router::new()
            .route("/:camera", get(watch_camera))
            .with_state(viewers.clone())
            .into_make_service_with_connect_info::<SocketAddr>();
        let shutdown = stopped(stop.clone());
        let mut server =
            tokio::spawn(async move { axum::serve(listener, app).with_graceful_shutdown(shutdown).await });

        tokio::select! {
            () = push_frames(encoder, parts_tx, push_interval, stop, viewers.clients.clone()) => {}
            finished = &mut server => {
                let message = match finished {
                    Ok(Ok(())) => "listener closed".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => e.to_string(),
                };
                viewers.fail(message);
                return;
            }
        }

        // The part sender is gone, so every open response ends on its own
        if time::timeout(DRAIN_TIMEOUT, server).await.is_err() {
            debug!(camera = %viewers.camera, "Viewers still attached, closing");
        }
    });
    // Dropping the runtime cancels whatever is left and closes those sockets
}

async fn stopped(stop: StopFlag) {
    while !stop.is_set() {
        time::sleep(STOP_POLL).await;
    }
}

/// `GET /<camera>`: admit the viewer if it names this server's camera
async fn watch_camera(
    State(state): State<ViewerState>,
    Path(camera): Path<String>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if camera != *state.camera {
        debug!(%peer, requested = %camera, "Unknown stream requested");
        return StatusCode::NOT_FOUND.into_response();
    }

    let guard = ViewerGuard::admit(&state, peer);
    let (tx, mut rx) = mpsc::channel::<Bytes>(1);
    tokio::spawn(forward_parts(state.parts.clone(), tx, state.write_timeout, guard));

    let body = async_stream::stream! {
        while let Some(part) = rx.recv().await {
            yield Ok::<Bytes, io::Error>(part);
        }
    };
    (
        [
            (header::CONTENT_TYPE, STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

/// Hand each new part to one viewer's body. A viewer that has not taken the
/// previous part within `write_timeout` is dropped.
async fn forward_parts(
    mut parts: watch::Receiver<Option<Bytes>>,
    tx: mpsc::Sender<Bytes>,
    write_timeout: Duration,
    guard: ViewerGuard,
) {
    parts.mark_changed();
    loop {
        tokio::select! {
            () = tx.closed() => break,
            changed = parts.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        let Some(part) = parts.borrow_and_update().clone() else {
            continue;
        };
        match time::timeout(write_timeout, tx.send(part)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                debug!(peer = %guard.peer, "Viewer stalled, dropping");
                break;
            }
        }
    }
    drop(guard);
}

/// Publish the current part every `interval` while anyone is watching
async fn push_frames(
    mut encoder: PartEncoder,
    parts: watch::Sender<Option<Bytes>>,
    interval: Duration,
    stop: StopFlag,
    clients: Arc<AtomicUsize>,
) {
    let mut tick = time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while !stop.is_set() {
        tick.tick().await;
        if clients.load(Ordering::Relaxed) == 0 {
            continue;
        }
        if let Some(part) = encoder.current_part() {
            parts.send_replace(Some(part));
        }
    }
}

/// Scales and encodes the stream slot, once per captured frame
struct PartEncoder {
    slots: Arc<CameraSlots>,
    target: (u32, u32),
    quality: u8,
    /// Sequence and encoded part of the last pushed frame
    cached: Option<(u64, Bytes)>,
}

impl PartEncoder {
    fn current_part(&mut self) -> Option<Bytes> {
        let frame = self.slots.stream.read()?;
        let sequence = frame.meta.sequence;
        if let Some((cached_seq, part)) = &self.cached {
            if *cached_seq == sequence {
                return Some(part.clone());
            }
        }

        let started = Instant::now();
        let (w, h) = self.target;
        let encoded = if frame.dimensions() == (w, h) || w == 0 || h == 0 {
            encode_jpeg(&frame.image, self.quality)
        } else {
            encode_jpeg(&imageops::resize(&*frame.image, w, h, FilterType::Triangle), self.quality)
        };
        let jpeg = match encoded {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!(error = %e, "Stream encode failed, skipping frame");
                return None;
            }
        };
        metrics::histogram!("chersonesos_stream_encode_seconds").record(started.elapsed().as_secs_f64());

        let part = mjpeg_part(&jpeg);
        self.cached = Some((sequence, part.clone()));
        Some(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::test_frame;
    use crate::events;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn config() -> StreamingConfig {
        StreamingConfig {
            bind_address: "127.0.0.1".into(),
            width: 32,
            height: 24,
            push_interval_ms: 20,
            ..StreamingConfig::default()
        }
    }

    fn server(slots: Arc<CameraSlots>) -> (StreamServer, flume::Receiver<PipelineEvent>) {
        let (tx, rx) = events::channel(64);
        (StreamServer::new("LCamera", 0, slots, config(), tx), rx)
    }

    fn connect(addr: SocketAddr, path: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        let request = format!("GET {path} HTTP/1.0\r\nHost: rov\r\n\r\n");
        stream.write_all(request.as_bytes()).unwrap();
        stream
    }

    /// Read until `needle` shows up, returning its position
    fn read_until(stream: &mut TcpStream, buf: &mut Vec<u8>, needle: &[u8]) -> usize {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = buf.windows(needle.len()).position(|w| w == needle) {
                return pos;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_part_framing() {
        let part = mjpeg_part(b"abc");
        assert_eq!(
            &part[..],
            b"----frameboundary\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\nabc\r\n"
        );
        assert!(STREAM_CONTENT_TYPE.ends_with(&format!("boundary={BOUNDARY}")));
    }

    #[test]
    fn test_viewer_receives_scaled_jpeg() {
        let slots = Arc::new(CameraSlots::new(3));
        slots.publish(test_frame(1, 64, 48));
        let (mut server, rx) = server(slots);
        let addr = server.start_streaming().unwrap();

        let mut stream = connect(addr, "/LCamera");
        let mut buf = Vec::new();
        let head_end = read_until(&mut stream, &mut buf, b"\r\n\r\n");
        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
        assert!(head.starts_with("HTTP/1.0 200 OK"), "{head}");
        assert!(head.contains("multipart/x-mixed-replace; boundary=--frameboundary"));

        buf.drain(..head_end + 4);
        read_until(&mut stream, &mut buf, b"----frameboundary\r\n");
        let headers_end = read_until(&mut stream, &mut buf, b"\r\n\r\n");
        let headers = String::from_utf8_lossy(&buf[..headers_end]).to_string();
        let length: usize = headers
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let body_start = headers_end + 4;
        let mut chunk = [0u8; 4096];
        while buf.len() < body_start + length {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0);
            buf.extend_from_slice(&chunk[..n]);
        }
        let jpeg = image::load_from_memory(&buf[body_start..body_start + length]).unwrap();
        assert_eq!((jpeg.width(), jpeg.height()), (32, 24));

        server.stop_streaming();
        let events: Vec<_> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::ClientConnected { .. })));
        assert!(events.iter().any(|e| matches!(e, PipelineEvent::ClientDisconnected { .. })));
        assert!(matches!(events.last(), Some(PipelineEvent::StreamingStopped { .. })));
    }

    #[test]
    fn test_unknown_paths_get_404() {
        let slots = Arc::new(CameraSlots::new(3));
        let (mut server, _rx) = server(slots);
        let addr = server.start_streaming().unwrap();

        for path in ["/RCamera", "/", "/LCamera/extra"] {
            let mut stream = connect(addr, path);
            let mut response = Vec::new();
            let _ = stream.read_to_end(&mut response);
            assert!(response.starts_with(b"HTTP/1.0 404 Not Found"), "{path}");
        }
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_port_in_use() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let (tx, _rx) = events::channel(8);
        let mut server = StreamServer::new("LCamera", port, Arc::new(CameraSlots::new(3)), config(), tx);
        assert!(matches!(
            server.start_streaming(),
            Err(StreamError::PortBindFailed { port: p, .. }) if p == port
        ));
        assert!(!server.is_streaming());
    }

    #[test]
    fn test_stop_disconnects_viewers() {
        let slots = Arc::new(CameraSlots::new(3));
        slots.publish(test_frame(1, 32, 24));
        let (mut server, _rx) = server(slots);
        let addr = server.start_streaming().unwrap();
        assert!(matches!(server.start_streaming(), Err(StreamError::AlreadyStreaming(_))));

        let mut stream = connect(addr, "/LCamera");
        let mut buf = Vec::new();
        read_until(&mut stream, &mut buf, b"\r\n\r\n");
        assert_eq!(server.client_count(), 1);

        server.stop_streaming();
        let mut rest = Vec::new();
        // the response ended, so the read reaches EOF
        let _ = stream.read_to_end(&mut rest);
        assert_eq!(server.client_count(), 0);
        assert!(TcpStream::connect(addr).is_err());
    }
}
