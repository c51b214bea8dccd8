//! Per-camera streaming server: MJPEG multipart on `/stream`, single JPEG
//! on `/snapshot`, FLV on `/flv` (locally muxed, or proxied verbatim from
//! an announced upstream).
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::ConfigState;
use crate::flv;
use crate::frame_bus::FrameBus;
use crate::h264;
use crate::http;
use crate::venc::VencShared;
use log::{debug, info, warn};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const MJPEG_BOUNDARY: &str = "boundarydonotcross";
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const ACCEPT_POLL: Duration = Duration::from_millis(200);
/// Upstream FLV announcement lifetime without a refresh.
const PROXY_TTL: Duration = Duration::from_secs(60);
/// How long `/flv` waits for the first SPS/PPS before giving up entirely.
const PREAMBLE_WAIT: Duration = Duration::from_secs(30);

struct ProxyState {
    url: String,
    announced_at: Instant,
}

pub struct StreamServer {
    bus: Arc<FrameBus>,
    config: Arc<ConfigState>,
    venc: Arc<VencShared>,
    running: Arc<AtomicBool>,
    proxy: Mutex<Option<ProxyState>>,
    mjpeg_clients: AtomicUsize,
    flv_clients: AtomicUsize,
    proxy_clients: AtomicUsize,
}

impl StreamServer {
    pub fn new(
        bus: Arc<FrameBus>,
        config: Arc<ConfigState>,
        venc: Arc<VencShared>,
        running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            venc,
            running,
            proxy: Mutex::new(None),
            mjpeg_clients: AtomicUsize::new(0),
            flv_clients: AtomicUsize::new(0),
            proxy_clients: AtomicUsize::new(0),
        })
    }

    pub fn client_counts(&self) -> (usize, usize, usize) {
        (
            self.mjpeg_clients.load(Ordering::Relaxed),
            self.flv_clients.load(Ordering::Relaxed),
            self.proxy_clients.load(Ordering::Relaxed),
        )
    }

    /// Announce (or refresh) the upstream FLV URL; `/flv` proxies while the
    /// announcement is fresh.
    pub fn announce_proxy(&self, url: String) {
        info!("FLV proxy announced: {url}");
        *self.proxy.lock().unwrap() = Some(ProxyState {
            url,
            announced_at: Instant::now(),
        });
    }

    pub fn proxy_status(&self) -> serde_json::Value {
        let guard = self.proxy.lock().unwrap();
        match guard.as_ref() {
            Some(p) if p.announced_at.elapsed() < PROXY_TTL => serde_json::json!({
                "active": true,
                "url": p.url,
                "clients": self.proxy_clients.load(Ordering::Relaxed),
                "age_s": p.announced_at.elapsed().as_secs(),
            }),
            _ => serde_json::json!({ "active": false }),
        }
    }

    fn fresh_proxy_url(&self) -> Option<String> {
        let mut guard = self.proxy.lock().unwrap();
        match guard.as_ref() {
            Some(p) if p.announced_at.elapsed() < PROXY_TTL => Some(p.url.clone()),
            Some(_) => {
                // Expired announcement is discarded.
                *guard = None;
                None
            }
            None => None,
        }
    }

    /// Binds the streaming port and spawns the accept loop.
    pub fn start(self: &Arc<Self>, port: u16) -> io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        info!("streaming server on port {port}");
        let server = Arc::clone(self);
        thread::Builder::new()
            .name("stream-accept".into())
            .spawn(move || {
                while server.running.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            debug!("stream client {peer}");
                            let server = Arc::clone(&server);
                            let _ = thread::Builder::new()
                                .name("stream-conn".into())
                                .spawn(move || server.handle_connection(stream));
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(e) => {
                            warn!("stream accept failed: {e}");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
            })
            .expect("failed to spawn stream-accept thread");
        Ok(())
    }

    fn handle_connection(&self, mut stream: TcpStream) {
        let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
        let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
        let request = match http::read_request(&mut stream) {
            Ok(r) => r,
            Err(e) => {
                debug!("bad stream request: {e}");
                return;
            }
        };
        let result = match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/stream") => self.serve_mjpeg(&mut stream),
            ("HEAD", "/stream") => http::respond_head(
                &mut stream,
                200,
                &format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"),
                0,
            ),
            ("GET", "/snapshot") => self.serve_snapshot(&mut stream, false),
            ("HEAD", "/snapshot") => self.serve_snapshot(&mut stream, true),
            ("GET", "/flv") => self.serve_flv(&mut stream),
            _ => http::respond_error(&mut stream, 404, "not found"),
        };
        if let Err(e) = result {
            debug!("stream client gone: {e}");
        }
    }

    fn serve_snapshot(&self, stream: &mut TcpStream, head_only: bool) -> io::Result<()> {
        let mut jpeg = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if self.bus.jpeg.snapshot(&mut jpeg).is_some() {
                break;
            }
            if Instant::now() >= deadline {
                return http::respond_error(stream, 503, "no frame available");
            }
            thread::sleep(Duration::from_millis(50));
        }
        if head_only {
            http::respond_head(stream, 200, "image/jpeg", jpeg.len())
        } else {
            http::respond(stream, 200, "image/jpeg", &jpeg)
        }
    }

    /// multipart/x-mixed-replace loop: a part per fresh slot sequence.
    fn serve_mjpeg(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.mjpeg_clients.fetch_add(1, Ordering::Relaxed);
        let result = self.mjpeg_loop(stream);
        self.mjpeg_clients.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn mjpeg_loop(&self, stream: &mut TcpStream) -> io::Result<()> {
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n"
        )?;
        let mut jpeg = Vec::new();
        let mut last_seq = 0u64;
        while self.running.load(Ordering::Relaxed) {
            match self.bus.jpeg.snapshot(&mut jpeg) {
                Some((seq, _ts)) if seq != last_seq => {
                    last_seq = seq;
                    write!(
                        stream,
                        "\r\n--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                        jpeg.len()
                    )?;
                    stream.write_all(&jpeg)?;
                    stream.flush()?;
                }
                _ => thread::sleep(Duration::from_millis(10)),
            }
        }
        Ok(())
    }

    fn serve_flv(&self, stream: &mut TcpStream) -> io::Result<()> {
        if let Some(url) = self.fresh_proxy_url() {
            self.proxy_clients.fetch_add(1, Ordering::Relaxed);
            let result = proxy_flv(stream, &url, &self.running);
            self.proxy_clients.fetch_sub(1, Ordering::Relaxed);
            return result;
        }
        self.flv_clients.fetch_add(1, Ordering::Relaxed);
        let result = self.flv_loop(stream);
        self.flv_clients.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn flv_loop(&self, stream: &mut TcpStream) -> io::Result<()> {
        // Hold the connection until SPS/PPS exist; ask the encoder for a
        // keyframe if none is fresh.
        if !self.venc.idr_fresh(self.bus.now_ms()) {
            self.venc.request_keyframe();
        }
        let deadline = Instant::now() + PREAMBLE_WAIT;
        let (sps, pps) = loop {
            if let Some(pair) = self.venc.parameter_sets() {
                break pair;
            }
            if Instant::now() >= deadline || !self.running.load(Ordering::Relaxed) {
                return http::respond_error(stream, 503, "encoder not started");
            }
            thread::sleep(Duration::from_millis(100));
        };

        let cfg = self.config.get();
        let (width, height) = cfg.h264_resolution.dims();
        let fps = self.venc.fps().max(1);

        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: video/x-flv\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n"
        )?;
        stream.write_all(&flv::FLV_FILE_HEADER)?;
        stream.write_all(&flv::metadata_tag(width, height, fps, "printcam"))?;
        stream.write_all(&flv::sequence_header_tag(&sps, &pps))?;
        stream.flush()?;

        // Millisecond timestamps start at zero on connect and advance by
        // 1000/fps per access unit.
        let mut burst = Vec::new();
        let mut last_seq = 0u64;
        let mut tag_count: u64 = 0;
        while self.running.load(Ordering::Relaxed) {
            match self.bus.h264.snapshot(&mut burst) {
                Some((seq, _ts)) if seq != last_seq => {
                    last_seq = seq;
                    let nals = h264::split_annex_b(&burst);
                    let ts = (tag_count * 1000 / u64::from(fps)) as u32;
                    if let Some(tag) = flv::access_unit_tag(ts, &nals) {
                        stream.write_all(&tag)?;
                        stream.flush()?;
                        tag_count += 1;
                    }
                    // Oversized or parameter-only bursts are skipped; the
                    // connection stays up.
                }
                _ => thread::sleep(Duration::from_millis(5)),
            }
        }
        Ok(())
    }
}

/// `http://host[:port]/path` -> (host, port, path).
pub fn parse_http_url(url: &str) -> Option<(String, u16, String)> {
    let rest = url.strip_prefix("http://")?;
    let (authority, path) = match rest.split_once('/') {
        Some((a, p)) => (a, format!("/{p}")),
        None => (rest, "/".to_string()),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h.to_string(), p.parse().ok()?),
        None => (authority.to_string(), 80),
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port, path))
}

/// Streams the upstream FLV body verbatim.
fn proxy_flv(client: &mut TcpStream, url: &str, running: &AtomicBool) -> io::Result<()> {
    let Some((host, port, path)) = parse_http_url(url) else {
        return http::respond_error(client, 502, "bad upstream url");
    };
    let addr = (host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "upstream unresolvable"))?;
    let mut upstream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    upstream.set_read_timeout(Some(Duration::from_secs(10)))?;
    write!(
        upstream,
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    )?;

    // Skip upstream status line and headers, then relay the body bytes.
    let mut reader = BufReader::new(upstream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if !line.contains("200") {
        return http::respond_error(client, 502, "upstream refused");
    }
    loop {
        line.clear();
        reader.read_line(&mut line)?;
        if line.trim_end().is_empty() {
            break;
        }
    }

    write!(
        client,
        "HTTP/1.1 200 OK\r\nContent-Type: video/x-flv\r\nConnection: close\r\n\r\n"
    )?;
    let mut buf = [0u8; 16 * 1024];
    while running.load(Ordering::Relaxed) {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        client.write_all(&buf[..n])?;
    }
    client.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_parsing() {
        assert_eq!(
            parse_http_url("http://10.0.0.2:18088/flv"),
            Some(("10.0.0.2".to_string(), 18088, "/flv".to_string()))
        );
        assert_eq!(
            parse_http_url("http://cam.local/live/stream.flv"),
            Some(("cam.local".to_string(), 80, "/live/stream.flv".to_string()))
        );
        assert_eq!(
            parse_http_url("http://host"),
            Some(("host".to_string(), 80, "/".to_string()))
        );
        assert_eq!(parse_http_url("rtsp://host/x"), None);
        assert_eq!(parse_http_url("http:///x"), None);
    }

    #[test]
    fn flv_timestamps_advance_by_frame_period() {
        let fps = 25u64;
        let ts: Vec<u64> = (0..5).map(|n| n * 1000 / fps).collect();
        assert_eq!(ts, vec![0, 40, 80, 120, 160]);
    }
}
