//! Moonraker webcam provisioning: pushes one webcam entry per enabled
//! camera over moonraker's HTTP API and tracks the upstream connection
//! state. The print-event WebSocket itself lives outside this process.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::camera::CameraDescriptor;
use log::{debug, info, warn};
use serde_json::json;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal HTTP exchange against moonraker. Returns (status, body).
fn http_request(
    host: &str,
    method: &str,
    path: &str,
    body: Option<&serde_json::Value>,
) -> io::Result<(u16, Vec<u8>)> {
    let addr = host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unresolvable host"))?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    let payload = body.map(|v| v.to_string()).unwrap_or_default();
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{payload}",
        payload.len()
    )?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let text = String::from_utf8_lossy(&raw);
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body_start = text.find("\r\n\r\n").map(|i| i + 4).unwrap_or(raw.len());
    Ok((status, raw[body_start.min(raw.len())..].to_vec()))
}

pub struct MoonrakerClient {
    /// host:port, empty disables provisioning.
    host: Mutex<String>,
    last_push: Mutex<Option<(Instant, bool)>>,
}

impl MoonrakerClient {
    pub fn new(host: String) -> Self {
        Self {
            host: Mutex::new(host),
            last_push: Mutex::new(None),
        }
    }

    pub fn set_host(&self, host: String) {
        *self.host.lock().unwrap() = host;
    }

    pub fn host(&self) -> String {
        self.host.lock().unwrap().clone()
    }

    pub fn reachable(&self) -> bool {
        let host = self.host();
        if host.is_empty() {
            return false;
        }
        matches!(http_request(&host, "GET", "/server/info", None), Ok((200, _)))
    }

    /// Pushes (replaces) one webcam entry per enabled camera, addressed by
    /// the local IP clients should stream from. Re-run on IP change.
    pub fn provision_cameras(&self, local_ip: &str, cameras: &[CameraDescriptor]) -> bool {
        let host = self.host();
        if host.is_empty() {
            return false;
        }
        let mut all_ok = true;
        for cam in cameras.iter().filter(|c| c.enabled) {
            let name = format!("printcam-{}", cam.camera_id);
            let entry = json!({
                "name": name,
                "service": "mjpegstreamer-adaptive",
                "enabled": true,
                "stream_url": format!("http://{local_ip}:{}/stream", cam.streaming_port),
                "snapshot_url": format!("http://{local_ip}:{}/snapshot", cam.streaming_port),
                "target_fps": cam.max_fps,
            });
            // Delete-then-create keeps the entry in sync without patch
            // semantics.
            let _ = http_request(
                &host,
                "DELETE",
                &format!("/server/webcams/item?name={name}"),
                None,
            );
            match http_request(&host, "POST", "/server/webcams/item", Some(&entry)) {
                Ok((status, _)) if status == 200 || status == 201 => {
                    debug!("moonraker webcam {name} provisioned");
                }
                Ok((status, _)) => {
                    warn!("moonraker webcam {name} push returned {status}");
                    all_ok = false;
                }
                Err(e) => {
                    warn!("moonraker webcam {name} push failed: {e}");
                    all_ok = false;
                }
            }
        }
        *self.last_push.lock().unwrap() = Some((Instant::now(), all_ok));
        if all_ok {
            info!("moonraker provisioning pushed to {host}");
        }
        all_ok
    }

    pub fn status(&self) -> serde_json::Value {
        let host = self.host();
        let last = *self.last_push.lock().unwrap();
        json!({
            "host": host,
            "connected": self.reachable(),
            "last_push_ok": last.map(|(_, ok)| ok),
            "last_push_age_s": last.map(|(t, _)| t.elapsed().as_secs()),
        })
    }
}

/// The address local clients can reach this device on. Routing-table trick:
/// a connected UDP socket learns the outbound interface address without
/// sending a packet.
pub fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_host_short_circuits() {
        let client = MoonrakerClient::new(String::new());
        assert!(!client.reachable());
        assert!(!client.provision_cameras("10.0.0.5", &[]));
        let status = client.status();
        assert_eq!(status["connected"], false);
    }
}
