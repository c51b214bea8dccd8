//! Local control surface: HTML pages rendered from `$name` templates and
//! the JSON API. One request at a time on the control port; configuration
//! changes validate, persist, then notify the rest of the process through
//! the change callback.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::camera::{self, CameraDescriptor};
use crate::capture::CapturePump;
use crate::config::{CameraOverride, ConfigState, H264Resolution, TimelapseStorage};
use crate::cpu_budget::CpuSample;
use crate::frame_bus::FrameBus;
use crate::http::{self, Request};
use crate::moonraker::{local_ip, MoonrakerClient};
use crate::stream_server::StreamServer;
use crate::supervisor::Supervisor;
use crate::timelapse::TimelapseRecorder;
use log::{debug, info, warn};
use printcam_fault_ai::engine::FaultEngine;
use printcam_fault_ai::heads::list_model_sets;
use printcam_fault_ai::PrinterSignals;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

const ACCEPT_POLL: Duration = Duration::from_millis(200);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const NET_CHECK_PERIOD: Duration = Duration::from_secs(30);

pub type TouchInject = Arc<dyn Fn(i32, i32, u32) -> bool + Send + Sync>;
pub type RestartHook = Arc<dyn Fn() + Send + Sync>;

pub struct ControlDeps {
    pub config: Arc<ConfigState>,
    pub bus: Arc<FrameBus>,
    pub cameras: Arc<Mutex<Vec<CameraDescriptor>>>,
    pub recorder: Arc<TimelapseRecorder>,
    pub engine: Arc<FaultEngine>,
    pub stream: Arc<StreamServer>,
    pub supervisor: Option<Arc<Supervisor>>,
    pub pump: Arc<CapturePump>,
    pub cpu: Arc<Mutex<CpuSample>>,
    pub signals: Arc<dyn PrinterSignals>,
    pub touch: TouchInject,
    pub restart: RestartHook,
    pub moonraker: Arc<MoonrakerClient>,
    pub template_dir: PathBuf,
    pub running: Arc<AtomicBool>,
}

/// `$name` substitution over a template file. Unknown names render empty.
pub fn render_template(raw: &str, vars: &HashMap<&str, String>) -> String {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    let re = TOKEN.get_or_init(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").unwrap());
    re.replace_all(raw, |caps: &regex::Captures<'_>| {
        vars.get(&caps[1]).cloned().unwrap_or_default()
    })
    .into_owned()
}

/// Recursive JSON merge used by the settings endpoints: objects merge
/// key-wise, everything else overwrites.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(b), Value::Object(p)) => {
            for (k, v) in p {
                match b.get_mut(k) {
                    Some(slot) => merge_json(slot, v),
                    None => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}

fn fs_free_bytes(path: &str) -> Option<(u64, u64)> {
    let c = std::ffi::CString::new(path).ok()?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c.as_ptr(), &mut st) } != 0 {
        return None;
    }
    let frsize = st.f_frsize as u64;
    Some((st.f_bavail as u64 * frsize, st.f_blocks as u64 * frsize))
}

fn parse_bool(s: &str) -> bool {
    matches!(s, "1" | "true" | "on" | "yes")
}

/// Spawns the control server thread; requests are handled one at a time
/// on that thread, with the 2 s / 30 s periodic supervisor work woven into
/// the accept poll.
pub fn start(deps: ControlDeps, port: u16) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    info!("control server on port {port}");
    thread::Builder::new()
        .name("control".into())
        .spawn(move || {
            let mut last_net_check = Instant::now();
            let mut last_ip = local_ip().unwrap_or_default();
            while deps.running.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, _peer)) => {
                        let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
                        let _ = stream.set_write_timeout(Some(Duration::from_secs(10)));
                        match http::read_request(&mut stream) {
                            Ok(req) => {
                                if let Err(e) = handle(&deps, &req, &mut stream) {
                                    debug!("control client error: {e}");
                                }
                            }
                            Err(e) => debug!("control request parse failed: {e}"),
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        warn!("control accept failed: {e}");
                        thread::sleep(ACCEPT_POLL);
                    }
                }

                if last_net_check.elapsed() >= NET_CHECK_PERIOD {
                    last_net_check = Instant::now();
                    let ip = local_ip().unwrap_or_default();
                    if !ip.is_empty() && ip != last_ip {
                        info!("local IP changed {last_ip} -> {ip}, re-provisioning");
                        last_ip = ip.clone();
                        let cameras = deps.cameras.lock().unwrap().clone();
                        deps.moonraker.provision_cameras(&ip, &cameras);
                    }
                }
            }
        })
        .expect("failed to spawn control thread");
    Ok(())
}

fn handle(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let method = req.method.as_str();
    let path = req.path.as_str();

    if let Some(name) = path.strip_prefix("/api/timelapse/thumb/") {
        return serve_thumb(deps, stream, name);
    }
    if let Some(name) = path.strip_prefix("/api/timelapse/video/") {
        return serve_video(deps, req, stream, name);
    }
    if let Some(name) = path.strip_prefix("/api/timelapse/delete/") {
        if method == "DELETE" {
            return delete_recording(deps, stream, name);
        }
        return http::respond_error(stream, 405, "DELETE required");
    }

    match (method, path) {
        ("GET", "/") => serve_page(deps, stream, "index.html"),
        ("GET", "/control") => serve_page(deps, stream, "control.html"),
        ("POST", "/control") => apply_control_form(deps, req, stream),
        ("GET", "/timelapse") => serve_page(deps, stream, "timelapse.html"),
        ("GET", "/status") => serve_status_text(deps, stream),

        ("GET", "/api/stats") => serve_stats(deps, stream),
        ("GET", "/api/config") => {
            let cfg = deps.config.get();
            http::respond_json(stream, 200, &serde_json::to_value(cfg).unwrap_or(Value::Null))
        }

        ("GET", "/api/camera/controls") => serve_camera_controls(deps, req, stream),
        ("POST", "/api/camera/set") => apply_camera_control(deps, req, stream),
        ("GET", "/api/cameras") => {
            let cameras = deps.cameras.lock().unwrap().clone();
            http::respond_json(
                stream,
                200,
                &serde_json::to_value(cameras).unwrap_or(Value::Null),
            )
        }
        ("POST", "/api/camera/enable") => camera_lifecycle(deps, req, stream, true),
        ("POST", "/api/camera/disable") => camera_lifecycle(deps, req, stream, false),
        ("POST", "/api/camera/settings") => apply_camera_settings(deps, req, stream),

        ("POST", "/api/touch") => apply_touch(deps, req, stream),
        ("GET", "/api/led/on") => {
            deps.signals.lamp_on();
            http::respond_json(stream, 200, &json!({ "led": "on" }))
        }
        ("GET", "/api/led/off") => {
            deps.signals.lamp_off();
            http::respond_json(stream, 200, &json!({ "led": "off" }))
        }
        ("GET", "/api/restart") => {
            (deps.restart)();
            http::respond_json(stream, 200, &json!({ "restarting": true }))
        }

        ("GET", "/api/timelapse/list") => serve_timelapse_list(deps, req, stream),
        ("GET", "/api/timelapse/storage") => serve_storage_info(deps, stream),
        ("GET", "/api/timelapse/browse") => serve_browse(deps, req, stream),
        ("POST", "/api/timelapse/mkdir") => apply_mkdir(deps, req, stream),
        ("GET", "/api/timelapse/moonraker") => {
            http::respond_json(stream, 200, &deps.moonraker.status())
        }
        ("POST", "/api/timelapse/settings") => apply_timelapse_settings(deps, req, stream),

        ("GET", "/api/network/interfaces") => serve_interfaces(stream),
        ("GET", "/api/moonraker/cameras") => {
            http::respond_json(stream, 200, &deps.moonraker.status())
        }
        ("POST", "/api/moonraker/cameras") => apply_moonraker(deps, req, stream),

        ("POST", "/api/acproxycam/flv") => apply_proxy_announce(deps, req, stream),
        ("GET", "/api/acproxycam/flv") => {
            http::respond_json(stream, 200, &deps.stream.proxy_status())
        }

        ("GET", "/api/fault_detect/models") => {
            let root = deps.config.get().model_root;
            let sets = list_model_sets(Path::new(&root));
            http::respond_json(
                stream,
                200,
                &serde_json::to_value(sets).unwrap_or(Value::Null),
            )
        }
        ("POST", "/api/fault_detect/settings") => apply_fault_detect_settings(deps, req, stream),

        _ => http::respond_error(stream, 404, "not found"),
    }
}

fn page_vars(deps: &ControlDeps) -> HashMap<&'static str, String> {
    let cfg = deps.config.get();
    let (w, h) = cfg.h264_resolution.dims();
    let mut vars = HashMap::new();
    vars.insert("version", env!("CARGO_PKG_VERSION").to_string());
    vars.insert("streaming_port", cfg.streaming_port.to_string());
    vars.insert("control_port", cfg.control_port.to_string());
    vars.insert("h264_enabled", cfg.h264_enabled.to_string());
    vars.insert("h264_resolution", format!("{w}x{h}"));
    vars.insert("h264_bitrate", cfg.h264_bitrate.to_string());
    vars.insert("mjpeg_fps", cfg.mjpeg_fps.to_string());
    vars.insert("jpeg_quality", cfg.jpeg_quality.to_string());
    vars.insert("skip_ratio", cfg.skip_ratio.to_string());
    vars.insert("auto_skip", cfg.auto_skip.to_string());
    vars.insert("target_cpu", cfg.target_cpu.to_string());
    vars.insert("capture_fps", format!("{:.1}", deps.pump.observed_fps()));
    vars
}

fn serve_page(deps: &ControlDeps, stream: &mut TcpStream, name: &str) -> io::Result<()> {
    let path = deps.template_dir.join(name);
    match fs::read_to_string(&path) {
        Ok(raw) => {
            let html = render_template(&raw, &page_vars(deps));
            http::respond(stream, 200, "text/html; charset=utf-8", html.as_bytes())
        }
        Err(e) => {
            warn!("template {} unreadable: {e}", path.display());
            http::respond_error(stream, 500, "template missing")
        }
    }
}

fn serve_status_text(deps: &ControlDeps, stream: &mut TcpStream) -> io::Result<()> {
    let cpu = *deps.cpu.lock().unwrap();
    let (mjpeg, flv, proxy) = deps.stream.client_counts();
    let engine = deps.engine.status();
    let body = format!(
        "printcam {}\ncapture: {} ({:.1} fps)\nclients: mjpeg={mjpeg} flv={flv} proxy={proxy}\n\
         cpu: total={:.1}% self={:.1}% children={:.1}% skip={}\n\
         fault-detect: running={} no_npu={} cycles={} skipped={}\n\
         timelapse: active={} encode={:?}\n",
        env!("CARGO_PKG_VERSION"),
        if deps.pump.healthy() { "healthy" } else { "FAILED" },
        deps.pump.observed_fps(),
        cpu.total_pct,
        cpu.self_pct,
        cpu.children_pct,
        cpu.effective_skip_ratio,
        engine.running,
        engine.no_npu,
        engine.cycles,
        engine.skipped,
        deps.recorder.session_active(),
        deps.recorder.encode_status.get(),
    );
    http::respond(stream, 200, "text/plain; charset=utf-8", body.as_bytes())
}

fn serve_stats(deps: &ControlDeps, stream: &mut TcpStream) -> io::Result<()> {
    let cpu = *deps.cpu.lock().unwrap();
    let (mjpeg, flv, proxy) = deps.stream.client_counts();
    let verdict = deps.engine.latest_result().map(|r| {
        json!({
            "verdict": r.verdict,
            "confidence": r.confidence,
            "label": r.label,
            "cycle": r.cycle,
            "total_ms": r.total_ms,
            "boost_overrode": r.boost.overrode,
        })
    });
    let stats = json!({
        "capture": {
            "healthy": deps.pump.healthy(),
            "fps": deps.pump.observed_fps(),
            "frames_published": deps.pump.frames_published(),
            "jpeg_seq": deps.bus.jpeg.seq(),
            "h264_seq": deps.bus.h264.seq(),
        },
        "clients": { "mjpeg": mjpeg, "flv": flv, "proxy": proxy },
        "cpu": cpu,
        "fault_detect": {
            "status": deps.engine.status(),
            "latest": verdict,
        },
        "timelapse": {
            "active": deps.recorder.session_active(),
            "frames": deps.recorder.frame_count(),
            "encode_status": deps.recorder.encode_status.get(),
            "recovery": deps.recorder.recovery_status(),
            "detail": deps.recorder.last_detail(),
        },
    });
    http::respond_json(stream, 200, &stats)
}

fn apply_control_form(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let form = req.body_fields();
    let result = deps.config.update(|cfg| {
        if let Some(v) = form.get("h264_enabled") {
            cfg.h264_enabled = parse_bool(v);
        }
        if let Some(v) = form.get("h264_resolution") {
            if let Some(res) = H264Resolution::parse(v) {
                cfg.h264_resolution = res;
            }
        }
        if let Some(v) = form.get("h264_bitrate").and_then(|v| v.parse().ok()) {
            cfg.h264_bitrate = v;
        }
        if let Some(v) = form.get("mjpeg_fps").and_then(|v| v.parse().ok()) {
            cfg.mjpeg_fps = v;
        }
        if let Some(v) = form.get("jpeg_quality").and_then(|v| v.parse().ok()) {
            cfg.jpeg_quality = v;
        }
        if let Some(v) = form.get("skip_ratio").and_then(|v| v.parse().ok()) {
            cfg.skip_ratio = v;
        }
        if let Some(v) = form.get("auto_skip") {
            cfg.auto_skip = parse_bool(v);
        }
        if let Some(v) = form.get("target_cpu").and_then(|v| v.parse().ok()) {
            cfg.target_cpu = v;
        }
        if let Some(v) = form.get("display_enabled") {
            cfg.display_enabled = parse_bool(v);
        }
        if let Some(v) = form.get("display_fps").and_then(|v| v.parse().ok()) {
            cfg.display_fps = v;
        }
    });
    match result {
        Ok(()) => http::respond_redirect(stream, "/control"),
        Err(e) => http::respond_error(stream, 400, &e),
    }
}

fn camera_by_id(deps: &ControlDeps, id: u8) -> Option<CameraDescriptor> {
    deps.cameras
        .lock()
        .unwrap()
        .iter()
        .find(|c| c.camera_id == id)
        .cloned()
}

fn req_camera_id(req: &Request) -> Option<u8> {
    req.param("camera_id")
        .map(str::to_string)
        .or_else(|| req.body_fields().get("camera_id").cloned())
        .and_then(|v| v.parse().ok())
}

fn serve_camera_controls(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let Some(id) = req_camera_id(req) else {
        return http::respond_error(stream, 400, "camera_id required");
    };
    let Some(cam) = camera_by_id(deps, id) else {
        return http::respond_error(stream, 404, "unknown camera");
    };
    match camera::control_ranges(&cam.device_path) {
        Ok(ranges) => http::respond_json(stream, 200, &ranges),
        Err(e) => http::respond_error(stream, 500, &format!("control query failed: {e}")),
    }
}

fn apply_camera_control(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let fields = req.body_fields();
    let Some(id) = req_camera_id(req) else {
        return http::respond_error(stream, 400, "camera_id required");
    };
    let (Some(name), Some(value)) = (fields.get("name"), fields.get("value")) else {
        return http::respond_error(stream, 400, "name and value required");
    };
    let Ok(value) = value.parse::<i64>() else {
        return http::respond_error(stream, 400, "value must be an integer");
    };
    let Some(cam) = camera_by_id(deps, id) else {
        return http::respond_error(stream, 404, "unknown camera");
    };
    if camera::control_id(name).is_none() {
        return http::respond_error(stream, 400, "unknown control");
    }
    if let Err(e) = camera::set_control(&cam.device_path, name, value) {
        return http::respond_error(stream, 500, &format!("set failed: {e}"));
    }
    // Persist so the control survives restart (validated as a whole).
    let name = name.clone();
    let result = deps.config.update(|cfg| {
        let v = Some(value as i32);
        let c = &mut cfg.controls;
        match name.as_str() {
            "brightness" => c.brightness = v,
            "contrast" => c.contrast = v,
            "saturation" => c.saturation = v,
            "hue" => c.hue = v,
            "gamma" => c.gamma = v,
            "sharpness" => c.sharpness = v,
            "gain" => c.gain = v,
            "backlight" => c.backlight = v,
            "white_balance_auto" => c.white_balance_auto = Some(value != 0),
            "white_balance_temp" => c.white_balance_temp = v,
            "exposure_auto" => c.exposure_auto = v,
            "exposure" => c.exposure = v,
            "exposure_priority" => c.exposure_priority = v,
            "power_line" => c.power_line = v,
            _ => {}
        }
    });
    match result {
        Ok(()) => http::respond_json(stream, 200, &json!({ "ok": true })),
        Err(e) => http::respond_error(stream, 400, &e),
    }
}

fn camera_lifecycle(
    deps: &ControlDeps,
    req: &Request,
    stream: &mut TcpStream,
    enable: bool,
) -> io::Result<()> {
    let Some(id) = req_camera_id(req) else {
        return http::respond_error(stream, 400, "camera_id required");
    };
    let Some(sup) = deps.supervisor.as_ref() else {
        return http::respond_error(stream, 400, "not running in primary mode");
    };
    let result = if enable {
        sup.enable_camera(id)
    } else {
        sup.disable_camera(id)
    };
    match result {
        Ok(()) => http::respond_json(stream, 200, &json!({ "camera_id": id, "enabled": enable })),
        Err(e) => http::respond_error(stream, 400, &e),
    }
}

fn apply_camera_settings(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let fields = req.body_fields();
    let Some(id) = req_camera_id(req) else {
        return http::respond_error(stream, 400, "camera_id required");
    };
    if camera_by_id(deps, id).is_none() {
        return http::respond_error(stream, 404, "unknown camera");
    }
    let get_u32 = |k: &str| fields.get(k).and_then(|v| v.parse::<u32>().ok());
    let result = deps.config.update(|cfg| {
        let entry = cfg.camera_overrides.entry(id).or_insert_with(CameraOverride::default);
        if let Some(w) = get_u32("width") {
            entry.width = w;
        }
        if let Some(h) = get_u32("height") {
            entry.height = h;
        }
        if let Some(f) = get_u32("fps") {
            entry.fps = f;
        }
        if let Some(v) = fields.get("force_mjpeg") {
            entry.force_mjpeg = parse_bool(v);
        }
    });
    match result {
        Ok(()) => http::respond_json(stream, 200, &json!({ "ok": true })),
        Err(e) => http::respond_error(stream, 400, &e),
    }
}

fn apply_touch(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let fields = req.body_fields();
    let coord = |k: &str| fields.get(k).and_then(|v| v.parse::<i32>().ok());
    let (Some(x), Some(y)) = (coord("x"), coord("y")) else {
        return http::respond_error(stream, 400, "x and y required");
    };
    let duration = fields
        .get("duration_ms")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(50);
    if (deps.touch)(x, y, duration) {
        http::respond_json(stream, 200, &json!({ "ok": true }))
    } else {
        http::respond_error(stream, 500, "touch injection failed")
    }
}

fn timelapse_dir(deps: &ControlDeps, storage: Option<&str>) -> PathBuf {
    let cfg = deps.config.get().timelapse;
    let dir = match storage {
        Some("usb") => cfg.usb_path,
        Some("internal") => cfg.internal_path,
        _ => match cfg.storage {
            TimelapseStorage::Usb => cfg.usb_path,
            TimelapseStorage::Internal => cfg.internal_path,
        },
    };
    PathBuf::from(dir)
}

fn serve_timelapse_list(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let dir = timelapse_dir(deps, req.param("storage"));
    let mut recordings = Vec::new();
    if let Ok(entries) = fs::read_dir(&dir) {
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        names.sort();
        for name in names.iter().filter(|n| n.ends_with(".mp4")) {
            let stem = name.trim_end_matches(".mp4");
            let meta = fs::metadata(dir.join(name)).ok();
            let thumbs: Vec<&String> = names
                .iter()
                .filter(|n| {
                    n.ends_with(".jpg")
                        && n.strip_prefix(stem)
                            .map_or(false, |rest| rest.starts_with('_'))
                })
                .collect();
            recordings.push(json!({
                "name": name,
                "size": meta.as_ref().map(|m| m.len()),
                "thumbnails": thumbs,
            }));
        }
    }
    http::respond_json(stream, 200, &json!({ "dir": dir, "recordings": recordings }))
}

/// Thumbnails live beside the recordings in either storage root.
fn find_recording_file(deps: &ControlDeps, name: &str) -> Option<PathBuf> {
    let cfg = deps.config.get().timelapse;
    for root in [&cfg.internal_path, &cfg.usb_path] {
        let candidate = Path::new(root).join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn serve_thumb(deps: &ControlDeps, stream: &mut TcpStream, name: &str) -> io::Result<()> {
    let name = match http::sanitize_filename(name) {
        Ok(n) => n,
        Err(e) => return http::respond_error(stream, 400, &e),
    };
    let Some(path) = find_recording_file(deps, name) else {
        return http::respond_error(stream, 404, "no such thumbnail");
    };
    let body = fs::read(&path)?;
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nCache-Control: max-age=86400\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    stream.write_all(&body)?;
    stream.flush()
}

fn serve_video(deps: &ControlDeps, req: &Request, stream: &mut TcpStream, name: &str) -> io::Result<()> {
    let name = match http::sanitize_filename(name) {
        Ok(n) => n,
        Err(e) => return http::respond_error(stream, 400, &e),
    };
    let Some(path) = find_recording_file(deps, name) else {
        return http::respond_error(stream, 404, "no such recording");
    };
    let body = fs::read(&path)?;
    let total = body.len() as u64;

    if let Some(range) = req.header("range") {
        let Some((start, end)) = http::parse_range(range, total) else {
            return http::respond_error(stream, 400, "unsatisfiable range");
        };
        let slice = &body[start as usize..=end as usize];
        write!(
            stream,
            "HTTP/1.1 206 Partial Content\r\nContent-Type: video/mp4\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
            slice.len(),
            start,
            end,
            total
        )?;
        stream.write_all(slice)?;
        return stream.flush();
    }
    write!(
        stream,
        "HTTP/1.1 200 OK\r\nContent-Type: video/mp4\r\nContent-Length: {total}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n"
    )?;
    stream.write_all(&body)?;
    stream.flush()
}

fn delete_recording(deps: &ControlDeps, stream: &mut TcpStream, name: &str) -> io::Result<()> {
    let name = match http::sanitize_filename(name) {
        Ok(n) => n,
        Err(e) => return http::respond_error(stream, 400, &e),
    };
    if !name.ends_with(".mp4") {
        return http::respond_error(stream, 400, "not a recording");
    }
    let Some(path) = find_recording_file(deps, name) else {
        return http::respond_error(stream, 404, "no such recording");
    };
    fs::remove_file(&path)?;
    // Matching thumbnails share the stem.
    let stem = name.trim_end_matches(".mp4");
    if let Some(dir) = path.parent() {
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                let fname = entry.file_name();
                let fname = fname.to_string_lossy();
                if fname.ends_with(".jpg")
                    && fname
                        .strip_prefix(stem)
                        .map_or(false, |rest| rest.starts_with('_'))
                {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
    info!("recording {name} deleted");
    http::respond_json(stream, 200, &json!({ "deleted": name }))
}

fn serve_storage_info(deps: &ControlDeps, stream: &mut TcpStream) -> io::Result<()> {
    let cfg = deps.config.get().timelapse;
    let report = |path: &str| match fs_free_bytes(path) {
        Some((free, total)) => json!({ "path": path, "free": free, "total": total }),
        None => json!({ "path": path, "available": false }),
    };
    http::respond_json(
        stream,
        200,
        &json!({
            "internal": report(&cfg.internal_path),
            "usb": report(&cfg.usb_path),
        }),
    )
}

fn serve_browse(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let rel = req.param("path").unwrap_or("");
    let rel = match http::sanitize_relpath(rel) {
        Ok(p) => p,
        Err(e) => return http::respond_error(stream, 400, &e),
    };
    let usb_root = PathBuf::from(deps.config.get().timelapse.usb_path);
    let dir = usb_root.join(rel.trim_start_matches('/'));
    if !dir.starts_with(&usb_root) {
        return http::respond_error(stream, 400, "outside usb storage");
    }
    let mut dirs = Vec::new();
    match fs::read_dir(&dir) {
        Ok(entries) => {
            for entry in entries.flatten() {
                if entry.file_type().map_or(false, |t| t.is_dir()) {
                    dirs.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            dirs.sort();
            http::respond_json(stream, 200, &json!({ "path": rel, "directories": dirs }))
        }
        Err(_) => http::respond_error(stream, 404, "no such directory"),
    }
}

fn apply_mkdir(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let fields = req.body_fields();
    let Some(rel) = fields.get("path") else {
        return http::respond_error(stream, 400, "path required");
    };
    let rel = match http::sanitize_relpath(rel) {
        Ok(p) => p,
        Err(e) => return http::respond_error(stream, 400, &e),
    };
    let usb_root = PathBuf::from(deps.config.get().timelapse.usb_path);
    let dir = usb_root.join(rel.trim_start_matches('/'));
    if !dir.starts_with(&usb_root) {
        return http::respond_error(stream, 400, "outside usb storage");
    }
    match fs::create_dir_all(&dir) {
        Ok(()) => http::respond_json(stream, 200, &json!({ "created": rel })),
        Err(e) => http::respond_error(stream, 500, &format!("mkdir failed: {e}")),
    }
}

fn apply_timelapse_settings(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let Some(patch) = req.json() else {
        return http::respond_error(stream, 400, "JSON body required");
    };
    let current = deps.config.get();
    let mut staged = serde_json::to_value(&current.timelapse).unwrap_or(Value::Null);
    merge_json(&mut staged, &patch);
    let parsed: crate::config::TimelapseConfig = match serde_json::from_value(staged) {
        Ok(v) => v,
        Err(e) => return http::respond_error(stream, 400, &format!("bad settings: {e}")),
    };
    match deps.config.update(|cfg| cfg.timelapse = parsed.clone()) {
        Ok(()) => http::respond_json(stream, 200, &json!({ "ok": true })),
        Err(e) => http::respond_error(stream, 400, &e),
    }
}

fn apply_fault_detect_settings(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let Some(patch) = req.json() else {
        return http::respond_error(stream, 400, "JSON body required");
    };
    let current = deps.config.get();
    let mut staged = serde_json::to_value(&current.fault_detect).unwrap_or(Value::Null);
    merge_json(&mut staged, &patch);
    let parsed: printcam_fault_ai::config::FaultDetectConfig = match serde_json::from_value(staged)
    {
        Ok(v) => v,
        Err(e) => return http::respond_error(stream, 400, &format!("bad settings: {e}")),
    };
    let table = match parsed.zmask_table() {
        Ok(t) => t,
        Err(e) => return http::respond_error(stream, 400, &format!("bad mask: {e}")),
    };
    match deps.config.update(|cfg| cfg.fault_detect = parsed.clone()) {
        Ok(()) => {
            deps.engine.apply_config(parsed, table);
            http::respond_json(stream, 200, &json!({ "ok": true }))
        }
        Err(e) => http::respond_error(stream, 400, &e),
    }
}

fn serve_interfaces(stream: &mut TcpStream) -> io::Result<()> {
    let mut interfaces = Vec::new();
    if let Ok(entries) = fs::read_dir("/sys/class/net") {
        for entry in entries.flatten() {
            interfaces.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    interfaces.sort();
    http::respond_json(
        stream,
        200,
        &json!({ "interfaces": interfaces, "primary_ip": local_ip() }),
    )
}

fn apply_moonraker(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let fields = req.body_fields();
    if let Some(host) = fields.get("host") {
        deps.moonraker.set_host(host.clone());
        let host = host.clone();
        let _ = deps.config.update(|cfg| cfg.moonraker_host = host.clone());
    }
    let Some(ip) = local_ip() else {
        return http::respond_error(stream, 500, "no local address");
    };
    let cameras = deps.cameras.lock().unwrap().clone();
    let ok = deps.moonraker.provision_cameras(&ip, &cameras);
    http::respond_json(stream, 200, &json!({ "pushed": ok }))
}

fn apply_proxy_announce(deps: &ControlDeps, req: &Request, stream: &mut TcpStream) -> io::Result<()> {
    let fields = req.body_fields();
    let Some(url) = fields.get("url") else {
        return http::respond_error(stream, 400, "url required");
    };
    if crate::stream_server::parse_http_url(url).is_none() {
        return http::respond_error(stream, 400, "only plain http upstreams supported");
    }
    deps.stream.announce_proxy(url.clone());
    http::respond_json(stream, 200, &json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_substitution() {
        let mut vars = HashMap::new();
        vars.insert("name", "printcam".to_string());
        vars.insert("fps_2", "30".to_string());
        let out = render_template("hello $name at $fps_2 ($unknown$name)", &vars);
        assert_eq!(out, "hello printcam at 30 (printcam)");
    }

    #[test]
    fn template_token_charset() {
        let mut vars = HashMap::new();
        vars.insert("a_b2", "x".to_string());
        // `$2bad` is not a valid token and passes through untouched.
        let out = render_template("$a_b2 $2bad", &vars);
        assert_eq!(out, "x $2bad");
    }

    #[test]
    fn json_merge_is_recursive() {
        let mut base = json!({ "a": 1, "nested": { "x": 1, "y": 2 }, "keep": true });
        let patch = json!({ "a": 5, "nested": { "y": 9, "z": 3 } });
        merge_json(&mut base, &patch);
        assert_eq!(base["a"], 5);
        assert_eq!(base["nested"]["x"], 1);
        assert_eq!(base["nested"]["y"], 9);
        assert_eq!(base["nested"]["z"], 3);
        assert_eq!(base["keep"], true);
    }

    #[test]
    fn bool_form_values() {
        assert!(parse_bool("1") && parse_bool("true") && parse_bool("on"));
        assert!(!parse_bool("0") && !parse_bool("off") && !parse_bool(""));
    }
}
