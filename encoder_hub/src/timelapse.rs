//! Time-lapse recorder: frames captured on print events into a per-session
//! temp directory, deferred hardware encode into MP4 on print end, ffmpeg
//! fallback tiers, and orphan recovery across process restarts.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::{ConfigState, TimelapseConfig};
use crate::frame_bus::FrameBus;
use crate::h264::{self, validate_jpeg};
use crate::mp4::Mp4Writer;
use crate::venc::{rgb_to_nv12_scaled, VencSession};
use anyhow::{anyhow, Context, Result};
use chrono::Local;
use log::{debug, error, info, warn};
use serde_derive::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::runtime::Runtime;
use v4l::prelude::*;

pub const FRAME_PREFIX: &str = "frame_";

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodeStatus {
    Idle,
    Pending,
    Running,
    Success,
    Failed,
}

impl EncodeStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EncodeStatus::Pending,
            2 => EncodeStatus::Running,
            3 => EncodeStatus::Success,
            4 => EncodeStatus::Failed,
            _ => EncodeStatus::Idle,
        }
    }
}

/// Shared encode-status cell: the fault-detect engine skips cycles while
/// this reads `Pending` or `Running` (the encoder and the NPU compete for
/// the same contiguous arena).
pub struct EncodeStatusCell(AtomicU8);

impl EncodeStatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(EncodeStatus::Idle as u8))
    }

    pub fn get(&self) -> EncodeStatus {
        EncodeStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, status: EncodeStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    pub fn busy(&self) -> bool {
        matches!(self.get(), EncodeStatus::Pending | EncodeStatus::Running)
    }
}

impl Default for EncodeStatusCell {
    fn default() -> Self {
        Self::new()
    }
}

/// One print's recording lifecycle.
pub struct TimelapseSession {
    pub base_name: String,
    pub temp_dir: PathBuf,
    pub frame_count: u32,
    pub active: bool,
    /// Set when the print-event hook owns the session; RPC-initiated
    /// commands are ignored while it holds.
    pub custom_mode: bool,
    pub detail: String,
    /// Slot sequence of the last captured frame, for duplicate suppression.
    last_capture_seq: u64,
}

/// Print filename -> session base name: path and extension stripped,
/// characters the path sanitizer would reject replaced by underscores.
pub fn base_name_for(print_name: &str) -> String {
    let file = print_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(print_name);
    let stem = match file.rsplit_once('.') {
        Some((stem, _ext)) if !stem.is_empty() => stem,
        _ => file,
    };
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "print".to_string()
    } else {
        cleaned
    }
}

/// `1 + max(NN)` over existing `{name}_{NN}.mp4`, or 1 when none exist.
pub fn find_next_sequence(dir: &Path, name: &str) -> u32 {
    let mut max_seen = 0u32;
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let fname = entry.file_name();
            let fname = fname.to_string_lossy();
            let Some(rest) = fname
                .strip_prefix(name)
                .and_then(|r| r.strip_prefix('_'))
                .and_then(|r| r.strip_suffix(".mp4"))
            else {
                continue;
            };
            if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(nn) = rest.parse::<u32>() {
                    max_seen = max_seen.max(nn);
                }
            }
        }
    }
    max_seen + 1
}

/// Output fps: fixed when variable fps is off, else `clamp(N / target, min,
/// max)` with round-to-nearest division.
pub fn compute_output_fps(cfg: &TimelapseConfig, frames: u32) -> u32 {
    if !cfg.variable_fps {
        return cfg.output_fps.max(1);
    }
    let target = cfg.target_length.max(1);
    let fps = (frames + target / 2) / target;
    fps.clamp(cfg.variable_fps_min.max(1), cfg.variable_fps_max.max(1))
}

/// The exact software-fallback argv. `fallback_codec` swaps the x264 block
/// for the permissive mpeg4 tier.
pub fn ffmpeg_args(
    fps: u32,
    frame_dir: &Path,
    filter: &str,
    crf: u32,
    out: &Path,
    fallback_codec: bool,
) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-framerate".to_string(),
        fps.to_string(),
        "-i".to_string(),
        frame_dir
            .join(format!("{FRAME_PREFIX}%04d.jpg"))
            .to_string_lossy()
            .into_owned(),
    ];
    if !filter.is_empty() {
        args.push("-vf".to_string());
        args.push(filter.to_string());
    }
    if fallback_codec {
        args.extend(
            ["-c:v", "mpeg4", "-q:v", "5"]
                .iter()
                .map(|s| s.to_string()),
        );
    } else {
        args.extend(
            [
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-tune",
                "zerolatency",
                "-x264-params",
                "keyint=30:min-keyint=10:scenecut=0:bframes=0:ref=1:rc-lookahead=0:threads=1",
                "-crf",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(crf.to_string());
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());
    }
    args.push(out.to_string_lossy().into_owned());
    args
}

/// `hflip`, `vflip`, `hflip,vflip` or empty, matching the flip flags.
pub fn flip_filter(flip_x: bool, flip_y: bool) -> &'static str {
    match (flip_x, flip_y) {
        (true, true) => "hflip,vflip",
        (true, false) => "hflip",
        (false, true) => "vflip",
        (false, false) => "",
    }
}

fn flip_rgb(rgb: &mut [u8], width: usize, height: usize, flip_x: bool, flip_y: bool) {
    if flip_x {
        for row in 0..height {
            let row_data = &mut rgb[row * width * 3..(row + 1) * width * 3];
            for col in 0..width / 2 {
                for ch in 0..3 {
                    row_data.swap(col * 3 + ch, (width - 1 - col) * 3 + ch);
                }
            }
        }
    }
    if flip_y {
        let stride = width * 3;
        for row in 0..height / 2 {
            let (top, rest) = rgb.split_at_mut((height - 1 - row) * stride);
            top[row * stride..row * stride + stride]
                .swap_with_slice(&mut rest[..stride]);
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub enum RecoveryStatus {
    Idle,
    Running { dir: String },
    Done { recovered: u32, rescued: u32 },
}

pub struct TimelapseRecorder {
    bus: Arc<FrameBus>,
    config: Arc<ConfigState>,
    session: Mutex<Option<TimelapseSession>>,
    pub encode_status: Arc<EncodeStatusCell>,
    venc_device: String,
    recovery: Mutex<RecoveryStatus>,
    detail: Mutex<String>,
}

impl TimelapseRecorder {
    pub fn new(bus: Arc<FrameBus>, config: Arc<ConfigState>, venc_device: String) -> Self {
        Self {
            bus,
            config,
            session: Mutex::new(None),
            encode_status: Arc::new(EncodeStatusCell::new()),
            venc_device,
            recovery: Mutex::new(RecoveryStatus::Idle),
            detail: Mutex::new(String::new()),
        }
    }

    /// Starts a session. `custom_mode` marks ownership by the print-event
    /// hook; while a custom session is live, RPC initiation is a no-op.
    pub fn start_session(&self, print_name: &str, custom_mode: bool) -> bool {
        let mut guard = self.session.lock().unwrap();
        if let Some(existing) = guard.as_ref() {
            if existing.active {
                if existing.custom_mode && !custom_mode {
                    debug!("time-lapse start ignored: session owned by print events");
                } else {
                    debug!("time-lapse start ignored: session already active");
                }
                return false;
            }
        }

        let cfg = self.config.get().timelapse;
        let base_name = base_name_for(print_name);
        let temp_dir =
            Path::new(cfg.output_dir()).join(format!("{}_{}", base_name, std::process::id()));
        if let Err(e) = fs::create_dir_all(&temp_dir) {
            error!("time-lapse temp dir {} failed: {e}", temp_dir.display());
            return false;
        }
        info!("time-lapse session started: {base_name} -> {}", temp_dir.display());
        *guard = Some(TimelapseSession {
            base_name,
            temp_dir,
            frame_count: 0,
            active: true,
            custom_mode,
            detail: String::new(),
            last_capture_seq: 0,
        });
        true
    }

    /// Releasing ownership while a session is active preserves the session.
    pub fn release_custom_mode(&self) {
        let mut guard = self.session.lock().unwrap();
        if let Some(session) = guard.as_mut() {
            if !session.active {
                session.custom_mode = false;
            }
        }
    }

    pub fn session_active(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |s| s.active)
    }

    pub fn custom_mode(&self) -> bool {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |s| s.custom_mode)
    }

    pub fn frame_count(&self) -> u32 {
        self.session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |s| s.frame_count)
    }

    pub fn recovery_status(&self) -> RecoveryStatus {
        self.recovery.lock().unwrap().clone()
    }

    pub fn last_detail(&self) -> String {
        self.detail.lock().unwrap().clone()
    }

    /// Captures one frame from the jpeg slot into the session directory.
    /// Duplicate slot sequences and structurally invalid JPEGs are skipped.
    pub fn capture_frame(&self) -> Result<bool> {
        let mut guard = self.session.lock().unwrap();
        let session = guard
            .as_mut()
            .filter(|s| s.active)
            .ok_or_else(|| anyhow!("no active time-lapse session"))?;

        let mut jpeg = Vec::new();
        let Some((seq, _ts)) = self.bus.jpeg.snapshot(&mut jpeg) else {
            debug!("time-lapse capture: no frame published yet");
            return Ok(false);
        };
        if seq == session.last_capture_seq {
            debug!("time-lapse capture: duplicate frame (seq {seq})");
            return Ok(false);
        }
        if !validate_jpeg(&jpeg) {
            warn!("time-lapse capture: corrupt JPEG skipped");
            return Ok(false);
        }

        let path = session
            .temp_dir
            .join(format!("{FRAME_PREFIX}{:04}.jpg", session.frame_count));
        fs::write(&path, &jpeg).with_context(|| format!("writing {}", path.display()))?;
        session.frame_count += 1;
        session.last_capture_seq = seq;
        debug!(
            "time-lapse frame {:04} captured ({} bytes)",
            session.frame_count - 1,
            jpeg.len()
        );
        Ok(true)
    }

    /// Ends the session and hands the deferred encode to a worker thread.
    pub fn finalize(self: &Arc<Self>, reason: &str) {
        let session = {
            let mut guard = self.session.lock().unwrap();
            match guard.as_mut() {
                Some(s) if s.active => {
                    s.active = false;
                    s.detail = format!("print end: {reason}");
                    guard.take()
                }
                _ => None,
            }
        };
        let Some(session) = session else {
            debug!("finalize without active session ({reason})");
            return;
        };
        if session.frame_count == 0 {
            info!("time-lapse session had no frames, discarding");
            let _ = fs::remove_dir_all(&session.temp_dir);
            return;
        }

        self.encode_status.set(EncodeStatus::Pending);
        let recorder = Arc::clone(self);
        thread::Builder::new()
            .name("tl-encode".into())
            .spawn(move || {
                let cfg = recorder.config.get().timelapse;
                if cfg.end_delay_s > 0 {
                    thread::sleep(Duration::from_secs(u64::from(cfg.end_delay_s)));
                }
                recorder.encode_status.set(EncodeStatus::Running);
                let outcome = encode_session(
                    &cfg,
                    &recorder.venc_device,
                    &session.temp_dir,
                    &session.base_name,
                    session.frame_count,
                    None,
                );
                match outcome {
                    Ok(out) => {
                        info!("time-lapse written: {}", out.display());
                        *recorder.detail.lock().unwrap() =
                            format!("encoded {}", out.display());
                        recorder.encode_status.set(EncodeStatus::Success);
                    }
                    Err(e) => {
                        error!("time-lapse encode failed: {e:#}");
                        *recorder.detail.lock().unwrap() = format!("encode failed: {e:#}");
                        recorder.encode_status.set(EncodeStatus::Failed);
                    }
                }
                let _ = fs::remove_dir_all(&session.temp_dir);
            })
            .expect("failed to spawn tl-encode thread");
    }

    /// Drops the session and its frames without encoding.
    pub fn cancel(&self) {
        let mut guard = self.session.lock().unwrap();
        if let Some(session) = guard.take() {
            info!("time-lapse session cancelled ({} frames)", session.frame_count);
            let _ = fs::remove_dir_all(&session.temp_dir);
        }
    }

    /// Startup scan for `{base}_{pid}` temp directories left by dead
    /// processes. Runs on a background thread; encodes what it can and
    /// rescues the frames of anything it cannot.
    pub fn spawn_orphan_recovery(self: &Arc<Self>) {
        let recorder = Arc::clone(self);
        thread::Builder::new()
            .name("tl-recover".into())
            .spawn(move || recorder.recover_orphans())
            .expect("failed to spawn tl-recover thread");
    }

    fn recover_orphans(&self) {
        let cfg = self.config.get().timelapse;
        let mut recovered = 0u32;
        let mut rescued = 0u32;
        for root in [cfg.internal_path.clone(), cfg.usb_path.clone()] {
            let Ok(entries) = fs::read_dir(&root) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some((base, pid)) = split_orphan_name(&path) else {
                    continue;
                };
                if pid == std::process::id() || process_alive(pid) {
                    continue;
                }
                let frames = contiguous_frame_count(&path);
                if frames == 0 {
                    let _ = fs::remove_dir_all(&path);
                    continue;
                }
                info!(
                    "orphaned time-lapse: {} ({} frames, dead pid {})",
                    path.display(),
                    frames,
                    pid
                );
                *self.recovery.lock().unwrap() = RecoveryStatus::Running {
                    dir: path.display().to_string(),
                };
                let stamp = Local::now().format("%Y%m%d_%H%M%S");
                let out_name = format!("recovered_{stamp}");
                self.encode_status.set(EncodeStatus::Running);
                let result = encode_session(
                    &cfg,
                    &self.venc_device,
                    &path,
                    &base,
                    frames,
                    Some(out_name),
                );
                self.encode_status.set(EncodeStatus::Idle);
                match result {
                    Ok(out) => {
                        info!("orphan recovered into {}", out.display());
                        recovered += 1;
                        let _ = fs::remove_dir_all(&path);
                    }
                    Err(e) => {
                        warn!("orphan encode failed ({e:#}), rescuing frames");
                        if rescue_frames(&cfg.usb_path, &path, frames).is_ok() {
                            rescued += 1;
                        }
                        let _ = fs::remove_dir_all(&path);
                    }
                }
            }
        }
        *self.recovery.lock().unwrap() = RecoveryStatus::Done { recovered, rescued };
    }
}

/// `{base}_{pid}` -> (base, pid).
fn split_orphan_name(path: &Path) -> Option<(String, u32)> {
    let name = path.file_name()?.to_str()?;
    let (base, pid_s) = name.rsplit_once('_')?;
    if base.is_empty() || pid_s.is_empty() || !pid_s.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((base.to_string(), pid_s.parse().ok()?))
}

fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Count of the gap-free `frame_0000.jpg ..` prefix.
fn contiguous_frame_count(dir: &Path) -> u32 {
    let mut count = 0u32;
    loop {
        let candidate = dir.join(format!("{FRAME_PREFIX}{count:04}.jpg"));
        if !candidate.exists() {
            return count;
        }
        count += 1;
    }
}

fn rescue_frames(usb_root: &str, dir: &Path, frames: u32) -> Result<()> {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let dest = Path::new(usb_root)
        .join("Time-lapse-Frames-Recovery")
        .join(format!("frames_{stamp}_{frames}"));
    fs::create_dir_all(&dest)?;
    for i in 0..frames {
        let name = format!("{FRAME_PREFIX}{i:04}.jpg");
        fs::copy(dir.join(&name), dest.join(&name))
            .with_context(|| format!("rescuing {name}"))?;
    }
    info!("rescued {frames} frames into {}", dest.display());
    Ok(())
}

/// Full deferred encode: last-frame duplication, fps computation, claim of
/// the output name, hardware path, then the two ffmpeg tiers. Returns the
/// output path. The temp directory is left for the caller to delete.
fn encode_session(
    cfg: &TimelapseConfig,
    venc_device: &str,
    temp_dir: &Path,
    base_name: &str,
    mut frames: u32,
    fixed_out_name: Option<String>,
) -> Result<PathBuf> {
    anyhow::ensure!(frames > 0, "no frames to encode");

    // Optional tail-hold: duplicate the last frame by file copy.
    if cfg.duplicate_last_frames > 0 {
        let last = temp_dir.join(format!("{FRAME_PREFIX}{:04}.jpg", frames - 1));
        for _ in 0..cfg.duplicate_last_frames {
            let next = temp_dir.join(format!("{FRAME_PREFIX}{frames:04}.jpg"));
            if fs::copy(&last, &next).is_err() {
                break;
            }
            frames += 1;
        }
    }

    let fps = compute_output_fps(cfg, frames);
    let out_dir = PathBuf::from(cfg.output_dir());
    fs::create_dir_all(&out_dir)?;

    let out_stem = match fixed_out_name {
        Some(name) => name,
        None => {
            // Claim the sequence number atomically so two finalizes can
            // never pick the same NN.
            let mut nn = find_next_sequence(&out_dir, base_name);
            loop {
                let candidate = out_dir.join(format!("{base_name}_{nn:02}.mp4"));
                match fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&candidate)
                {
                    Ok(_) => break format!("{base_name}_{nn:02}"),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => nn += 1,
                    Err(e) => return Err(e).context("claiming output name"),
                }
            }
        }
    };
    let out_path = out_dir.join(format!("{out_stem}.mp4"));

    let hw = encode_with_venc(cfg, venc_device, temp_dir, frames, fps, &out_path);
    if let Err(e) = hw {
        warn!("hardware time-lapse encode failed ({e:#}), trying ffmpeg");
        let filter = flip_filter(cfg.flip_x, cfg.flip_y);
        let args = ffmpeg_args(fps, temp_dir, filter, cfg.crf, &out_path, false);
        if !run_ffmpeg(&args)? {
            warn!("libx264 fallback failed, trying permissive codec");
            let args = ffmpeg_args(fps, temp_dir, filter, cfg.crf, &out_path, true);
            anyhow::ensure!(run_ffmpeg(&args)?, "all encoder paths failed");
        }
    }

    // Thumbnail mirror: last temp frame copied beside the MP4.
    let last = temp_dir.join(format!("{FRAME_PREFIX}{:04}.jpg", frames - 1));
    let thumb = out_dir.join(format!("{out_stem}_{frames}.jpg"));
    if let Err(e) = fs::copy(&last, &thumb) {
        warn!("thumbnail copy failed: {e}");
    }
    Ok(out_path)
}

fn run_ffmpeg(args: &[String]) -> Result<bool> {
    debug!("ffmpeg {}", args.join(" "));
    match Command::new("ffmpeg").args(args).status() {
        Ok(status) => Ok(status.success()),
        Err(e) => {
            warn!("ffmpeg launch failed: {e}");
            Ok(false)
        }
    }
}

/// Preferred path: decode each JPEG, feed the hardware encoder at the
/// first frame's dimensions, mux the Annex-B output into an MP4.
fn encode_with_venc(
    cfg: &TimelapseConfig,
    venc_device: &str,
    temp_dir: &Path,
    frames: u32,
    fps: u32,
    out_path: &Path,
) -> Result<()> {
    let dev = Device::with_path(venc_device).context("opening encoder device")?;

    let first = read_frame_rgb(temp_dir, 0, cfg)?;
    let (width, height) = (first.1, first.2);
    let mut session = VencSession::init(&dev, width, height, 4000, fps)?;

    let mut sps: Option<Vec<u8>> = None;
    let mut pps: Option<Vec<u8>> = None;
    let mut samples: Vec<(Vec<u8>, bool)> = Vec::with_capacity(frames as usize);

    for i in 0..frames {
        let (rgb, w, h) = if i == 0 {
            first.clone()
        } else {
            match read_frame_rgb(temp_dir, i, cfg) {
                Ok(f) => f,
                Err(e) => {
                    warn!("frame {i:04} unreadable, skipping: {e:#}");
                    continue;
                }
            }
        };
        let nv12 = rgb_to_nv12_scaled(&rgb, w, h, width, height);
        let nals = session.encode(&nv12)?;
        let mut bodies: Vec<&[u8]> = Vec::new();
        let mut keyframe = false;
        for nal in &nals {
            match nal.nal_type {
                h264::NAL_SPS => sps = Some(nal.data.clone()),
                h264::NAL_PPS => pps = Some(nal.data.clone()),
                h264::NAL_IDR => {
                    keyframe = true;
                    bodies.push(&nal.data);
                }
                h264::NAL_SLICE | h264::NAL_SEI => bodies.push(&nal.data),
                _ => {}
            }
        }
        if !bodies.is_empty() {
            samples.push((h264::to_avcc(&bodies), keyframe));
        }
    }

    let sps = sps.ok_or_else(|| anyhow!("encoder produced no SPS"))?;
    let pps = pps.ok_or_else(|| anyhow!("encoder produced no PPS"))?;
    anyhow::ensure!(!samples.is_empty(), "encoder produced no samples");

    let rt = Runtime::new()?;
    rt.block_on(async {
        let file = tokio::fs::File::create(out_path).await?;
        let mut writer = Mp4Writer::new(file, sps, pps, width, height, fps).await?;
        for (avcc, keyframe) in &samples {
            writer.write_sample(avcc, *keyframe).await?;
        }
        writer.finish().await?;
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

fn read_frame_rgb(
    temp_dir: &Path,
    index: u32,
    cfg: &TimelapseConfig,
) -> Result<(Vec<u8>, u32, u32)> {
    let path = temp_dir.join(format!("{FRAME_PREFIX}{index:04}.jpg"));
    let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    anyhow::ensure!(validate_jpeg(&raw), "{}: corrupt JPEG", path.display());
    let img = image::load_from_memory(&raw)
        .with_context(|| format!("decoding {}", path.display()))?
        .to_rgb8();
    let (w, h) = (img.width(), img.height());
    let mut rgb = img.into_raw();
    if cfg.flip_x || cfg.flip_y {
        flip_rgb(&mut rgb, w as usize, h as usize, cfg.flip_x, cfg.flip_y);
    }
    Ok((rgb, w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_strips_extension_and_path() {
        assert_eq!(base_name_for("Test_PLA_0.2.gcode"), "Test_PLA_0.2");
        assert_eq!(base_name_for("/sd/jobs/benchy.gcode"), "benchy");
        assert_eq!(base_name_for("weird name;rm.gcode"), "weird_name_rm");
        assert_eq!(base_name_for(""), "print");
    }

    #[test]
    fn next_sequence_over_existing_outputs() {
        let dir = std::env::temp_dir().join("printcam_tl_seq");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        assert_eq!(find_next_sequence(&dir, "Test_PLA_0.2"), 1);

        fs::write(dir.join("Test_PLA_0.2_01.mp4"), b"x").unwrap();
        fs::write(dir.join("Test_PLA_0.2_03.mp4"), b"x").unwrap();
        // Thumbnails and other prints do not count.
        fs::write(dir.join("Test_PLA_0.2_01_10.jpg"), b"x").unwrap();
        fs::write(dir.join("Other_01.mp4"), b"x").unwrap();
        assert_eq!(find_next_sequence(&dir, "Test_PLA_0.2"), 4);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn output_fps_fixed_and_variable() {
        let mut cfg = TimelapseConfig::default();
        cfg.output_fps = 24;
        assert_eq!(compute_output_fps(&cfg, 1000), 24);

        cfg.variable_fps = true;
        cfg.variable_fps_min = 10;
        cfg.variable_fps_max = 60;
        cfg.target_length = 10;
        assert_eq!(compute_output_fps(&cfg, 300), 30);
        assert_eq!(compute_output_fps(&cfg, 20), 10); // clamped up
        assert_eq!(compute_output_fps(&cfg, 6000), 60); // clamped down
    }

    #[test]
    fn ffmpeg_argv_shape() {
        let args = ffmpeg_args(
            30,
            Path::new("/tmp/t_1"),
            "hflip,vflip",
            23,
            Path::new("/tmp/out.mp4"),
            false,
        );
        let expect: Vec<String> = [
            "-y",
            "-framerate",
            "30",
            "-i",
            "/tmp/t_1/frame_%04d.jpg",
            "-vf",
            "hflip,vflip",
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-x264-params",
            "keyint=30:min-keyint=10:scenecut=0:bframes=0:ref=1:rc-lookahead=0:threads=1",
            "-crf",
            "23",
            "-pix_fmt",
            "yuv420p",
            "/tmp/out.mp4",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expect);

        let fallback = ffmpeg_args(30, Path::new("/tmp/t_1"), "", 23, Path::new("/tmp/o.mp4"), true);
        assert_eq!(
            fallback,
            ["-y", "-framerate", "30", "-i", "/tmp/t_1/frame_%04d.jpg", "-c:v", "mpeg4", "-q:v", "5", "/tmp/o.mp4"]
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn flip_filter_forms() {
        assert_eq!(flip_filter(false, false), "");
        assert_eq!(flip_filter(true, false), "hflip");
        assert_eq!(flip_filter(false, true), "vflip");
        assert_eq!(flip_filter(true, true), "hflip,vflip");
    }

    #[test]
    fn flip_rgb_horizontal_and_vertical() {
        // 2x2 image, distinct corner reds.
        let mut rgb = vec![
            1, 0, 0, 2, 0, 0, //
            3, 0, 0, 4, 0, 0,
        ];
        flip_rgb(&mut rgb, 2, 2, true, false);
        assert_eq!(rgb[0], 2);
        assert_eq!(rgb[3], 1);
        flip_rgb(&mut rgb, 2, 2, false, true);
        assert_eq!(rgb[0], 4);
        assert_eq!(rgb[6], 2);
    }

    #[test]
    fn orphan_name_parsing() {
        assert_eq!(
            split_orphan_name(Path::new("/a/Test_PLA_12345")),
            Some(("Test_PLA".to_string(), 12345))
        );
        assert_eq!(split_orphan_name(Path::new("/a/noseparator")), None);
        assert_eq!(split_orphan_name(Path::new("/a/name_notanumber")), None);
    }

    #[test]
    fn contiguous_prefix_counting() {
        let dir = std::env::temp_dir().join("printcam_tl_contig");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        assert_eq!(contiguous_frame_count(&dir), 0);
        for i in [0u32, 1, 2, 4] {
            fs::write(dir.join(format!("frame_{i:04}.jpg")), b"x").unwrap();
        }
        // The gap at 3 ends the prefix.
        assert_eq!(contiguous_frame_count(&dir), 3);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn encode_status_cell_gates() {
        let cell = EncodeStatusCell::new();
        assert!(!cell.busy());
        cell.set(EncodeStatus::Pending);
        assert!(cell.busy());
        cell.set(EncodeStatus::Running);
        assert!(cell.busy());
        cell.set(EncodeStatus::Success);
        assert!(!cell.busy());
    }
}
