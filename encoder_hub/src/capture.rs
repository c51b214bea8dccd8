//! The V4L2 capture pump: one DQBUF/QBUF loop per process feeding the
//! frame bus, the hardware encoder and the fault-detect handoff.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::ConfigState;
use crate::cpu_budget::SkipControl;
use crate::frame_bus::FrameBus;
use crate::h264;
use crate::venc::{self, VencSession, VencShared};
use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use log::{debug, error, info, warn};
use printcam_fault_ai::engine::FaultEngine;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Format, FourCC};

const CAPTURE_BUFFERS: u32 = 4;
const MIN_FRAME_BYTES: usize = 128;
/// Dequeue failures tolerated before the device is closed and reopened.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Clone, Debug)]
pub struct CaptureSettings {
    pub device_path: String,
    pub force_mjpeg: bool,
    /// Resolution ceiling; 0 means take the largest the device offers.
    pub max_width: u32,
    pub max_height: u32,
    /// 0 means the fastest discrete rate at the chosen resolution.
    pub fps_override: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SourceFormat {
    Mjpeg,
    Yuyv,
}

struct Negotiated {
    dev: Device,
    format: SourceFormat,
    width: u32,
    height: u32,
    fps: u32,
}

/// Prefer MJPEG when offered, else YUYV; largest discrete resolution not
/// exceeding the override; fastest discrete rate at that resolution.
fn open_device(settings: &CaptureSettings) -> Result<Negotiated> {
    let dev = Device::with_path(&settings.device_path)
        .with_context(|| format!("opening {}", settings.device_path))?;

    let has_mjpeg = dev
        .enum_formats()?
        .iter()
        .any(|f| f.fourcc == FourCC::new(b"MJPG"));
    let (fourcc, format) = if has_mjpeg || settings.force_mjpeg {
        (FourCC::new(b"MJPG"), SourceFormat::Mjpeg)
    } else {
        (FourCC::new(b"YUYV"), SourceFormat::Yuyv)
    };

    let mut sizes: Vec<(u32, u32)> = Vec::new();
    for size in dev.enum_framesizes(fourcc)? {
        for d in size.size.to_discrete() {
            sizes.push((d.width, d.height));
        }
    }
    anyhow::ensure!(!sizes.is_empty(), "no discrete frame sizes");
    sizes.sort_by_key(|(w, h)| std::cmp::Reverse(u64::from(*w) * u64::from(*h)));
    let (width, height) = sizes
        .iter()
        .copied()
        .find(|(w, h)| {
            (settings.max_width == 0 || *w <= settings.max_width)
                && (settings.max_height == 0 || *h <= settings.max_height)
        })
        .unwrap_or(*sizes.last().unwrap());

    let max_fps = dev
        .enum_frameintervals(fourcc, width, height)?
        .iter()
        .filter_map(|fi| match &fi.interval {
            v4l::frameinterval::FrameIntervalEnum::Discrete(f) if f.numerator > 0 => {
                Some(f.denominator / f.numerator)
            }
            _ => None,
        })
        .max()
        .unwrap_or(30);
    let fps = if settings.fps_override > 0 {
        settings.fps_override.min(max_fps)
    } else {
        max_fps
    };

    let fmt = dev.set_format(&Format::new(width, height, fourcc))?;
    anyhow::ensure!(
        fmt.fourcc == fourcc,
        "device refused {fourcc}, negotiated {}",
        fmt.fourcc
    );
    dev.set_params(&Parameters::with_fps(fps))?;

    info!(
        "capture open: {} {}x{} @{}fps ({})",
        settings.device_path,
        fmt.width,
        fmt.height,
        fps,
        if format == SourceFormat::Mjpeg {
            "MJPEG"
        } else {
            "YUYV"
        }
    );
    Ok(Negotiated {
        dev,
        format,
        width: fmt.width,
        height: fmt.height,
        fps,
    })
}

/// Packed YUYV (Y0 U Y1 V) to RGB, fixed-point BT.601 as elsewhere in the
/// pipeline.
pub fn yuyv_to_rgb(yuyv: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut rgb = vec![0u8; width * height * 3];
    for row in 0..height {
        for pair in 0..width / 2 {
            let src = (row * width + pair * 2) * 2;
            let y0 = i32::from(yuyv[src]);
            let u = i32::from(yuyv[src + 1]) - 128;
            let y1 = i32::from(yuyv[src + 2]);
            let v = i32::from(yuyv[src + 3]) - 128;

            let r_off = (359 * v) >> 8;
            let g_off = (88 * u + 183 * v) >> 8;
            let b_off = (453 * u) >> 8;

            for (i, y) in [(0usize, y0), (1usize, y1)] {
                let dst = (row * width + pair * 2 + i) * 3;
                rgb[dst] = (y + r_off).clamp(0, 255) as u8;
                rgb[dst + 1] = (y - g_off).clamp(0, 255) as u8;
                rgb[dst + 2] = (y + b_off).clamp(0, 255) as u8;
            }
        }
    }
    rgb
}

fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u32) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100) as u8)
        .encode(rgb, width, height, ExtendedColorType::Rgb8)
        .context("JPEG encode")?;
    Ok(out)
}

pub struct CapturePump {
    shared: Arc<PumpShared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

struct PumpShared {
    bus: Arc<FrameBus>,
    config: Arc<ConfigState>,
    skip: Arc<SkipControl>,
    engine: Arc<FaultEngine>,
    venc_shared: Arc<VencShared>,
    venc_device: String,
    running: Arc<AtomicBool>,
    healthy: AtomicBool,
    pending_reconfigure: Mutex<Option<(u32, u32, u32)>>,
    frames_published: AtomicU64,
    observed_fps: Mutex<f32>,
}

impl CapturePump {
    pub fn new(
        bus: Arc<FrameBus>,
        config: Arc<ConfigState>,
        skip: Arc<SkipControl>,
        engine: Arc<FaultEngine>,
        venc_shared: Arc<VencShared>,
        venc_device: String,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            shared: Arc::new(PumpShared {
                bus,
                config,
                skip,
                engine,
                venc_shared,
                venc_device,
                running,
                healthy: AtomicBool::new(true),
                pending_reconfigure: Mutex::new(None),
                frames_published: AtomicU64::new(0),
                observed_fps: Mutex::new(0.0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self, settings: CaptureSettings) {
        let shared = Arc::clone(&self.shared);
        *self.worker.lock().unwrap() = Some(
            thread::Builder::new()
                .name("capture".into())
                .spawn(move || pump_loop(shared, settings))
                .expect("failed to spawn capture thread"),
        );
    }

    /// Takes effect at the next frame boundary.
    pub fn reconfigure(&self, width: u32, height: u32, fps: u32) {
        *self.shared.pending_reconfigure.lock().unwrap() = Some((width, height, fps));
    }

    pub fn healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Relaxed)
    }

    pub fn observed_fps(&self) -> f32 {
        *self.shared.observed_fps.lock().unwrap()
    }

    pub fn frames_published(&self) -> u64 {
        self.shared.frames_published.load(Ordering::Relaxed)
    }

    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Per-frame H.264 path state owned by the pump thread.
struct VencState<'a> {
    session: VencSession<'a>,
    bitrate: u32,
    out_w: u32,
    out_h: u32,
}

fn pump_loop(shared: Arc<PumpShared>, mut settings: CaptureSettings) {
    let mut consecutive_reopen_failures = 0u32;
    while shared.running.load(Ordering::Relaxed) {
        // Fold any pending reconfigure into the open parameters.
        if let Some((w, h, fps)) = shared.pending_reconfigure.lock().unwrap().take() {
            settings.max_width = w;
            settings.max_height = h;
            settings.fps_override = fps;
        }
        let negotiated = match open_device(&settings) {
            Ok(n) => {
                consecutive_reopen_failures = 0;
                n
            }
            Err(e) => {
                consecutive_reopen_failures += 1;
                error!(
                    "capture open failed ({consecutive_reopen_failures} consecutive): {e:#}"
                );
                if consecutive_reopen_failures >= 2 {
                    shared.healthy.store(false, Ordering::SeqCst);
                    error!("capture marked unhealthy, thread exiting");
                    return;
                }
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };
        match run_stream(&shared, &negotiated) {
            StreamExit::Shutdown => return,
            StreamExit::Reconfigure => continue,
            StreamExit::DeviceError => {
                warn!("capture stream failed, reopening device once");
                continue;
            }
        }
    }
}

enum StreamExit {
    Shutdown,
    Reconfigure,
    DeviceError,
}

fn run_stream(shared: &Arc<PumpShared>, negotiated: &Negotiated) -> StreamExit {
    let mut stream =
        match MmapStream::with_buffers(&negotiated.dev, Type::VideoCapture, CAPTURE_BUFFERS) {
            Ok(s) => s,
            Err(e) => {
                error!("capture stream setup failed: {e}");
                return StreamExit::DeviceError;
            }
        };

    // The encoder session lives on this thread; it is rebuilt whenever the
    // H.264 settings change.
    let venc_dev = Device::with_path(&shared.venc_device).ok();
    let mut venc_state: Option<VencState<'_>> = None;

    let mut frame_index: u64 = 0;
    let mut consecutive_failures = 0u32;
    let mut last_jpeg_publish = Instant::now() - Duration::from_secs(1);
    let mut fps_window_start = Instant::now();
    let mut fps_window_frames = 0u32;

    loop {
        if !shared.running.load(Ordering::Relaxed) {
            return StreamExit::Shutdown;
        }
        if shared.pending_reconfigure.lock().unwrap().is_some() {
            return StreamExit::Reconfigure;
        }

        let (buf, meta) = match CaptureStream::next(&mut stream) {
            Ok(pair) => pair,
            Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                continue;
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!("dequeue failed ({consecutive_failures}): {e}");
                if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                    return StreamExit::DeviceError;
                }
                continue;
            }
        };
        consecutive_failures = 0;

        let index = frame_index;
        frame_index += 1;

        // Skip decision happens before any work on the frame.
        let ratio = u64::from(shared.skip.effective());
        if index % ratio != 0 {
            continue;
        }

        let used = (meta.bytesused as usize).min(buf.len());
        if used < MIN_FRAME_BYTES {
            debug!("runt frame ({used} bytes), dropping");
            continue;
        }
        let raw = &buf[..used];
        let cfg = shared.config.get();
        let ts = shared.bus.now_ms();

        // Produce the JPEG for this frame.
        let mut rgb_cache: Option<Vec<u8>> = None;
        let jpeg: Option<Vec<u8>> = match negotiated.format {
            SourceFormat::Mjpeg => Some(raw.to_vec()),
            SourceFormat::Yuyv => {
                let expected = (negotiated.width * negotiated.height * 2) as usize;
                if used < expected {
                    debug!("short YUYV frame ({used} < {expected}), dropping");
                    continue;
                }
                let rgb = yuyv_to_rgb(raw, negotiated.width as usize, negotiated.height as usize);
                let encoded =
                    encode_jpeg(&rgb, negotiated.width, negotiated.height, cfg.jpeg_quality);
                rgb_cache = Some(rgb);
                match encoded {
                    Ok(j) => Some(j),
                    Err(e) => {
                        warn!("JPEG encode failed: {e:#}");
                        None
                    }
                }
            }
        };

        if let Some(ref jpeg) = jpeg {
            // The MJPEG cap bounds the publish rate, not the capture rate.
            let min_gap = Duration::from_millis(1000 / u64::from(cfg.mjpeg_fps.clamp(2, 30)));
            if last_jpeg_publish.elapsed() >= min_gap {
                shared.bus.jpeg.publish(jpeg, ts);
                last_jpeg_publish = Instant::now();
                shared.frames_published.fetch_add(1, Ordering::Relaxed);
                fps_window_frames += 1;
            }

            if shared.engine.wants_frame() {
                shared.bus.fd_source.publish(jpeg, ts);
                shared.engine.deliver_frame();
            }
        }

        // H.264 path: build/tear the session to match config, then encode.
        if let Some(ref dev) = venc_dev {
            let (out_w, out_h) = cfg.h264_resolution.dims();
            let stale = venc_state.as_ref().map_or(false, |s| {
                s.out_w != out_w || s.out_h != out_h || s.bitrate != cfg.h264_bitrate
            });
            if !cfg.h264_enabled || stale {
                venc_state = None;
            }
            if cfg.h264_enabled && venc_state.is_none() {
                match VencSession::init(dev, out_w, out_h, cfg.h264_bitrate, negotiated.fps) {
                    Ok(session) => {
                        shared.venc_shared.set_fps(negotiated.fps);
                        venc_state = Some(VencState {
                            session,
                            bitrate: cfg.h264_bitrate,
                            out_w,
                            out_h,
                        });
                    }
                    Err(e) => warn!("hardware encoder init failed: {e:#}"),
                }
            }

            let mut session_failed = false;
            if let Some(state) = venc_state.as_mut() {
                let rgb = match rgb_cache.take() {
                    Some(rgb) => Some(rgb),
                    None => jpeg.as_deref().and_then(|j| {
                        image::load_from_memory(j)
                            .map(|img| img.to_rgb8().into_raw())
                            .map_err(|e| debug!("MJPEG decode for encoder failed: {e}"))
                            .ok()
                    }),
                };
                if let Some(rgb) = rgb {
                    if shared.venc_shared.take_keyframe_request() {
                        state.session.request_keyframe();
                    }
                    let nv12 = venc::rgb_to_nv12_scaled(
                        &rgb,
                        negotiated.width,
                        negotiated.height,
                        state.out_w,
                        state.out_h,
                    );
                    match state.session.encode(&nv12) {
                        Ok(nals) if !nals.is_empty() => {
                            shared.venc_shared.absorb(&nals, ts);
                            shared.bus.h264.publish(&h264::to_annex_b(&nals), ts);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            // Mid-stream errors invalidate the session; it is
                            // rebuilt with a forced keyframe on the next frame.
                            warn!("hardware encode failed, resetting session: {e:#}");
                            session_failed = true;
                        }
                    }
                }
            }
            if session_failed {
                venc_state = None;
            }
        }

        if fps_window_start.elapsed() >= Duration::from_secs(5) {
            let fps = fps_window_frames as f32 / fps_window_start.elapsed().as_secs_f32();
            *shared.observed_fps.lock().unwrap() = fps;
            fps_window_start = Instant::now();
            fps_window_frames = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuyv_conversion_gray_midpoint() {
        // Y=128, U=V=128 is mid gray: offsets vanish.
        let yuyv = [128u8, 128, 128, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1);
        assert_eq!(rgb.len(), 6);
        for px in rgb {
            assert_eq!(px, 128);
        }
    }

    #[test]
    fn yuyv_conversion_red_push() {
        // V well above bias pushes red up and green down.
        let yuyv = [128u8, 128, 128, 255];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1);
        assert!(rgb[0] > 200, "r={}", rgb[0]);
        assert!(rgb[1] < 100, "g={}", rgb[1]);
    }

    #[test]
    fn jpeg_encoder_emits_markers() {
        let rgb = vec![200u8; 16 * 16 * 3];
        let jpeg = encode_jpeg(&rgb, 16, 16, 80).unwrap();
        assert!(crate::h264::validate_jpeg(&jpeg));
    }

    #[test]
    fn skip_decision_keeps_every_nth() {
        // Mirror of the pump's gate: keep iff index % r == 0.
        let kept: Vec<u64> = (0..10).filter(|i| i % 3 == 0).collect();
        assert_eq!(kept, vec![0, 3, 6, 9]);
    }
}
