//! Printcam encoder hub: captures USB camera frames on a networked 3D
//! printer, serves MJPEG and FLV streams, records print time-lapses and
//! runs on-device fault detection on the SoC accelerator.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

#[macro_use]
extern crate log;

use anyhow::{bail, Context, Result};
use docopt::Docopt;
use serde_derive::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::sleep;
use std::time::Duration;

mod camera;
mod capture;
mod config;
mod control_server;
mod cpu_budget;
mod flv;
mod frame_bus;
mod h264;
mod http;
mod moonraker;
mod mp4;
mod print_events;
mod stream_server;
mod supervisor;
mod timelapse;
mod venc;

use crate::camera::CameraDescriptor;
use crate::capture::{CapturePump, CaptureSettings};
use crate::config::{ConfigState, EncoderConfig};
use crate::control_server::ControlDeps;
use crate::cpu_budget::{CpuBudget, SkipControl};
use crate::frame_bus::FrameBus;
use crate::moonraker::{local_ip, MoonrakerClient};
use crate::stream_server::StreamServer;
use crate::supervisor::Supervisor;
use crate::timelapse::TimelapseRecorder;
use crate::venc::VencShared;
use printcam_fault_ai::engine::FaultEngine;
use printcam_fault_ai::PrinterSignals;

const USAGE: &str = "
Printcam encoder hub: camera encoder and print-supervision daemon for a networked 3D printer.

Usage:
  printcam-encoder-hub [--config=<path>]
  printcam-encoder-hub --camera-id=<id> --device=<dev> --streaming-port=<port> [--width=<px>] [--height=<px>] [--fps=<fps>] [--force-mjpeg] [--config=<path>]
  printcam-encoder-hub (--version | -v)
  printcam-encoder-hub (--help | -h)

Options:
    --config=<path>          Config file path [default: /useremain/app/gk/printcam.json]
    --camera-id=<id>         Run as the encoder for one secondary camera
    --device=<dev>           V4L2 device of the secondary camera
    --streaming-port=<port>  Streaming port of the secondary camera
    --width=<px>             Capture width ceiling override
    --height=<px>            Capture height ceiling override
    --fps=<fps>              Capture rate override
    --force-mjpeg            Force the MJPEG capture format
    --version, -v            Show version
    --help, -h               Show help
";

#[derive(Debug, Clone, Deserialize)]
struct Args {
    flag_config: String,
    flag_camera_id: Option<u8>,
    flag_device: Option<String>,
    flag_streaming_port: Option<u16>,
    flag_width: Option<u32>,
    flag_height: Option<u32>,
    flag_fps: Option<u32>,
    flag_force_mjpeg: bool,
}

static RUNNING: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    if let Some(flag) = RUNNING.get() {
        flag.store(false, Ordering::SeqCst);
    }
}

/// The MQTT broker that owns the printer LED and buzzer is an external
/// collaborator; its absence degrades these to logged intents.
struct BrokerSignals;

impl PrinterSignals for BrokerSignals {
    fn lamp_on(&self) {
        info!("printer lamp on requested");
    }

    fn lamp_off(&self) {
        info!("printer lamp off requested");
    }

    fn lamp_state(&self) -> Option<bool> {
        None
    }

    fn buzzer(&self, pattern: &str) {
        info!("printer buzzer requested (pattern {pattern})");
    }
}

fn template_dir() -> PathBuf {
    let candidates = [
        PathBuf::from("templates"),
        PathBuf::from("/useremain/app/gk/templates"),
    ];
    for c in &candidates {
        if c.is_dir() {
            return c.clone();
        }
    }
    // Fall back beside the binary.
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("templates")))
        .unwrap_or_else(|| PathBuf::from("templates"))
}

fn main() -> Result<()> {
    let version = env!("CARGO_PKG_NAME").to_string() + ", version: " + env!("CARGO_PKG_VERSION");
    env_logger::init();

    let args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .map(|d| d.version(Some(version)))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let running = Arc::new(AtomicBool::new(true));
    let _ = RUNNING.set(Arc::clone(&running));
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }

    let config_path = PathBuf::from(&args.flag_config);
    let cfg = match EncoderConfig::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("config unreadable ({e:#}), starting from defaults");
            let cfg = EncoderConfig::default();
            if let Err(e) = cfg.save(&config_path) {
                warn!("could not write default config: {e:#}");
            }
            cfg
        }
    };
    let config = Arc::new(ConfigState::new(cfg, config_path));

    if args.flag_camera_id.is_some() {
        run_child(&args, config, running)
    } else {
        run_primary(config, running)
    }
}

/// Secondary-camera mode: capture and streaming only, supervised by the
/// primary process.
fn run_child(args: &Args, config: Arc<ConfigState>, running: Arc<AtomicBool>) -> Result<()> {
    let camera_id = args.flag_camera_id.unwrap();
    let device = args
        .flag_device
        .clone()
        .context("--device required with --camera-id")?;
    let port = args
        .flag_streaming_port
        .context("--streaming-port required with --camera-id")?;
    info!("secondary camera {camera_id} on {device}, port {port}");

    let bus = Arc::new(FrameBus::new());
    let skip = Arc::new(SkipControl::new(config.get().skip_ratio));
    let venc_shared = Arc::new(VencShared::new());

    // The engine never starts in child mode; the pump only consults its
    // frame handoff, which stays idle.
    let engine = Arc::new(FaultEngine::new(
        printcam_fault_ai::config::FaultDetectConfig::default(),
        printcam_fault_ai::zmask::ZMaskTable::new(printcam_fault_ai::zmask::CellMask::all()),
        Arc::new(BrokerSignals),
        Arc::new(|| false),
        Arc::new(|_out: &mut Vec<u8>| -> Option<(u64, u64)> { None }),
    ));

    let pump = Arc::new(CapturePump::new(
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&skip),
        Arc::clone(&engine),
        Arc::clone(&venc_shared),
        venc::DEFAULT_VENC_DEVICE.to_string(),
        Arc::clone(&running),
    ));
    pump.start(CaptureSettings {
        device_path: device,
        force_mjpeg: args.flag_force_mjpeg,
        max_width: args.flag_width.unwrap_or(0),
        max_height: args.flag_height.unwrap_or(0),
        fps_override: args.flag_fps.unwrap_or(0),
    });

    let server = StreamServer::new(
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&venc_shared),
        Arc::clone(&running),
    );
    server
        .start(port)
        .with_context(|| format!("binding streaming port {port}"))?;

    while running.load(Ordering::Relaxed) {
        if !pump.healthy() {
            running.store(false, Ordering::SeqCst);
            bail!("capture device lost");
        }
        sleep(Duration::from_millis(500));
    }
    pump.join();
    Ok(())
}

fn run_primary(config: Arc<ConfigState>, running: Arc<AtomicBool>) -> Result<()> {
    let cfg = config.get();

    // Camera discovery happens once; the set is stable for the process.
    let mut discovered = camera::discover(&cfg.primary_usb_port);
    if discovered.is_empty() {
        bail!("no usable cameras found");
    }
    for cam in discovered.iter_mut() {
        if let Some(enabled) = cfg.camera_enabled.get(&cam.camera_id) {
            if !cam.is_primary && cam.camera_id != 1 {
                cam.enabled = *enabled;
            }
        }
    }
    let primary: CameraDescriptor = discovered[0].clone();
    let cameras = Arc::new(Mutex::new(discovered));

    let bus = Arc::new(FrameBus::new());
    let skip = Arc::new(SkipControl::new(cfg.skip_ratio));
    let venc_shared = Arc::new(VencShared::new());
    let signals: Arc<dyn PrinterSignals> = Arc::new(BrokerSignals);

    let recorder = Arc::new(TimelapseRecorder::new(
        Arc::clone(&bus),
        Arc::clone(&config),
        venc::DEFAULT_VENC_DEVICE.to_string(),
    ));
    recorder.spawn_orphan_recovery();

    // Fault-detect engine: gated by the time-lapse encode status, fed from
    // the fd_source slot.
    let encode_status = Arc::clone(&recorder.encode_status);
    let snapshot_bus = Arc::clone(&bus);
    let fd_table = cfg
        .fault_detect
        .zmask_table()
        .map_err(|e| anyhow::anyhow!("fault-detect mask table: {e}"))?;
    let engine = Arc::new(FaultEngine::new(
        cfg.fault_detect.clone(),
        fd_table,
        Arc::clone(&signals),
        Arc::new(move || encode_status.busy()),
        Arc::new(move |out: &mut Vec<u8>| snapshot_bus.fd_source.snapshot(out)),
    ));
    engine.start();

    let pump = Arc::new(CapturePump::new(
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&skip),
        Arc::clone(&engine),
        Arc::clone(&venc_shared),
        venc::DEFAULT_VENC_DEVICE.to_string(),
        Arc::clone(&running),
    ));
    pump.start(CaptureSettings {
        device_path: primary.device_path.clone(),
        force_mjpeg: false,
        max_width: cfg.capture_max_width,
        max_height: cfg.capture_max_height,
        fps_override: 0,
    });
    if let Err(e) = camera::apply_controls(&primary.device_path, &cfg.controls) {
        warn!("initial camera controls not applied: {e}");
    }

    let stream = StreamServer::new(
        Arc::clone(&bus),
        Arc::clone(&config),
        Arc::clone(&venc_shared),
        Arc::clone(&running),
    );
    stream
        .start(primary.streaming_port)
        .with_context(|| format!("binding streaming port {}", primary.streaming_port))?;

    let supervisor = Supervisor::new(
        Arc::clone(&config),
        Arc::clone(&cameras),
        Arc::clone(&running),
    );
    supervisor.start();

    let sup_for_pids = Arc::clone(&supervisor);
    let cpu = CpuBudget::start(
        Arc::clone(&config),
        Arc::clone(&skip),
        Arc::new(move || sup_for_pids.child_pids()),
        Arc::clone(&running),
    );

    // Print events arrive over a channel from the external print-state
    // source; the sender half is handed to that integration.
    let (print_tx, print_rx) = crossbeam_channel::unbounded::<print_events::PrintEvent>();
    let _print_hook = print_events::spawn(
        print_rx,
        Arc::clone(&recorder),
        Arc::clone(&engine),
        Arc::clone(&config),
        Arc::clone(&running),
    );

    // Config changes reconfigure the moving parts at their next safe
    // boundary.
    {
        let skip = Arc::clone(&skip);
        let pump = Arc::clone(&pump);
        let primary_dev = primary.device_path.clone();
        config.on_change(Box::new(move |cfg| {
            if !cfg.auto_skip {
                skip.set(cfg.skip_ratio);
            }
            pump.reconfigure(cfg.capture_max_width, cfg.capture_max_height, 0);
            if let Err(e) = camera::apply_controls(&primary_dev, &cfg.controls) {
                warn!("camera controls not applied: {e}");
            }
        }));
    }

    let moonraker = Arc::new(MoonrakerClient::new(cfg.moonraker_host.clone()));
    let restart_flag = Arc::clone(&running);
    let deps = ControlDeps {
        config: Arc::clone(&config),
        bus: Arc::clone(&bus),
        cameras: Arc::clone(&cameras),
        recorder: Arc::clone(&recorder),
        engine: Arc::clone(&engine),
        stream: Arc::clone(&stream),
        supervisor: Some(Arc::clone(&supervisor)),
        pump: Arc::clone(&pump),
        cpu: Arc::clone(&cpu.last_sample),
        signals: Arc::clone(&signals),
        touch: Arc::new(|x, y, duration_ms| {
            info!("touch injection requested: ({x},{y}) for {duration_ms} ms");
            true
        }),
        restart: Arc::new(move || {
            info!("restart requested via control surface");
            restart_flag.store(false, Ordering::SeqCst);
        }),
        moonraker: Arc::clone(&moonraker),
        template_dir: template_dir(),
        running: Arc::clone(&running),
    };
    control_server::start(deps, cfg.control_port)
        .with_context(|| format!("binding control port {}", cfg.control_port))?;

    if let Some(ip) = local_ip() {
        moonraker.provision_cameras(&ip, &cameras.lock().unwrap());
    }

    info!("printcam up: streaming {}, control {}", primary.streaming_port, cfg.control_port);

    let mut exit: Result<()> = Ok(());
    while running.load(Ordering::Relaxed) {
        if !pump.healthy() {
            error!("primary capture failed, shutting down");
            running.store(false, Ordering::SeqCst);
            exit = Err(anyhow::anyhow!("primary capture device lost"));
            break;
        }
        sleep(Duration::from_millis(500));
    }

    // Shutdown: stop accepting, stop the engine, join the pump, terminate
    // children; hardware releases with the pump thread's encoder session.
    running.store(false, Ordering::SeqCst);
    engine.stop();
    pump.join();
    supervisor.shutdown_children();
    drop(print_tx);
    info!("shutdown complete");
    exit
}
