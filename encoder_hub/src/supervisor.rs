//! Multi-camera supervision: one child encoder process per enabled
//! secondary camera, reaped and restarted from a single tick thread.
//! No signal-based coordination: the tick polls child status and drives
//! SIGTERM/SIGKILL directly.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::camera::CameraDescriptor;
use crate::config::ConfigState;
use log::{error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(2);
/// An exit this soon after start counts toward the restart storm.
const EARLY_EXIT_WINDOW: Duration = Duration::from_secs(10);
const STORM_WINDOW: Duration = Duration::from_secs(300);
const STORM_LIMIT: usize = 5;
const TERM_GRACE: Duration = Duration::from_secs(3);

/// Early-exit restart bookkeeping over the storm window.
pub(crate) struct RestartWindow {
    events: VecDeque<Instant>,
}

impl RestartWindow {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    fn record(&mut self, at: Instant) {
        self.events.push_back(at);
    }

    fn stormy(&mut self, now: Instant) -> bool {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > STORM_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len() > STORM_LIMIT
    }
}

struct ManagedChild {
    camera_id: u8,
    child: Option<Child>,
    last_start: Option<Instant>,
    restarts: RestartWindow,
}

pub struct Supervisor {
    config: Arc<ConfigState>,
    cameras: Arc<Mutex<Vec<CameraDescriptor>>>,
    children: Mutex<HashMap<u8, ManagedChild>>,
    running: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        config: Arc<ConfigState>,
        cameras: Arc<Mutex<Vec<CameraDescriptor>>>,
        running: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cameras,
            children: Mutex::new(HashMap::new()),
            running,
        })
    }

    /// Current child pids, for the CPU budget sampler.
    pub fn child_pids(&self) -> Vec<u32> {
        self.children
            .lock()
            .unwrap()
            .values()
            .filter_map(|c| c.child.as_ref().map(Child::id))
            .collect()
    }

    pub fn enable_camera(&self, camera_id: u8) -> Result<(), String> {
        let mut cameras = self.cameras.lock().unwrap();
        let cam = cameras
            .iter_mut()
            .find(|c| c.camera_id == camera_id)
            .ok_or_else(|| format!("unknown camera {camera_id}"))?;
        if cam.is_primary {
            return Err("primary camera is always running".to_string());
        }
        cam.enabled = true;
        cam.error = None;
        let _ = self
            .config
            .update(|c| drop(c.camera_enabled.insert(camera_id, true)));
        info!("camera {camera_id} enabled");
        Ok(())
    }

    pub fn disable_camera(&self, camera_id: u8) -> Result<(), String> {
        {
            let mut cameras = self.cameras.lock().unwrap();
            let cam = cameras
                .iter_mut()
                .find(|c| c.camera_id == camera_id)
                .ok_or_else(|| format!("unknown camera {camera_id}"))?;
            if cam.is_primary {
                return Err("primary camera cannot be disabled".to_string());
            }
            cam.enabled = false;
        }
        let _ = self
            .config
            .update(|c| drop(c.camera_enabled.insert(camera_id, false)));
        self.teardown_child(camera_id);
        info!("camera {camera_id} disabled");
        Ok(())
    }

    /// SIGTERM, bounded grace, then SIGKILL.
    fn teardown_child(&self, camera_id: u8) {
        let mut children = self.children.lock().unwrap();
        let Some(managed) = children.get_mut(&camera_id) else {
            return;
        };
        let Some(mut child) = managed.child.take() else {
            return;
        };
        let pid = child.id() as i32;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        let deadline = Instant::now() + TERM_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(100))
                }
                _ => break,
            }
        }
        warn!("camera {camera_id} child {pid} ignored SIGTERM, killing");
        let _ = child.kill();
        let _ = child.wait();
    }

    fn spawn_child(&self, cam: &CameraDescriptor) -> std::io::Result<Child> {
        let cfg = self.config.get();
        let exe = std::env::current_exe()?;
        let mut cmd = Command::new(exe);
        cmd.arg("--camera-id")
            .arg(cam.camera_id.to_string())
            .arg("--device")
            .arg(&cam.device_path)
            .arg("--streaming-port")
            .arg(cam.streaming_port.to_string());
        if let Some(ovr) = cfg.camera_overrides.get(&cam.camera_id) {
            if ovr.width > 0 && ovr.height > 0 {
                cmd.arg("--width")
                    .arg(ovr.width.to_string())
                    .arg("--height")
                    .arg(ovr.height.to_string());
            }
            if ovr.fps > 0 {
                cmd.arg("--fps").arg(ovr.fps.to_string());
            }
            if ovr.force_mjpeg {
                cmd.arg("--force-mjpeg");
            }
        }
        cmd.spawn()
    }

    /// One supervision pass: reap, damp restart storms, (re)spawn.
    pub fn tick(&self) {
        let enabled: Vec<CameraDescriptor> = self
            .cameras
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.is_primary && c.enabled)
            .cloned()
            .collect();

        let mut children = self.children.lock().unwrap();

        // Reap exits and classify early deaths.
        let now = Instant::now();
        for managed in children.values_mut() {
            let Some(child) = managed.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    let early = managed
                        .last_start
                        .map_or(false, |t| now.duration_since(t) <= EARLY_EXIT_WINDOW);
                    warn!(
                        "camera {} child exited ({status}){}",
                        managed.camera_id,
                        if early { " early" } else { "" }
                    );
                    managed.child = None;
                    if early {
                        managed.restarts.record(now);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("reaping camera {} child: {e}", managed.camera_id);
                    managed.child = None;
                }
            }
        }

        // Spawn whatever should run and is not running.
        for cam in &enabled {
            let managed = children.entry(cam.camera_id).or_insert_with(|| ManagedChild {
                camera_id: cam.camera_id,
                child: None,
                last_start: None,
                restarts: RestartWindow::new(),
            });
            if managed.child.is_some() {
                continue;
            }
            if managed.restarts.stormy(now) {
                let reason = "restart storm: disabled after repeated early exits";
                error!("camera {}: {reason}", cam.camera_id);
                let mut cameras = self.cameras.lock().unwrap();
                if let Some(c) = cameras.iter_mut().find(|c| c.camera_id == cam.camera_id) {
                    c.enabled = false;
                    c.error = Some(reason.to_string());
                }
                continue;
            }
            match self.spawn_child(cam) {
                Ok(child) => {
                    info!(
                        "camera {} child started (pid {})",
                        cam.camera_id,
                        child.id()
                    );
                    managed.last_start = Some(Instant::now());
                    managed.child = Some(child);
                }
                Err(e) => error!("camera {} spawn failed: {e}", cam.camera_id),
            }
        }
    }

    /// Spawns the tick thread.
    pub fn start(self: &Arc<Self>) {
        let sup = Arc::clone(self);
        thread::Builder::new()
            .name("supervisor".into())
            .spawn(move || {
                while sup.running.load(Ordering::Relaxed) {
                    sup.tick();
                    thread::sleep(TICK);
                }
                sup.shutdown_children();
            })
            .expect("failed to spawn supervisor thread");
    }

    pub fn shutdown_children(&self) {
        let ids: Vec<u8> = self.children.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.teardown_child(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storm_detection_needs_six_in_window() {
        let now = Instant::now();
        let mut w = RestartWindow::new();
        for i in 0..5 {
            w.record(now - Duration::from_secs(60 - i));
        }
        assert!(!w.stormy(now));
        w.record(now);
        assert!(w.stormy(now));
    }

    #[test]
    fn storm_window_expires_old_events() {
        let now = Instant::now();
        let mut w = RestartWindow::new();
        for _ in 0..6 {
            w.record(now - STORM_WINDOW - Duration::from_secs(1));
        }
        assert!(!w.stormy(now));
        // Fresh burst counts again.
        for _ in 0..6 {
            w.record(now);
        }
        assert!(w.stormy(now));
    }
}
