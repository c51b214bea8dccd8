//! Print-event hook: consumes start / layer-change / stop events from the
//! upstream print-state source (external; events arrive over a channel)
//! and drives the time-lapse recorder and the fault-detect Z cell.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::{ConfigState, TimelapseMode};
use crate::timelapse::TimelapseRecorder;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use printcam_fault_ai::engine::FaultEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum PrintEvent {
    Start { name: String },
    LayerChange { current: u32, total: u32, z_mm: f32 },
    Stop { reason: String },
}

/// Out-of-order guard: a layer lower than the last observed is ignored.
/// Reset on print start.
struct LayerTracker {
    last: u32,
}

impl LayerTracker {
    fn new() -> Self {
        Self { last: 0 }
    }

    fn reset(&mut self) {
        self.last = 0;
    }

    fn observe(&mut self, current: u32) -> bool {
        if current < self.last {
            return false;
        }
        self.last = current;
        true
    }
}

pub fn spawn(
    events: Receiver<PrintEvent>,
    recorder: Arc<TimelapseRecorder>,
    engine: Arc<FaultEngine>,
    config: Arc<ConfigState>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("print-events".into())
        .spawn(move || {
            let mut tracker = LayerTracker::new();
            let mut hyper_ticker_up = false;
            while running.load(Ordering::Relaxed) {
                let event = match events.recv_timeout(Duration::from_millis(500)) {
                    Ok(ev) => ev,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                match event {
                    PrintEvent::Start { name } => {
                        info!("print start: {name}");
                        tracker.reset();
                        hyper_ticker_up = false;
                        recorder.start_session(&name, true);
                    }
                    PrintEvent::LayerChange { current, total, z_mm } => {
                        if !tracker.observe(current) {
                            debug!("out-of-order layer {current} ignored");
                            continue;
                        }
                        engine.set_current_z(z_mm);
                        debug!("layer {current}/{total} at z={z_mm:.2}");
                        let tl = config.get().timelapse;
                        match tl.mode {
                            TimelapseMode::Layer => {
                                if current > 1 && recorder.session_active() {
                                    if tl.stream_delay_s > 0 {
                                        thread::sleep(Duration::from_secs(u64::from(
                                            tl.stream_delay_s,
                                        )));
                                    }
                                    let _ = recorder.capture_frame();
                                }
                            }
                            TimelapseMode::Hyperlapse => {
                                if !hyper_ticker_up && recorder.session_active() {
                                    hyper_ticker_up = true;
                                    spawn_hyperlapse_ticker(
                                        Arc::clone(&recorder),
                                        Arc::clone(&config),
                                        Arc::clone(&running),
                                    );
                                }
                            }
                        }
                    }
                    PrintEvent::Stop { reason } => {
                        info!("print end: {reason}");
                        hyper_ticker_up = false;
                        recorder.finalize(&reason);
                        recorder.release_custom_mode();
                    }
                }
            }
        })
        .expect("failed to spawn print-events thread")
}

/// Captures every `hyperlapse_interval_s` between the first layer and the
/// end of the print; exits with the session.
fn spawn_hyperlapse_ticker(
    recorder: Arc<TimelapseRecorder>,
    config: Arc<ConfigState>,
    running: Arc<AtomicBool>,
) {
    thread::Builder::new()
        .name("tl-hyperlapse".into())
        .spawn(move || {
            while running.load(Ordering::Relaxed) && recorder.session_active() {
                let _ = recorder.capture_frame();
                let interval = config.get().timelapse.hyperlapse_interval_s.max(1);
                for _ in 0..interval * 2 {
                    if !running.load(Ordering::Relaxed) || !recorder.session_active() {
                        return;
                    }
                    thread::sleep(Duration::from_millis(500));
                }
            }
        })
        .expect("failed to spawn hyperlapse ticker");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_tracker_ignores_regressions() {
        let mut t = LayerTracker::new();
        assert!(t.observe(1));
        assert!(t.observe(2));
        assert!(t.observe(2)); // repeats are in order
        assert!(!t.observe(1));
        assert!(t.observe(5));
        assert!(!t.observe(4));
        t.reset();
        assert!(t.observe(1));
    }
}
