//! CPU budget controller: samples total/self/children CPU every two
//! seconds and, when auto-skip is on, steers the effective skip ratio
//! toward the configured target one step per tick.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::ConfigState;
use log::debug;
use serde_derive::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};

pub const TICK: Duration = Duration::from_secs(2);
const HYSTERESIS: f32 = 5.0;
pub const SKIP_RATIO_CEILING: u32 = 10;

/// The per-frame skip divider the capture pump reads. Writers are the
/// config apply path (configured value) and this controller (override).
pub struct SkipControl {
    effective: AtomicU32,
}

impl SkipControl {
    pub fn new(initial: u32) -> Self {
        Self {
            effective: AtomicU32::new(initial.max(1)),
        }
    }

    pub fn effective(&self) -> u32 {
        self.effective.load(Ordering::Relaxed).max(1)
    }

    pub fn set(&self, ratio: u32) {
        self.effective.store(ratio.max(1), Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CpuSample {
    pub total_pct: f32,
    pub self_pct: f32,
    pub children_pct: f32,
    pub effective_skip_ratio: u32,
}

/// One steering step. Above the band: one step up, capped. Below the band
/// with headroom: one step down. Inside the band: hold, so a constant load
/// cannot oscillate by more than one step per tick.
pub fn steer(current: u32, total_cpu: f32, target_cpu: u32) -> u32 {
    let target = target_cpu as f32;
    if total_cpu > target + HYSTERESIS {
        (current + 1).min(SKIP_RATIO_CEILING)
    } else if total_cpu < target - HYSTERESIS && current > 1 {
        current - 1
    } else {
        current
    }
}

/// Lists supervised child pids so their CPU counts toward the budget.
pub type ChildPids = Arc<dyn Fn() -> Vec<u32> + Send + Sync>;

pub struct CpuBudget {
    pub last_sample: Arc<Mutex<CpuSample>>,
}

impl CpuBudget {
    /// Spawns the 2 s sampling thread.
    pub fn start(
        config: Arc<ConfigState>,
        skip: Arc<SkipControl>,
        child_pids: ChildPids,
        running: Arc<AtomicBool>,
    ) -> Self {
        let last_sample = Arc::new(Mutex::new(CpuSample::default()));
        let sample_out = Arc::clone(&last_sample);
        thread::Builder::new()
            .name("cpu-budget".into())
            .spawn(move || {
                let mut sys = System::new();
                let self_pid = Pid::from_u32(std::process::id());
                while running.load(Ordering::Relaxed) {
                    thread::sleep(TICK);
                    sys.refresh_cpu_usage();
                    sys.refresh_processes(ProcessesToUpdate::All, true);

                    let total = sys.global_cpu_usage();
                    let self_pct = sys
                        .process(self_pid)
                        .map(|p| p.cpu_usage())
                        .unwrap_or(0.0);
                    let children_pct: f32 = child_pids()
                        .iter()
                        .filter_map(|pid| sys.process(Pid::from_u32(*pid)))
                        .map(|p| p.cpu_usage())
                        .sum();

                    let cfg = config.get();
                    let current = skip.effective();
                    let next = if cfg.auto_skip {
                        steer(current, total, cfg.target_cpu)
                    } else {
                        cfg.skip_ratio
                    };
                    if next != current {
                        debug!(
                            "skip ratio {current} -> {next} (cpu {total:.1}% target {}%)",
                            cfg.target_cpu
                        );
                        skip.set(next);
                    }

                    *sample_out.lock().unwrap() = CpuSample {
                        total_pct: total,
                        self_pct,
                        children_pct,
                        effective_skip_ratio: skip.effective(),
                    };
                }
            })
            .expect("failed to spawn cpu-budget thread");
        Self { last_sample }
    }

    pub fn sample(&self) -> CpuSample {
        *self.last_sample.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steer_steps_up_above_band() {
        assert_eq!(steer(1, 80.0, 60), 2);
        assert_eq!(steer(SKIP_RATIO_CEILING, 99.0, 60), SKIP_RATIO_CEILING);
    }

    #[test]
    fn steer_steps_down_below_band() {
        assert_eq!(steer(3, 40.0, 60), 2);
        assert_eq!(steer(1, 10.0, 60), 1);
    }

    #[test]
    fn steer_holds_inside_hysteresis() {
        for cpu in [56.0, 60.0, 64.9] {
            assert_eq!(steer(4, cpu, 60), 4);
        }
    }

    #[test]
    fn steer_converges_without_oscillation() {
        // Constant load above the band: ratio climbs one per tick to the
        // ceiling and stays there.
        let mut ratio = 1;
        let mut last = ratio;
        for _ in 0..20 {
            let next = steer(ratio, 95.0, 60);
            assert!(next.abs_diff(last) <= 1);
            last = next;
            ratio = next;
        }
        assert_eq!(ratio, SKIP_RATIO_CEILING);
        // Then constant low load: walks back down to 1 and holds.
        for _ in 0..20 {
            ratio = steer(ratio, 20.0, 60);
        }
        assert_eq!(ratio, 1);
        assert_eq!(steer(ratio, 20.0, 60), 1);
    }

    #[test]
    fn skip_control_floors_at_one() {
        let s = SkipControl::new(0);
        assert_eq!(s.effective(), 1);
        s.set(0);
        assert_eq!(s.effective(), 1);
        s.set(7);
        assert_eq!(s.effective(), 7);
    }
}
