//! The fault-detect worker. One dedicated thread owns the accelerator
//! sessions and the large scratch buffers; everything the rest of the
//! process touches goes through the small locked sections here.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::{FaultDetectConfig, Strategy};
use crate::heads::{tensor_from_rgb, ModelSet};
use crate::heatmap::{self, HEATMAP_FLOOR, STRONG_CELLS_MIN};
use crate::preprocess;
use crate::result::{
    BoostInfo, FaultDetectResult, FaultLabel, HeadScores, HeatmapInfo, Verdict,
};
use crate::zmask::{CellMask, ZMaskTable};
use crate::{FaultError, PrinterSignals};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use sysinfo::System;

/// Returns true while the time-lapse encoder owns the contiguous-memory
/// arena; cycles are skipped for as long as it does.
pub type EncodeGate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Fills the caller's buffer with the latest fault-detect source JPEG and
/// returns `(seq, ts_ms)`, or `None` before the first publish.
pub type FrameSnapshot = Arc<dyn Fn(&mut Vec<u8>) -> Option<(u64, u64)> + Send + Sync>;

const FRAME_WAIT: Duration = Duration::from_secs(3);
const ALLOC_RETRY_BACKOFF: Duration = Duration::from_millis(200);
const BUZZER_COOLDOWN: Duration = Duration::from_secs(15);
const LED_FORCE_PERIOD: Duration = Duration::from_secs(300);
const LED_QUERY_PERIOD: Duration = Duration::from_secs(60);
const LED_SETTLE: Duration = Duration::from_secs(3);
/// Consecutive ok cycles needed to leave the short verify interval.
const VERIFY_EXIT_OK_CYCLES: u32 = 3;

/// Pending-frame handoff between the capture pump and the worker.
pub struct FrameHandoff {
    state: Mutex<HandoffState>,
    cond: Condvar,
}

#[derive(Default)]
struct HandoffState {
    need_frame: bool,
    delivered: bool,
}

impl FrameHandoff {
    fn new() -> Self {
        Self {
            state: Mutex::new(HandoffState::default()),
            cond: Condvar::new(),
        }
    }

    /// Worker side: post the request and wait for delivery, bounded.
    fn request_and_wait(&self, timeout: Duration, running: &AtomicBool) -> bool {
        let mut st = self.state.lock().unwrap();
        st.need_frame = true;
        st.delivered = false;
        let deadline = Instant::now() + timeout;
        while !st.delivered && running.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self.cond.wait_timeout(st, deadline - now).unwrap();
            st = guard;
        }
        st.need_frame = false;
        let got = st.delivered;
        st.delivered = false;
        got
    }

    /// Pump side: whether the worker is waiting on a frame.
    pub fn wants_frame(&self) -> bool {
        self.state.lock().unwrap().need_frame
    }

    /// Pump side: the fd source slot now holds a fresh frame.
    pub fn deliver(&self) {
        let mut st = self.state.lock().unwrap();
        if st.need_frame {
            st.need_frame = false;
            st.delivered = true;
            self.cond.notify_all();
        }
    }

    fn wake(&self) {
        self.cond.notify_all();
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub enabled: bool,
    pub running: bool,
    pub no_npu: bool,
    pub cycles: u64,
    pub skipped: u64,
    pub last_skip_reason: Option<String>,
    pub model_load_failures: u64,
    pub verify_mode: bool,
}

struct EngineState {
    no_npu: bool,
    last_result: Option<FaultDetectResult>,
    cycles: u64,
    skipped: u64,
    last_skip_reason: Option<&'static str>,
    model_load_failures: u64,
    verify_mode: bool,
    consecutive_ok: u32,
    last_buzz: Option<Instant>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            no_npu: false,
            last_result: None,
            cycles: 0,
            skipped: 0,
            last_skip_reason: None,
            model_load_failures: 0,
            verify_mode: false,
            consecutive_ok: 0,
            last_buzz: None,
        }
    }
}

/// Config plus the Z table it guards; `generation` bumps on every apply so
/// the worker knows when to reload models and reset smoothing.
struct ConfigCell {
    cfg: FaultDetectConfig,
    zmask: ZMaskTable,
    generation: u64,
}

struct EngineInner {
    config: Mutex<ConfigCell>,
    state: Mutex<EngineState>,
    handoff: FrameHandoff,
    current_z: Mutex<f32>,
    running: AtomicBool,
    sleeper: (Mutex<()>, Condvar),
    signals: Arc<dyn PrinterSignals>,
    encode_gate: EncodeGate,
    snapshot: FrameSnapshot,
}

pub struct FaultEngine {
    inner: Arc<EngineInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FaultEngine {
    pub fn new(
        cfg: FaultDetectConfig,
        zmask: ZMaskTable,
        signals: Arc<dyn PrinterSignals>,
        encode_gate: EncodeGate,
        snapshot: FrameSnapshot,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config: Mutex::new(ConfigCell {
                    cfg,
                    zmask,
                    generation: 0,
                }),
                state: Mutex::new(EngineState::new()),
                handoff: FrameHandoff::new(),
                current_z: Mutex::new(0.0),
                running: AtomicBool::new(false),
                sleeper: (Mutex::new(()), Condvar::new()),
                signals,
                encode_gate,
                snapshot,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker if fault-detect is enabled and a model set is
    /// installed. Returns whether a worker is running afterwards.
    pub fn start(&self) -> bool {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_some() {
            return true;
        }
        {
            let cell = self.inner.config.lock().unwrap();
            if !cell.cfg.enabled || cell.cfg.model_dir.is_empty() {
                return false;
            }
        }
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        *worker = Some(
            thread::Builder::new()
                .name("fault-detect".into())
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn fault-detect worker"),
        );
        true
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.sleeper.1.notify_all();
        self.inner.handoff.wake();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Swap in a new configuration and Z table; takes effect on the next
    /// cycle (EMA state and models reload). Starts or stops the worker to
    /// match the enabled flag.
    pub fn apply_config(&self, cfg: FaultDetectConfig, zmask: ZMaskTable) {
        let enable = cfg.enabled && !cfg.model_dir.is_empty();
        {
            let mut cell = self.inner.config.lock().unwrap();
            cell.cfg = cfg;
            cell.zmask = zmask;
            cell.generation += 1;
        }
        if enable {
            self.start();
        } else {
            self.stop();
        }
    }

    pub fn set_current_z(&self, z_mm: f32) {
        *self.inner.current_z.lock().unwrap() = z_mm;
    }

    pub fn wants_frame(&self) -> bool {
        self.inner.handoff.wants_frame()
    }

    pub fn deliver_frame(&self) {
        self.inner.handoff.deliver()
    }

    pub fn latest_result(&self) -> Option<FaultDetectResult> {
        self.inner.state.lock().unwrap().last_result.clone()
    }

    pub fn status(&self) -> EngineStatus {
        let enabled = self.inner.config.lock().unwrap().cfg.enabled;
        let st = self.inner.state.lock().unwrap();
        EngineStatus {
            enabled,
            running: self.inner.running.load(Ordering::Relaxed),
            no_npu: st.no_npu,
            cycles: st.cycles,
            skipped: st.skipped,
            last_skip_reason: st.last_skip_reason.map(str::to_string),
            model_load_failures: st.model_load_failures,
            verify_mode: st.verify_mode,
        }
    }
}

impl Drop for FaultEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn skip_cycle(inner: &EngineInner, reason: &'static str) {
    let mut st = inner.state.lock().unwrap();
    st.skipped += 1;
    st.last_skip_reason = Some(reason);
    debug!("fault-detect cycle skipped: {reason}");
}

fn sleep_interruptible(inner: &EngineInner, dur: Duration) {
    let guard = inner.sleeper.0.lock().unwrap();
    if inner.running.load(Ordering::Relaxed) {
        let _ = inner.sleeper.1.wait_timeout(guard, dur).unwrap();
    }
}

/// One retry after a short backoff for arena exhaustion; other errors pass
/// through.
fn with_alloc_retry<T>(
    mut f: impl FnMut() -> Result<T, FaultError>,
) -> Result<T, FaultError> {
    match f() {
        Err(FaultError::NpuAlloc) => {
            warn!("NPU arena exhausted; retrying once after {:?}", ALLOC_RETRY_BACKOFF);
            thread::sleep(ALLOC_RETRY_BACKOFF);
            f()
        }
        other => other,
    }
}

struct LedState {
    last_forced: Option<Instant>,
    last_query: Option<Instant>,
}

fn led_keepalive(inner: &EngineInner, led: &mut LedState) {
    let now = Instant::now();
    if led.last_forced.map_or(true, |t| now - t >= LED_FORCE_PERIOD) {
        inner.signals.lamp_on();
        led.last_forced = Some(now);
        led.last_query = Some(now);
        return;
    }
    if led.last_query.map_or(true, |t| now - t >= LED_QUERY_PERIOD) {
        led.last_query = Some(now);
        if inner.signals.lamp_state() == Some(false) {
            inner.signals.lamp_on();
            // Let camera exposure settle before sampling a frame.
            thread::sleep(LED_SETTLE);
        }
    }
}

fn worker_loop(inner: Arc<EngineInner>) {
    if let Err(e) = crate::heads::init_runtime() {
        error!("fault-detect disabled, {e}");
        inner.state.lock().unwrap().no_npu = true;
        return;
    }
    info!("fault-detect worker started");

    let mut models: Option<ModelSet> = None;
    let mut model_generation = u64::MAX;
    let mut sys = System::new();
    let mut led = LedState {
        last_forced: None,
        last_query: None,
    };

    while inner.running.load(Ordering::Relaxed) {
        let (interval_s, verify_interval_s) = {
            let cell = inner.config.lock().unwrap();
            (cell.cfg.interval_s, cell.cfg.verify_interval_s)
        };
        let interval = if inner.state.lock().unwrap().verify_mode {
            verify_interval_s
        } else {
            interval_s
        };
        sleep_interruptible(&inner, Duration::from_secs(u64::from(interval.max(1))));
        if !inner.running.load(Ordering::Relaxed) {
            break;
        }

        let (cfg, generation) = {
            let cell = inner.config.lock().unwrap();
            (cell.cfg.clone(), cell.generation)
        };
        if !cfg.enabled {
            continue;
        }

        // VENC and the NPU share one contiguous arena.
        if (inner.encode_gate)() {
            skip_cycle(&inner, "timelapse_encode_in_progress");
            continue;
        }

        sys.refresh_memory();
        let avail_mb = sys.available_memory() / (1024 * 1024);
        if avail_mb < cfg.min_free_mem_mb {
            skip_cycle(&inner, "low_memory");
            continue;
        }

        led_keepalive(&inner, &mut led);

        if model_generation != generation || models.is_none() {
            match ModelSet::load(&cfg) {
                Ok(mut set) => {
                    set.reset_smoothing();
                    models = Some(set);
                    model_generation = generation;
                }
                Err(e) => {
                    let mut st = inner.state.lock().unwrap();
                    st.model_load_failures += 1;
                    st.skipped += 1;
                    st.last_skip_reason = Some("model_load");
                    warn!("model load failed: {e}");
                    continue;
                }
            }
        }

        if !inner.handoff.request_and_wait(FRAME_WAIT, &inner.running) {
            skip_cycle(&inner, "frame_timeout");
            continue;
        }
        let mut jpeg = Vec::new();
        if (inner.snapshot)(&mut jpeg).is_none() {
            skip_cycle(&inner, "no_frame");
            continue;
        }

        let t_cycle = Instant::now();
        let set = models.as_mut().unwrap();
        match run_cycle(&inner, set, &cfg, jpeg, t_cycle) {
            Ok(result) => publish(&inner, &cfg, result),
            Err(FaultError::NpuAlloc) => skip_cycle(&inner, "npu_alloc"),
            Err(FaultError::FrameCorrupt(e)) => {
                debug!("fault-detect frame rejected: {e}");
                skip_cycle(&inner, "frame_corrupt");
            }
            Err(e) => {
                warn!("fault-detect cycle error: {e}");
                skip_cycle(&inner, "inference_error");
            }
        }
    }
    info!("fault-detect worker stopped");
}

/// Scores and thresholds for one cycle, separated from the engine so the
/// combination rules stay testable without sessions.
pub(crate) struct CycleScores {
    pub cnn: HeadScores,
    pub proto: HeadScores,
    pub mc: HeadScores,
    pub cnn_thr: f32,
    pub proto_thr: f32,
    pub mc_thr: f32,
}

impl CycleScores {
    fn cnn_fault(&self) -> bool {
        self.cnn.running && self.cnn.likelihood >= self.cnn_thr
    }
    fn proto_fault(&self) -> bool {
        self.proto.running && self.proto.likelihood >= self.proto_thr
    }
    fn mc_fault(&self) -> bool {
        self.mc.running && self.mc.likelihood >= self.mc_thr
    }
    fn leaning(s: &HeadScores, thr: f32) -> bool {
        s.running && s.likelihood > 0.5 * thr
    }
    fn cnn_leaning(&self) -> bool {
        Self::leaning(&self.cnn, self.cnn_thr)
    }
    fn proto_leaning(&self) -> bool {
        Self::leaning(&self.proto, self.proto_thr)
    }
    fn mc_leaning(&self) -> bool {
        Self::leaning(&self.mc, self.mc_thr)
    }
    fn any_leaning(&self) -> bool {
        self.cnn_leaning() || self.proto_leaning() || self.mc_leaning()
    }
    fn any_above(&self) -> bool {
        self.cnn_fault() || self.proto_fault() || self.mc_fault()
    }
}

/// The heads whose likelihoods enter the combined confidence.
pub(crate) fn active_likelihoods(strategy: Strategy, s: &CycleScores) -> Vec<f32> {
    let mut lks = Vec::new();
    let voters: &[&HeadScores] = match strategy {
        Strategy::Cnn => &[&s.cnn],
        Strategy::Protonet => &[&s.proto],
        Strategy::Multiclass => &[&s.mc],
        Strategy::And | Strategy::Classify | Strategy::ClassifyAnd => &[&s.cnn, &s.proto],
        _ => &[&s.cnn, &s.proto, &s.mc],
    };
    for v in voters {
        if v.running {
            lks.push(v.likelihood);
        }
    }
    lks
}

/// Verdict combination. For `verify` the multiclass head has already been
/// run (or not) by the caller; a missing multiclass falls back to the
/// disjunction it was meant to confirm.
pub(crate) fn combine(strategy: Strategy, s: &CycleScores) -> Verdict {
    let fault = match strategy {
        Strategy::Or => s.cnn_fault() || s.proto_fault() || s.mc_fault(),
        Strategy::And => s.cnn_fault() && s.proto_fault(),
        Strategy::All => {
            let mut all = true;
            let mut any_running = false;
            for (running, flag) in [
                (s.cnn.running, s.cnn_fault()),
                (s.proto.running, s.proto_fault()),
                (s.mc.running, s.mc_fault()),
            ] {
                if running {
                    any_running = true;
                    all &= flag;
                }
            }
            any_running && all
        }
        Strategy::Majority => {
            let mut n_active = 0u32;
            let mut n_fault = 0u32;
            for (running, flag) in [
                (s.cnn.running, s.cnn_fault()),
                (s.proto.running, s.proto_fault()),
                (s.mc.running, s.mc_fault()),
            ] {
                if running {
                    n_active += 1;
                    if flag {
                        n_fault += 1;
                    }
                }
            }
            2 * n_fault > n_active
        }
        Strategy::Verify => {
            if s.cnn_fault() || s.proto_fault() {
                if s.mc.running {
                    s.mc_fault()
                } else {
                    true
                }
            } else {
                false
            }
        }
        Strategy::Classify => s.cnn_fault() || s.proto_fault(),
        Strategy::ClassifyAnd => s.cnn_fault() && s.proto_fault(),
        Strategy::Cnn => s.cnn_fault(),
        Strategy::Protonet => s.proto_fault(),
        Strategy::Multiclass => s.mc_fault(),
    };
    if fault {
        Verdict::Fault
    } else {
        Verdict::Ok
    }
}

/// Confidence semantics follow the verdict: mean fault-likelihood of the
/// active heads for `fault`, its complement for `ok`.
pub(crate) fn confidence_for(verdict: Verdict, lks: &[f32]) -> f32 {
    if lks.is_empty() {
        return 0.0;
    }
    let mean = lks.iter().sum::<f32>() / lks.len() as f32;
    match verdict {
        Verdict::Fault => mean,
        Verdict::Ok => 1.0 - mean,
    }
}

/// Strategy-aware corroboration for the second boost path.
pub(crate) fn boost_corroborated(strategy: Strategy, s: &CycleScores) -> bool {
    match strategy {
        Strategy::Or | Strategy::Classify => s.any_leaning(),
        Strategy::Majority | Strategy::Verify => s.any_above(),
        Strategy::And | Strategy::ClassifyAnd => s.cnn_fault() && s.proto_leaning(),
        Strategy::All => s.cnn_fault() && s.proto_fault(),
        Strategy::Cnn => s.cnn_leaning(),
        Strategy::Protonet => s.proto_leaning(),
        Strategy::Multiclass => s.mc_leaning(),
    }
}

/// Whether the heatmap overrides an `ok` verdict. Never demotes: callers
/// only consult this when the pre-boost verdict is `ok`.
pub(crate) fn boost_overrides(
    strategy: Strategy,
    s: &CycleScores,
    max_value: f32,
    strong_cells: u32,
    boost_threshold: f32,
) -> bool {
    if strong_cells < STRONG_CELLS_MIN {
        return false;
    }
    let heatmap_only = max_value > boost_threshold && s.any_leaning();
    heatmap_only || boost_corroborated(strategy, s)
}

#[allow(clippy::too_many_lines)]
fn run_cycle(
    inner: &EngineInner,
    set: &mut ModelSet,
    cfg: &FaultDetectConfig,
    jpeg: Vec<u8>,
    t_cycle: Instant,
) -> Result<FaultDetectResult, FaultError> {
    let (rgb, crop) = preprocess::prepare(&jpeg)?;
    let chw = tensor_from_rgb(&rgb);

    let strategy = cfg.strategy;
    let want_cnn = !matches!(strategy, Strategy::Protonet | Strategy::Multiclass);
    let want_proto = !matches!(strategy, Strategy::Cnn | Strategy::Multiclass);
    // Voting member for the disjunction-family strategies, labeling-only for
    // the and/classify family, deferred for verify.
    let want_mc_now = matches!(
        strategy,
        Strategy::Or
            | Strategy::All
            | Strategy::Majority
            | Strategy::Multiclass
            | Strategy::And
            | Strategy::Classify
            | Strategy::ClassifyAnd
    );

    let mut cnn_s = HeadScores::default();
    if want_cnn {
        if let Some(cnn) = set.cnn.as_mut() {
            let (prob, ms) = with_alloc_retry(|| cnn.run(chw.clone()))?;
            cnn_s = HeadScores {
                running: true,
                raw: prob,
                likelihood: prob,
                infer_ms: ms,
            };
        }
    }

    let mut proto_s = HeadScores::default();
    if want_proto {
        if let Some(proto) = set.protonet.as_mut() {
            let (margin, ms) = with_alloc_retry(|| proto.run(chw.clone()))?;
            proto_s = HeadScores {
                running: true,
                raw: margin,
                likelihood: (margin + 1.0) / 2.0,
                infer_ms: ms,
            };
        }
    }

    // Dynamic CNN threshold: a strongly-leaning ProtoNet lowers the CNN bar
    // unless the strategy requires conjunction.
    let mut cnn_thr = cfg.cnn_threshold;
    if proto_s.running
        && proto_s.likelihood >= cfg.proto_dynamic_trigger
        && !strategy.is_conjunctive()
    {
        debug!(
            "dynamic CNN threshold {} -> {}",
            cfg.cnn_threshold, cfg.cnn_dynamic_threshold
        );
        cnn_thr = cfg.cnn_dynamic_threshold;
    }

    let mut mc_s = HeadScores::default();
    let mut label = FaultLabel::Success;
    let mut run_mc = |set: &mut ModelSet,
                      mc_s: &mut HeadScores,
                      label: &mut FaultLabel|
     -> Result<(), FaultError> {
        if let Some(mc) = set.multiclass.as_mut() {
            let (raw, l, ms) = with_alloc_retry(|| mc.run(chw.clone()))?;
            *mc_s = HeadScores {
                running: true,
                raw,
                likelihood: raw,
                infer_ms: ms,
            };
            *label = l;
        }
        Ok(())
    };

    if want_mc_now {
        run_mc(set, &mut mc_s, &mut label)?;
    }

    let mut scores = CycleScores {
        cnn: cnn_s,
        proto: proto_s,
        mc: mc_s,
        cnn_thr,
        proto_thr: cfg.protonet_threshold,
        mc_thr: cfg.multiclass_threshold,
    };

    // Verify: multiclass only confirms an existing suspicion.
    if strategy == Strategy::Verify && (scores.cnn_fault() || scores.proto_fault()) {
        run_mc(set, &mut scores.mc, &mut label)?;
    }

    let mut verdict = combine(strategy, &scores);
    let mut confidence = confidence_for(verdict, &active_likelihoods(strategy, &scores));

    // Spatial heatmap: run the grid head first (its borrow of the model
    // set must end before a post-boost multiclass run).
    let mut heatmap_out: Option<HeatmapInfo> = None;
    let mut boost = BoostInfo::default();
    if cfg.heatmap_enabled {
        let grid = match set.spatial.as_mut() {
            Some(spatial) => {
                let dims = (spatial.protos.rows, spatial.protos.cols);
                match with_alloc_retry(|| spatial.run(chw.clone())) {
                    Ok((cells, _ms)) => Some((cells, dims.0, dims.1)),
                    Err(e) => {
                        warn!("spatial head failed: {e}");
                        None
                    }
                }
            }
            None => None,
        };
        if let Some((cells, rows, cols)) = grid {
            let mask: CellMask = {
                let z = *inner.current_z.lock().unwrap();
                let cell = inner.config.lock().unwrap();
                *cell.zmask.mask_for_z(z)
            };
            let info = heatmap::heatmap_info(cells, rows, cols, &mask);
            if info.max_value > HEATMAP_FLOOR {
                let (strong, total) = heatmap::count_strong(&info, &mask);
                boost = BoostInfo {
                    active: true,
                    overrode: false,
                    strong_cells: strong,
                    total_cells: total,
                };
                if verdict == Verdict::Ok
                    && boost_overrides(
                        strategy,
                        &scores,
                        info.max_value,
                        strong,
                        cfg.heatmap_boost_threshold,
                    )
                {
                    verdict = Verdict::Fault;
                    boost.overrode = true;
                    // Post-boost labeling run, only while the arena is not
                    // owned by a time-lapse encode.
                    if !scores.mc.running && !(inner.encode_gate)() {
                        run_mc(set, &mut scores.mc, &mut label)?;
                    }
                    confidence = if scores.mc.running {
                        scores.mc.likelihood
                    } else {
                        scores.cnn.likelihood.max(scores.proto.likelihood)
                    }
                    .max(0.50);
                }
            }
            heatmap_out = Some(info);
        }
    }

    let cycle = inner.state.lock().unwrap().cycles + 1;
    Ok(FaultDetectResult {
        verdict,
        confidence,
        label,
        cnn: scores.cnn,
        protonet: scores.proto,
        multiclass: scores.mc,
        total_ms: t_cycle.elapsed().as_secs_f32() * 1000.0,
        heatmap: heatmap_out,
        boost,
        crop,
        cycle,
        ts_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
    })
}

fn publish(inner: &EngineInner, cfg: &FaultDetectConfig, result: FaultDetectResult) {
    let fault = result.verdict == Verdict::Fault;
    {
        let mut st = inner.state.lock().unwrap();
        st.cycles += 1;
        st.last_skip_reason = None;
        if fault {
            st.verify_mode = true;
            st.consecutive_ok = 0;
        } else if st.verify_mode {
            st.consecutive_ok += 1;
            if st.consecutive_ok >= VERIFY_EXIT_OK_CYCLES {
                st.verify_mode = false;
                st.consecutive_ok = 0;
            }
        }
        if fault {
            let cooled = st
                .last_buzz
                .map_or(true, |t| t.elapsed() >= BUZZER_COOLDOWN);
            if cfg.buzzer_enabled && cooled {
                inner.signals.buzzer(&cfg.buzzer_pattern);
                st.last_buzz = Some(Instant::now());
            }
        }
        st.last_result = Some(result);
    }
    if fault {
        info!("fault-detect verdict: fault");
    } else {
        debug!("fault-detect verdict: ok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(running: bool, lk: f32) -> HeadScores {
        HeadScores {
            running,
            raw: lk,
            likelihood: lk,
            infer_ms: 1.0,
        }
    }

    fn scores(cnn: Option<f32>, proto: Option<f32>, mc: Option<f32>) -> CycleScores {
        CycleScores {
            cnn: head(cnn.is_some(), cnn.unwrap_or(0.0)),
            proto: head(proto.is_some(), proto.unwrap_or(0.0)),
            mc: head(mc.is_some(), mc.unwrap_or(0.0)),
            cnn_thr: 0.50,
            proto_thr: 0.50,
            mc_thr: 0.81,
        }
    }

    #[test]
    fn and_requires_both_heads() {
        let both = scores(Some(0.9), Some(0.8), None);
        assert_eq!(combine(Strategy::And, &both), Verdict::Fault);
        let only_cnn = scores(Some(0.9), Some(0.2), None);
        assert_eq!(combine(Strategy::And, &only_cnn), Verdict::Ok);
        let only_proto = scores(Some(0.2), Some(0.9), None);
        assert_eq!(combine(Strategy::And, &only_proto), Verdict::Ok);
    }

    #[test]
    fn majority_scenario_from_three_heads() {
        // CNN 0.72 (fault), ProtoNet 0.40 (ok), Multiclass 0.75 < 0.81 (ok).
        let s = scores(Some(0.72), Some(0.40), Some(0.75));
        let verdict = combine(Strategy::Majority, &s);
        assert_eq!(verdict, Verdict::Ok);
        let conf = confidence_for(verdict, &active_likelihoods(Strategy::Majority, &s));
        assert!((conf - (1.0 - (0.72 + 0.40 + 0.75) / 3.0)).abs() < 1e-5);
        assert!((conf - 0.3766).abs() < 1e-3);
    }

    #[test]
    fn or_flags_on_any_head() {
        let s = scores(Some(0.1), Some(0.2), Some(0.9));
        assert_eq!(combine(Strategy::Or, &s), Verdict::Fault);
        let s = scores(Some(0.1), Some(0.2), Some(0.5));
        assert_eq!(combine(Strategy::Or, &s), Verdict::Ok);
    }

    #[test]
    fn classify_ignores_multiclass_vote() {
        // Multiclass screaming fault must not flip classify.
        let s = scores(Some(0.1), Some(0.2), Some(0.99));
        assert_eq!(combine(Strategy::Classify, &s), Verdict::Ok);
        let s = scores(Some(0.8), Some(0.2), None);
        assert_eq!(combine(Strategy::Classify, &s), Verdict::Fault);
    }

    #[test]
    fn verify_accepts_multiclass_verdict() {
        // Suspicion raised, multiclass denies it.
        let s = scores(Some(0.9), Some(0.1), Some(0.3));
        assert_eq!(combine(Strategy::Verify, &s), Verdict::Ok);
        // Suspicion raised, multiclass confirms.
        let s = scores(Some(0.9), Some(0.1), Some(0.9));
        assert_eq!(combine(Strategy::Verify, &s), Verdict::Fault);
        // No suspicion: multiclass never consulted.
        let s = scores(Some(0.1), Some(0.1), None);
        assert_eq!(combine(Strategy::Verify, &s), Verdict::Ok);
    }

    #[test]
    fn all_requires_every_running_head() {
        let s = scores(Some(0.9), Some(0.9), Some(0.9));
        assert_eq!(combine(Strategy::All, &s), Verdict::Fault);
        let s = scores(Some(0.9), Some(0.9), Some(0.5));
        assert_eq!(combine(Strategy::All, &s), Verdict::Ok);
        // Heads that did not run are not counted against `all`.
        let s = scores(Some(0.9), None, None);
        assert_eq!(combine(Strategy::All, &s), Verdict::Fault);
    }

    #[test]
    fn single_head_strategies() {
        assert_eq!(
            combine(Strategy::Cnn, &scores(Some(0.6), None, None)),
            Verdict::Fault
        );
        assert_eq!(
            combine(Strategy::Protonet, &scores(None, Some(0.4), None)),
            Verdict::Ok
        );
        assert_eq!(
            combine(Strategy::Multiclass, &scores(None, None, Some(0.9))),
            Verdict::Fault
        );
    }

    #[test]
    fn boost_requires_strong_cells() {
        // Example: all heads ok, heatmap 1.72, 7 strong cells, CNN leaning.
        let s = scores(Some(0.30), Some(0.10), Some(0.10));
        assert!(boost_overrides(Strategy::Or, &s, 1.72, 7, 0.80));
        // Two strong cells are not enough on either path.
        assert!(!boost_overrides(Strategy::Or, &s, 1.72, 2, 0.80));
    }

    #[test]
    fn boost_heatmap_only_path_needs_leaning_head() {
        // Nothing leaning: heatmap alone cannot override.
        let cold = scores(Some(0.05), Some(0.05), Some(0.05));
        assert!(!boost_overrides(Strategy::Or, &cold, 1.72, 7, 0.80));
    }

    #[test]
    fn boost_strategy_aware_corroboration() {
        // and: CNN above plus ProtoNet leaning.
        let s = scores(Some(0.60), Some(0.30), None);
        assert!(boost_corroborated(Strategy::And, &s));
        let s = scores(Some(0.60), Some(0.10), None);
        assert!(!boost_corroborated(Strategy::And, &s));
        // majority: needs a head above threshold, leaning is not enough.
        let s = scores(Some(0.30), Some(0.30), Some(0.30));
        assert!(!boost_corroborated(Strategy::Majority, &s));
        let s = scores(Some(0.60), Some(0.30), Some(0.30));
        assert!(boost_corroborated(Strategy::Majority, &s));
        // all: both CNN and ProtoNet above.
        let s = scores(Some(0.60), Some(0.60), None);
        assert!(boost_corroborated(Strategy::All, &s));
        let s = scores(Some(0.60), Some(0.40), None);
        assert!(!boost_corroborated(Strategy::All, &s));
    }

    #[test]
    fn confidence_follows_verdict() {
        let lks = [0.8, 0.6];
        assert!((confidence_for(Verdict::Fault, &lks) - 0.7).abs() < 1e-6);
        assert!((confidence_for(Verdict::Ok, &lks) - 0.3).abs() < 1e-6);
        assert_eq!(confidence_for(Verdict::Ok, &[]), 0.0);
    }

    #[test]
    fn handoff_times_out_without_delivery() {
        let handoff = FrameHandoff::new();
        let running = AtomicBool::new(true);
        let t0 = Instant::now();
        assert!(!handoff.request_and_wait(Duration::from_millis(50), &running));
        assert!(t0.elapsed() >= Duration::from_millis(50));
        assert!(!handoff.wants_frame());
    }

    #[test]
    fn handoff_delivery_wakes_waiter() {
        let handoff = Arc::new(FrameHandoff::new());
        let running = Arc::new(AtomicBool::new(true));
        let h = Arc::clone(&handoff);
        let pump = thread::spawn(move || {
            // Poll like the capture loop does, then deliver.
            for _ in 0..100 {
                if h.wants_frame() {
                    h.deliver();
                    return true;
                }
                thread::sleep(Duration::from_millis(5));
            }
            false
        });
        let got = handoff.request_and_wait(Duration::from_secs(3), &running);
        assert!(got);
        assert!(pump.join().unwrap());
    }
}
