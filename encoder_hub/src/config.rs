//! Process-wide configuration: one serde record behind one lock, loaded
//! from and persisted to a single JSON file. "Apply" swaps the staged value
//! under the lock and fires the change callback outside it.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context, Result};
use printcam_fault_ai::config::FaultDetectConfig;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const DEFAULT_CONFIG_PATH: &str = "/useremain/app/gk/printcam.json";

/// Closed set of hardware H.264 output sizes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum H264Resolution {
    #[serde(rename = "1280x720")]
    R1280x720,
    #[serde(rename = "960x540")]
    R960x540,
    #[serde(rename = "640x360")]
    R640x360,
}

impl H264Resolution {
    pub fn dims(self) -> (u32, u32) {
        match self {
            H264Resolution::R1280x720 => (1280, 720),
            H264Resolution::R960x540 => (960, 540),
            H264Resolution::R640x360 => (640, 360),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1280x720" => Some(Self::R1280x720),
            "960x540" => Some(Self::R960x540),
            "640x360" => Some(Self::R640x360),
            _ => None,
        }
    }
}

/// UVC image controls pushed to the capture device. Unset controls are left
/// at the driver's current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraControls {
    pub brightness: Option<i32>,
    pub contrast: Option<i32>,
    pub saturation: Option<i32>,
    pub hue: Option<i32>,
    pub gamma: Option<i32>,
    pub sharpness: Option<i32>,
    pub gain: Option<i32>,
    pub backlight: Option<i32>,
    pub white_balance_auto: Option<bool>,
    pub white_balance_temp: Option<i32>,
    /// 1 = manual, 3 = aperture-priority auto.
    pub exposure_auto: Option<i32>,
    pub exposure: Option<i32>,
    pub exposure_priority: Option<i32>,
    /// 0 = off, 1 = 50 Hz, 2 = 60 Hz.
    pub power_line: Option<i32>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelapseMode {
    Layer,
    Hyperlapse,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimelapseStorage {
    Internal,
    Usb,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelapseConfig {
    pub mode: TimelapseMode,
    pub hyperlapse_interval_s: u32,
    pub storage: TimelapseStorage,
    pub internal_path: String,
    pub usb_path: String,
    pub output_fps: u32,
    pub variable_fps: bool,
    pub variable_fps_min: u32,
    pub variable_fps_max: u32,
    /// Target clip length in seconds for variable fps.
    pub target_length: u32,
    pub crf: u32,
    pub duplicate_last_frames: u32,
    pub stream_delay_s: u32,
    pub end_delay_s: u32,
    pub flip_x: bool,
    pub flip_y: bool,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            mode: TimelapseMode::Layer,
            hyperlapse_interval_s: 10,
            storage: TimelapseStorage::Internal,
            internal_path: "/useremain/app/gk/Time-lapse".to_string(),
            usb_path: "/mnt/udisk".to_string(),
            output_fps: 30,
            variable_fps: false,
            variable_fps_min: 10,
            variable_fps_max: 60,
            target_length: 10,
            crf: 23,
            duplicate_last_frames: 0,
            stream_delay_s: 0,
            end_delay_s: 0,
            flip_x: false,
            flip_y: false,
        }
    }
}

impl TimelapseConfig {
    /// Directory the session writes its final MP4 into.
    pub fn output_dir(&self) -> &str {
        match self.storage {
            TimelapseStorage::Internal => &self.internal_path,
            TimelapseStorage::Usb => &self.usb_path,
        }
    }
}

/// Per-camera capture overrides used for supervised child processes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOverride {
    pub width: u32,
    pub height: u32,
    pub force_mjpeg: bool,
    pub fps: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub streaming_port: u16,
    pub control_port: u16,

    pub h264_enabled: bool,
    pub h264_resolution: H264Resolution,
    /// kbps, 100..4000.
    pub h264_bitrate: u32,

    /// MJPEG frame cap, 2..30.
    pub mjpeg_fps: u32,
    pub jpeg_quality: u32,

    /// Integer capture-rate divider, >= 1.
    pub skip_ratio: u32,
    pub auto_skip: bool,
    /// Target total CPU percentage for auto skip, 25..90.
    pub target_cpu: u32,

    pub display_enabled: bool,
    /// On-device display refresh, 1..10.
    pub display_fps: u32,

    /// Optional capture resolution ceiling, 0 = largest the device offers.
    pub capture_max_width: u32,
    pub capture_max_height: u32,

    /// sysfs port path of the internal (primary) USB camera connector.
    pub primary_usb_port: String,

    pub controls: CameraControls,
    /// Per-camera enable flags and overrides, keyed by camera id.
    pub camera_enabled: BTreeMap<u8, bool>,
    pub camera_overrides: BTreeMap<u8, CameraOverride>,

    pub timelapse: TimelapseConfig,
    pub fault_detect: FaultDetectConfig,

    /// Moonraker host:port for provisioning pushes, empty disables.
    pub moonraker_host: String,
    /// Directory scanned for installable fault-detect model sets.
    pub model_root: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            streaming_port: 8080,
            control_port: 8081,
            h264_enabled: false,
            h264_resolution: H264Resolution::R1280x720,
            h264_bitrate: 1500,
            mjpeg_fps: 15,
            jpeg_quality: 80,
            skip_ratio: 1,
            auto_skip: false,
            target_cpu: 60,
            display_enabled: false,
            display_fps: 5,
            capture_max_width: 0,
            capture_max_height: 0,
            primary_usb_port: String::new(),
            controls: CameraControls::default(),
            camera_enabled: BTreeMap::new(),
            camera_overrides: BTreeMap::new(),
            timelapse: TimelapseConfig::default(),
            fault_detect: FaultDetectConfig::default(),
            moonraker_host: String::new(),
            model_root: "/useremain/app/gk/models".to_string(),
        }
    }
}

impl EncoderConfig {
    /// Range validation applied on every configuration-changing endpoint.
    pub fn validate(&self) -> Result<(), String> {
        fn range(name: &str, v: u32, lo: u32, hi: u32) -> Result<(), String> {
            if (lo..=hi).contains(&v) {
                Ok(())
            } else {
                Err(format!("{name} out of [{lo},{hi}]: {v}"))
            }
        }
        range("h264_bitrate", self.h264_bitrate, 100, 4000)?;
        range("mjpeg_fps", self.mjpeg_fps, 2, 30)?;
        range("jpeg_quality", self.jpeg_quality, 1, 100)?;
        if self.skip_ratio < 1 {
            return Err(format!("skip_ratio must be >= 1: {}", self.skip_ratio));
        }
        range("target_cpu", self.target_cpu, 25, 90)?;
        range("display_fps", self.display_fps, 1, 10)?;
        if let Some(ea) = self.controls.exposure_auto {
            if ea != 1 && ea != 3 {
                return Err(format!("exposure_auto must be 1 or 3: {ea}"));
            }
        }
        if let Some(pl) = self.controls.power_line {
            if !(0..=2).contains(&pl) {
                return Err(format!("power_line must be 0..2: {pl}"));
            }
        }
        let tl = &self.timelapse;
        range("timelapse.output_fps", tl.output_fps, 1, 120)?;
        range("timelapse.crf", tl.crf, 0, 51)?;
        if tl.variable_fps {
            if tl.variable_fps_min == 0 || tl.variable_fps_min > tl.variable_fps_max {
                return Err(format!(
                    "variable fps bounds invalid: {}..{}",
                    tl.variable_fps_min, tl.variable_fps_max
                ));
            }
            if tl.target_length == 0 {
                return Err("target_length must be >= 1".to_string());
            }
        }
        if tl.mode == TimelapseMode::Hyperlapse && tl.hyperlapse_interval_s == 0 {
            return Err("hyperlapse_interval_s must be >= 1".to_string());
        }
        self.fault_detect.validate()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("config {}: {}", path.display(), e))?;
        Ok(cfg)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        fs::write(path, raw).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }
}

type ChangeCallback = Box<dyn Fn(&EncoderConfig) + Send + Sync>;

/// The shared configuration record. Readers copy the fields they need in a
/// short critical section; apply stages, swaps, persists, then notifies.
pub struct ConfigState {
    current: Mutex<EncoderConfig>,
    path: PathBuf,
    callback: Mutex<Option<ChangeCallback>>,
}

impl ConfigState {
    pub fn new(cfg: EncoderConfig, path: PathBuf) -> Self {
        Self {
            current: Mutex::new(cfg),
            path,
            callback: Mutex::new(None),
        }
    }

    pub fn on_change(&self, cb: ChangeCallback) {
        *self.callback.lock().unwrap() = Some(cb);
    }

    pub fn get(&self) -> EncoderConfig {
        self.current.lock().unwrap().clone()
    }

    /// Stage + validate + swap + persist, then run the callback outside the
    /// lock so reconfiguration can take its own locks.
    pub fn apply(&self, staged: EncoderConfig) -> Result<(), String> {
        staged.validate()?;
        {
            let mut cur = self.current.lock().unwrap();
            *cur = staged.clone();
        }
        if let Err(e) = staged.save(&self.path) {
            log::error!("config persist failed: {e:#}");
        }
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(&staged);
        }
        Ok(())
    }

    /// Convenience for endpoints that edit a copy in place.
    pub fn update(&self, edit: impl FnOnce(&mut EncoderConfig)) -> Result<(), String> {
        let mut staged = self.get();
        edit(&mut staged);
        self.apply(staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EncoderConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_catches_ranges() {
        let mut c = EncoderConfig::default();
        c.h264_bitrate = 50;
        assert!(c.validate().is_err());

        let mut c = EncoderConfig::default();
        c.mjpeg_fps = 31;
        assert!(c.validate().is_err());

        let mut c = EncoderConfig::default();
        c.skip_ratio = 0;
        assert!(c.validate().is_err());

        let mut c = EncoderConfig::default();
        c.controls.exposure_auto = Some(2);
        assert!(c.validate().is_err());

        let mut c = EncoderConfig::default();
        c.timelapse.variable_fps = true;
        c.timelapse.variable_fps_min = 30;
        c.timelapse.variable_fps_max = 10;
        assert!(c.validate().is_err());
    }

    #[test]
    fn resolution_set_is_closed() {
        assert_eq!(
            H264Resolution::parse("960x540"),
            Some(H264Resolution::R960x540)
        );
        assert_eq!(H264Resolution::parse("1920x1080"), None);
        assert_eq!(H264Resolution::R640x360.dims(), (640, 360));
    }

    #[test]
    fn json_round_trip() {
        let mut c = EncoderConfig::default();
        c.h264_enabled = true;
        c.camera_enabled.insert(2, true);
        c.camera_overrides.insert(
            2,
            CameraOverride {
                width: 640,
                height: 480,
                force_mjpeg: true,
                fps: 15,
            },
        );
        let raw = serde_json::to_string(&c).unwrap();
        let back: EncoderConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.camera_overrides.get(&2), c.camera_overrides.get(&2));
        assert!(back.h264_enabled);
    }

    #[test]
    fn apply_runs_callback_with_new_value() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let dir = std::env::temp_dir().join("printcam_cfg_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cfg.json");
        let state = ConfigState::new(EncoderConfig::default(), path.clone());
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = Arc::clone(&seen);
        state.on_change(Box::new(move |cfg| {
            seen2.store(cfg.mjpeg_fps, Ordering::SeqCst);
        }));

        state.update(|c| c.mjpeg_fps = 20).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 20);
        assert_eq!(state.get().mjpeg_fps, 20);
        // Invalid edits are rejected whole and do not fire the callback.
        assert!(state.update(|c| c.mjpeg_fps = 99).is_err());
        assert_eq!(state.get().mjpeg_fps, 20);
        let _ = std::fs::remove_file(path);
    }
}
