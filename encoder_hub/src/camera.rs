//! USB camera discovery and UVC control plumbing over V4L2.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::CameraControls;
use log::{debug, info, warn};
use serde_derive::Serialize;
use serde_json::json;
use std::io;
use v4l::context;
use v4l::control::{Control, Value};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

pub const MAX_CAMERAS: u8 = 4;

/// Streaming port for a camera id: 1 -> 8080, 2 -> 8082, 3 -> 8083, 4 -> 8084.
pub fn port_for_camera(camera_id: u8) -> u16 {
    match camera_id {
        1 => 8080,
        n => 8080 + u16::from(n),
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CameraDescriptor {
    /// Stable identifier derived from the hardware-path string.
    pub stable_id: String,
    pub device_path: String,
    pub name: String,
    pub usb_port: String,
    /// Subset of {"MJPEG", "YUYV"} the device offers.
    pub formats: Vec<&'static str>,
    /// Discrete resolutions, largest pixel count first.
    pub resolutions: Vec<(u32, u32)>,
    /// Maximum discrete frame rate at the preferred resolution.
    pub max_fps: u32,
    pub camera_id: u8,
    pub streaming_port: u16,
    pub enabled: bool,
    pub is_primary: bool,
    /// Surfaced supervisor error (restart storm), if any.
    pub error: Option<String>,
}

/// FNV-1a over the hardware path; short, stable across boots.
pub fn stable_id_for(hw_path: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in hw_path.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("cam-{hash:016x}")
}

fn fps_of_interval(interval: &v4l::frameinterval::FrameIntervalEnum) -> Option<u32> {
    match interval {
        v4l::frameinterval::FrameIntervalEnum::Discrete(fraction) => {
            if fraction.numerator == 0 {
                None
            } else {
                Some(fraction.denominator / fraction.numerator)
            }
        }
        v4l::frameinterval::FrameIntervalEnum::Stepwise(step) => {
            if step.min.numerator == 0 {
                None
            } else {
                Some(step.min.denominator / step.min.numerator)
            }
        }
    }
}

fn probe_node(path: &str) -> io::Result<Option<CameraDescriptor>> {
    let dev = Device::with_path(path)?;
    let caps = dev.query_caps()?;

    let mut formats = Vec::new();
    for desc in dev.enum_formats()? {
        if desc.fourcc == FourCC::new(b"MJPG") && !formats.contains(&"MJPEG") {
            formats.push("MJPEG");
        }
        if desc.fourcc == FourCC::new(b"YUYV") && !formats.contains(&"YUYV") {
            formats.push("YUYV");
        }
    }
    if formats.is_empty() {
        return Ok(None);
    }

    let probe_fourcc = if formats.contains(&"MJPEG") {
        FourCC::new(b"MJPG")
    } else {
        FourCC::new(b"YUYV")
    };
    let mut resolutions: Vec<(u32, u32)> = Vec::new();
    for size in dev.enum_framesizes(probe_fourcc)? {
        for discrete in size.size.to_discrete() {
            let pair = (discrete.width, discrete.height);
            if !resolutions.contains(&pair) {
                resolutions.push(pair);
            }
        }
    }
    if resolutions.is_empty() {
        return Ok(None);
    }
    resolutions.sort_by_key(|(w, h)| std::cmp::Reverse(u64::from(*w) * u64::from(*h)));

    let (best_w, best_h) = resolutions[0];
    let max_fps = dev
        .enum_frameintervals(probe_fourcc, best_w, best_h)?
        .iter()
        .filter_map(|fi| fps_of_interval(&fi.interval))
        .max()
        .unwrap_or(30);

    Ok(Some(CameraDescriptor {
        stable_id: stable_id_for(&caps.bus),
        device_path: path.to_string(),
        name: caps.card.clone(),
        usb_port: caps.bus.clone(),
        formats,
        resolutions,
        max_fps,
        camera_id: 0,
        streaming_port: 0,
        enabled: false,
        is_primary: false,
        error: None,
    }))
}

/// Enumerates capture devices once at startup. One descriptor per physical
/// camera (nodes sharing a hardware path collapse to the first), primary
/// first, ids 1..=4, only camera 1 enabled.
pub fn discover(primary_usb_port: &str) -> Vec<CameraDescriptor> {
    let mut found: Vec<CameraDescriptor> = Vec::new();
    for node in context::enum_devices() {
        let path = node.path().to_string_lossy().to_string();
        match probe_node(&path) {
            Ok(Some(desc)) => {
                if found.iter().any(|d| d.usb_port == desc.usb_port) {
                    debug!("{path}: secondary node of {}", desc.usb_port);
                    continue;
                }
                found.push(desc);
            }
            Ok(None) => debug!("{path}: no usable capture format"),
            Err(e) => debug!("{path}: probe failed: {e}"),
        }
    }

    // Primary camera (the internal USB port) sorts first, then device path.
    for desc in &mut found {
        desc.is_primary = !primary_usb_port.is_empty() && desc.usb_port == primary_usb_port;
    }
    found.sort_by(|a, b| {
        b.is_primary
            .cmp(&a.is_primary)
            .then_with(|| a.device_path.cmp(&b.device_path))
    });
    found.truncate(MAX_CAMERAS as usize);

    for (i, desc) in found.iter_mut().enumerate() {
        desc.camera_id = i as u8 + 1;
        desc.streaming_port = port_for_camera(desc.camera_id);
        desc.enabled = desc.camera_id == 1;
        info!(
            "camera {}: {} at {} ({}x{} @{}fps, {:?}){}",
            desc.camera_id,
            desc.name,
            desc.device_path,
            desc.resolutions[0].0,
            desc.resolutions[0].1,
            desc.max_fps,
            desc.formats,
            if desc.is_primary { " [primary]" } else { "" }
        );
    }
    found
}

// UVC control ids.
const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_CONTRAST: u32 = 0x0098_0901;
const CID_SATURATION: u32 = 0x0098_0902;
const CID_HUE: u32 = 0x0098_0903;
const CID_WHITE_BALANCE_AUTO: u32 = 0x0098_090C;
const CID_GAMMA: u32 = 0x0098_0910;
const CID_GAIN: u32 = 0x0098_0913;
const CID_POWER_LINE: u32 = 0x0098_0918;
const CID_WHITE_BALANCE_TEMP: u32 = 0x0098_091A;
const CID_SHARPNESS: u32 = 0x0098_091B;
const CID_BACKLIGHT: u32 = 0x0098_091C;
const CID_EXPOSURE_AUTO: u32 = 0x009A_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009A_0902;
const CID_EXPOSURE_PRIORITY: u32 = 0x009A_0903;

/// `(config field name, control id)` for every supported image control.
pub const CONTROL_TABLE: [(&str, u32); 14] = [
    ("brightness", CID_BRIGHTNESS),
    ("contrast", CID_CONTRAST),
    ("saturation", CID_SATURATION),
    ("hue", CID_HUE),
    ("gamma", CID_GAMMA),
    ("sharpness", CID_SHARPNESS),
    ("gain", CID_GAIN),
    ("backlight", CID_BACKLIGHT),
    ("white_balance_auto", CID_WHITE_BALANCE_AUTO),
    ("white_balance_temp", CID_WHITE_BALANCE_TEMP),
    ("exposure_auto", CID_EXPOSURE_AUTO),
    ("exposure", CID_EXPOSURE_ABSOLUTE),
    ("exposure_priority", CID_EXPOSURE_PRIORITY),
    ("power_line", CID_POWER_LINE),
];

pub fn control_id(name: &str) -> Option<u32> {
    CONTROL_TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, id)| *id)
}

/// Pushes every set control to the device; failures on individual controls
/// are logged and skipped (devices differ in what they expose).
pub fn apply_controls(device_path: &str, controls: &CameraControls) -> io::Result<()> {
    let dev = Device::with_path(device_path)?;
    let mut pending: Vec<(&str, i64)> = Vec::new();
    let mut push = |name: &'static str, v: Option<i32>| {
        if let Some(v) = v {
            pending.push((name, i64::from(v)));
        }
    };
    push("brightness", controls.brightness);
    push("contrast", controls.contrast);
    push("saturation", controls.saturation);
    push("hue", controls.hue);
    push("gamma", controls.gamma);
    push("sharpness", controls.sharpness);
    push("gain", controls.gain);
    push("backlight", controls.backlight);
    push(
        "white_balance_auto",
        controls.white_balance_auto.map(i32::from),
    );
    push("white_balance_temp", controls.white_balance_temp);
    push("exposure_auto", controls.exposure_auto);
    push("exposure", controls.exposure);
    push("exposure_priority", controls.exposure_priority);
    push("power_line", controls.power_line);

    for (name, value) in pending {
        let id = control_id(name).expect("name from the control table");
        if let Err(e) = dev.set_control(Control {
            id,
            value: Value::Integer(value),
        }) {
            warn!("{device_path}: set {name}={value} failed: {e}");
        }
    }
    Ok(())
}

/// Sets one control by its table name.
pub fn set_control(device_path: &str, name: &str, value: i64) -> io::Result<()> {
    let id = control_id(name)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown control"))?;
    let dev = Device::with_path(device_path)?;
    dev.set_control(Control {
        id,
        value: Value::Integer(value),
    })
}

/// Ranges and current values for the control UI.
pub fn control_ranges(device_path: &str) -> io::Result<serde_json::Value> {
    let dev = Device::with_path(device_path)?;
    let descriptions = dev.query_controls()?;
    let mut out = Vec::new();
    for (name, id) in CONTROL_TABLE {
        let Some(desc) = descriptions.iter().find(|d| d.id == id) else {
            continue;
        };
        let current = dev.control(id).ok().and_then(|c| match c.value {
            Value::Integer(v) => Some(v),
            Value::Boolean(b) => Some(i64::from(b)),
            _ => None,
        });
        out.push(json!({
            "name": name,
            "minimum": desc.minimum,
            "maximum": desc.maximum,
            "step": desc.step,
            "default": desc.default,
            "value": current,
        }));
    }
    Ok(serde_json::Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_assignment() {
        assert_eq!(port_for_camera(1), 8080);
        assert_eq!(port_for_camera(2), 8082);
        assert_eq!(port_for_camera(3), 8083);
        assert_eq!(port_for_camera(4), 8084);
    }

    #[test]
    fn stable_id_is_deterministic_and_distinct() {
        let a = stable_id_for("usb-xhci-hcd.0.auto-1.2");
        let b = stable_id_for("usb-xhci-hcd.0.auto-1.2");
        let c = stable_id_for("usb-xhci-hcd.0.auto-1.3");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("cam-"));
        assert_eq!(a.len(), 4 + 16);
    }

    #[test]
    fn control_table_lookup() {
        assert_eq!(control_id("brightness"), Some(0x0098_0900));
        assert_eq!(control_id("exposure_auto"), Some(0x009A_0901));
        assert_eq!(control_id("bogus"), None);
    }
}
