//! Hardware H.264 encoder sink. The SoC encoder is a V4L2 memory-to-memory
//! stateful device: raw NV12 frames go in on the output queue, Annex-B
//! bytes come back on the capture queue. The session lives on whichever
//! thread drives it (the capture pump, or time-lapse finalize); only the
//! SPS/PPS cache and the keyframe request cross threads.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::h264::{self, NalUnit};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use v4l::buffer::Type;
use v4l::control::{Control, Value};
use v4l::io::traits::{CaptureStream, OutputStream};
use v4l::prelude::*;
use v4l::video::{Capture, Output};
use v4l::{Format, FourCC};

pub const DEFAULT_VENC_DEVICE: &str = "/dev/video-enc0";
const ENCODE_BUFFERS: u32 = 4;

const CID_VIDEO_BITRATE: u32 = 0x0099_09CF;
const CID_FORCE_KEY_FRAME: u32 = 0x0099_09E5;

/// IDR considered fresh for a newly connected client within this window.
pub const IDR_FRESH_WINDOW_MS: u64 = 2_000;

/// Cross-thread encoder state: parameter-set cache and the out-of-band
/// keyframe request issued by the FLV server.
pub struct VencShared {
    sps: Mutex<Option<Vec<u8>>>,
    pps: Mutex<Option<Vec<u8>>>,
    keyframe_request: AtomicBool,
    last_idr_ms: AtomicU64,
    /// Frames per second the stream currently advertises.
    fps: AtomicU64,
}

impl VencShared {
    pub fn new() -> Self {
        Self {
            sps: Mutex::new(None),
            pps: Mutex::new(None),
            keyframe_request: AtomicBool::new(false),
            last_idr_ms: AtomicU64::new(u64::MAX),
            fps: AtomicU64::new(30),
        }
    }

    pub fn sps(&self) -> Option<Vec<u8>> {
        self.sps.lock().unwrap().clone()
    }

    pub fn pps(&self) -> Option<Vec<u8>> {
        self.pps.lock().unwrap().clone()
    }

    pub fn parameter_sets(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        Some((self.sps()?, self.pps()?))
    }

    pub fn set_fps(&self, fps: u32) {
        self.fps.store(u64::from(fps.max(1)), Ordering::Relaxed);
    }

    pub fn fps(&self) -> u32 {
        self.fps.load(Ordering::Relaxed) as u32
    }

    /// Called by the FLV server when a client connects without a fresh IDR.
    pub fn request_keyframe(&self) {
        self.keyframe_request.store(true, Ordering::SeqCst);
    }

    pub fn take_keyframe_request(&self) -> bool {
        self.keyframe_request.swap(false, Ordering::SeqCst)
    }

    pub fn note_idr(&self, ts_ms: u64) {
        self.last_idr_ms.store(ts_ms, Ordering::Relaxed);
    }

    pub fn idr_fresh(&self, now_ms: u64) -> bool {
        let last = self.last_idr_ms.load(Ordering::Relaxed);
        last != u64::MAX && now_ms.saturating_sub(last) <= IDR_FRESH_WINDOW_MS
    }

    /// Absorbs parameter sets and IDR bookkeeping from one encoded burst.
    pub fn absorb(&self, nals: &[NalUnit], ts_ms: u64) {
        for nal in nals {
            match nal.nal_type {
                h264::NAL_SPS => *self.sps.lock().unwrap() = Some(nal.data.clone()),
                h264::NAL_PPS => *self.pps.lock().unwrap() = Some(nal.data.clone()),
                h264::NAL_IDR => self.note_idr(ts_ms),
                _ => {}
            }
        }
    }
}

impl Default for VencShared {
    fn default() -> Self {
        Self::new()
    }
}

/// One live encode session. Borrows the device so the whole session stays
/// on the driving thread's stack; drop releases the queues in reverse
/// order of init.
pub struct VencSession<'a> {
    dev: &'a Device,
    out_stream: MmapStream<'a>,
    cap_stream: MmapStream<'a>,
    pub width: u32,
    pub height: u32,
    force_keyframe: bool,
}

impl<'a> VencSession<'a> {
    /// Negotiates NV12 in / H.264 out and the target bitrate. An `ENOMEM`
    /// class failure here is the arena-exhaustion case callers retry after
    /// memory reclamation.
    pub fn init(dev: &'a Device, width: u32, height: u32, bitrate_kbps: u32, fps: u32) -> Result<Self> {
        let out_fmt = Format::new(width, height, FourCC::new(b"NV12"));
        Output::set_format(dev, &out_fmt).context("setting encoder raw input format")?;

        let cap_fmt = Format::new(width, height, FourCC::new(b"H264"));
        Capture::set_format(dev, &cap_fmt).context("setting encoder bitstream format")?;

        if let Err(e) = dev.set_control(Control {
            id: CID_VIDEO_BITRATE,
            value: Value::Integer(i64::from(bitrate_kbps) * 1000),
        }) {
            warn!("encoder bitrate control rejected: {e}");
        }

        let out_stream = MmapStream::with_buffers(dev, Type::VideoOutput, ENCODE_BUFFERS)
            .context("allocating encoder output buffers")?;
        let cap_stream = MmapStream::with_buffers(dev, Type::VideoCapture, ENCODE_BUFFERS)
            .context("allocating encoder capture buffers")?;

        info!("hardware encoder up: {width}x{height} @{fps}fps, {bitrate_kbps} kbps");
        Ok(Self {
            dev,
            out_stream,
            cap_stream,
            width,
            height,
            force_keyframe: true, // first encode after init is an IDR
        })
    }

    pub fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    /// Pushes one NV12 frame and returns the NAL units of the encoded
    /// access unit (possibly preceded by SPS/PPS).
    pub fn encode(&mut self, nv12: &[u8]) -> Result<Vec<NalUnit>> {
        let expected = (self.width * self.height * 3 / 2) as usize;
        anyhow::ensure!(
            nv12.len() == expected,
            "NV12 frame size {} != expected {}",
            nv12.len(),
            expected
        );

        if self.force_keyframe {
            self.force_keyframe = false;
            if let Err(e) = self.dev.set_control(Control {
                id: CID_FORCE_KEY_FRAME,
                value: Value::None,
            }) {
                debug!("force-keyframe control rejected: {e}");
            }
        }

        let (out_buf, out_meta) = OutputStream::next(&mut self.out_stream)
            .context("dequeuing encoder input buffer")?;
        out_buf[..nv12.len()].copy_from_slice(nv12);
        out_meta.bytesused = nv12.len() as u32;

        let (cap_buf, cap_meta) = CaptureStream::next(&mut self.cap_stream)
            .context("dequeuing encoded bitstream")?;
        let used = cap_meta.bytesused as usize;
        Ok(h264::split_annex_b(&cap_buf[..used.min(cap_buf.len())]))
    }
}

/// Nearest-neighbor scale plus RGB -> NV12 (BT.601 limited range, fixed
/// point). Output layout: full-res Y plane then interleaved half-res UV.
pub fn rgb_to_nv12_scaled(
    rgb: &[u8],
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
) -> Vec<u8> {
    let (sw, sh, dw, dh) = (src_w as usize, src_h as usize, dst_w as usize, dst_h as usize);
    debug_assert_eq!(rgb.len(), sw * sh * 3);
    let mut out = vec![0u8; dw * dh * 3 / 2];
    let (y_plane, uv_plane) = out.split_at_mut(dw * dh);

    for dy in 0..dh {
        let sy = dy * sh / dh;
        for dx in 0..dw {
            let sx = dx * sw / dw;
            let p = (sy * sw + sx) * 3;
            let (r, g, b) = (
                i32::from(rgb[p]),
                i32::from(rgb[p + 1]),
                i32::from(rgb[p + 2]),
            );
            // 0.257R + 0.504G + 0.098B + 16, scaled by 256.
            let y = (66 * r + 129 * g + 25 * b + 128) / 256 + 16;
            y_plane[dy * dw + dx] = y.clamp(0, 255) as u8;

            if dy % 2 == 0 && dx % 2 == 0 {
                let u = (-38 * r - 74 * g + 112 * b + 128) / 256 + 128;
                let v = (112 * r - 94 * g - 18 * b + 128) / 256 + 128;
                let uv = (dy / 2) * dw + dx;
                uv_plane[uv] = u.clamp(0, 255) as u8;
                uv_plane[uv + 1] = v.clamp(0, 255) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_caches_parameter_sets_and_idr() {
        let shared = VencShared::new();
        assert!(shared.parameter_sets().is_none());
        assert!(!shared.idr_fresh(1000));

        let nals = vec![
            NalUnit {
                nal_type: h264::NAL_SPS,
                data: vec![0x67, 0x64, 0x00, 0x1F],
            },
            NalUnit {
                nal_type: h264::NAL_PPS,
                data: vec![0x68, 0xEB],
            },
            NalUnit {
                nal_type: h264::NAL_IDR,
                data: vec![0x65, 0x88],
            },
        ];
        shared.absorb(&nals, 500);
        let (sps, pps) = shared.parameter_sets().unwrap();
        assert_eq!(sps[0] & 0x1F, h264::NAL_SPS);
        assert_eq!(pps[0] & 0x1F, h264::NAL_PPS);
        assert!(shared.idr_fresh(500 + IDR_FRESH_WINDOW_MS));
        assert!(!shared.idr_fresh(501 + IDR_FRESH_WINDOW_MS));
    }

    #[test]
    fn keyframe_request_is_one_shot() {
        let shared = VencShared::new();
        assert!(!shared.take_keyframe_request());
        shared.request_keyframe();
        assert!(shared.take_keyframe_request());
        assert!(!shared.take_keyframe_request());
    }

    #[test]
    fn nv12_conversion_dimensions() {
        let rgb = vec![128u8; 8 * 6 * 3];
        let nv12 = rgb_to_nv12_scaled(&rgb, 8, 6, 4, 4);
        assert_eq!(nv12.len(), 4 * 4 * 3 / 2);
    }

    #[test]
    fn nv12_black_and_white_levels() {
        // Pure black -> Y near 16, pure white -> Y near 235 (limited range).
        let black = vec![0u8; 2 * 2 * 3];
        let nv12 = rgb_to_nv12_scaled(&black, 2, 2, 2, 2);
        assert!((15..=17).contains(&nv12[0]));
        assert!((126..=130).contains(&nv12[4]));

        let white = vec![255u8; 2 * 2 * 3];
        let nv12 = rgb_to_nv12_scaled(&white, 2, 2, 2, 2);
        assert!((234..=236).contains(&nv12[0]));
    }
}
