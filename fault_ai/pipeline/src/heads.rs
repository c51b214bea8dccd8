//! Model heads: CNN fault classifier, ProtoNet embedding head with class
//! prototypes, and the multiclass labeler. Each head owns one accelerator
//! session; all sessions live on the engine worker thread.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::FaultDetectConfig;
use crate::preprocess::{INPUT_HEIGHT, INPUT_WIDTH};
use crate::result::{FaultLabel, FAULT_LABELS, SUCCESS_CLASS};
use crate::FaultError;
use log::{debug, info};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const MODEL_CNN: &str = "cnn.onnx";
pub const MODEL_PROTONET: &str = "protonet.onnx";
pub const PROTONET_PROTOS: &str = "protonet_prototypes.bin";
pub const MODEL_MULTICLASS: &str = "multiclass.onnx";
pub const MODEL_SPATIAL: &str = "spatial.onnx";
pub const SPATIAL_PROTOS: &str = "spatial_prototypes.bin";

/// EMA weight for the newest logits.
pub const EMA_ALPHA: f32 = 0.3;

/// Brings up the accelerator runtime once per process. Failure means the
/// engine must enter its `no_npu` state.
pub fn init_runtime() -> Result<(), FaultError> {
    ort::init()
        .with_name("printcam-fault-ai")
        .commit()
        .map_err(|e| FaultError::NpuUnavailable(e.to_string()))?;
    Ok(())
}

/// Distinguishes arena exhaustion from general runtime errors so the caller
/// can apply the one-shot 200 ms retry.
pub(crate) fn classify_ort_error(e: ort::Error) -> FaultError {
    let msg = e.to_string();
    let lower = msg.to_ascii_lowercase();
    if lower.contains("alloc") || lower.contains("out of memory") || lower.contains("code -2") {
        FaultError::NpuAlloc
    } else {
        FaultError::Inference(msg)
    }
}

pub(crate) fn build_session(path: &Path) -> Result<Session, FaultError> {
    if !path.exists() {
        return Err(FaultError::ModelMissing(path.display().to_string()));
    }
    Session::builder()
        .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
        .and_then(|b| b.with_intra_threads(2))
        .and_then(|b| b.commit_from_file(path))
        .map_err(classify_ort_error)
}

/// HWC u8 RGB -> CHW f32 in [0,1], the layout every head consumes.
pub fn tensor_from_rgb(rgb: &[u8]) -> Vec<f32> {
    let w = INPUT_WIDTH as usize;
    let h = INPUT_HEIGHT as usize;
    debug_assert_eq!(rgb.len(), w * h * 3);
    let mut chw = vec![0f32; 3 * h * w];
    let plane = h * w;
    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 3;
            let dst = y * w + x;
            chw[dst] = rgb[src] as f32 / 255.0;
            chw[plane + dst] = rgb[src + 1] as f32 / 255.0;
            chw[2 * plane + dst] = rgb[src + 2] as f32 / 255.0;
        }
    }
    chw
}

fn run_session(session: &mut Session, chw: Vec<f32>) -> Result<Vec<f32>, FaultError> {
    let input = ort::value::Tensor::from_array((
        [1usize, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize],
        chw,
    ))
    .map_err(classify_ort_error)?;
    let outputs = session
        .run(ort::inputs![input])
        .map_err(classify_ort_error)?;
    let (_, data) = outputs[0]
        .try_extract_tensor::<f32>()
        .map_err(classify_ort_error)?;
    Ok(data.to_vec())
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn ema_blend(prev: Option<&[f32]>, new: &[f32]) -> Vec<f32> {
    match prev {
        Some(p) if p.len() == new.len() => new
            .iter()
            .zip(p)
            .map(|(n, o)| EMA_ALPHA * n + (1.0 - EMA_ALPHA) * o)
            .collect(),
        _ => new.to_vec(),
    }
}

/// Reads a headerless little-endian f32 file holding `2 * EMB_DIM` values:
/// the ok prototype followed by the fault prototype.
pub(crate) fn load_prototype_pair(path: &Path) -> Result<(Vec<f32>, Vec<f32>), FaultError> {
    let raw = fs::read(path)?;
    if raw.is_empty() || raw.len() % 8 != 0 {
        return Err(FaultError::ModelMissing(format!(
            "{}: not a 2xD float32 prototype file ({} bytes)",
            path.display(),
            raw.len()
        )));
    }
    let floats: Vec<f32> = raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let dim = floats.len() / 2;
    Ok((floats[..dim].to_vec(), floats[dim..].to_vec()))
}

pub struct CnnHead {
    session: Session,
    ema_logits: Option<Vec<f32>>,
}

impl CnnHead {
    pub fn load(dir: &Path) -> Result<Self, FaultError> {
        Ok(Self {
            session: build_session(&dir.join(MODEL_CNN))?,
            ema_logits: None,
        })
    }

    pub fn reset(&mut self) {
        self.ema_logits = None;
    }

    /// Softmax fault-probability after EMA smoothing on the logits.
    /// Returns `(probability, inference_ms)`.
    pub fn run(&mut self, chw: Vec<f32>) -> Result<(f32, f32), FaultError> {
        let t0 = Instant::now();
        let logits = run_session(&mut self.session, chw)?;
        let smoothed = ema_blend(self.ema_logits.as_deref(), &logits);
        self.ema_logits = Some(smoothed.clone());
        let prob = if smoothed.len() >= 2 {
            softmax(&smoothed)[1]
        } else {
            // Single-logit export: sigmoid.
            1.0 / (1.0 + (-smoothed[0]).exp())
        };
        Ok((prob, t0.elapsed().as_secs_f32() * 1000.0))
    }
}

pub struct ProtoNetHead {
    session: Session,
    proto_ok: Vec<f32>,
    proto_fault: Vec<f32>,
}

impl ProtoNetHead {
    pub fn load(dir: &Path) -> Result<Self, FaultError> {
        let (proto_ok, proto_fault) = load_prototype_pair(&dir.join(PROTONET_PROTOS))?;
        Ok(Self {
            session: build_session(&dir.join(MODEL_PROTONET))?,
            proto_ok,
            proto_fault,
        })
    }

    /// Signed cosine margin in [-1,1]: positive leans fault. Returns
    /// `(margin, inference_ms)`.
    pub fn run(&mut self, chw: Vec<f32>) -> Result<(f32, f32), FaultError> {
        let t0 = Instant::now();
        let emb = run_session(&mut self.session, chw)?;
        if emb.len() != self.proto_ok.len() {
            return Err(FaultError::Inference(format!(
                "embedding dim {} != prototype dim {}",
                emb.len(),
                self.proto_ok.len()
            )));
        }
        let margin = (cosine(&emb, &self.proto_fault) - cosine(&emb, &self.proto_ok)) / 2.0;
        Ok((margin, t0.elapsed().as_secs_f32() * 1000.0))
    }
}

pub struct MulticlassHead {
    session: Session,
    ema_logits: Option<Vec<f32>>,
}

impl MulticlassHead {
    pub fn load(dir: &Path) -> Result<Self, FaultError> {
        Ok(Self {
            session: build_session(&dir.join(MODEL_MULTICLASS))?,
            ema_logits: None,
        })
    }

    pub fn reset(&mut self) {
        self.ema_logits = None;
    }

    /// Returns `(1 - p(success), argmax label, inference_ms)` after EMA
    /// smoothing on the class logits.
    pub fn run(&mut self, chw: Vec<f32>) -> Result<(f32, FaultLabel, f32), FaultError> {
        let t0 = Instant::now();
        let logits = run_session(&mut self.session, chw)?;
        if logits.len() != FAULT_LABELS.len() {
            return Err(FaultError::Inference(format!(
                "multiclass head produced {} classes, expected {}",
                logits.len(),
                FAULT_LABELS.len()
            )));
        }
        let smoothed = ema_blend(self.ema_logits.as_deref(), &logits);
        self.ema_logits = Some(smoothed.clone());
        let probs = softmax(&smoothed);
        let raw = 1.0 - probs[SUCCESS_CLASS];
        let argmax = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(SUCCESS_CLASS);
        Ok((raw, FAULT_LABELS[argmax], t0.elapsed().as_secs_f32() * 1000.0))
    }
}

/// The heads loaded from one model-set directory, filtered by config flags.
pub struct ModelSet {
    pub cnn: Option<CnnHead>,
    pub protonet: Option<ProtoNetHead>,
    pub multiclass: Option<MulticlassHead>,
    pub spatial: Option<crate::heatmap::SpatialHead>,
}

impl ModelSet {
    pub fn load(cfg: &FaultDetectConfig) -> Result<Self, FaultError> {
        let dir = PathBuf::from(&cfg.model_dir);
        if !dir.is_dir() {
            return Err(FaultError::ModelMissing(dir.display().to_string()));
        }

        let cnn = if cfg.cnn_enabled && dir.join(MODEL_CNN).exists() {
            Some(CnnHead::load(&dir)?)
        } else {
            None
        };
        let protonet = if cfg.protonet_enabled
            && dir.join(MODEL_PROTONET).exists()
            && dir.join(PROTONET_PROTOS).exists()
        {
            Some(ProtoNetHead::load(&dir)?)
        } else {
            None
        };
        let multiclass = if cfg.multiclass_enabled && dir.join(MODEL_MULTICLASS).exists() {
            Some(MulticlassHead::load(&dir)?)
        } else {
            None
        };
        let spatial = if cfg.heatmap_enabled
            && dir.join(MODEL_SPATIAL).exists()
            && dir.join(SPATIAL_PROTOS).exists()
        {
            Some(crate::heatmap::SpatialHead::load(&dir)?)
        } else {
            None
        };

        if cnn.is_none() && protonet.is_none() && multiclass.is_none() {
            return Err(FaultError::ModelMissing(format!(
                "{}: no usable head",
                dir.display()
            )));
        }
        info!(
            "model set loaded from {} (cnn={} protonet={} multiclass={} spatial={})",
            dir.display(),
            cnn.is_some(),
            protonet.is_some(),
            multiclass.is_some(),
            spatial.is_some()
        );
        Ok(Self {
            cnn,
            protonet,
            multiclass,
            spatial,
        })
    }

    pub fn reset_smoothing(&mut self) {
        if let Some(c) = self.cnn.as_mut() {
            c.reset();
        }
        if let Some(m) = self.multiclass.as_mut() {
            m.reset();
        }
    }
}

/// One installable model set as reported by the control surface.
#[derive(Clone, Debug, Serialize)]
pub struct ModelSetInfo {
    pub name: String,
    pub path: String,
    pub heads: Vec<&'static str>,
}

/// Scans `root` for subdirectories that contain at least one head model.
pub fn list_model_sets(root: &Path) -> Vec<ModelSetInfo> {
    let mut sets = Vec::new();
    let Ok(entries) = fs::read_dir(root) else {
        return sets;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let mut heads = Vec::new();
        if path.join(MODEL_CNN).exists() {
            heads.push("cnn");
        }
        if path.join(MODEL_PROTONET).exists() && path.join(PROTONET_PROTOS).exists() {
            heads.push("protonet");
        }
        if path.join(MODEL_MULTICLASS).exists() {
            heads.push("multiclass");
        }
        if path.join(MODEL_SPATIAL).exists() && path.join(SPATIAL_PROTOS).exists() {
            heads.push("spatial");
        }
        if heads.is_empty() {
            continue;
        }
        sets.push(ModelSetInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: path.display().to_string(),
            heads,
        });
    }
    sets.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("{} model sets under {}", sets.len(), root.display());
    sets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one_and_orders() {
        let p = softmax(&[1.0, 3.0, 0.5]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(p[1] > p[0] && p[0] > p[2]);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
        assert!((cosine(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn ema_blend_weights_new_sample() {
        let prev = [1.0f32, 0.0];
        let blended = ema_blend(Some(&prev), &[0.0, 1.0]);
        assert!((blended[0] - 0.7).abs() < 1e-6);
        assert!((blended[1] - 0.3).abs() < 1e-6);
        // No history: pass through.
        assert_eq!(ema_blend(None, &[2.0, 3.0]), vec![2.0, 3.0]);
    }

    #[test]
    fn prototype_pair_loader_splits_halves() {
        let dir = std::env::temp_dir().join("printcam_proto_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(PROTONET_PROTOS);
        let mut bytes = Vec::new();
        for v in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();
        let (ok, fault) = load_prototype_pair(&path).unwrap();
        assert_eq!(ok, vec![1.0, 2.0, 3.0]);
        assert_eq!(fault, vec![4.0, 5.0, 6.0]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn tensor_layout_is_chw() {
        let w = INPUT_WIDTH as usize;
        let h = INPUT_HEIGHT as usize;
        let mut rgb = vec![0u8; w * h * 3];
        // Pixel (0,0) = (255, 0, 0).
        rgb[0] = 255;
        let chw = tensor_from_rgb(&rgb);
        assert_eq!(chw.len(), 3 * w * h);
        assert!((chw[0] - 1.0).abs() < 1e-6);
        assert_eq!(chw[w * h], 0.0);
        assert_eq!(chw[2 * w * h], 0.0);
    }
}
