//! Spatial heatmap: a grid encoder plus two class prototypes give one
//! signed margin per cell. Cells above the strong-margin bar, gated by the
//! active Z mask, feed the verdict boost.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::heads::{build_session, classify_ort_error, cosine, SPATIAL_PROTOS};
use crate::preprocess::{INPUT_HEIGHT, INPUT_WIDTH};
use crate::result::HeatmapInfo;
use crate::zmask::{CellMask, HEATMAP_COLS, HEATMAP_ROWS};
use crate::FaultError;
use ort::session::Session;
use std::fs;
use std::path::Path;
use std::time::Instant;

/// Heatmap is considered at all only above this masked maximum.
pub const HEATMAP_FLOOR: f32 = 0.45;
/// Per-cell margin above which a cell counts as strong.
pub const STRONG_MARGIN: f32 = 0.3;
/// Strong cells needed for either boost path.
pub const STRONG_CELLS_MIN: u32 = 3;

pub struct SpatialPrototypes {
    pub rows: usize,
    pub cols: usize,
    pub emb_dim: usize,
    pub proto_ok: Vec<f32>,
    pub proto_fault: Vec<f32>,
}

impl SpatialPrototypes {
    /// File layout: four little-endian u32 `{H, W, emb_dim, n_classes}` with
    /// `n_classes == 2`, then `n_classes * emb_dim` little-endian f32.
    pub fn load(path: &Path) -> Result<Self, FaultError> {
        let raw = fs::read(path)?;
        if raw.len() < 16 {
            return Err(FaultError::ModelMissing(format!(
                "{}: truncated spatial prototype file",
                path.display()
            )));
        }
        let word = |i: usize| {
            u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]])
                as usize
        };
        let (rows, cols, emb_dim, n_classes) = (word(0), word(1), word(2), word(3));
        if n_classes != 2 {
            return Err(FaultError::ModelMissing(format!(
                "{}: n_classes {} != 2",
                path.display(),
                n_classes
            )));
        }
        if rows == 0 || rows > HEATMAP_ROWS || cols == 0 || cols > HEATMAP_COLS {
            return Err(FaultError::ModelMissing(format!(
                "{}: grid {}x{} outside {}x{}",
                path.display(),
                rows,
                cols,
                HEATMAP_ROWS,
                HEATMAP_COLS
            )));
        }
        let expect = 16 + n_classes * emb_dim * 4;
        if raw.len() != expect {
            return Err(FaultError::ModelMissing(format!(
                "{}: {} bytes, expected {}",
                path.display(),
                raw.len(),
                expect
            )));
        }
        let floats: Vec<f32> = raw[16..]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self {
            rows,
            cols,
            emb_dim,
            proto_ok: floats[..emb_dim].to_vec(),
            proto_fault: floats[emb_dim..].to_vec(),
        })
    }
}

pub struct SpatialHead {
    session: Session,
    pub protos: SpatialPrototypes,
}

impl SpatialHead {
    pub fn load(dir: &Path) -> Result<Self, FaultError> {
        let protos = SpatialPrototypes::load(&dir.join(SPATIAL_PROTOS))?;
        Ok(Self {
            session: build_session(&dir.join(crate::heads::MODEL_SPATIAL))?,
            protos,
        })
    }

    /// Runs the grid encoder and produces row-major per-cell margins
    /// (`cos(cell, fault) - cos(cell, ok)`). Returns `(cells, ms)`.
    pub fn run(&mut self, chw: Vec<f32>) -> Result<(Vec<f32>, f32), FaultError> {
        let t0 = Instant::now();
        let input = ort::value::Tensor::from_array((
            [1usize, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize],
            chw,
        ))
        .map_err(classify_ort_error)?;
        let outputs = self
            .session
            .run(ort::inputs![input])
            .map_err(classify_ort_error)?;
        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(classify_ort_error)?;

        // Expect [1, emb, H, W].
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let (emb, rows, cols) = match dims.as_slice() {
            [1, e, r, c] => (*e, *r, *c),
            other => {
                return Err(FaultError::Inference(format!(
                    "spatial head output shape {:?}",
                    other
                )))
            }
        };
        if emb != self.protos.emb_dim || rows != self.protos.rows || cols != self.protos.cols {
            return Err(FaultError::Inference(format!(
                "spatial output {}x{}x{} does not match prototypes {}x{}x{}",
                emb, rows, cols, self.protos.emb_dim, self.protos.rows, self.protos.cols
            )));
        }

        let plane = rows * cols;
        let mut cell = vec![0f32; emb];
        let mut margins = Vec::with_capacity(plane);
        for r in 0..rows {
            for c in 0..cols {
                for (e, slot) in cell.iter_mut().enumerate() {
                    *slot = data[e * plane + r * cols + c];
                }
                margins.push(
                    cosine(&cell, &self.protos.proto_fault) - cosine(&cell, &self.protos.proto_ok),
                );
            }
        }
        Ok((margins, t0.elapsed().as_secs_f32() * 1000.0))
    }
}

/// Masked maximum and its coordinate over a row-major margin grid. Mask
/// bits are indexed `row * cols + col` with the grid's own width.
pub fn heatmap_info(cells: Vec<f32>, rows: usize, cols: usize, mask: &CellMask) -> HeatmapInfo {
    let mut max_value = f32::NEG_INFINITY;
    let (mut max_row, mut max_col) = (0, 0);
    for r in 0..rows {
        for c in 0..cols {
            if !mask.get(r * cols + c) {
                continue;
            }
            let v = cells[r * cols + c];
            if v > max_value {
                max_value = v;
                max_row = r;
                max_col = c;
            }
        }
    }
    if max_value == f32::NEG_INFINITY {
        max_value = 0.0;
    }
    HeatmapInfo {
        rows,
        cols,
        cells,
        max_value,
        max_row,
        max_col,
    }
}

/// Counts strong cells (margin above `STRONG_MARGIN`) and total cells
/// inside the active mask.
pub fn count_strong(info: &HeatmapInfo, mask: &CellMask) -> (u32, u32) {
    let mut strong = 0;
    let mut total = 0;
    for r in 0..info.rows {
        for c in 0..info.cols {
            if !mask.get(r * info.cols + c) {
                continue;
            }
            total += 1;
            if info.cells[r * info.cols + c] > STRONG_MARGIN {
                strong += 1;
            }
        }
    }
    (strong, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proto_file(rows: u32, cols: u32, emb: u32, classes: u32) -> Vec<u8> {
        let mut raw = Vec::new();
        for v in [rows, cols, emb, classes] {
            raw.extend_from_slice(&v.to_le_bytes());
        }
        for i in 0..(classes * emb) {
            raw.extend_from_slice(&(i as f32).to_le_bytes());
        }
        raw
    }

    #[test]
    fn spatial_prototype_parse() {
        let dir = std::env::temp_dir().join("printcam_spatial_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("p.bin");
        std::fs::write(&path, proto_file(7, 14, 8, 2)).unwrap();
        let p = SpatialPrototypes::load(&path).unwrap();
        assert_eq!((p.rows, p.cols, p.emb_dim), (7, 14, 8));
        assert_eq!(p.proto_ok.len(), 8);
        assert_eq!(p.proto_fault[0], 8.0);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn spatial_prototype_rejects_bad_headers() {
        let dir = std::env::temp_dir().join("printcam_spatial_test2");
        std::fs::create_dir_all(&dir).unwrap();
        for (name, bytes) in [
            ("classes", proto_file(7, 14, 8, 3)),
            ("rows", proto_file(15, 14, 8, 2)),
            ("cols", proto_file(7, 29, 8, 2)),
        ] {
            let path = dir.join(name);
            std::fs::write(&path, &bytes).unwrap();
            assert!(SpatialPrototypes::load(&path).is_err(), "{name}");
            std::fs::remove_file(&path).unwrap();
        }
    }

    #[test]
    fn masked_max_and_strong_counting() {
        let rows = 2;
        let cols = 3;
        let cells = vec![0.1, 0.9, 0.35, 0.0, 1.5, 0.31];
        let mut mask = CellMask::empty();
        // Enable everything except the 1.5 cell at (1,1).
        for r in 0..rows {
            for c in 0..cols {
                mask.set(r * cols + c, !(r == 1 && c == 1));
            }
        }
        let info = heatmap_info(cells, rows, cols, &mask);
        assert!((info.max_value - 0.9).abs() < 1e-6);
        assert_eq!((info.max_row, info.max_col), (0, 1));

        let (strong, total) = count_strong(&info, &mask);
        assert_eq!(total, 5);
        // 0.9, 0.35, 0.31 are above 0.3; the masked 1.5 is not counted.
        assert_eq!(strong, 3);
    }
}
