//! Print fault-detection pipeline: runs quantized vision heads on the
//! accelerator against frames handed over by the encoder hub and combines
//! them into a single fault verdict.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod engine;
pub mod heads;
pub mod heatmap;
pub mod preprocess;
pub mod result;
pub mod zmask;

use thiserror::Error;

/// Errors the engine distinguishes. Most of these are skip-the-cycle class;
/// only `NpuUnavailable` is terminal for the worker.
#[derive(Error, Debug)]
pub enum FaultError {
    #[error("NPU runtime unavailable: {0}")]
    NpuUnavailable(String),

    #[error("model file missing: {0}")]
    ModelMissing(String),

    /// Contiguous-memory arena exhaustion inside the accelerator runtime.
    /// Distinguished from general inference errors (runtime code -2) so the
    /// cycle can retry once after a short backoff.
    #[error("NPU contiguous memory exhausted")]
    NpuAlloc,

    #[error("corrupt frame: {0}")]
    FrameCorrupt(String),

    #[error("bad mask encoding: {0}")]
    MaskEncoding(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Printer-side signals. The broker connection itself lives outside this
/// crate; the engine only needs these three operations for its LED
/// keep-alive and the fault buzzer.
pub trait PrinterSignals: Send + Sync {
    fn lamp_on(&self);
    fn lamp_off(&self);
    /// Current lamp state if the broker answered in time.
    fn lamp_state(&self) -> Option<bool>;
    fn buzzer(&self, pattern: &str);
}

/// No-op signals for tests and for hubs running without a broker.
pub struct NullSignals;

impl PrinterSignals for NullSignals {
    fn lamp_on(&self) {}
    fn lamp_off(&self) {}
    fn lamp_state(&self) -> Option<bool> {
        None
    }
    fn buzzer(&self, _pattern: &str) {}
}
