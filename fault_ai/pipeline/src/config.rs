//! Engine configuration. The hub owns the serialized form inside its main
//! config file and pushes copies here through `FaultEngine::apply_config`.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::zmask::{CellMask, ZMaskEntry, ZMaskTable};
use crate::FaultError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How per-head verdicts combine into the cycle verdict.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Or,
    And,
    All,
    Majority,
    Verify,
    Classify,
    ClassifyAnd,
    Cnn,
    Protonet,
    Multiclass,
}

impl Strategy {
    /// Strategies where the CNN threshold must not be dynamically lowered.
    pub fn is_conjunctive(self) -> bool {
        matches!(self, Strategy::And | Strategy::ClassifyAnd | Strategy::All)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Strategy::Or => "or",
            Strategy::And => "and",
            Strategy::All => "all",
            Strategy::Majority => "majority",
            Strategy::Verify => "verify",
            Strategy::Classify => "classify",
            Strategy::ClassifyAnd => "classify_and",
            Strategy::Cnn => "cnn",
            Strategy::Protonet => "protonet",
            Strategy::Multiclass => "multiclass",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "or" => Ok(Strategy::Or),
            "and" => Ok(Strategy::And),
            "all" => Ok(Strategy::All),
            "majority" => Ok(Strategy::Majority),
            "verify" => Ok(Strategy::Verify),
            "classify" => Ok(Strategy::Classify),
            "classify_and" => Ok(Strategy::ClassifyAnd),
            "cnn" => Ok(Strategy::Cnn),
            "protonet" => Ok(Strategy::Protonet),
            "multiclass" => Ok(Strategy::Multiclass),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultDetectConfig {
    pub enabled: bool,
    /// Directory holding the installed model set (heads + prototype files).
    pub model_dir: String,
    pub strategy: Strategy,

    pub interval_s: u32,
    /// Shorter re-check interval after a fault verdict.
    pub verify_interval_s: u32,

    pub cnn_enabled: bool,
    pub protonet_enabled: bool,
    pub multiclass_enabled: bool,

    pub cnn_threshold: f32,
    /// CNN threshold used for the cycle when ProtoNet crosses the trigger.
    pub cnn_dynamic_threshold: f32,
    pub protonet_threshold: f32,
    pub proto_dynamic_trigger: f32,
    pub multiclass_threshold: f32,

    pub heatmap_enabled: bool,
    pub heatmap_boost_threshold: f32,

    pub min_free_mem_mb: u64,

    pub buzzer_enabled: bool,
    pub buzzer_pattern: String,

    /// Transport form of the Z table: `(z_mm, mask hex)` entries plus the
    /// fallback mask (empty string = all cells participate).
    pub z_masks: Vec<ZMaskSpec>,
    pub base_mask: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZMaskSpec {
    pub z_mm: f32,
    pub mask: String,
}

impl Default for FaultDetectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model_dir: String::new(),
            strategy: Strategy::Or,
            interval_s: 10,
            verify_interval_s: 3,
            cnn_enabled: true,
            protonet_enabled: true,
            multiclass_enabled: true,
            cnn_threshold: 0.50,
            cnn_dynamic_threshold: 0.35,
            protonet_threshold: 0.50,
            proto_dynamic_trigger: 0.85,
            multiclass_threshold: 0.81,
            heatmap_enabled: true,
            heatmap_boost_threshold: 0.80,
            min_free_mem_mb: 48,
            buzzer_enabled: true,
            buzzer_pattern: "double".to_string(),
            z_masks: Vec::new(),
            base_mask: String::new(),
        }
    }
}

impl FaultDetectConfig {
    /// Range checks mirroring the control-server validation. Returns the
    /// first violation as a short message.
    pub fn validate(&self) -> Result<(), String> {
        fn unit(name: &str, v: f32) -> Result<(), String> {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(format!("{name} out of [0,1]: {v}"))
            }
        }
        if self.interval_s == 0 || self.interval_s > 3600 {
            return Err(format!("interval_s out of [1,3600]: {}", self.interval_s));
        }
        if self.verify_interval_s == 0 || self.verify_interval_s > self.interval_s.max(1) {
            return Err(format!(
                "verify_interval_s out of [1,{}]: {}",
                self.interval_s, self.verify_interval_s
            ));
        }
        unit("cnn_threshold", self.cnn_threshold)?;
        unit("cnn_dynamic_threshold", self.cnn_dynamic_threshold)?;
        unit("protonet_threshold", self.protonet_threshold)?;
        unit("proto_dynamic_trigger", self.proto_dynamic_trigger)?;
        unit("multiclass_threshold", self.multiclass_threshold)?;
        if !(0.0..=2.0).contains(&self.heatmap_boost_threshold) {
            return Err(format!(
                "heatmap_boost_threshold out of [0,2]: {}",
                self.heatmap_boost_threshold
            ));
        }
        self.zmask_table()
            .map_err(|e| format!("z mask table: {e}"))?;
        Ok(())
    }

    /// Builds the runtime Z table from the transport form.
    pub fn zmask_table(&self) -> Result<ZMaskTable, FaultError> {
        let base = if self.base_mask.is_empty() {
            CellMask::all()
        } else {
            CellMask::from_hex(&self.base_mask)?
        };
        let mut entries = Vec::with_capacity(self.z_masks.len());
        for spec in &self.z_masks {
            entries.push(ZMaskEntry {
                z_mm: spec.z_mm,
                mask: CellMask::from_hex(&spec.mask)?,
            });
        }
        Ok(ZMaskTable::with_entries(base, entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_round_trip() {
        for s in [
            "or",
            "and",
            "all",
            "majority",
            "verify",
            "classify",
            "classify_and",
            "cnn",
            "protonet",
            "multiclass",
        ] {
            assert_eq!(Strategy::from_str(s).unwrap().to_string(), s);
        }
        assert!(Strategy::from_str("sometimes").is_err());
    }

    #[test]
    fn default_config_validates() {
        assert!(FaultDetectConfig::default().validate().is_ok());
    }

    #[test]
    fn zmask_table_builds_from_transport_form() {
        let mut c = FaultDetectConfig::default();
        let table = c.zmask_table().unwrap();
        assert!(table.is_empty());
        assert_eq!(table.base(), &CellMask::all());

        let mut mask = CellMask::empty();
        mask.set(10, true);
        c.z_masks.push(ZMaskSpec {
            z_mm: 2.5,
            mask: mask.to_hex(),
        });
        let table = c.zmask_table().unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.mask_for_z(3.0), &mask);

        c.z_masks[0].mask = "not-hex".to_string();
        assert!(c.zmask_table().is_err());
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let mut c = FaultDetectConfig::default();
        c.cnn_threshold = 1.5;
        assert!(c.validate().is_err());
        let mut c = FaultDetectConfig::default();
        c.verify_interval_s = c.interval_s + 1;
        assert!(c.validate().is_err());
    }
}
