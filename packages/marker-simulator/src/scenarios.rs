//! scenarios.rs — Injectable tracker fault scenarios
//!
//! Each scenario reproduces a failure mode the bridge has to ride out.
//! Scenarios can be switched at runtime from the tracking server
//! (`{"command":"message","data":{"scenario":"<preset>"}}`).
//!
//! Every scenario is recoverable: turning it off returns the tracker to
//! clean output on the next epoch.

use serde::{Deserialize, Serialize};

use marker_types::MarkerId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioType {
    /// Selected targets periodically vanish from detection
    Dropout,
    /// Anchor marker periodically occluded (calibration must hold its last result)
    AnchorLoss,
    /// Random ids outside the target set appear (allow-list must drop them)
    SpuriousIds,
    /// Headings cross the 0/360 boundary every epoch
    HeadingWrap,
    /// Noise ×5 (stresses averaging)
    HighJitter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScenarioConfig {
    pub active: Vec<ScenarioType>,
    pub dropout_ids: Vec<MarkerId>,
    pub dropout_duration_epochs: u32,
    pub anchor_loss_epochs: u32,
    pub spurious_ids: Vec<MarkerId>,
    /// Per-epoch probability that each spurious id shows up
    pub spurious_rate: f64,
    pub jitter_multiplier: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            active: vec![],
            dropout_ids: vec![],
            dropout_duration_epochs: 5,
            anchor_loss_epochs: 30,
            spurious_ids: vec![42, 77, 99],
            spurious_rate: 0.3,
            jitter_multiplier: 5.0,
        }
    }
}

impl ScenarioConfig {
    pub fn has(&self, s: ScenarioType) -> bool {
        self.active.contains(&s)
    }

    pub fn is_dropped(&self, id: MarkerId, epoch: u32) -> bool {
        if !self.has(ScenarioType::Dropout) || !self.dropout_ids.contains(&id) {
            return false;
        }
        epoch % (self.dropout_duration_epochs + 10) < self.dropout_duration_epochs
    }

    /// Anchor hidden for `anchor_loss_epochs` out of every `2 × anchor_loss_epochs`.
    pub fn anchor_hidden(&self, epoch: u32) -> bool {
        if !self.has(ScenarioType::AnchorLoss) || self.anchor_loss_epochs == 0 {
            return false;
        }
        (epoch / self.anchor_loss_epochs) % 2 == 1
    }

    pub fn noise_multiplier(&self) -> f64 {
        if self.has(ScenarioType::HighJitter) { self.jitter_multiplier } else { 1.0 }
    }
}

pub fn preset_dropout(targets: &[MarkerId]) -> ScenarioConfig {
    ScenarioConfig {
        active: vec![ScenarioType::Dropout],
        dropout_ids: targets.iter().copied().take(2).collect(),
        ..Default::default()
    }
}

pub fn preset_anchor_loss() -> ScenarioConfig {
    ScenarioConfig { active: vec![ScenarioType::AnchorLoss], ..Default::default() }
}

pub fn preset_spurious_ids() -> ScenarioConfig {
    ScenarioConfig { active: vec![ScenarioType::SpuriousIds], ..Default::default() }
}

pub fn preset_heading_wrap() -> ScenarioConfig {
    ScenarioConfig { active: vec![ScenarioType::HeadingWrap], ..Default::default() }
}

pub fn preset_high_jitter() -> ScenarioConfig {
    ScenarioConfig { active: vec![ScenarioType::HighJitter], ..Default::default() }
}

/// Look up a preset by name; `None` for an unknown name.
pub fn preset(name: &str, targets: &[MarkerId]) -> Option<ScenarioConfig> {
    Some(match name {
        "dropout" => preset_dropout(targets),
        "anchor_loss" => preset_anchor_loss(),
        "spurious_ids" => preset_spurious_ids(),
        "heading_wrap" => preset_heading_wrap(),
        "high_jitter" => preset_high_jitter(),
        "default" | "none" => ScenarioConfig::default(),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropout_cycles_only_listed_ids() {
        let sc = preset_dropout(&[1, 2, 3]);
        assert!(sc.is_dropped(1, 0));
        assert!(sc.is_dropped(2, 4));
        assert!(!sc.is_dropped(2, 5));
        assert!(!sc.is_dropped(3, 0));
        // Cycle restarts after duration + 10
        assert!(sc.is_dropped(1, 15));
    }

    #[test]
    fn anchor_loss_alternates() {
        let sc = preset_anchor_loss();
        assert!(!sc.anchor_hidden(0));
        assert!(sc.anchor_hidden(30));
        assert!(!sc.anchor_hidden(60));
        assert!(!ScenarioConfig::default().anchor_hidden(30));
    }

    #[test]
    fn presets_by_name() {
        assert_eq!(preset("high_jitter", &[]).unwrap().noise_multiplier(), 5.0);
        assert!(preset("nope", &[]).is_none());
    }
}
