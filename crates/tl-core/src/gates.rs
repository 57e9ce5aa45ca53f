//! Human-in-the-loop checkpoints and which ones each [`HitlMode`] activates.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::pipeline::steps;
use crate::types::HitlMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    BeforePlan,
    BeforeImplement,
    AfterImplement,
    BeforeCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatePosition {
    Before,
    After,
}

impl Gate {
    pub const ALL: [Gate; 4] = [
        Gate::BeforePlan,
        Gate::BeforeImplement,
        Gate::AfterImplement,
        Gate::BeforeCommit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::BeforePlan => "before_plan",
            Gate::BeforeImplement => "before_implement",
            Gate::AfterImplement => "after_implement",
            Gate::BeforeCommit => "before_commit",
        }
    }

    pub fn parse(name: &str) -> Option<Gate> {
        Gate::ALL.iter().copied().find(|g| g.as_str() == name.trim())
    }

    /// The step this gate is attached to.
    pub fn step(&self) -> &'static str {
        match self {
            Gate::BeforePlan => steps::PLAN,
            Gate::BeforeImplement | Gate::AfterImplement => steps::IMPLEMENT,
            Gate::BeforeCommit => steps::COMMIT,
        }
    }

    pub fn position(&self) -> GatePosition {
        match self {
            Gate::AfterImplement => GatePosition::After,
            _ => GatePosition::Before,
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gates active under `mode`.
///
/// `review_only` and `collaborative` share the same gate set.
pub fn active_gates(mode: HitlMode) -> &'static [Gate] {
    match mode {
        HitlMode::Autopilot => &[],
        HitlMode::Supervised => &[Gate::BeforePlan, Gate::BeforeImplement, Gate::BeforeCommit],
        HitlMode::ReviewOnly | HitlMode::Collaborative => {
            &[Gate::AfterImplement, Gate::BeforeCommit]
        }
    }
}

fn gate_at(mode: HitlMode, step: &str, position: GatePosition) -> Option<Gate> {
    active_gates(mode)
        .iter()
        .copied()
        .find(|g| g.step() == step && g.position() == position)
}

/// Gate that must clear before `step` runs, if any.
pub fn gate_before(mode: HitlMode, step: &str) -> Option<Gate> {
    gate_at(mode, step, GatePosition::Before)
}

/// Gate that must clear after `step` completes, if any.
pub fn gate_after(mode: HitlMode, step: &str) -> Option<Gate> {
    gate_at(mode, step, GatePosition::After)
}
