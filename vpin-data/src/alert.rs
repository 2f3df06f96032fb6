use derive_more::Display;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Discrete severity of a VPIN score, ordered from least to most severe.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    #[default]
    #[display("NORMAL")]
    Normal,
    #[display("MODERATE")]
    Moderate,
    #[display("ELEVATED")]
    Elevated,
    #[display("HIGH")]
    High,
    #[display("CRITICAL")]
    Critical,
}

impl AlertLevel {
    /// Map a VPIN score onto its severity. Thresholds are inclusive on the lower edge.
    pub fn classify(score: Decimal) -> Self {
        if score >= dec!(0.85) {
            AlertLevel::Critical
        } else if score >= dec!(0.75) {
            AlertLevel::High
        } else if score >= dec!(0.65) {
            AlertLevel::Elevated
        } else if score >= dec!(0.50) {
            AlertLevel::Moderate
        } else {
            AlertLevel::Normal
        }
    }
}

/// True when `new` is strictly more severe than `previous`.
pub fn crossed_up(previous: AlertLevel, new: AlertLevel) -> bool {
    new > previous
}

/// Severity escalation detected by an [`AlertTracker`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Escalation {
    pub previous: AlertLevel,
    pub current: AlertLevel,
}

/// Follows the alert level of consecutive samples and reports upward crossings only, so a
/// sustained severity triggers once.
#[derive(Debug, Clone, Default)]
pub struct AlertTracker {
    level: AlertLevel,
}

impl AlertTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> AlertLevel {
        self.level
    }

    pub fn observe(&mut self, level: AlertLevel) -> Option<Escalation> {
        let previous = std::mem::replace(&mut self.level, level);
        crossed_up(previous, level).then_some(Escalation {
            previous,
            current: level,
        })
    }
}
