//! Linear, quadratic, and sigmoid domain-range interpolation.

use crate::value::EngineValue;

/// A domain or range bound pair for a mapping strategy.
#[derive(Debug, Clone)]
pub struct MapBounds {
    pub low: EngineValue,
    pub high: EngineValue,
}

/// The mapping strategies a `map` expression may name.
#[derive(Debug, Clone, Copy)]
pub enum MappingStrategy {
    Linear,
    /// `center_max`: vertex at range-high (downward parabola) vs range-low
    /// (upward parabola).
    Quadratic { center_max: bool },
    /// `steep`: a steeper logistic slope vs a shallower one.
    Sigmoid { steep: bool },
}

impl MappingStrategy {
    pub fn from_name(name: &str, method_arg: Option<bool>) -> Option<Self> {
        match name {
            "linear" => Some(Self::Linear),
            "quadratic" => Some(Self::Quadratic {
                center_max: method_arg.unwrap_or(false),
            }),
            "sigmoid" => Some(Self::Sigmoid {
                steep: method_arg.unwrap_or(false),
            }),
            _ => None,
        }
    }

    /// Applies this strategy. All inputs are plain doubles; unit handling is
    /// the caller's responsibility (the machine routes domain/range pairs
    /// through conversion groups before calling this).
    pub fn apply(self, operand: f64, from_low: f64, from_high: f64, to_low: f64, to_high: f64) -> f64 {
        match self {
            Self::Linear => {
                let percent = (operand - from_low) / (from_high - from_low);
                to_low + percent * (to_high - to_low)
            }
            Self::Quadratic { center_max } => {
                let mid = (from_low + from_high) / 2.0;
                let half_width = (from_high - from_low) / 2.0;
                let t = if half_width == 0.0 { 0.0 } else { (operand - mid) / half_width };
                let t2 = t * t;
                if center_max {
                    to_high - (to_high - to_low) * t2
                } else {
                    to_low + (to_high - to_low) * t2
                }
            }
            Self::Sigmoid { steep } => {
                let mid = (from_low + from_high) / 2.0;
                let width = (from_high - from_low).abs().max(f64::EPSILON);
                let k = if steep { 10.0 / width } else { 4.0 / width };
                let logistic = 1.0 / (1.0 + (-k * (operand - mid)).exp());
                to_low + (to_high - to_low) * logistic
            }
        }
    }
}
