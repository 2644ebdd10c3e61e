//! The value model.
//!
//! `EngineValue` is a tagged union of exactly one of a units-tagged scalar, a
//! boolean, a string, an entity reference, or a distribution. Arithmetic
//! between mismatched units is rejected here; the push-down machine is
//! responsible for routing operands through a conversion group first
//! (`crate::machine`).

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};

use crate::distribution::DistributionContents;
use crate::entity::EntityHandle;
use crate::error::{DomainError, JoshError, JoshResult};
use crate::units::Units;

/// A signed real number, represented as either an exact decimal or an
/// IEEE-754 double depending on [`EngineValueFactory::favor_big_decimal`].
///
/// The representation is an implementation detail: callers coerce out via
/// `EngineValue::as_decimal`/`as_double` and never need to match on this type
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Number {
    Decimal(Decimal),
    Double(f64),
}

impl Number {
    pub fn to_f64(self) -> f64 {
        match self {
            Self::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
            Self::Double(d) => d,
        }
    }

    pub fn to_decimal(self) -> Decimal {
        match self {
            Self::Decimal(d) => d,
            Self::Double(d) => Decimal::from_f64(d).unwrap_or(Decimal::ZERO),
        }
    }

    fn favors_decimal(self, other: Self) -> bool {
        matches!(self, Self::Decimal(_)) || matches!(other, Self::Decimal(_))
    }

    fn binary(self, other: Self, double_op: impl Fn(f64, f64) -> f64, decimal_op: impl Fn(Decimal, Decimal) -> Decimal) -> Self {
        if self.favors_decimal(other) {
            Self::Decimal(decimal_op(self.to_decimal(), other.to_decimal()))
        } else {
            Self::Double(double_op(self.to_f64(), other.to_f64()))
        }
    }

    pub fn add(self, other: Self) -> Self {
        self.binary(other, |a, b| a + b, |a, b| a + b)
    }

    pub fn sub(self, other: Self) -> Self {
        self.binary(other, |a, b| a - b, |a, b| a - b)
    }

    pub fn mul(self, other: Self) -> Self {
        self.binary(other, |a, b| a * b, |a, b| a * b)
    }

    pub fn div(self, other: Self) -> Self {
        self.binary(other, |a, b| a / b, |a, b| a / b)
    }

    pub fn pow(self, exponent: Self) -> Self {
        match self {
            Self::Decimal(_) => Self::Double(self.to_f64().powf(exponent.to_f64())),
            Self::Double(d) => Self::Double(d.powf(exponent.to_f64())),
        }
    }

    pub fn cmp_f64(self, other: Self) -> std::cmp::Ordering {
        self.to_f64().total_cmp(&other.to_f64())
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Double(d) => write!(f, "{d}"),
        }
    }
}

/// Picks the numeric representation every [`EngineValue::build`] call uses.
///
/// Representation is the only thing this flag affects; callers always
/// coerce out through `as_decimal`/`as_double` regardless of which mode built
/// the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineValueFactory {
    pub favor_big_decimal: bool,
}

impl EngineValueFactory {
    pub fn new(favor_big_decimal: bool) -> Self {
        Self { favor_big_decimal }
    }

    fn number(&self, value: f64) -> Number {
        if self.favor_big_decimal {
            Number::Decimal(Decimal::from_f64(value).unwrap_or(Decimal::ZERO))
        } else {
            Number::Double(value)
        }
    }

    pub fn build_scalar(&self, value: f64, units: Units) -> EngineValue {
        EngineValue::Scalar {
            number: self.number(value),
            units,
        }
    }

    pub fn build_bool(&self, b: bool) -> EngineValue {
        EngineValue::Boolean {
            b,
            units: Units::dimensionless(),
        }
    }

    pub fn build_string(&self, s: impl Into<String>) -> EngineValue {
        EngineValue::String {
            s: s.into(),
            units: Units::dimensionless(),
        }
    }

    pub fn build_entity(&self, entity: EntityHandle) -> EngineValue {
        EngineValue::EntityRef { entity }
    }

    pub fn build_realized_distribution(
        &self,
        items: impl IntoIterator<Item = EngineValue>,
        units: Units,
    ) -> EngineValue {
        EngineValue::Distribution {
            contents: DistributionContents::realized(items),
            units,
        }
    }
}

/// The tagged union at the center of the language: every attribute value,
/// literal, and intermediate machine-stack entry is one of these.
#[derive(Debug, Clone)]
pub enum EngineValue {
    Scalar { number: Number, units: Units },
    Boolean { b: bool, units: Units },
    String { s: String, units: Units },
    EntityRef { entity: EntityHandle },
    Distribution { contents: DistributionContents, units: Units },
}

impl EngineValue {
    /// Convenience constructor used internally and by tests; production code
    /// should prefer `EngineValueFactory::build_scalar` so representation is
    /// chosen consistently.
    pub fn scalar_double(value: f64, units: Units) -> Self {
        Self::Scalar {
            number: Number::Double(value),
            units,
        }
    }

    pub fn get_units(&self) -> Units {
        match self {
            Self::Scalar { units, .. }
            | Self::Boolean { units, .. }
            | Self::String { units, .. }
            | Self::Distribution { units, .. } => units.clone(),
            Self::EntityRef { entity } => Units::new(entity.borrow().entity_type.clone()),
        }
    }

    pub fn get_language_type(&self) -> &'static str {
        match self {
            Self::Scalar { .. } => "scalar",
            Self::Boolean { .. } => "boolean",
            Self::String { .. } => "string",
            Self::EntityRef { .. } => "entity",
            Self::Distribution { .. } => "distribution",
        }
    }

    pub fn get_size(&self) -> JoshResult<usize> {
        match self {
            Self::Distribution { contents, .. } => contents.count(),
            _ => Ok(1),
        }
    }

    pub fn replace_units(&self, units: Units) -> Self {
        match self.clone() {
            Self::Scalar { number, .. } => Self::Scalar { number, units },
            Self::Boolean { b, .. } => Self::Boolean { b, units },
            Self::String { s, .. } => Self::String { s, units },
            Self::Distribution { contents, .. } => Self::Distribution { contents, units },
            entity @ Self::EntityRef { .. } => entity,
        }
    }

    fn require_scalar(&self, op: &str) -> JoshResult<Number> {
        match self {
            Self::Scalar { number, .. } => Ok(*number),
            Self::Distribution { .. } => Err(JoshError::Domain(DomainError::OperatorOnDistribution { op: op.to_owned() })),
            _ => Err(JoshError::Compile(crate::error::CompileError::UnknownOperator {
                op: format!("{op} on {}", self.get_language_type()),
            })),
        }
    }

    // -- arithmetic ---------------------------------------------------

    /// Adds two values. Distributions broadcast scalars elementwise; two
    /// distributions are combined pairwise. Callers are expected to have
    /// already normalized units through a conversion group.
    pub fn add(&self, other: &Self) -> JoshResult<Self> {
        elementwise(self, other, "add", |a, b, units| EngineValue::Scalar {
            number: a.add(b),
            units,
        })
    }

    pub fn subtract(&self, other: &Self) -> JoshResult<Self> {
        elementwise(self, other, "subtract", |a, b, units| EngineValue::Scalar {
            number: a.sub(b),
            units,
        })
    }

    /// Multiplies two scalars. The `multiply` machine op only ever pushes a
    /// scalar, so distributions are rejected here rather than broadcast
    /// (unlike `add`/`subtract`).
    pub fn multiply(&self, other: &Self) -> JoshResult<Self> {
        let a = self.require_scalar("multiply")?;
        let b = other.require_scalar("multiply")?;
        Ok(Self::Scalar {
            number: a.mul(b),
            units: combine_units_multiply(&self.get_units(), &other.get_units()),
        })
    }

    pub fn divide(&self, other: &Self) -> JoshResult<Self> {
        let a = self.require_scalar("divide")?;
        let b = other.require_scalar("divide")?;
        Ok(Self::Scalar {
            number: a.div(b),
            units: combine_units_divide(&self.get_units(), &other.get_units()),
        })
    }

    pub fn raise_to_power(&self, exponent: &Self) -> JoshResult<Self> {
        let exp_units = exponent.get_units();
        if !exp_units.is_dimensionless() {
            return Err(JoshError::Domain(DomainError::OperatorOnDistribution {
                op: "pow requires a dimensionless exponent".to_owned(),
            }));
        }
        let base = self.require_scalar("pow")?;
        let exp = exponent.require_scalar("pow")?;
        Ok(Self::Scalar {
            number: base.pow(exp),
            units: self.get_units(),
        })
    }

    fn unary_numeric(&self, op: &str, f: impl Fn(Number) -> Number) -> JoshResult<Self> {
        let n = self.require_scalar(op)?;
        Ok(Self::Scalar {
            number: f(n),
            units: self.get_units(),
        })
    }

    pub fn abs(&self) -> JoshResult<Self> {
        self.unary_numeric("abs", |n| match n {
            Number::Decimal(d) => Number::Decimal(d.abs()),
            Number::Double(d) => Number::Double(d.abs()),
        })
    }

    pub fn ceil(&self) -> JoshResult<Self> {
        self.unary_numeric("ceil", |n| match n {
            Number::Decimal(d) => Number::Decimal(d.ceil()),
            Number::Double(d) => Number::Double(d.ceil()),
        })
    }

    pub fn floor(&self) -> JoshResult<Self> {
        self.unary_numeric("floor", |n| match n {
            Number::Decimal(d) => Number::Decimal(d.floor()),
            Number::Double(d) => Number::Double(d.floor()),
        })
    }

    pub fn round(&self) -> JoshResult<Self> {
        self.unary_numeric("round", |n| match n {
            Number::Decimal(d) => Number::Decimal(d.round()),
            Number::Double(d) => Number::Double(d.round()),
        })
    }

    pub fn log10(&self) -> JoshResult<Self> {
        let n = self.require_scalar("log10")?;
        if n.to_f64() <= 0.0 {
            return Err(JoshError::Domain(DomainError::NonPositiveLog {
                op: "log10".to_owned(),
                value: n.to_string(),
            }));
        }
        Ok(Self::Scalar {
            number: Number::Double(n.to_f64().log10()),
            units: self.get_units(),
        })
    }

    pub fn ln(&self) -> JoshResult<Self> {
        let n = self.require_scalar("ln")?;
        if n.to_f64() <= 0.0 {
            return Err(JoshError::Domain(DomainError::NonPositiveLog {
                op: "ln".to_owned(),
                value: n.to_string(),
            }));
        }
        Ok(Self::Scalar {
            number: Number::Double(n.to_f64().ln()),
            units: self.get_units(),
        })
    }

    // -- comparisons ----------------------------------------------------

    /// Units-aware structural equality, kept distinct from the numeric
    /// ordering comparisons below.
    ///
    /// Assumes the caller has already normalized units (the machine routes
    /// `eq`/`neq` through a conversion group before calling this).
    pub fn equal_to(&self, other: &Self) -> JoshResult<bool> {
        Ok(match (self, other) {
            (Self::Scalar { number: a, .. }, Self::Scalar { number: b, .. }) => a.cmp_f64(*b) == std::cmp::Ordering::Equal,
            (Self::Boolean { b: a, .. }, Self::Boolean { b, .. }) => a == b,
            (Self::String { s: a, .. }, Self::String { s: b, .. }) => a == b,
            (Self::EntityRef { entity: a }, Self::EntityRef { entity: b }) => std::rc::Rc::ptr_eq(a, b),
            (Self::Distribution { .. }, Self::Distribution { .. }) => {
                return Err(JoshError::Domain(DomainError::OperatorOnDistribution {
                    op: "eq".to_owned(),
                }));
            }
            _ => false,
        })
    }

    fn compare(&self, other: &Self, op: &str) -> JoshResult<std::cmp::Ordering> {
        let a = self.require_scalar(op)?;
        let b = other.require_scalar(op)?;
        Ok(a.cmp_f64(b))
    }

    pub fn gt(&self, other: &Self) -> JoshResult<bool> {
        Ok(self.compare(other, "gt")? == std::cmp::Ordering::Greater)
    }

    pub fn gte(&self, other: &Self) -> JoshResult<bool> {
        Ok(self.compare(other, "gte")? != std::cmp::Ordering::Less)
    }

    pub fn lt(&self, other: &Self) -> JoshResult<bool> {
        Ok(self.compare(other, "lt")? == std::cmp::Ordering::Less)
    }

    pub fn lte(&self, other: &Self) -> JoshResult<bool> {
        Ok(self.compare(other, "lte")? != std::cmp::Ordering::Greater)
    }

    // -- coercions --------------------------------------------------------

    pub fn as_decimal(&self) -> JoshResult<Decimal> {
        Ok(self.require_scalar("as_decimal")?.to_decimal())
    }

    pub fn as_double(&self) -> JoshResult<f64> {
        Ok(self.require_scalar("as_double")?.to_f64())
    }

    pub fn as_int(&self) -> JoshResult<i64> {
        Ok(self.as_double()? as i64)
    }

    pub fn as_bool(&self) -> JoshResult<bool> {
        match self {
            Self::Boolean { b, .. } => Ok(*b),
            _ => Err(JoshError::Compile(crate::error::CompileError::UnknownOperator {
                op: format!("as_bool on {}", self.get_language_type()),
            })),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Self::Scalar { number, units } => {
                if units.is_dimensionless() {
                    number.to_string()
                } else {
                    format!("{number} {units}")
                }
            }
            Self::Boolean { b, .. } => b.to_string(),
            Self::String { s, .. } => s.clone(),
            Self::EntityRef { entity } => entity.borrow().name.clone(),
            Self::Distribution { .. } => "<distribution>".to_owned(),
        }
    }

    pub fn as_entity(&self) -> JoshResult<EntityHandle> {
        match self {
            Self::EntityRef { entity } => Ok(entity.clone()),
            _ => Err(JoshError::Compile(crate::error::CompileError::UnknownOperator {
                op: format!("as_entity on {}", self.get_language_type()),
            })),
        }
    }

    pub fn as_distribution(&self) -> JoshResult<&DistributionContents> {
        match self {
            Self::Distribution { contents, .. } => Ok(contents),
            _ => Err(JoshError::Compile(crate::error::CompileError::UnknownOperator {
                op: format!("as_distribution on {}", self.get_language_type()),
            })),
        }
    }
}

impl fmt::Display for EngineValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

fn combine_units_multiply(left: &Units, right: &Units) -> Units {
    if left.is_dimensionless() {
        right.clone()
    } else if right.is_dimensionless() {
        left.clone()
    } else if left == right {
        Units::new(format!("{left}^2"))
    } else {
        Units::new(format!("{left}*{right}"))
    }
}

fn combine_units_divide(left: &Units, right: &Units) -> Units {
    if right.is_dimensionless() {
        left.clone()
    } else if left == right {
        Units::dimensionless()
    } else {
        Units::new(format!("{left}/{right}"))
    }
}

/// Shared implementation for `add`/`subtract`: scalar-scalar, scalar-distribution
/// (broadcast), and distribution-distribution (elementwise, matching length).
fn elementwise(
    left: &EngineValue,
    right: &EngineValue,
    op: &str,
    scalar_op: impl Fn(Number, Number, Units) -> EngineValue + Copy,
) -> JoshResult<EngineValue> {
    use EngineValue::{Distribution, Scalar};
    match (left, right) {
        (Scalar { number: a, units }, Scalar { number: b, .. }) => Ok(scalar_op(*a, *b, units.clone())),
        (Distribution { contents, units }, Scalar { number: b, .. }) => {
            let items = contents
                .realized_items()
                .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: op.to_owned() }))?;
            let combined: Vec<EngineValue> = items
                .iter()
                .map(|item| {
                    let a = item.require_scalar(op)?;
                    Ok(scalar_op(a, *b, units.clone()))
                })
                .collect::<JoshResult<_>>()?;
            Ok(EngineValue::Distribution {
                contents: DistributionContents::realized(combined),
                units: units.clone(),
            })
        }
        (Scalar { number: a, units }, Distribution { contents, .. }) => {
            let items = contents
                .realized_items()
                .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: op.to_owned() }))?;
            let combined: Vec<EngineValue> = items
                .iter()
                .map(|item| {
                    let b = item.require_scalar(op)?;
                    Ok(scalar_op(*a, b, units.clone()))
                })
                .collect::<JoshResult<_>>()?;
            Ok(EngineValue::Distribution {
                contents: DistributionContents::realized(combined),
                units: units.clone(),
            })
        }
        (Distribution { contents: left_c, units }, Distribution { contents: right_c, .. }) => {
            let left_items = left_c
                .realized_items()
                .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: op.to_owned() }))?;
            let right_items = right_c
                .realized_items()
                .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: op.to_owned() }))?;
            if left_items.len() != right_items.len() {
                return Err(JoshError::State(crate::error::StateError::StackUnderflow {
                    op: format!("{op}: mismatched distribution sizes"),
                }));
            }
            let combined: Vec<EngineValue> = left_items
                .iter()
                .zip(right_items.iter())
                .map(|(l, r)| {
                    let a = l.require_scalar(op)?;
                    let b = r.require_scalar(op)?;
                    Ok(scalar_op(a, b, units.clone()))
                })
                .collect::<JoshResult<_>>()?;
            Ok(EngineValue::Distribution {
                contents: DistributionContents::realized(combined),
                units: units.clone(),
            })
        }
        _ => Err(JoshError::Compile(crate::error::CompileError::UnknownOperator {
            op: format!("{op} on {}/{}", left.get_language_type(), right.get_language_type()),
        })),
    }
}

pub(crate) fn reduce_numeric(
    items: &[EngineValue],
    op: &str,
    pick: impl Fn(f64, f64) -> f64,
) -> JoshResult<EngineValue> {
    let mut iter = items.iter();
    let first = iter
        .next()
        .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: op.to_owned() }))?;
    let units = first.get_units();
    let mut best = first.as_double()?;
    for item in iter {
        best = pick(best, item.as_double()?);
    }
    Ok(EngineValue::scalar_double(best, units))
}

pub(crate) fn sum_numeric(items: &[EngineValue], op: &str) -> JoshResult<EngineValue> {
    let units = items
        .first()
        .map(EngineValue::get_units)
        .unwrap_or_else(Units::dimensionless);
    let mut total = 0.0;
    for item in items {
        total += item.as_double().map_err(|_| {
            JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: op.to_owned() })
        })?;
    }
    Ok(EngineValue::scalar_double(total, units))
}

pub(crate) fn mean_numeric(items: &[EngineValue], op: &str) -> JoshResult<EngineValue> {
    if items.is_empty() {
        return Err(JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: op.to_owned() }));
    }
    let sum = sum_numeric(items, op)?;
    let units = sum.get_units();
    Ok(EngineValue::scalar_double(sum.as_double()? / items.len() as f64, units))
}

pub(crate) fn std_numeric(items: &[EngineValue], op: &str) -> JoshResult<EngineValue> {
    if items.is_empty() {
        return Err(JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: op.to_owned() }));
    }
    let mean = mean_numeric(items, op)?.as_double()?;
    let units = items[0].get_units();
    let variance = items
        .iter()
        .map(|item| item.as_double().map(|v| (v - mean).powi(2)))
        .collect::<JoshResult<Vec<_>>>()?
        .iter()
        .sum::<f64>()
        / items.len() as f64;
    Ok(EngineValue::scalar_double(variance.sqrt(), units))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn factory() -> EngineValueFactory {
        EngineValueFactory::new(false)
    }

    #[test]
    fn add_requires_matching_representation_units_agnostic() {
        let f = factory();
        let a = f.build_scalar(2.0, Units::meters());
        let b = f.build_scalar(3.0, Units::meters());
        let sum = a.add(&b).unwrap();
        assert_eq!(sum.as_double().unwrap(), 5.0);
        assert_eq!(sum.get_units(), Units::meters());
    }

    #[test]
    fn multiply_dimensionless_times_x_is_x() {
        let f = factory();
        let a = f.build_scalar(2.0, Units::dimensionless());
        let b = f.build_scalar(3.0, Units::meters());
        let product = a.multiply(&b).unwrap();
        assert_eq!(product.as_double().unwrap(), 6.0);
        assert_eq!(product.get_units(), Units::meters());
    }

    #[test]
    fn pow_requires_dimensionless_exponent() {
        let f = factory();
        let base = f.build_scalar(2.0, Units::meters());
        let bad_exp = f.build_scalar(2.0, Units::meters());
        assert!(base.raise_to_power(&bad_exp).is_err());
        let good_exp = f.build_scalar(2.0, Units::dimensionless());
        assert_eq!(base.raise_to_power(&good_exp).unwrap().as_double().unwrap(), 4.0);
    }

    #[test]
    fn log_of_nonpositive_fails() {
        let f = factory();
        let zero = f.build_scalar(0.0, Units::dimensionless());
        assert!(zero.log10().is_err());
        assert!(zero.ln().is_err());
    }

    #[test]
    fn abs_on_distribution_is_domain_error() {
        let f = factory();
        let dist = f.build_realized_distribution(vec![f.build_scalar(-1.0, Units::count())], Units::count());
        assert!(matches!(dist.abs(), Err(JoshError::Domain(DomainError::OperatorOnDistribution { .. }))));
    }

    #[test]
    fn equal_to_is_units_aware_once_normalized() {
        let f = factory();
        let a = f.build_scalar(1.0, Units::meters());
        let b = f.build_scalar(1.0, Units::meters());
        assert!(a.equal_to(&b).unwrap());
    }

    #[test]
    fn add_broadcasts_scalar_over_distribution() {
        let f = factory();
        let dist = f.build_realized_distribution(
            vec![f.build_scalar(1.0, Units::count()), f.build_scalar(2.0, Units::count())],
            Units::count(),
        );
        let one = f.build_scalar(1.0, Units::count());
        let result = dist.add(&one).unwrap();
        let items = result.as_distribution().unwrap().realized_items().unwrap();
        assert_eq!(items[0].as_double().unwrap(), 2.0);
        assert_eq!(items[1].as_double().unwrap(), 3.0);
    }
}
