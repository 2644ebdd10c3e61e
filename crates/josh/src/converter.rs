//! Unit conversions and the converter table.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::{JoshError, JoshResult, UnitsError};
use crate::units::Units;
use crate::value::EngineValue;

/// A single unit conversion: either a self-identity alias (`Noop`) or a
/// callable that transforms a value from `source_units` to `destination_units`.
#[derive(Clone)]
pub enum Conversion {
    Noop { units: Units },
    Direct {
        source_units: Units,
        destination_units: Units,
        callable: Rc<dyn Fn(&EngineValue) -> JoshResult<EngineValue>>,
    },
}

impl fmt::Debug for Conversion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop { units } => write!(f, "Noop({units})"),
            Self::Direct {
                source_units,
                destination_units,
                ..
            } => write!(f, "Direct({source_units} -> {destination_units})"),
        }
    }
}

impl Conversion {
    pub fn source_units(&self) -> &Units {
        match self {
            Self::Noop { units } => units,
            Self::Direct { source_units, .. } => source_units,
        }
    }

    pub fn destination_units(&self) -> &Units {
        match self {
            Self::Noop { units } => units,
            Self::Direct { destination_units, .. } => destination_units,
        }
    }

    pub fn apply(&self, value: &EngineValue) -> JoshResult<EngineValue> {
        match self {
            Self::Noop { units } => Ok(value.replace_units(units.clone())),
            Self::Direct { callable, .. } => callable(value),
        }
    }
}

/// Indexes conversions by `(source, destination)` and resolves the correct
/// one for a conversion group.
#[derive(Clone, Default)]
pub struct Converter {
    table: IndexMap<(Units, Units), Conversion>,
}

impl Converter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, conversion: Conversion) {
        let key = (conversion.source_units().clone(), conversion.destination_units().clone());
        self.table.insert(key, conversion);
    }

    pub fn convert(&self, value: &EngineValue, target: &Units) -> JoshResult<EngineValue> {
        let source = value.get_units();
        if source == *target {
            return Ok(value.clone());
        }
        let key = (source.clone(), target.clone());
        match self.table.get(&key) {
            Some(conversion) => conversion.apply(value),
            None => Err(JoshError::Units(UnitsError {
                source: source.to_string(),
                destination: target.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn noop_conversion_just_relabels_units() {
        let mut converter = Converter::new();
        converter.register(Conversion::Noop { units: Units::new("m") });
        let value = EngineValue::scalar_double(5.0, Units::new("m"));
        let converted = converter.convert(&value, &Units::new("m")).unwrap();
        assert_eq!(converted.get_units(), Units::new("m"));
    }

    #[test]
    fn missing_conversion_is_units_error() {
        let converter = Converter::new();
        let value = EngineValue::scalar_double(5.0, Units::new("km"));
        assert!(matches!(
            converter.convert(&value, &Units::new("m")),
            Err(JoshError::Units(_))
        ));
    }

    #[test]
    fn direct_conversion_transforms_value() {
        let mut converter = Converter::new();
        converter.register(Conversion::Direct {
            source_units: Units::new("km"),
            destination_units: Units::new("m"),
            callable: Rc::new(|v| Ok(EngineValue::scalar_double(v.as_double()? * 1000.0, Units::new("m")))),
        });
        let value = EngineValue::scalar_double(2.0, Units::new("km"));
        let converted = converter.convert(&value, &Units::new("m")).unwrap();
        assert_eq!(converted.as_double().unwrap(), 2000.0);
    }
}
