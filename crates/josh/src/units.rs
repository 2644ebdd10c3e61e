//! Units tags carried by every [`crate::value::EngineValue`].
//!
//! A unit is a normalized symbolic string (`"meters"`, `"count"`, `""` for
//! dimensionless). Equality is structural. `Arc<str>` keeps clones cheap
//! without a dedicated offset-table interner, which this crate's scale does
//! not need (spec allows, but does not require, interning).

use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Units(Arc<str>);

impl Units {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(Arc::from(symbol.into()))
    }

    /// The dimensionless unit, `""`.
    pub fn dimensionless() -> Self {
        Self::new("")
    }

    pub fn count() -> Self {
        Self::new("count")
    }

    pub fn meters() -> Self {
        Self::new("meters")
    }

    pub fn position() -> Self {
        Self::new("position")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_dimensionless(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Units {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Units {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn dimensionless_is_empty_string() {
        assert_eq!(Units::dimensionless().as_str(), "");
        assert!(Units::dimensionless().is_dimensionless());
    }

    #[test]
    fn equality_is_structural() {
        assert_eq!(Units::new("meters"), Units::new("meters"));
        assert_ne!(Units::new("meters"), Units::new("km"));
    }

    #[test]
    fn clone_is_cheap_and_equal() {
        let a = Units::new("degC");
        let b = a.clone();
        assert_eq!(a, b);
    }
}
