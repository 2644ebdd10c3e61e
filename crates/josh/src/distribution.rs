//! Realized and virtualized distributions.
//!
//! A realized distribution is a finite ordered sequence already in memory; a
//! virtualized distribution is a lazy generator of possibly-unknown size.
//! Statistics are all-or-nothing on a virtualized distribution: if its size is
//! unknown, every statistic fails rather than forcing a partial answer.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use smallvec::SmallVec;

use crate::error::{DomainError, JoshError, JoshResult};
use crate::value::EngineValue;

/// A lazily-produced sequence of values whose total size may never be known.
///
/// Implementors back things like spatial queries over an unbounded external
/// data source; `sample` must be able to produce an element without
/// materializing the whole sequence.
pub trait VirtualizedDistribution: fmt::Debug + Send + Sync {
    /// Draws one value from the underlying generator.
    fn sample(&self, rng: &mut dyn RngMut) -> EngineValue;

    /// The number of elements, if known without exhausting the generator.
    fn get_size(&self) -> Option<usize>;
}

/// Object-safe RNG handle passed to [`VirtualizedDistribution::sample`].
pub trait RngMut {
    fn next_u64(&mut self) -> u64;
    fn gen_range_usize(&mut self, bound: usize) -> usize;
}

impl<R: Rng + ?Sized> RngMut for R {
    fn next_u64(&mut self) -> u64 {
        Rng::r#gen(self)
    }

    fn gen_range_usize(&mut self, bound: usize) -> usize {
        self.gen_range(0..bound)
    }
}

#[derive(Debug, Clone)]
pub enum DistributionContents {
    Realized(SmallVec<[EngineValue; 8]>),
    Virtualized(Arc<dyn VirtualizedDistribution>),
}

impl DistributionContents {
    pub fn realized(items: impl IntoIterator<Item = EngineValue>) -> Self {
        Self::Realized(items.into_iter().collect())
    }

    pub fn get_size(&self) -> Option<usize> {
        match self {
            Self::Realized(items) => Some(items.len()),
            Self::Virtualized(v) => v.get_size(),
        }
    }

    pub fn is_realized(&self) -> bool {
        matches!(self, Self::Realized(_))
    }

    /// Draws a single value without replacement bookkeeping (caller decides).
    pub fn sample_one(&self, rng: &mut dyn RngMut) -> JoshResult<EngineValue> {
        match self {
            Self::Realized(items) => {
                if items.is_empty() {
                    return Err(JoshError::Domain(DomainError::StatisticOnVirtualized {
                        statistic: "sample of an empty distribution".to_owned(),
                    }));
                }
                let idx = rng.gen_range_usize(items.len());
                Ok(items[idx].clone())
            }
            Self::Virtualized(v) => Ok(v.sample(rng)),
        }
    }

    pub fn realized_items(&self) -> Option<&[EngineValue]> {
        match self {
            Self::Realized(items) => Some(items),
            Self::Virtualized(_) => None,
        }
    }

    fn require_realized(&self, statistic: &str) -> JoshResult<&[EngineValue]> {
        self.realized_items()
            .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized {
                statistic: statistic.to_owned(),
            }))
    }

    pub fn count(&self) -> JoshResult<usize> {
        Ok(self.require_realized("count")?.len())
    }

    pub fn min(&self) -> JoshResult<EngineValue> {
        reduce_numeric(self.require_realized("min")?, "min", |a, b| if a <= b { a } else { b })
    }

    pub fn max(&self) -> JoshResult<EngineValue> {
        reduce_numeric(self.require_realized("max")?, "max", |a, b| if a >= b { a } else { b })
    }

    pub fn sum(&self) -> JoshResult<EngineValue> {
        let items = self.require_realized("sum")?;
        crate::value::sum_numeric(items, "sum")
    }

    pub fn mean(&self) -> JoshResult<EngineValue> {
        let items = self.require_realized("mean")?;
        crate::value::mean_numeric(items, "mean")
    }

    pub fn std(&self) -> JoshResult<EngineValue> {
        let items = self.require_realized("std")?;
        crate::value::std_numeric(items, "std")
    }
}

fn reduce_numeric(
    items: &[EngineValue],
    op: &str,
    pick: impl Fn(f64, f64) -> f64,
) -> JoshResult<EngineValue> {
    crate::value::reduce_numeric(items, op, pick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::units::Units;

    fn realized(vals: &[f64]) -> DistributionContents {
        DistributionContents::realized(
            vals.iter()
                .map(|v| EngineValue::scalar_double(*v, Units::count())),
        )
    }

    #[test]
    fn statistics_absent_on_virtualized() {
        #[derive(Debug)]
        struct Unknown;
        impl VirtualizedDistribution for Unknown {
            fn sample(&self, _rng: &mut dyn RngMut) -> EngineValue {
                EngineValue::scalar_double(1.0, Units::count())
            }
            fn get_size(&self) -> Option<usize> {
                None
            }
        }
        let d = DistributionContents::Virtualized(Arc::new(Unknown));
        assert!(d.get_size().is_none());
        assert!(d.count().is_err());
        assert!(d.mean().is_err());
    }

    #[test]
    fn count_matches_realized_len() {
        let d = realized(&[1.0, 2.0, 3.0]);
        assert_eq!(d.count().unwrap(), 3);
    }
}
