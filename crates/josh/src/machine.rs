//! The push-down evaluation machine.
//!
//! Single-threaded, cooperative, one machine per handler invocation. The
//! stack is a contiguous LIFO of [`EngineValue`]s; every operator in the
//! language's catalog is implemented as a method here. Conversion groups
//! bracket consecutive pops that must share units; nesting them is a state
//! error.

use std::rc::Rc;
use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use smallvec::SmallVec;

use crate::bridge::{BridgeGetter, EngineBridge};
use crate::distribution::DistributionContents;
use crate::entity::{Entity, EntityHandle, Substep};
use crate::error::{DomainError, JoshError, JoshResult, StateError};
use crate::mapping::MappingStrategy;
use crate::scope::{LocalScope, Scope};
use crate::units::Units;
use crate::value::{EngineValue, EngineValueFactory, Number};

/// A seedable RNG shared across the machines of one simulation: a single
/// synchronized generator rather than one per machine, so that sequential
/// draws differ across entities that share a seed. The `Mutex` lets the
/// same RNG be shared across machines running on different threads.
#[derive(Clone)]
pub struct SharedRng(Arc<Mutex<ChaCha8Rng>>);

impl SharedRng {
    pub fn seeded(seed: u64) -> Self {
        Self(Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))))
    }

    /// Seeds from wall-clock time when the caller has no deterministic seed
    /// to inject.
    pub fn from_entropy() -> Self {
        let seed = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64;
        Self::seeded(seed)
    }

    fn gen_f64(&self) -> f64 {
        self.0.lock().expect("rng mutex poisoned").r#gen::<f64>()
    }

    fn gen_range_usize(&self, bound: usize) -> usize {
        self.0.lock().expect("rng mutex poisoned").gen_range(0..bound)
    }

    /// Standard normal draw via the Box-Muller transform.
    fn gen_standard_normal(&self) -> f64 {
        let mut guard = self.0.lock().expect("rng mutex poisoned");
        let u1: f64 = guard.r#gen::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = guard.r#gen();
        (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

struct RngMutAdapter<'a>(&'a SharedRng);

impl crate::distribution::RngMut for RngMutAdapter<'_> {
    fn next_u64(&mut self) -> u64 {
        (self.0.gen_f64() * u64::MAX as f64) as u64
    }

    fn gen_range_usize(&mut self, bound: usize) -> usize {
        self.0.gen_range_usize(bound)
    }
}

/// Tracks an open conversion group: the units the first pop recorded as the
/// common target. Nesting is rejected.
struct ConversionGroup {
    target: Option<Units>,
}

/// The push-down evaluator. Borrows a scope and a bridge for the duration of
/// one handler invocation and releases them on return.
pub struct Machine {
    stack: SmallVec<[EngineValue; 16]>,
    group: Option<ConversionGroup>,
    ended: bool,
    scope: Rc<LocalScope>,
    bridge: Rc<BridgeGetter>,
    rng: SharedRng,
    factory: EngineValueFactory,
    current_substep: Substep,
    /// The geographic key of the entity this handler is running on, if any;
    /// threaded through to `bridge.get_external`. `None`
    /// outside a per-entity invocation (e.g. top-level simulation handlers).
    geo_key: Option<String>,
}

impl Machine {
    pub fn new(
        scope: Rc<LocalScope>,
        bridge: Rc<BridgeGetter>,
        rng: SharedRng,
        factory: EngineValueFactory,
        current_substep: Substep,
    ) -> Self {
        Self {
            stack: SmallVec::new(),
            group: None,
            ended: false,
            scope,
            bridge,
            rng,
            factory,
            current_substep,
            geo_key: None,
        }
    }

    /// Attaches the geographic key of the entity this machine runs a handler
    /// for.
    pub fn with_geo_key(mut self, geo_key: Option<String>) -> Self {
        self.geo_key = geo_key;
        self
    }

    pub fn scope(&self) -> &dyn Scope {
        self.scope.as_ref()
    }

    pub fn local_scope(&self) -> &LocalScope {
        self.scope.as_ref()
    }

    pub fn factory(&self) -> &EngineValueFactory {
        &self.factory
    }

    pub fn current_substep(&self) -> Substep {
        self.current_substep
    }

    fn bridge(&self) -> JoshResult<Rc<dyn EngineBridge>> {
        self.bridge.get().cloned()
    }

    // -- stack discipline --------------------------------------------------

    pub fn push(&mut self, value: EngineValue) {
        self.stack.push(value);
    }

    pub fn pop(&mut self, op: &str) -> JoshResult<EngineValue> {
        self.stack
            .pop()
            .ok_or_else(|| JoshError::State(StateError::StackUnderflow { op: op.to_owned() }))
    }

    pub fn pop_bool(&mut self, op: &str) -> JoshResult<bool> {
        self.pop(op)?.as_bool()
    }

    /// Used by [`crate::action::ChainingConditionalBuilder`]: pops the
    /// boolean a compiled condition left on top of the stack.
    pub fn pop_bool_for_condition(&mut self) -> JoshResult<bool> {
        self.pop_bool("condition")
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Transitions `is_ended` false -> true exactly once.
    pub fn end(&mut self) -> JoshResult<()> {
        if self.ended {
            return Err(JoshError::State(StateError::MachineAlreadyEnded));
        }
        self.ended = true;
        Ok(())
    }

    /// Requires `is_ended` and a non-empty stack; returns the top without
    /// popping.
    pub fn get_result(&self) -> JoshResult<EngineValue> {
        if !self.ended {
            return Err(JoshError::State(StateError::MachineNotEnded));
        }
        self.stack
            .last()
            .cloned()
            .ok_or_else(|| JoshError::State(StateError::StackUnderflow { op: "get_result".to_owned() }))
    }

    // -- conversion groups ---------------------------------------------------

    fn open_group(&mut self) -> JoshResult<()> {
        if self.group.is_some() {
            return Err(JoshError::State(StateError::NestedConversionGroup));
        }
        self.group = Some(ConversionGroup { target: None });
        Ok(())
    }

    fn close_group(&mut self) {
        self.group = None;
    }

    /// Pops one value inside an open conversion group. The first pop in the
    /// group records its units as the target; later pops are routed through
    /// `bridge.convert` if their units differ.
    fn pop_for_conversion(&mut self, op: &str) -> JoshResult<EngineValue> {
        let value = self.pop(op)?;
        let target = match &self.group {
            Some(group) => group.target.clone(),
            None => return Err(JoshError::State(StateError::StackUnderflow {
                op: format!("{op}: no conversion group open"),
            })),
        };
        match target {
            None => {
                if let Some(group) = &mut self.group {
                    group.target = Some(value.get_units());
                }
                Ok(value)
            }
            Some(target_units) => {
                if value.get_units() == target_units {
                    Ok(value)
                } else {
                    self.bridge()?.convert(&value, &target_units)
                }
            }
        }
    }

    // -- arithmetic / logical / comparison -----------------------------------

    pub fn op_add(&mut self) -> JoshResult<()> {
        self.open_group()?;
        let right = self.pop_for_conversion("add")?;
        let left = self.pop_for_conversion("add")?;
        self.close_group();
        self.push(left.add(&right)?);
        Ok(())
    }

    pub fn op_subtract(&mut self) -> JoshResult<()> {
        self.open_group()?;
        let right = self.pop_for_conversion("subtract")?;
        let left = self.pop_for_conversion("subtract")?;
        self.close_group();
        self.push(left.subtract(&right)?);
        Ok(())
    }

    pub fn op_multiply(&mut self) -> JoshResult<()> {
        let right = self.pop("multiply")?;
        let left = self.pop("multiply")?;
        self.push(left.multiply(&right)?);
        Ok(())
    }

    pub fn op_divide(&mut self) -> JoshResult<()> {
        let right = self.pop("divide")?;
        let left = self.pop("divide")?;
        self.push(left.divide(&right)?);
        Ok(())
    }

    pub fn op_pow(&mut self) -> JoshResult<()> {
        let exponent = self.pop("pow")?;
        let base = self.pop("pow")?;
        self.push(base.raise_to_power(&exponent)?);
        Ok(())
    }

    pub fn op_concat(&mut self) -> JoshResult<()> {
        self.open_group()?;
        let right = self.pop_for_conversion("concat")?;
        let left = self.pop_for_conversion("concat")?;
        self.close_group();
        let right_units = right.get_units();
        let left_items = left
            .as_distribution()?
            .realized_items()
            .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: "concat".to_owned() }))?
            .to_vec();
        let right_items = right
            .as_distribution()?
            .realized_items()
            .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: "concat".to_owned() }))?
            .to_vec();
        let combined = left_items.into_iter().chain(right_items).collect::<Vec<_>>();
        self.push(EngineValue::Distribution {
            contents: DistributionContents::realized(combined),
            units: right_units,
        });
        Ok(())
    }

    pub fn op_and(&mut self) -> JoshResult<()> {
        let right = self.pop_bool("and")?;
        let left = self.pop_bool("and")?;
        self.push(self.factory.build_bool(left && right));
        Ok(())
    }

    pub fn op_or(&mut self) -> JoshResult<()> {
        let right = self.pop_bool("or")?;
        let left = self.pop_bool("or")?;
        self.push(self.factory.build_bool(left || right));
        Ok(())
    }

    pub fn op_xor(&mut self) -> JoshResult<()> {
        let right = self.pop_bool("xor")?;
        let left = self.pop_bool("xor")?;
        self.push(self.factory.build_bool(left ^ right));
        Ok(())
    }

    fn comparison(&mut self, op: &str, cmp: impl Fn(&EngineValue, &EngineValue) -> JoshResult<bool>) -> JoshResult<()> {
        self.open_group()?;
        let right = self.pop_for_conversion(op)?;
        let left = self.pop_for_conversion(op)?;
        self.close_group();
        let result = cmp(&left, &right)?;
        self.push(self.factory.build_bool(result));
        Ok(())
    }

    pub fn op_eq(&mut self) -> JoshResult<()> {
        self.comparison("eq", |l, r| l.equal_to(r))
    }

    pub fn op_neq(&mut self) -> JoshResult<()> {
        self.comparison("neq", |l, r| l.equal_to(r).map(|eq| !eq))
    }

    pub fn op_gt(&mut self) -> JoshResult<()> {
        self.comparison("gt", |l, r| l.gt(r))
    }

    pub fn op_gte(&mut self) -> JoshResult<()> {
        self.comparison("gte", |l, r| l.gte(r))
    }

    pub fn op_lt(&mut self) -> JoshResult<()> {
        self.comparison("lt", |l, r| l.lt(r))
    }

    pub fn op_lte(&mut self) -> JoshResult<()> {
        self.comparison("lte", |l, r| l.lte(r))
    }

    // -- slicing / sampling ---------------------------------------------------

    pub fn op_slice(&mut self) -> JoshResult<()> {
        let selections = self.pop("slice")?;
        let subject = self.pop("slice")?;
        let (contents, units) = match &subject {
            EngineValue::Distribution { contents, units } => (contents, units.clone()),
            _ => {
                return Err(JoshError::Domain(DomainError::OperatorOnDistribution { op: "slice".to_owned() }));
            }
        };
        let items = contents
            .realized_items()
            .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: "slice".to_owned() }))?;
        let mask = selections
            .as_distribution()?
            .realized_items()
            .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: "slice".to_owned() }))?;
        let filtered: Vec<EngineValue> = items
            .iter()
            .zip(mask.iter())
            .filter_map(|(item, keep)| match keep.as_bool() {
                Ok(true) => Some(item.clone()),
                _ => None,
            })
            .collect();
        self.push(EngineValue::Distribution {
            contents: DistributionContents::realized(filtered),
            units,
        });
        Ok(())
    }

    pub fn op_sample(&mut self, with_replacement: bool) -> JoshResult<()> {
        let count_value = self.pop("sample")?;
        let subject = self.pop("sample")?;
        let count = count_value.as_double()?.round() as i64;
        if count < 0 {
            return Err(JoshError::Domain(DomainError::NegativeEntityCount { count: count.to_string() }));
        }
        let contents = subject.as_distribution()?;
        let units = subject.get_units();
        if count == 1 {
            let mut adapter = RngMutAdapter(&self.rng);
            let value = contents.sample_one(&mut adapter)?;
            self.push(value);
            return Ok(());
        }
        let items = contents
            .realized_items()
            .ok_or_else(|| JoshError::Domain(DomainError::StatisticOnVirtualized { statistic: "sample".to_owned() }))?;
        if !with_replacement && count as usize > items.len() {
            return Err(JoshError::Domain(DomainError::NegativeEntityCount {
                count: "sample without replacement cannot exceed distribution size".to_owned(),
            }));
        }
        let mut drawn = Vec::with_capacity(count as usize);
        if with_replacement {
            for _ in 0..count {
                let idx = self.rng.gen_range_usize(items.len());
                drawn.push(items[idx].clone());
            }
        } else {
            let mut pool: Vec<EngineValue> = items.to_vec();
            for _ in 0..count {
                let idx = self.rng.gen_range_usize(pool.len());
                drawn.push(pool.remove(idx));
            }
        }
        self.push(EngineValue::Distribution {
            contents: DistributionContents::realized(drawn),
            units,
        });
        Ok(())
    }

    // -- casting / bounding ---------------------------------------------------

    pub fn op_cast(&mut self, units: Units, force: bool) -> JoshResult<()> {
        let subject = self.pop("cast")?;
        let result = if force {
            subject.replace_units(units)
        } else {
            self.bridge()?.convert(&subject, &units)?
        };
        self.push(result);
        Ok(())
    }

    pub fn op_bound(&mut self, has_lower: bool, has_upper: bool) -> JoshResult<()> {
        self.open_group()?;
        let upper = if has_upper { Some(self.pop_for_conversion("bound")?) } else { None };
        let lower = if has_lower { Some(self.pop_for_conversion("bound")?) } else { None };
        let target = self.pop_for_conversion("bound")?;
        self.close_group();
        let units = target.get_units();
        let mut value = target.as_double()?;
        if let Some(lower) = &lower {
            value = value.max(lower.as_double()?);
        }
        if let Some(upper) = &upper {
            value = value.min(upper.as_double()?);
        }
        self.push(EngineValue::scalar_double(value, units));
        Ok(())
    }

    pub fn op_apply_map(&mut self, strategy: MappingStrategy) -> JoshResult<()> {
        self.open_group()?;
        let to_high = self.pop_for_conversion("map range")?;
        let to_low = self.pop_for_conversion("map range")?;
        self.close_group();

        self.open_group()?;
        let from_high = self.pop_for_conversion("map domain")?;
        let from_low = self.pop_for_conversion("map domain")?;
        let operand = self.pop_for_conversion("map domain")?;
        self.close_group();

        let result = strategy.apply(
            operand.as_double()?,
            from_low.as_double()?,
            from_high.as_double()?,
            to_low.as_double()?,
            to_high.as_double()?,
        );
        self.push(EngineValue::scalar_double(result, to_low.get_units()));
        Ok(())
    }

    // -- entity construction / spatial queries ---------------------------------

    pub fn op_create_entity(&mut self, entity_type: &str) -> JoshResult<()> {
        let count_value = self.pop("create_entity")?;
        let count = count_value.as_double()?.round();
        if count < 0.0 {
            return Err(JoshError::Domain(DomainError::NegativeEntityCount { count: count.to_string() }));
        }
        let bridge = self.bridge()?;
        let prototype = bridge.get_prototype(entity_type)?;
        let count = count as usize;
        let mut built = Vec::with_capacity(count);
        for _ in 0..count {
            let name = format!("{entity_type}-{}", uuid::Uuid::new_v4());
            let entity = prototype.build(name);
            crate::fast_forward::EntityFastForwarder::fast_forward(
                &entity,
                self.current_substep,
                self.bridge.clone(),
                self.rng.clone(),
                self.factory,
            )?;
            built.push(entity);
        }
        if count == 1 {
            self.push(self.factory.build_entity(built.into_iter().next().expect("count == 1")));
        } else {
            let values = built.into_iter().map(|e| self.factory.build_entity(e));
            self.push(self.factory.build_realized_distribution(values, Units::new(entity_type)));
        }
        Ok(())
    }

    pub fn op_execute_spatial_query(&mut self, resolver: &crate::scope::ValueResolver) -> JoshResult<()> {
        let distance = self.pop("execute_spatial_query")?;
        let distance_meters = if distance.get_units() == Units::meters() {
            distance
        } else {
            self.bridge()?.convert(&distance, &Units::meters())?
        };
        let radius_meters = distance_meters.as_double()?;
        let subject = resolver.get(self.scope())?.as_entity()?;
        let geometry = subject
            .borrow()
            .geometry
            .clone()
            .ok_or_else(|| JoshError::Resolution(crate::error::ResolutionError {
                path: "geometry".to_owned(),
                available: vec![],
            }))?;
        let bridge = self.bridge()?;
        let patches = bridge.get_prior_patches(&geometry, radius_meters)?;
        let values = patches.into_iter().map(|e| self.factory.build_entity(e));
        self.push(self.factory.build_realized_distribution(values, Units::new("patch")));
        Ok(())
    }

    pub fn op_push_attribute(&mut self, resolver: &crate::scope::ValueResolver) -> JoshResult<()> {
        let subject = self.pop("push_attribute")?.as_entity()?;
        let entity_scope = crate::scope::EntityScope::new(subject, self.scope.converter());
        let value = resolver.get(&entity_scope)?;
        self.push(value);
        Ok(())
    }

    // -- randomness -------------------------------------------------------

    pub fn op_rand_uniform(&mut self) -> JoshResult<()> {
        self.open_group()?;
        let high = self.pop_for_conversion("rand_uniform")?;
        let low = self.pop_for_conversion("rand_uniform")?;
        self.close_group();
        let low_v = low.as_double()?;
        let high_v = high.as_double()?;
        let draw = low_v + self.rng.gen_f64() * (high_v - low_v);
        self.push(EngineValue::scalar_double(draw, low.get_units()));
        Ok(())
    }

    pub fn op_rand_norm(&mut self) -> JoshResult<()> {
        self.open_group()?;
        let std = self.pop_for_conversion("rand_norm")?;
        let mean = self.pop_for_conversion("rand_norm")?;
        self.close_group();
        let draw = mean.as_double()? + self.rng.gen_standard_normal() * std.as_double()?;
        self.push(EngineValue::scalar_double(draw, mean.get_units()));
        Ok(())
    }

    // -- unary numeric ------------------------------------------------------

    pub fn op_abs(&mut self) -> JoshResult<()> {
        let value = self.pop("abs")?;
        self.push(value.abs()?);
        Ok(())
    }

    pub fn op_ceil(&mut self) -> JoshResult<()> {
        let value = self.pop("ceil")?;
        self.push(value.ceil()?);
        Ok(())
    }

    pub fn op_floor(&mut self) -> JoshResult<()> {
        let value = self.pop("floor")?;
        self.push(value.floor()?);
        Ok(())
    }

    pub fn op_round(&mut self) -> JoshResult<()> {
        let value = self.pop("round")?;
        self.push(value.round()?);
        Ok(())
    }

    pub fn op_log10(&mut self) -> JoshResult<()> {
        let value = self.pop("log10")?;
        self.push(value.log10()?);
        Ok(())
    }

    pub fn op_ln(&mut self) -> JoshResult<()> {
        let value = self.pop("ln")?;
        self.push(value.ln()?);
        Ok(())
    }

    // -- distribution statistics ---------------------------------------------

    pub fn op_count(&mut self) -> JoshResult<()> {
        let value = self.pop("count")?;
        let count = value.as_distribution()?.count()?;
        self.push(self.factory.build_scalar(count as f64, Units::count()));
        Ok(())
    }

    pub fn op_max(&mut self) -> JoshResult<()> {
        let value = self.pop("max")?;
        self.push(value.as_distribution()?.max()?);
        Ok(())
    }

    pub fn op_mean(&mut self) -> JoshResult<()> {
        let value = self.pop("mean")?;
        self.push(value.as_distribution()?.mean()?);
        Ok(())
    }

    pub fn op_min(&mut self) -> JoshResult<()> {
        let value = self.pop("min")?;
        self.push(value.as_distribution()?.min()?);
        Ok(())
    }

    pub fn op_std(&mut self) -> JoshResult<()> {
        let value = self.pop("std")?;
        self.push(value.as_distribution()?.std()?);
        Ok(())
    }

    pub fn op_sum(&mut self) -> JoshResult<()> {
        let value = self.pop("sum")?;
        self.push(value.as_distribution()?.sum()?);
        Ok(())
    }

    // -- position / locals / control flow -------------------------------------

    pub fn op_make_position(&mut self) -> JoshResult<()> {
        let type2 = self.pop("make_position")?.as_string();
        let val2 = self.pop("make_position")?;
        let type1 = self.pop("make_position")?.as_string();
        let val1 = self.pop("make_position")?;
        let description = format!("{} {type1}, {} {type2}", val1.as_string(), val2.as_string());
        self.push(EngineValue::String {
            s: description,
            units: Units::position(),
        });
        Ok(())
    }

    // -- config / external references -----------------------------------

    /// `config("name")` with no default: fails if the bridge has nothing
    /// registered under that name.
    pub fn op_push_config(&mut self, name: &str) -> JoshResult<()> {
        let value = self.bridge()?.get_config_optional(name).ok_or_else(|| {
            JoshError::Resolution(crate::error::ResolutionError {
                path: format!("config.{name}"),
                available: vec![],
            })
        })?;
        self.push(value);
        Ok(())
    }

    /// `config("name", default)`: the default was compiled and pushed before
    /// this op runs; a missing config recovers by using it.
    pub fn op_push_config_with_default(&mut self, name: &str) -> JoshResult<()> {
        let default = self.pop("push_config_with_default")?;
        let value = self.bridge()?.get_config_optional(name).unwrap_or(default);
        self.push(value);
        Ok(())
    }

    /// `external("name")` / `external("name", step)`. `step` is `None` for
    /// the "current step" form, resolved at run time via
    /// `bridge.get_current_timestep()`.
    pub fn op_push_external(&mut self, name: &str, step: Option<i64>) -> JoshResult<()> {
        let step = step.unwrap_or_else(|| self.bridge().map(|b| b.get_current_timestep()).unwrap_or(0));
        let geo_key = self.geo_key.clone().unwrap_or_default();
        let value = self.bridge()?.get_external(&geo_key, name, step)?;
        self.push(value);
        Ok(())
    }

    pub fn op_save_local(&mut self, name: &str) -> JoshResult<()> {
        let value = self.pop("save_local")?;
        self.scope.define_constant(name.to_owned(), value);
        Ok(())
    }

    pub fn op_condition(&mut self, body: &crate::action::HandlerAction) -> JoshResult<()> {
        let matched = self.pop_bool("condition")?;
        if matched {
            body(self)?;
        }
        Ok(())
    }

    pub fn op_branch(
        &mut self,
        positive: &crate::action::HandlerAction,
        negative: &crate::action::HandlerAction,
    ) -> JoshResult<()> {
        let matched = self.pop_bool("branch")?;
        if matched {
            positive(self)
        } else {
            negative(self)
        }
    }

    pub fn op_end(&mut self) -> JoshResult<()> {
        self.end()
    }

    /// Runs a fresh sub-invocation over `entity`'s own scope, used by the
    /// fast-forwarder and event-handler evaluation to compute one attribute.
    pub fn run_for_entity(
        entity: &EntityHandle,
        parent_scope: Option<Rc<dyn Scope>>,
        bridge: Rc<BridgeGetter>,
        rng: SharedRng,
        factory: EngineValueFactory,
        substep: Substep,
        callable: &crate::action::CompiledCallable,
    ) -> JoshResult<EngineValue> {
        let base = match parent_scope {
            Some(scope) => scope,
            None => {
                let converter = bridge.get()?.converter();
                Rc::new(crate::scope::EntityScope::new(entity.clone(), converter))
            }
        };
        let local = Rc::new(LocalScope::new(base));
        let mut machine = Machine::new(local, bridge, rng, factory, substep);
        callable(&mut machine)?;
        machine.end()?;
        machine.get_result()
    }

    /// Minimal helper a host bridge can use to seed an entity reference used
    /// only by this entity: returns a clone of the entity's name. Kept tiny —
    /// richer Entity access belongs to the host.
    pub fn entity_name(entity: &EntityHandle) -> String {
        let e: &Entity = &entity.borrow();
        e.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::converter::{Conversion, Converter};
    use crate::entity::EntityPrototype;
    use crate::scope::LocalScope;
    use indexmap::IndexMap;
    use std::cell::OnceCell;

    struct RootScope {
        converter: Rc<Converter>,
    }
    impl Scope for RootScope {
        fn get(&self, name: &str) -> JoshResult<EngineValue> {
            Err(JoshError::Resolution(crate::error::ResolutionError {
                path: name.to_owned(),
                available: vec![],
            }))
        }
        fn has(&self, _name: &str) -> bool {
            false
        }
        fn attributes(&self) -> Vec<String> {
            vec![]
        }
        fn converter(&self) -> Rc<Converter> {
            self.converter.clone()
        }
    }

    struct StubGeometryFactory;
    impl crate::bridge::GeometryFactory for StubGeometryFactory {
        fn from_position(&self, description: &str) -> JoshResult<crate::entity::Geometry> {
            Ok(crate::entity::Geometry(description.to_owned()))
        }
    }

    struct StubBridge {
        converter: Converter,
        geometry_factory: StubGeometryFactory,
        last_radius_meters: std::cell::Cell<Option<f64>>,
    }
    impl EngineBridge for StubBridge {
        fn convert(&self, value: &EngineValue, target_units: &Units) -> JoshResult<EngineValue> {
            self.converter.convert(value, target_units)
        }
        fn get_prototype(&self, entity_type_name: &str) -> JoshResult<EntityPrototype> {
            Ok(EntityPrototype::new(entity_type_name, IndexMap::new()))
        }
        fn geometry_factory(&self) -> &dyn crate::bridge::GeometryFactory {
            &self.geometry_factory
        }
        fn converter(&self) -> Rc<Converter> {
            Rc::new(self.converter.clone())
        }
        fn get_prior_patches(&self, _geometry: &crate::entity::Geometry, radius_meters: f64) -> JoshResult<Vec<EntityHandle>> {
            self.last_radius_meters.set(Some(radius_meters));
            Ok(vec![])
        }
        fn get_external(&self, _geo_key: &str, _name: &str, _step: i64) -> JoshResult<EngineValue> {
            Ok(EngineValue::scalar_double(0.0, Units::dimensionless()))
        }
        fn get_config_optional(&self, _name: &str) -> Option<EngineValue> {
            None
        }
        fn get_absolute_timestep(&self) -> i64 {
            0
        }
        fn get_current_timestep(&self) -> i64 {
            0
        }
        fn engine_value_factory(&self) -> EngineValueFactory {
            EngineValueFactory::new(false)
        }
    }

    fn machine_with_bridge() -> (Machine, Rc<BridgeGetter>) {
        let mut converter = Converter::new();
        converter.register(Conversion::Direct {
            source_units: Units::new("km"),
            destination_units: Units::new("m"),
            callable: Rc::new(|v| Ok(EngineValue::scalar_double(v.as_double()? * 1000.0, Units::new("m")))),
        });
        let root = Rc::new(RootScope { converter: Rc::new(converter.clone()) });
        let scope = Rc::new(LocalScope::new(root));
        let bridge_getter = Rc::new(BridgeGetter::new());
        let bridge: Rc<dyn EngineBridge> = Rc::new(StubBridge {
            converter,
            geometry_factory: StubGeometryFactory,
            last_radius_meters: std::cell::Cell::new(None),
        });
        bridge_getter.set(bridge).unwrap();
        let machine = Machine::new(
            scope,
            bridge_getter.clone(),
            SharedRng::seeded(1),
            EngineValueFactory::new(false),
            Substep::Step,
        );
        (machine, bridge_getter)
    }

    /// Like `machine_with_bridge`, but keeps a handle onto the concrete
    /// `StubBridge` so a test can read back what `get_prior_patches` was
    /// called with.
    fn machine_with_recording_bridge(converter: Converter) -> (Machine, Rc<StubBridge>) {
        let root = Rc::new(RootScope { converter: Rc::new(converter.clone()) });
        let scope = Rc::new(LocalScope::new(root));
        let bridge_getter = Rc::new(BridgeGetter::new());
        let bridge = Rc::new(StubBridge {
            converter,
            geometry_factory: StubGeometryFactory,
            last_radius_meters: std::cell::Cell::new(None),
        });
        bridge_getter.set(bridge.clone()).unwrap();
        let machine = Machine::new(
            scope,
            bridge_getter,
            SharedRng::seeded(1),
            EngineValueFactory::new(false),
            Substep::Step,
        );
        (machine, bridge)
    }

    #[test]
    fn add_converts_to_first_popped_units() {
        let (mut machine, _bridge) = machine_with_bridge();
        machine.push(EngineValue::scalar_double(2.0, Units::new("km")));
        machine.push(EngineValue::scalar_double(500.0, Units::new("m")));
        machine.op_add().unwrap();
        let result = machine.pop("test").unwrap();
        assert_eq!(result.as_double().unwrap(), 2500.0);
        assert_eq!(result.get_units(), Units::new("m"));
    }

    #[test]
    fn conversion_group_closes_after_operator() {
        let (mut machine, _bridge) = machine_with_bridge();
        machine.push(EngineValue::scalar_double(1.0, Units::new("m")));
        machine.push(EngineValue::scalar_double(1.0, Units::new("m")));
        machine.op_add().unwrap();
        // a second add must succeed, proving the group closed (no nesting error)
        machine.push(EngineValue::scalar_double(1.0, Units::new("m")));
        assert!(machine.op_add().is_ok());
        let _ = OnceCell::<()>::new();
    }

    #[test]
    fn end_twice_fails() {
        let (mut machine, _bridge) = machine_with_bridge();
        machine.push(EngineValue::scalar_double(1.0, Units::dimensionless()));
        machine.end().unwrap();
        assert!(matches!(machine.end(), Err(JoshError::State(StateError::MachineAlreadyEnded))));
    }

    #[test]
    fn result_before_end_fails() {
        let (machine, _bridge) = machine_with_bridge();
        assert!(matches!(machine.get_result(), Err(JoshError::State(StateError::MachineNotEnded))));
    }

    #[test]
    fn linear_map_end_to_end() {
        let (mut machine, _bridge) = machine_with_bridge();
        machine.push(EngineValue::scalar_double(5.0, Units::new("m")));
        machine.push(EngineValue::scalar_double(0.0, Units::new("m")));
        machine.push(EngineValue::scalar_double(10.0, Units::new("m")));
        machine.push(EngineValue::scalar_double(100.0, Units::new("degC")));
        machine.push(EngineValue::scalar_double(200.0, Units::new("degC")));
        machine.op_apply_map(MappingStrategy::Linear).unwrap();
        let result = machine.pop("test").unwrap();
        assert_eq!(result.as_double().unwrap(), 150.0);
        assert_eq!(result.get_units(), Units::new("degC"));
    }

    #[test]
    fn create_entity_fast_forwards_to_current_substep() {
        let (mut machine, _bridge) = machine_with_bridge();
        machine.push(EngineValue::scalar_double(3.0, Units::count()));
        machine.op_create_entity("Deer").unwrap();
        let result = machine.pop("test").unwrap();
        let items = result.as_distribution().unwrap().realized_items().unwrap();
        assert_eq!(items.len(), 3);
        for item in items {
            let entity = item.as_entity().unwrap();
            assert_eq!(entity.borrow().current_substep, Some(Substep::Step));
        }
    }

    #[test]
    fn spatial_query_threads_converted_distance_to_bridge() {
        let (mut machine, bridge) = machine_with_recording_bridge(Converter::new());
        let here = EntityPrototype::new("Patch", IndexMap::new()).build("here");
        here.borrow_mut().geometry = Some(crate::entity::Geometry("origin".to_owned()));
        machine.local_scope().define_constant("here", machine.factory().build_entity(here));

        machine.push(EngineValue::scalar_double(5.0, Units::meters()));
        let resolver = crate::scope::ValueResolver::new("here");
        machine.op_execute_spatial_query(&resolver).unwrap();

        assert_eq!(bridge.last_radius_meters.get(), Some(5.0));
    }

    #[test]
    fn spatial_query_converts_distance_units_before_threading_them() {
        let mut converter = Converter::new();
        converter.register(Conversion::Direct {
            source_units: Units::new("km"),
            destination_units: Units::new("m"),
            callable: Rc::new(|v| Ok(EngineValue::scalar_double(v.as_double()? * 1000.0, Units::new("m")))),
        });
        let (mut machine, bridge) = machine_with_recording_bridge(converter);
        let here = EntityPrototype::new("Patch", IndexMap::new()).build("here");
        here.borrow_mut().geometry = Some(crate::entity::Geometry("origin".to_owned()));
        machine.local_scope().define_constant("here", machine.factory().build_entity(here));

        machine.push(EngineValue::scalar_double(2.0, Units::new("km")));
        let resolver = crate::scope::ValueResolver::new("here");
        machine.op_execute_spatial_query(&resolver).unwrap();

        assert_eq!(bridge.last_radius_meters.get(), Some(2000.0));
    }
}
