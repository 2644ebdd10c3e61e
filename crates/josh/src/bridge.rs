//! The `EngineBridge` contract and its set-once indirection.
//!
//! The bridge is the interpreter's one collaborator with the surrounding
//! simulation environment: conversion, entity prototypes, geometry, prior-step
//! patches, external data, configuration, and the value factory. This crate
//! defines only the trait; a concrete implementation (converter registry,
//! geometry factory, prior-step patch index, external data providers) is the
//! host's responsibility.

use std::cell::OnceCell;
use std::rc::Rc;

use crate::converter::Converter;
use crate::entity::{EntityHandle, EntityPrototype, Geometry};
use crate::error::{JoshError, JoshResult, StateError};
use crate::units::Units;
use crate::value::{EngineValue, EngineValueFactory};

/// The simulation environment an evaluation machine runs against.
pub trait EngineBridge {
    fn convert(&self, value: &EngineValue, target_units: &Units) -> JoshResult<EngineValue>;
    fn get_prototype(&self, entity_type_name: &str) -> JoshResult<EntityPrototype>;
    fn geometry_factory(&self) -> &dyn GeometryFactory;
    /// The converter table backing `convert`, handed to scopes built without
    /// an outer parent (e.g. the fast-forwarder's per-entity scopes) so
    /// `Scope::converter` has something real to return.
    fn converter(&self) -> Rc<Converter>;
    /// Patches from the previous completed step within `radius_meters` of
    /// `geometry`. `radius_meters` is the `D` operand of a `within` query,
    /// already converted to meters by the caller.
    fn get_prior_patches(&self, geometry: &Geometry, radius_meters: f64) -> JoshResult<Vec<EntityHandle>>;
    fn get_external(&self, geo_key: &str, name: &str, step: i64) -> JoshResult<EngineValue>;
    fn get_config_optional(&self, name: &str) -> Option<EngineValue>;
    fn get_absolute_timestep(&self) -> i64;
    fn get_current_timestep(&self) -> i64;
    fn engine_value_factory(&self) -> EngineValueFactory;
}

/// Opaque collaborator that turns position literals into geometry. Concrete
/// construction strategy is the host's; this trait only records the shape
/// the machine depends on.
pub trait GeometryFactory {
    fn from_position(&self, description: &str) -> JoshResult<Geometry>;
}

/// Set-once indirection that lets a program be compiled before the bridge it
/// will run against exists. Rebinding fails with
/// [`StateError::BridgeAlreadySet`]; reading before a bind fails with
/// [`StateError::BridgeNotSet`].
#[derive(Default)]
pub struct BridgeGetter {
    bridge: OnceCell<Rc<dyn EngineBridge>>,
}

impl BridgeGetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, bridge: Rc<dyn EngineBridge>) -> JoshResult<()> {
        self.bridge
            .set(bridge)
            .map_err(|_| JoshError::State(StateError::BridgeAlreadySet))
    }

    pub fn get(&self) -> JoshResult<&Rc<dyn EngineBridge>> {
        self.bridge.get().ok_or(JoshError::State(StateError::BridgeNotSet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::RESERVED_ENTITY_TYPES;
    use indexmap::IndexMap;

    struct NullGeometryFactory;
    impl GeometryFactory for NullGeometryFactory {
        fn from_position(&self, description: &str) -> JoshResult<Geometry> {
            Ok(Geometry(description.to_owned()))
        }
    }

    struct StubBridge {
        geometry_factory: NullGeometryFactory,
    }

    impl EngineBridge for StubBridge {
        fn convert(&self, value: &EngineValue, target_units: &Units) -> JoshResult<EngineValue> {
            Ok(value.replace_units(target_units.clone()))
        }
        fn get_prototype(&self, entity_type_name: &str) -> JoshResult<EntityPrototype> {
            Ok(EntityPrototype::new(entity_type_name, IndexMap::new()))
        }
        fn geometry_factory(&self) -> &dyn GeometryFactory {
            &self.geometry_factory
        }
        fn converter(&self) -> Rc<crate::converter::Converter> {
            Rc::new(crate::converter::Converter::new())
        }
        fn get_prior_patches(&self, _geometry: &Geometry, _radius_meters: f64) -> JoshResult<Vec<EntityHandle>> {
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

    #[test]
    fn rebind_fails() {
        let getter = BridgeGetter::new();
        let bridge: Rc<dyn EngineBridge> = Rc::new(StubBridge {
            geometry_factory: NullGeometryFactory,
        });
        getter.set(bridge.clone()).unwrap();
        assert!(matches!(
            getter.set(bridge),
            Err(JoshError::State(StateError::BridgeAlreadySet))
        ));
    }

    #[test]
    fn read_before_set_fails() {
        let getter = BridgeGetter::new();
        assert!(matches!(getter.get(), Err(JoshError::State(StateError::BridgeNotSet))));
    }

    #[test]
    fn reserved_entity_types_cover_agent_and_patch() {
        assert!(RESERVED_ENTITY_TYPES.contains(&"agent"));
        assert!(RESERVED_ENTITY_TYPES.contains(&"patch"));
    }
}
