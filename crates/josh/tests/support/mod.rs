//! Shared test double for `EngineBridge`.
//!
//! `FakeBridge` carries one converter, one entity-prototype table (so
//! `create N of T` can resolve a type name), a fixed set of config values, and
//! a fixed set of external values keyed by `(geo_key, name, step)`. It never
//! builds real geometry; `geometry_factory` just echoes the position string
//! back, which is all the integration tests below need.

use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use josh::{
    Converter, EngineBridge, EngineValue, EngineValueFactory, EntityHandle, EntityPrototype, Geometry,
    GeometryFactory, JoshResult,
};

pub struct NullGeometryFactory;

impl GeometryFactory for NullGeometryFactory {
    fn from_position(&self, description: &str) -> JoshResult<Geometry> {
        Ok(Geometry(description.to_owned()))
    }
}

pub struct FakeBridge {
    pub converter: Converter,
    pub prototypes: IndexMap<String, EntityPrototype>,
    pub config: HashMap<String, EngineValue>,
    pub external: HashMap<(String, String, i64), EngineValue>,
    pub prior_patches: Vec<EntityHandle>,
    pub current_timestep: i64,
    pub geometry_factory: NullGeometryFactory,
}

impl FakeBridge {
    pub fn new(converter: Converter, prototypes: IndexMap<String, EntityPrototype>) -> Self {
        Self {
            converter,
            prototypes,
            config: HashMap::new(),
            external: HashMap::new(),
            prior_patches: Vec::new(),
            current_timestep: 0,
            geometry_factory: NullGeometryFactory,
        }
    }
}

impl EngineBridge for FakeBridge {
    fn convert(&self, value: &EngineValue, target_units: &josh::Units) -> JoshResult<EngineValue> {
        self.converter.convert(value, target_units)
    }

    fn get_prototype(&self, entity_type_name: &str) -> JoshResult<EntityPrototype> {
        self.prototypes
            .get(entity_type_name)
            .cloned()
            .ok_or_else(|| josh::JoshError::Compile(josh::CompileError::UnknownEntityType {
                name: entity_type_name.to_owned(),
            }))
    }

    fn geometry_factory(&self) -> &dyn GeometryFactory {
        &self.geometry_factory
    }

    fn converter(&self) -> Rc<Converter> {
        Rc::new(self.converter.clone())
    }

    fn get_prior_patches(&self, _geometry: &Geometry, _radius_meters: f64) -> JoshResult<Vec<EntityHandle>> {
        Ok(self.prior_patches.clone())
    }

    fn get_external(&self, geo_key: &str, name: &str, step: i64) -> JoshResult<EngineValue> {
        self.external
            .get(&(geo_key.to_owned(), name.to_owned(), step))
            .cloned()
            .ok_or_else(|| josh::JoshError::Resolution(josh::ResolutionError {
                path: format!("external.{name}"),
                available: vec![],
            }))
    }

    fn get_config_optional(&self, name: &str) -> Option<EngineValue> {
        self.config.get(name).cloned()
    }

    fn get_absolute_timestep(&self) -> i64 {
        self.current_timestep
    }

    fn get_current_timestep(&self) -> i64 {
        self.current_timestep
    }

    fn engine_value_factory(&self) -> EngineValueFactory {
        EngineValueFactory::new(false)
    }
}

pub struct RootScope(pub Rc<Converter>);

impl josh::Scope for RootScope {
    fn get(&self, name: &str) -> JoshResult<EngineValue> {
        Err(josh::JoshError::Resolution(josh::ResolutionError {
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
        self.0.clone()
    }
}
