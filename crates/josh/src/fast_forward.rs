//! Brings a newly created entity's state up to the caller's current substep.
//!
//! Entities are only ever built mid-handler, inside whatever substep the
//! *caller* currently has open (`create 3 of Deer` inside a `step` handler,
//! say). A freshly built entity starts with no substep open and no
//! attributes computed; before the caller can see it, every substep up to
//! and including the caller's current one must run once, in fixed order,
//! each touching every attribute to force its lazy evaluation.

use std::rc::Rc;

use crate::bridge::BridgeGetter;
use crate::entity::{EntityHandle, Event, Substep};
use crate::error::JoshResult;
use crate::machine::{Machine, SharedRng};
use crate::value::EngineValueFactory;

/// Stateless driver over `Entity::start_substep`/`end_substep` plus the
/// attribute-handler evaluation loop.
pub struct EntityFastForwarder;

impl EntityFastForwarder {
    /// Runs `{constant, init, start, step, end}` up to and including `target`
    /// in order. Every substep strictly before `target` is opened, has every
    /// attribute touched, and is closed; `target` itself is opened and has
    /// every attribute touched but is left open so the caller's own handler
    /// body can keep writing to it.
    pub fn fast_forward(
        entity: &EntityHandle,
        target: Substep,
        bridge: Rc<BridgeGetter>,
        rng: SharedRng,
        factory: EngineValueFactory,
    ) -> JoshResult<()> {
        for substep in Substep::ORDER {
            if substep > target {
                break;
            }
            entity.borrow_mut().start_substep(substep)?;
            Self::touch_all_attributes(entity, substep, &bridge, &rng, factory)?;
            if substep < target {
                entity.borrow_mut().end_substep()?;
            }
        }
        Ok(())
    }

    /// Forces every attribute this entity has a handler for under `substep`'s
    /// event, in declaration order.
    fn touch_all_attributes(
        entity: &EntityHandle,
        substep: Substep,
        bridge: &Rc<BridgeGetter>,
        rng: &SharedRng,
        factory: EngineValueFactory,
    ) -> JoshResult<()> {
        let event = substep_event(substep);
        let attributes = entity.borrow().attributes_for_event(event);
        for attribute in attributes {
            Self::evaluate_attribute(entity, &attribute, event, substep, bridge, rng, factory)?;
        }
        Ok(())
    }

    /// Evaluates one attribute under `event` via first-match selector,
    /// writing the winning handler's result back onto the entity.
    fn evaluate_attribute(
        entity: &EntityHandle,
        attribute: &str,
        event: Event,
        substep: Substep,
        bridge: &Rc<BridgeGetter>,
        rng: &SharedRng,
        factory: EngineValueFactory,
    ) -> JoshResult<()> {
        let group = match entity.borrow().handler_group_for(attribute, event) {
            Some(group) => group.clone(),
            None => return Ok(()),
        };
        for handler in &group.members {
            let matched = match &handler.selector {
                None => true,
                Some(selector) => {
                    let value = Machine::run_for_entity(entity, None, bridge.clone(), rng.clone(), factory, substep, selector)?;
                    value.as_bool()?
                }
            };
            if !matched {
                continue;
            }
            let value = Machine::run_for_entity(entity, None, bridge.clone(), rng.clone(), factory, substep, &handler.callable)?;
            entity.borrow_mut().set_attribute(attribute, value);
            return Ok(());
        }
        Ok(())
    }
}

/// The event a given substep corresponds to, for the fast-forwarder's "touch
/// every attribute" loop.
fn substep_event(substep: Substep) -> Event {
    match substep {
        Substep::Constant => Event::Constant,
        Substep::Init => Event::Init,
        Substep::Start => Event::Start,
        Substep::Step => Event::Step,
        Substep::End => Event::End,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::action::HandlerAction;
    use crate::bridge::{EngineBridge, GeometryFactory};
    use crate::converter::Converter;
    use crate::entity::{EntityPrototype, Event, EventHandler, EventHandlerGroup, EventKey};
    use crate::units::Units;
    use crate::value::EngineValue;
    use indexmap::IndexMap;
    use std::rc::Rc as StdRc;

    struct NullGeometryFactory;
    impl GeometryFactory for NullGeometryFactory {
        fn from_position(&self, description: &str) -> JoshResult<crate::entity::Geometry> {
            Ok(crate::entity::Geometry(description.to_owned()))
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
        fn converter(&self) -> StdRc<Converter> {
            StdRc::new(Converter::new())
        }
        fn get_prior_patches(&self, _geometry: &crate::entity::Geometry, _radius_meters: f64) -> JoshResult<Vec<EntityHandle>> {
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

    fn push_const(value: EngineValue) -> HandlerAction {
        StdRc::new(move |machine: &mut crate::machine::Machine| {
            machine.push(value.clone());
            Ok(())
        })
    }

    #[test]
    fn fast_forward_touches_every_substep_and_leaves_target_open() {
        let mut groups = IndexMap::new();
        let mut group = EventHandlerGroup::default();
        group.push(EventHandler {
            callable: push_const(EngineValue::scalar_double(1.0, Units::count())),
            selector: None,
        });
        groups.insert(EventKey::new(None, "height", Event::Step), group);
        let proto = EntityPrototype::new("Deer", groups);
        let entity = proto.build("deer1");

        let bridge_getter = StdRc::new(BridgeGetter::new());
        let bridge: StdRc<dyn EngineBridge> = StdRc::new(StubBridge { geometry_factory: NullGeometryFactory });
        bridge_getter.set(bridge).unwrap();

        EntityFastForwarder::fast_forward(
            &entity,
            Substep::Step,
            bridge_getter,
            SharedRng::seeded(1),
            EngineValueFactory::new(false),
        )
        .unwrap();

        assert_eq!(entity.borrow().current_substep, Some(Substep::Step));
        assert_eq!(entity.borrow().get_attribute("height").unwrap().as_double().unwrap(), 1.0);
    }

    #[test]
    fn fast_forward_at_already_reached_target_is_idempotent() {
        let proto = EntityPrototype::new("Deer", IndexMap::new());
        let entity = proto.build("deer1");
        let bridge_getter = StdRc::new(BridgeGetter::new());
        let bridge: StdRc<dyn EngineBridge> = StdRc::new(StubBridge { geometry_factory: NullGeometryFactory });
        bridge_getter.set(bridge).unwrap();

        EntityFastForwarder::fast_forward(
            &entity,
            Substep::Constant,
            bridge_getter,
            SharedRng::seeded(1),
            EngineValueFactory::new(false),
        )
        .unwrap();
        assert_eq!(entity.borrow().current_substep, Some(Substep::Constant));
    }
}
