//! Entities, prototypes, and event-handler groups.
//!
//! An entity is a mutable object: a type, a name, an optional geographic key
//! and geometry, attribute values, a currently-open substep, and event
//! handler groups keyed by `(state?, attribute, event)`. Only one substep may
//! be open at a time; `start_substep`/`end_substep` enforce that.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::action::{CompiledCallable, CompiledSelector};
use crate::error::{JoshError, JoshResult, StateError};
use crate::scope::Scope;
use crate::value::EngineValue;

/// Shared handle to a mutable entity. Entities are reference-counted rather
/// than owned by a single scope because creator, scope, and distribution all
/// need to reach the same mutable object.
pub type EntityHandle = Rc<RefCell<Entity>>;

/// Reserved entity types.
pub const RESERVED_ENTITY_TYPES: &[&str] = &["agent", "disturbance", "external", "patch", "simulation"];

/// A substep within a single simulation step. Entities may only have one
/// substep open at a time, and substeps progress through this fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Substep {
    Constant,
    Init,
    Start,
    Step,
    End,
}

impl Substep {
    /// All substeps in execution order, used by the fast-forwarder.
    pub const ORDER: [Substep; 5] = [Self::Constant, Self::Init, Self::Start, Self::Step, Self::End];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::Init => "init",
            Self::Start => "start",
            Self::Step => "step",
            Self::End => "end",
        }
    }
}

impl fmt::Display for Substep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reserved event names. `Constant` is the default event when a
/// dotted handler name carries no explicit event suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Event {
    Init,
    Start,
    Step,
    End,
    Remove,
    Constant,
}

impl Event {
    pub fn from_keyword(s: &str) -> Option<Self> {
        Some(match s {
            "init" => Self::Init,
            "start" => Self::Start,
            "step" => Self::Step,
            "end" => Self::End,
            "remove" => Self::Remove,
            "constant" => Self::Constant,
            _ => return None,
        })
    }
}

/// Key under which an entity stores a group of handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub state: Option<String>,
    pub attribute: String,
    pub event: Event,
}

impl EventKey {
    pub fn new(state: Option<String>, attribute: impl Into<String>, event: Event) -> Self {
        Self {
            state,
            attribute: attribute.into(),
            event,
        }
    }

    /// Splits a dotted handler name into `(attribute, event)`: if the last
    /// segment is an event keyword, it is the event and the prefix is the
    /// attribute; otherwise the whole name is the attribute and the event
    /// defaults to `constant`.
    pub fn parse_name(name: &str) -> (String, Event) {
        if let Some((prefix, last)) = name.rsplit_once('.') {
            if let Some(event) = Event::from_keyword(last) {
                return (prefix.to_owned(), event);
            }
        }
        // No dot, or a dot whose suffix isn't an event keyword: the whole
        // name is the attribute and the event defaults to `constant`. A bare
        // event keyword with no attribute prefix (e.g. `step` alone) falls
        // through here too — it has no attribute to split off.
        (name.to_owned(), Event::Constant)
    }
}

/// One member of an event-handler group: a compiled body, and (for `if`/`elif`
/// members) a compiled selector. A member with no selector is the `else`.
#[derive(Clone)]
pub struct EventHandler {
    pub callable: CompiledCallable,
    pub selector: Option<CompiledSelector>,
}

/// An ordered list of handlers under one [`EventKey`]. Selection is
/// first-match-wins over `members` in declaration order.
#[derive(Clone, Default)]
pub struct EventHandlerGroup {
    pub members: Vec<EventHandler>,
}

impl EventHandlerGroup {
    pub fn push(&mut self, handler: EventHandler) {
        self.members.push(handler);
    }
}

/// A builder that produces entities of one type, optionally decorated with an
/// embedded parent and/or a shadowing scope snapshot.
#[derive(Clone)]
pub struct EntityPrototype {
    pub entity_type: String,
    pub handler_groups: Rc<IndexMap<EventKey, EventHandlerGroup>>,
    /// The creator becomes the new entity's parent when set.
    pub embedded_parent: Option<EntityHandle>,
    /// A snapshot of the creator's local-variable context, visible to the new
    /// entity's `init` handlers.
    pub shadowing_scope: Option<Rc<dyn Scope>>,
}

impl EntityPrototype {
    pub fn new(entity_type: impl Into<String>, handler_groups: IndexMap<EventKey, EventHandlerGroup>) -> Self {
        Self {
            entity_type: entity_type.into(),
            handler_groups: Rc::new(handler_groups),
            embedded_parent: None,
            shadowing_scope: None,
        }
    }

    pub fn with_embedded_parent(mut self, parent: EntityHandle) -> Self {
        self.embedded_parent = Some(parent);
        self
    }

    pub fn with_shadowing_scope(mut self, scope: Rc<dyn Scope>) -> Self {
        self.shadowing_scope = Some(scope);
        self
    }

    /// Builds one fresh entity. The entity starts with no substep open; the
    /// caller (usually the machine's `create_entity` op) is responsible for
    /// fast-forwarding it.
    pub fn build(&self, name: impl Into<String>) -> EntityHandle {
        Rc::new(RefCell::new(Entity {
            entity_type: self.entity_type.clone(),
            name: name.into(),
            geo_key: None,
            geometry: None,
            attributes: IndexMap::new(),
            current_substep: None,
            handler_groups: self.handler_groups.clone(),
            parent: self.embedded_parent.clone(),
            current_state: None,
        }))
    }
}

/// Opaque geometry handle. Geometry construction is the bridge's
/// responsibility; this crate only needs to
/// carry whatever the bridge hands back.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Geometry(pub String);

/// A mutable simulation object: agent, patch, disturbance, external resource,
/// or simulation.
pub struct Entity {
    pub entity_type: String,
    pub name: String,
    pub geo_key: Option<String>,
    pub geometry: Option<Geometry>,
    pub attributes: IndexMap<String, EngineValue>,
    pub current_substep: Option<Substep>,
    pub handler_groups: Rc<IndexMap<EventKey, EventHandlerGroup>>,
    pub parent: Option<EntityHandle>,
    /// The name of the `state` stanza this entity is currently in, if the
    /// program declares any. `None` means
    /// only the entity's top-level (stateless) handler groups apply.
    pub current_state: Option<String>,
}

impl Entity {
    pub fn get_attribute(&self, name: &str) -> Option<&EngineValue> {
        self.attributes.get(name)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: EngineValue) {
        self.attributes.insert(name.into(), value);
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn handler_group(&self, key: &EventKey) -> Option<&EventHandlerGroup> {
        self.handler_groups.get(key)
    }

    /// Sets the entity's current state, so later `handler_group_for` lookups
    /// prefer state-qualified handler groups over stateless ones.
    pub fn set_state(&mut self, state: impl Into<String>) {
        self.current_state = Some(state.into());
    }

    /// Looks up the handler group for `(attribute, event)`, preferring a
    /// group tagged with this entity's current state over the stateless
    /// (`state: None`) fallback.
    pub fn handler_group_for(&self, attribute: &str, event: Event) -> Option<&EventHandlerGroup> {
        if let Some(state) = &self.current_state {
            if let Some(group) = self.handler_groups.get(&EventKey::new(Some(state.clone()), attribute, event)) {
                return Some(group);
            }
        }
        self.handler_groups.get(&EventKey::new(None, attribute, event))
    }

    /// Every attribute name this entity has a handler group for under
    /// `event`, in declaration order, deduplicated. Used by the
    /// fast-forwarder to know which attributes to touch per substep.
    pub fn attributes_for_event(&self, event: Event) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut names = Vec::new();
        for key in self.handler_groups.keys() {
            if key.event == event && seen.insert(key.attribute.clone()) {
                names.push(key.attribute.clone());
            }
        }
        names
    }

    /// Opens `substep`. Fails if another substep is already open.
    pub fn start_substep(&mut self, substep: Substep) -> JoshResult<()> {
        if self.current_substep.is_some() {
            return Err(JoshError::State(StateError::SubstepAlreadyOpen {
                substep: substep.to_string(),
            }));
        }
        self.current_substep = Some(substep);
        Ok(())
    }

    /// Closes whichever substep is open. Fails if none is open.
    pub fn end_substep(&mut self) -> JoshResult<()> {
        if self.current_substep.take().is_none() {
            return Err(JoshError::State(StateError::SubstepNotOpen));
        }
        Ok(())
    }
}
