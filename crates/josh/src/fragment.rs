//! The compile visitor's return type.
//!
//! Every syntax-tree node compiles to exactly one `Fragment` variant; the
//! variant a caller gets back tells it what kind of node it just compiled
//! (an expression, an event-handler body, a group of handlers, a whole
//! entity, a unit conversion, or a full program). `josh::compiler` is the
//! only place that constructs and destructures these outside of tests.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::action::{CompiledCallable, CompiledSelector, HandlerAction};
use crate::converter::Conversion;
use crate::entity::{EntityPrototype, EventHandlerGroup, EventKey};
use crate::program::Program;

/// One compiled `(state?, attribute, event)` group, still attached to its
/// key so the enclosing entity/state stanza knows where to file it.
#[derive(Clone)]
pub struct GroupFragment {
    pub key: EventKey,
    pub group: EventHandlerGroup,
}

/// A `state <name> { ... }` stanza's compiled handler groups, tagged with
/// the state name.
#[derive(Clone)]
pub struct StateFragment {
    pub state: String,
    pub groups: Vec<GroupFragment>,
}

/// The compile visitor's return type. Every syntax-tree node kind maps to
/// exactly one of these.
#[derive(Clone)]
pub enum Fragment {
    /// A compiled expression or statement action.
    Action(HandlerAction),
    /// An event-handler body, with its selector if it came from an `if`/`elif`
    /// member.
    Callable {
        callable: CompiledCallable,
        selector: Option<CompiledSelector>,
    },
    Group(GroupFragment),
    State(StateFragment),
    /// A compiled `entity`/`simulation` stanza.
    Entity(EntityPrototype),
    Conversion(Conversion),
    Conversions(Vec<Conversion>),
    /// A fully compiled program.
    Program(Program),
}

impl Fragment {
    pub fn into_action(self) -> Option<HandlerAction> {
        match self {
            Self::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<EntityPrototype> {
        match self {
            Self::Entity(entity) => Some(entity),
            _ => None,
        }
    }
}

/// Builds handler groups (as produced by the compile visitor) into the
/// `IndexMap` an `EntityPrototype` stores, preserving declaration order.
pub fn groups_into_map(groups: Vec<GroupFragment>) -> IndexMap<EventKey, EventHandlerGroup> {
    let mut map = IndexMap::new();
    for fragment in groups {
        map.insert(fragment.key, fragment.group);
    }
    map
}

/// Folds a `CompiledCallable`/selector pair produced for one `if`/`elif`/
/// `else` member into an `EventHandlerGroup`, appending in source order.
pub fn push_member(group: &mut EventHandlerGroup, callable: CompiledCallable, selector: Option<CompiledSelector>) {
    group.push(crate::entity::EventHandler { callable, selector });
}

pub type ConversionCallable = Rc<dyn Fn(&crate::value::EngineValue) -> crate::error::JoshResult<crate::value::EngineValue>>;
