//! Compiler and push-down evaluation machine for the Josh spatial
//! agent-based simulation language.
//!
//! This crate implements two things: a visitor (`compiler`) that turns a
//! syntax tree (`ast`) into compiled `action`/`fragment` values, and a
//! push-down machine (`machine`) that executes them against a host-supplied
//! `bridge`. Parsing source text into a syntax tree, and everything a
//! concrete simulation host does around this core (geometry, persistence,
//! external data), is left to the host.

pub mod action;
pub mod ast;
pub mod bridge;
pub mod compiler;
pub mod converter;
pub mod distribution;
pub mod entity;
pub mod error;
pub mod fast_forward;
pub mod fragment;
pub mod machine;
pub mod mapping;
pub mod program;
pub mod scope;
pub mod units;
pub mod value;

pub use action::{ChainingConditionalBuilder, CompiledCallable, CompiledSelector, HandlerAction};
pub use bridge::{BridgeGetter, EngineBridge, GeometryFactory};
pub use compiler::CompileVisitor;
pub use converter::{Conversion, Converter};
pub use entity::{
    Entity, EntityHandle, EntityPrototype, Event, EventHandler, EventHandlerGroup, EventKey, Geometry, Substep,
    RESERVED_ENTITY_TYPES,
};
pub use error::{CompileError, DomainError, JoshError, JoshResult, ParseError, ResolutionError, StateError, UnitsError};
pub use fast_forward::EntityFastForwarder;
pub use fragment::Fragment;
pub use machine::{Machine, SharedRng};
pub use mapping::MappingStrategy;
pub use program::Program;
pub use scope::{EntityScope, LocalScope, Scope, ValueResolver};
pub use units::Units;
pub use value::{EngineValue, EngineValueFactory, Number};
