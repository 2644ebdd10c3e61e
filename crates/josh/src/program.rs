//! The compiled-program facade.
//!
//! `Program` is what `josh::compiler::CompileVisitor` hands back for a whole
//! syntax tree: the converter table every conversion stanza fed, and the
//! prototype/simulation stores every `entity`/`simulation` stanza fed. It
//! owns both for the lifetime of the run.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::converter::Converter;
use crate::entity::EntityPrototype;

/// A fully compiled Josh program: every entity prototype and simulation the
/// syntax tree declared, plus the unit converter built from its `unit`
/// stanzas.
#[derive(Clone)]
pub struct Program {
    converter: Rc<Converter>,
    prototypes: Rc<IndexMap<String, EntityPrototype>>,
    simulations: Rc<IndexMap<String, EntityPrototype>>,
}

impl Program {
    pub fn new(
        converter: Converter,
        prototypes: IndexMap<String, EntityPrototype>,
        simulations: IndexMap<String, EntityPrototype>,
    ) -> Self {
        Self {
            converter: Rc::new(converter),
            prototypes: Rc::new(prototypes),
            simulations: Rc::new(simulations),
        }
    }

    pub fn get_converter(&self) -> Rc<Converter> {
        self.converter.clone()
    }

    /// Simulations keyed by name.
    pub fn get_simulations(&self) -> &IndexMap<String, EntityPrototype> {
        &self.simulations
    }

    /// Entity prototypes keyed by entity type name.
    pub fn get_prototypes(&self) -> &IndexMap<String, EntityPrototype> {
        &self.prototypes
    }
}
