//! Compiled actions: each compiled node becomes a closure rather than a
//! bytecode instruction. The operator catalog is small and fixed, so
//! closures over child actions stay readable without a custom instruction
//! encoding.

use std::rc::Rc;

use crate::error::JoshResult;
use crate::machine::Machine;

/// A compiled node: applying it runs its effect on the machine, possibly
/// after running its own compiled children first.
pub type HandlerAction = Rc<dyn Fn(&mut Machine) -> JoshResult<()>>;

/// An event handler's compiled body.
pub type CompiledCallable = HandlerAction;

/// An `if`/`elif` branch's compiled condition; running it to completion
/// leaves a boolean on top of the machine's stack.
pub type CompiledSelector = HandlerAction;

/// Runs `first`, then `second`, on the same machine.
pub fn then(first: HandlerAction, second: HandlerAction) -> HandlerAction {
    Rc::new(move |machine| {
        first(machine)?;
        second(machine)
    })
}

/// Composes a sequence of actions to run in order on the same machine.
pub fn sequence(actions: Vec<HandlerAction>) -> HandlerAction {
    Rc::new(move |machine| {
        for action in &actions {
            action(machine)?;
        }
        Ok(())
    })
}

/// Builds a single compiled action out of an ordered `if/elif/elif/else`
/// chain. Each branch's condition is pushed and popped
/// as a boolean; the first truthy branch runs its body and short-circuits.
/// A missing `else` makes a non-matching chain a no-op; an `else` is modeled
/// as a predicate that always pushes `true`.
#[derive(Default)]
pub struct ChainingConditionalBuilder {
    branches: Vec<(HandlerAction, HandlerAction)>,
}

impl ChainingConditionalBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_branch(&mut self, condition: HandlerAction, body: HandlerAction) -> &mut Self {
        self.branches.push((condition, body));
        self
    }

    /// Adds the trailing `else` as a branch whose condition always pushes
    /// `true_value`.
    pub fn add_else(&mut self, body: HandlerAction, true_value: HandlerAction) -> &mut Self {
        self.branches.push((true_value, body));
        self
    }

    pub fn build(self) -> HandlerAction {
        let branches = self.branches;
        Rc::new(move |machine| {
            for (condition, body) in &branches {
                condition(machine)?;
                let matched = machine.pop_bool_for_condition()?;
                if matched {
                    return body(machine);
                }
            }
            Ok(())
        })
    }
}
