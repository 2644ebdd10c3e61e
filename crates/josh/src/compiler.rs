//! Compiles a syntax tree into the action tree the push-down machine
//! executes.
//!
//! `CompileVisitor` is total over `crate::ast::Node`: every node kind maps to
//! exactly one `Fragment` variant. The grammar/parser
//! front end that produces a `Node` tree is out of scope; this
//! module only consumes one.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::action::{self, HandlerAction};
use crate::ast::{self, BinaryOp, LimitNode, Literal, MapNode, Node, SampleNode};
use crate::bridge::{BridgeGetter, EngineBridge, GeometryFactory};
use crate::converter::{Conversion, Converter};
use crate::entity::{EntityHandle, EntityPrototype, Event, EventHandlerGroup, EventKey, Geometry, RESERVED_ENTITY_TYPES, Substep};
use crate::error::{CompileError, JoshError, JoshResult, ResolutionError};
use crate::fragment::{self, ConversionCallable, Fragment, GroupFragment, StateFragment};
use crate::machine::{Machine, SharedRng};
use crate::mapping::MappingStrategy;
use crate::program::Program;
use crate::scope::{LocalScope, Scope, ValueResolver};
use crate::units::Units;
use crate::value::{EngineValue, EngineValueFactory};

/// Visits a syntax tree and emits compiled [`Fragment`]s.
///
/// Holds three reused constant values: a `1 count` scalar (the implicit
/// count of `create T` with no explicit number), the `"all"` string (the
/// `all` sampling-count sentinel), and a `true` boolean (the predicate an
/// `else` member compiles to — a branch whose condition always pushes
/// `true`, applied per-member rather than through
/// `ChainingConditionalBuilder`; see `compile_handler_group` for why).
pub struct CompileVisitor {
    factory: EngineValueFactory,
    single_count: EngineValue,
    all_string: EngineValue,
    true_value: EngineValue,
}

impl CompileVisitor {
    pub fn new(factory: EngineValueFactory) -> Self {
        Self {
            factory,
            single_count: factory.build_scalar(1.0, Units::count()),
            all_string: factory.build_string("all"),
            true_value: factory.build_bool(true),
        }
    }

    /// Compiles a full program: every `entity`, `unit`, and `simulation`
    /// stanza into one [`Program`].
    pub fn compile_program(&self, program: &ast::ProgramNode) -> JoshResult<Program> {
        let mut converter = Converter::new();
        for unit in &program.units {
            let Fragment::Conversions(conversions) = self.compile_unit(unit)? else {
                unreachable!("compile_unit always returns Fragment::Conversions");
            };
            for conversion in conversions {
                converter.register(conversion);
            }
        }

        let mut prototypes = IndexMap::new();
        for entity in &program.entities {
            let prototype = self
                .compile_entity(entity)?
                .into_entity()
                .expect("compile_entity always returns Fragment::Entity");
            prototypes.insert(entity.entity_type.clone(), prototype);
        }

        let mut simulations = IndexMap::new();
        for simulation in &program.simulations {
            let prototype = self
                .compile_entity(simulation)?
                .into_entity()
                .expect("compile_entity always returns Fragment::Entity");
            simulations.insert(simulation.entity_type.clone(), prototype);
        }

        Ok(Program::new(converter, prototypes, simulations))
    }

    /// Dispatches on node kind.
    pub fn compile(&self, node: &Node) -> JoshResult<Fragment> {
        match node {
            Node::Literal(lit) => Ok(Fragment::Action(self.compile_literal(lit))),
            Node::Identifier(path) => Ok(Fragment::Action(self.compile_identifier(path))),
            Node::Binary { op, left, right } => self.compile_binary(*op, left, right),
            Node::Map(map) => self.compile_map(map),
            Node::Sample(sample) => self.compile_sample(sample),
            Node::Limit(limit) => self.compile_limit(limit),
            Node::Cast { operand, units, force } => self.compile_cast(operand, units, *force),
            Node::Create { entity_type, count } => self.compile_create(entity_type, count.as_deref()),
            Node::AttributeAccess { subject, resolver } => self.compile_attribute_access(subject, resolver),
            Node::SpatialQuery { subject, distance } => self.compile_spatial_query(subject, distance),
            Node::Return(inner) => self.compile_return(inner),
            Node::FullBody(stmts) => self.compile_full_body(stmts),
            Node::Lambda(inner) => self.compile_return(inner),
            Node::Assignment { name, value } => self.compile_assignment(name, value),
            Node::ConfigRef { name, default } => self.compile_config_ref(name, default.as_deref()),
            Node::ExternalRef { name, step } => self.compile_external_ref(name, step.as_deref()),
            Node::Entity(entity) => self.compile_entity(entity),
            Node::Unit(unit) => self.compile_unit(unit),
            Node::Simulation(simulation) => self.compile_entity(simulation),
            Node::Program(program) => Ok(Fragment::Program(self.compile_program(program)?)),
        }
    }

    /// Compiles a node known to be an expression/statement and unwraps the
    /// resulting action, for callers (binary operators, map/sample/limit
    /// forms) that only ever compile expression children.
    fn compile_expr(&self, node: &Node) -> JoshResult<HandlerAction> {
        self.compile(node)?
            .into_action()
            .ok_or_else(|| JoshError::Compile(CompileError::UnknownOperator { op: "expected an expression".to_owned() }))
    }

    // -- literals / identifiers -------------------------------------------

    fn compile_literal(&self, lit: &Literal) -> HandlerAction {
        let value = match lit {
            Literal::Number(n) => self.factory.build_scalar(*n, Units::dimensionless()),
            Literal::UnitsValue(n, units) => self.factory.build_scalar(*n, Units::new(units.clone())),
            Literal::Str(s) => self.factory.build_string(s.clone()),
            Literal::Bool(b) => self.factory.build_bool(*b),
            Literal::All => self.all_string.clone(),
            Literal::Position(n, kind) => self.factory.build_scalar(*n, Units::new(kind.clone())),
        };
        push_const(value)
    }

    /// `Identifier → action pushing a freshly constructed ValueResolver(text)`.
    /// The resolver is built once at compile time and
    /// captured by the closure, so its memoized prefix split
    /// is shared across every invocation of this compiled handler.
    fn compile_identifier(&self, path: &str) -> HandlerAction {
        let resolver = Rc::new(ValueResolver::new(path.to_owned()));
        Rc::new(move |machine: &mut Machine| {
            let value = resolver.get(machine.scope())?;
            machine.push(value);
            Ok(())
        })
    }

    // -- binary operators ---------------------------------------------------

    fn compile_binary(&self, op: BinaryOp, left: &Node, right: &Node) -> JoshResult<Fragment> {
        let left_action = self.compile_expr(left)?;
        let right_action = self.compile_expr(right)?;
        let apply: HandlerAction = Rc::new(move |m: &mut Machine| match op {
            BinaryOp::Add => m.op_add(),
            BinaryOp::Subtract => m.op_subtract(),
            BinaryOp::Multiply => m.op_multiply(),
            BinaryOp::Divide => m.op_divide(),
            BinaryOp::Pow => m.op_pow(),
            BinaryOp::Concat => m.op_concat(),
            BinaryOp::And => m.op_and(),
            BinaryOp::Or => m.op_or(),
            BinaryOp::Xor => m.op_xor(),
            BinaryOp::Eq => m.op_eq(),
            BinaryOp::Neq => m.op_neq(),
            BinaryOp::Gt => m.op_gt(),
            BinaryOp::Gte => m.op_gte(),
            BinaryOp::Lt => m.op_lt(),
            BinaryOp::Lte => m.op_lte(),
        });
        Ok(Fragment::Action(action::sequence(vec![left_action, right_action, apply])))
    }

    // -- map / sample / limit forms -----------------------------------------

    /// Pushes operands in the fixed stack order `apply_map` expects to pop
    /// them in: `operand, from_low, from_high, to_low, to_high`. The
    /// strategy's boolean method argument (`center_max`/`steep`)
    /// must be a literal at compile time — it selects which `MappingStrategy`
    /// variant is baked into the compiled op rather than being a runtime pop
    /// (see DESIGN.md for this simplification).
    fn compile_map(&self, map: &MapNode) -> JoshResult<Fragment> {
        let operand = self.compile_expr(&map.operand)?;
        let from_low = self.compile_expr(&map.from_low)?;
        let from_high = self.compile_expr(&map.from_high)?;
        let to_low = self.compile_expr(&map.to_low)?;
        let to_high = self.compile_expr(&map.to_high)?;
        let method_arg = map.method_arg.as_deref().map(literal_bool).transpose()?;
        let strategy = MappingStrategy::from_name(&map.strategy, method_arg).ok_or_else(|| {
            JoshError::Compile(CompileError::UnsupportedMapStrategy { strategy: map.strategy.clone() })
        })?;
        let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_apply_map(strategy));
        Ok(Fragment::Action(action::sequence(vec![
            operand, from_low, from_high, to_low, to_high, apply,
        ])))
    }

    fn compile_sample(&self, sample: &SampleNode) -> JoshResult<Fragment> {
        match sample {
            SampleNode::FromDistribution { subject, count, with_replacement } => {
                let subject_action = self.compile_expr(subject)?;
                let count_action = match count {
                    Some(node) => self.compile_expr(node)?,
                    None => push_const(self.single_count.clone()),
                };
                let with_replacement = *with_replacement;
                let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_sample(with_replacement));
                Ok(Fragment::Action(action::sequence(vec![subject_action, count_action, apply])))
            }
            SampleNode::Uniform { low, high } => {
                let low_action = self.compile_expr(low)?;
                let high_action = self.compile_expr(high)?;
                let apply: HandlerAction = Rc::new(|m: &mut Machine| m.op_rand_uniform());
                Ok(Fragment::Action(action::sequence(vec![low_action, high_action, apply])))
            }
            SampleNode::Normal { mean, std } => {
                let mean_action = self.compile_expr(mean)?;
                let std_action = self.compile_expr(std)?;
                let apply: HandlerAction = Rc::new(|m: &mut Machine| m.op_rand_norm());
                Ok(Fragment::Action(action::sequence(vec![mean_action, std_action, apply])))
            }
        }
    }

    fn compile_limit(&self, limit: &LimitNode) -> JoshResult<Fragment> {
        let target_action = self.compile_expr(&limit.target)?;
        let lower_action = limit.lower.as_deref().map(|n| self.compile_expr(n)).transpose()?;
        let upper_action = limit.upper.as_deref().map(|n| self.compile_expr(n)).transpose()?;
        let has_lower = lower_action.is_some();
        let has_upper = upper_action.is_some();
        let mut sequence = vec![target_action];
        if let Some(lower) = lower_action {
            sequence.push(lower);
        }
        if let Some(upper) = upper_action {
            sequence.push(upper);
        }
        let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_bound(has_lower, has_upper));
        sequence.push(apply);
        Ok(Fragment::Action(action::sequence(sequence)))
    }

    // -- cast / create / attribute / spatial ---------------------------------

    fn compile_cast(&self, operand: &Node, units: &str, force: bool) -> JoshResult<Fragment> {
        let operand_action = self.compile_expr(operand)?;
        let units = Units::new(units.to_owned());
        let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_cast(units.clone(), force));
        Ok(Fragment::Action(action::sequence(vec![operand_action, apply])))
    }

    fn compile_create(&self, entity_type: &str, count: Option<&Node>) -> JoshResult<Fragment> {
        let count_action = match count {
            Some(node) => self.compile_expr(node)?,
            None => push_const(self.single_count.clone()),
        };
        let entity_type = entity_type.to_owned();
        let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_create_entity(&entity_type));
        Ok(Fragment::Action(action::sequence(vec![count_action, apply])))
    }

    fn compile_attribute_access(&self, subject: &Node, resolver: &str) -> JoshResult<Fragment> {
        let subject_action = self.compile_expr(subject)?;
        let resolver = Rc::new(ValueResolver::new(resolver.to_owned()));
        let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_push_attribute(&resolver));
        Ok(Fragment::Action(action::sequence(vec![subject_action, apply])))
    }

    /// `T within D`: `T` must be a (possibly dotted) identifier — the
    /// resolver it names is what `execute_spatial_query` re-resolves against
    /// the caller's scope to find the querying entity.
    fn compile_spatial_query(&self, subject: &Node, distance: &Node) -> JoshResult<Fragment> {
        let Node::Identifier(path) = subject else {
            return Err(JoshError::Compile(CompileError::UnknownOperator {
                op: "within requires an identifier subject".to_owned(),
            }));
        };
        let distance_action = self.compile_expr(distance)?;
        let resolver = Rc::new(ValueResolver::new(path.clone()));
        let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_execute_spatial_query(&resolver));
        Ok(Fragment::Action(action::sequence(vec![distance_action, apply])))
    }

    // -- bodies / control flow ----------------------------------------------

    /// `return <expr>`: compiles the operand, then ends the machine once its
    /// value is on top of the stack.
    fn compile_return(&self, inner: &Node) -> JoshResult<Fragment> {
        let inner_action = self.compile_expr(inner)?;
        let end: HandlerAction = Rc::new(|m: &mut Machine| m.op_end());
        Ok(Fragment::Action(action::sequence(vec![inner_action, end])))
    }

    /// Runs each statement in source order, stopping as soon as one of them
    /// ends the machine. A body whose last statement never calls `end` surfaces as a
    /// `MachineNotEnded` error at `get_result` time rather than at compile
    /// time.
    fn compile_full_body(&self, stmts: &[Node]) -> JoshResult<Fragment> {
        let actions = stmts.iter().map(|s| self.compile_expr(s)).collect::<JoshResult<Vec<_>>>()?;
        Ok(Fragment::Action(Rc::new(move |m: &mut Machine| {
            for action in &actions {
                action(m)?;
                if m.is_ended() {
                    return Ok(());
                }
            }
            Ok(())
        })))
    }

    /// `<name> = <expr>`: rejects assignment to a reserved event/entity-type
    /// keyword.
    fn compile_assignment(&self, name: &str, value: &Node) -> JoshResult<Fragment> {
        if is_reserved_name(name) {
            return Err(JoshError::Compile(CompileError::ReservedNameAssignment { name: name.to_owned() }));
        }
        let value_action = self.compile_expr(value)?;
        let name = name.to_owned();
        let save: HandlerAction = Rc::new(move |m: &mut Machine| m.op_save_local(&name));
        Ok(Fragment::Action(action::sequence(vec![value_action, save])))
    }

    fn compile_config_ref(&self, name: &str, default: Option<&Node>) -> JoshResult<Fragment> {
        let name = name.to_owned();
        match default {
            None => {
                let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_push_config(&name));
                Ok(Fragment::Action(apply))
            }
            Some(default_node) => {
                let default_action = self.compile_expr(default_node)?;
                let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_push_config_with_default(&name));
                Ok(Fragment::Action(action::sequence(vec![default_action, apply])))
            }
        }
    }

    fn compile_external_ref(&self, name: &str, step: Option<&Node>) -> JoshResult<Fragment> {
        let name = name.to_owned();
        let literal_step = step.map(literal_int).transpose()?;
        let apply: HandlerAction = Rc::new(move |m: &mut Machine| m.op_push_external(&name, literal_step));
        Ok(Fragment::Action(apply))
    }

    // -- stanzas --------------------------------------------------------------

    /// `if`/`elif`/`else` members of one dotted handler name. Compiles each member into its own
    /// `EventHandler{callable, selector}` rather than fusing the chain with
    /// `ChainingConditionalBuilder`: `fast_forward`'s per-attribute evaluation
    /// must be able to leave an attribute untouched when no member matches,
    /// which requires trying each selector in its own
    /// sub-invocation and stopping before running any body — a single fused
    /// action has no way to signal "nothing matched" without ending the
    /// machine. A lone unconditional member (no `if`/`elif` siblings) compiles
    /// with `selector: None`; an `else` trailing one or more `if`/`elif`
    /// members compiles with a selector that always pushes `true` (the same
    /// modeling `ChainingConditionalBuilder::add_else` uses). An unconditional
    /// member anywhere but last is malformed.
    fn compile_handler_group(&self, state: Option<&str>, node: &ast::HandlerGroupNode) -> JoshResult<GroupFragment> {
        let (attribute, event) = EventKey::parse_name(&node.name);
        let key = EventKey::new(state.map(str::to_owned), attribute.clone(), event);
        let mut group = EventHandlerGroup::default();
        let last_index = node.members.len().saturating_sub(1);
        for (index, member) in node.members.iter().enumerate() {
            let body_action = self.compile_full_body_or_expr(&member.body)?;
            let selector = match &member.condition {
                Some(condition) => Some(self.compile_expr(condition)?),
                None if node.members.len() == 1 => None,
                None if index == last_index => Some(push_const(self.true_value.clone())),
                None => {
                    return Err(JoshError::Compile(CompileError::NonConditionalWithSelector {
                        attribute: attribute.clone(),
                    }));
                }
            };
            fragment::push_member(&mut group, body_action, selector);
        }
        Ok(GroupFragment { key, group })
    }

    fn compile_full_body_or_expr(&self, body: &[Node]) -> JoshResult<HandlerAction> {
        self.compile_full_body(body)?
            .into_action()
            .ok_or_else(|| JoshError::Compile(CompileError::UnknownOperator { op: "handler body".to_owned() }))
    }

    fn compile_state(&self, state: &ast::StateNode) -> JoshResult<StateFragment> {
        let groups = state
            .groups
            .iter()
            .map(|g| self.compile_handler_group(Some(&state.name), g))
            .collect::<JoshResult<Vec<_>>>()?;
        Ok(StateFragment { state: state.name.clone(), groups })
    }

    /// Composes an `entity`/`simulation` stanza's top-level and per-state
    /// handler groups into one `EntityPrototype`. Agent-defined
    /// entity type names are not drawn from `RESERVED_ENTITY_TYPES` — that
    /// list reserves identifiers as local/attribute names (`is_reserved_name`),
    /// not entity type names.
    fn compile_entity(&self, entity: &ast::EntityNode) -> JoshResult<Fragment> {
        let mut groups = Vec::new();
        for group in &entity.top_level_groups {
            groups.push(self.compile_handler_group(None, group)?);
        }
        for state in &entity.states {
            groups.extend(self.compile_state(state)?.groups);
        }
        let handler_groups = fragment::groups_into_map(groups);
        Ok(Fragment::Entity(EntityPrototype::new(entity.entity_type.clone(), handler_groups)))
    }

    /// `unit <source> { from A to B using <expr> ... }`. A conversion member with no body compiles to a `Noop` alias;
    /// one with a body compiles to a closure that runs the expression in a
    /// throwaway machine with the incoming value bound to the local name
    /// `value` (see DESIGN.md — conversion bodies are pure-math expressions
    /// and do not see the rest of the program's scope or a live bridge).
    fn compile_unit(&self, unit: &ast::UnitNode) -> JoshResult<Fragment> {
        let mut conversions = Vec::new();
        for member in &unit.conversions {
            let source_units = Units::new(member.source_units.clone());
            let destination_units = Units::new(member.destination_units.clone());
            let conversion = match &member.body {
                None => Conversion::Noop { units: source_units },
                Some(body) => {
                    let body_action = self.compile_expr(body)?;
                    let factory = self.factory;
                    let callable: ConversionCallable =
                        Rc::new(move |value: &EngineValue| run_conversion_body(&body_action, value, factory));
                    Conversion::Direct { source_units, destination_units, callable }
                }
            };
            conversions.push(conversion);
        }
        Ok(Fragment::Conversions(conversions))
    }
}

fn push_const(value: EngineValue) -> HandlerAction {
    Rc::new(move |m: &mut Machine| {
        m.push(value.clone());
        Ok(())
    })
}

fn is_reserved_name(name: &str) -> bool {
    RESERVED_ENTITY_TYPES.contains(&name) || Event::from_keyword(name).is_some() || name == "meta"
}

fn literal_bool(node: &Node) -> JoshResult<bool> {
    match node {
        Node::Literal(Literal::Bool(b)) => Ok(*b),
        _ => Err(JoshError::Compile(CompileError::UnsupportedMapStrategy {
            strategy: "method argument must be a literal boolean".to_owned(),
        })),
    }
}

fn literal_int(node: &Node) -> JoshResult<i64> {
    match node {
        Node::Literal(Literal::Number(n)) => Ok(*n as i64),
        _ => Err(JoshError::Compile(CompileError::UnknownOperator {
            op: "external step must be a literal number".to_owned(),
        })),
    }
}

/// The minimal `EngineBridge` a unit-conversion body runs against. Conversion
/// bodies are pure arithmetic over the bound `value` local; they never create
/// entities, query geometry, or read external/config data, so every method
/// but `convert`/`engine_value_factory` is unreachable in practice and only
/// exists to satisfy the trait.
struct ConversionBridge {
    factory: EngineValueFactory,
    geometry_factory: UnreachableGeometryFactory,
}

struct UnreachableGeometryFactory;
impl GeometryFactory for UnreachableGeometryFactory {
    fn from_position(&self, description: &str) -> JoshResult<Geometry> {
        Ok(Geometry(description.to_owned()))
    }
}

impl EngineBridge for ConversionBridge {
    fn convert(&self, value: &EngineValue, target_units: &Units) -> JoshResult<EngineValue> {
        Ok(value.replace_units(target_units.clone()))
    }
    fn get_prototype(&self, entity_type_name: &str) -> JoshResult<EntityPrototype> {
        Err(JoshError::Compile(CompileError::UnknownEntityType { name: entity_type_name.to_owned() }))
    }
    fn geometry_factory(&self) -> &dyn GeometryFactory {
        &self.geometry_factory
    }
    fn converter(&self) -> Rc<Converter> {
        Rc::new(Converter::new())
    }
    fn get_prior_patches(&self, _geometry: &Geometry, _radius_meters: f64) -> JoshResult<Vec<EntityHandle>> {
        Ok(vec![])
    }
    fn get_external(&self, _geo_key: &str, name: &str, _step: i64) -> JoshResult<EngineValue> {
        Err(JoshError::Resolution(ResolutionError { path: format!("external.{name}"), available: vec![] }))
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
        self.factory
    }
}

/// A scope with nothing in it but the converter, so `Scope::converter` has
/// something real to hand back when a conversion body's `LocalScope` falls
/// through to its parent.
struct ConversionRootScope(Rc<Converter>);
impl Scope for ConversionRootScope {
    fn get(&self, name: &str) -> JoshResult<EngineValue> {
        Err(JoshError::Resolution(ResolutionError { path: name.to_owned(), available: vec![] }))
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

/// Runs one conversion body to completion in a fresh, disposable machine: the
/// incoming value is bound to the local name `value`, the body is evaluated,
/// and its top-of-stack result is handed back. Uses `SharedRng::from_entropy`
/// since a conversion body has no deterministic seed available at compile
/// time (see DESIGN.md).
fn run_conversion_body(body: &HandlerAction, value: &EngineValue, factory: EngineValueFactory) -> JoshResult<EngineValue> {
    let root: Rc<dyn Scope> = Rc::new(ConversionRootScope(Rc::new(Converter::new())));
    let scope = Rc::new(LocalScope::new(root));
    scope.define_constant("value", value.clone());
    let bridge_getter = Rc::new(BridgeGetter::new());
    let bridge: Rc<dyn EngineBridge> = Rc::new(ConversionBridge { factory, geometry_factory: UnreachableGeometryFactory });
    bridge_getter.set(bridge)?;
    let mut machine = Machine::new(scope, bridge_getter, SharedRng::from_entropy(), factory, Substep::Constant);
    body(&mut machine)?;
    if !machine.is_ended() {
        machine.end()?;
    }
    machine.get_result()
}
