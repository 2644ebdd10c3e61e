//! Syntax-tree node shapes the compile visitor (`crate::compiler`) consumes.
//!
//! The grammar and parser front end is an external
//! collaborator: this module defines only the "syntax tree consumer"
//! contract — node shapes a caller (a real parser, or a test) populates
//! directly. There is no grammar, no tokenizer, and no parse-error recovery
//! here; a `ParseError` value (`crate::error::ParseError`) is how a fatal
//! parse failure from that external stage is supposed to reach this crate,
//! re-surfaced as-is by whatever calls the compiler.

use crate::entity::Event;

/// A literal value as written in source.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A bare number with no unit suffix (dimensionless).
    Number(f64),
    /// A number with a unit suffix, e.g. `5 meters`.
    UnitsValue(f64, String),
    Str(String),
    Bool(bool),
    /// The `all` keyword, used as a sample-count sentinel.
    All,
    /// A `position` literal operand half, e.g. `33.1 latitude`.
    Position(f64, String),
}

/// A binary operator spelled out in source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Pow,
    Concat,
    And,
    Or,
    Xor,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// One `linear`/`parametric`/method-argument map form.
#[derive(Debug, Clone)]
pub struct MapNode {
    pub operand: Box<Node>,
    pub from_low: Box<Node>,
    pub from_high: Box<Node>,
    pub to_low: Box<Node>,
    pub to_high: Box<Node>,
    pub strategy: String,
    /// The optional boolean method argument (`center_max` / `steep`).
    pub method_arg: Option<Box<Node>>,
}

/// A sampling form: simple, count, replacement choice, uniform, or normal.
#[derive(Debug, Clone)]
pub enum SampleNode {
    FromDistribution {
        subject: Box<Node>,
        count: Option<Box<Node>>,
        with_replacement: bool,
    },
    Uniform { low: Box<Node>, high: Box<Node> },
    Normal { mean: Box<Node>, std: Box<Node> },
}

/// A `limit`/bound form: both bounds, min-only, or max-only.
#[derive(Debug, Clone)]
pub struct LimitNode {
    pub target: Box<Node>,
    pub lower: Option<Box<Node>>,
    pub upper: Option<Box<Node>>,
}

/// One `if`/`elif`/`else` member of an event-handler group.
#[derive(Debug, Clone)]
pub struct HandlerMember {
    /// `None` for an `else` member; `Some` for `if`/`elif`.
    pub condition: Option<Box<Node>>,
    pub body: Vec<Node>,
}

/// A dotted handler name (`height.step`, `population`), split at compile
/// time by `EventKey`'s name-parsing rule.
#[derive(Debug, Clone)]
pub struct HandlerGroupNode {
    pub name: String,
    pub members: Vec<HandlerMember>,
}

/// A `state <name> { ... }` stanza.
#[derive(Debug, Clone)]
pub struct StateNode {
    pub name: String,
    pub groups: Vec<HandlerGroupNode>,
}

/// An `entity <type> { ... }` stanza: top-level (stateless) groups plus
/// nested state stanzas.
#[derive(Debug, Clone)]
pub struct EntityNode {
    pub entity_type: String,
    pub top_level_groups: Vec<HandlerGroupNode>,
    pub states: Vec<StateNode>,
}

/// One `from <units> to <units> using <expr>` member of a `unit` stanza, or a
/// bare alias (`unit alias km = 1000 m` folds to a `Noop`, modeled by the
/// compiler when `body` is `None`).
#[derive(Debug, Clone)]
pub struct ConversionNode {
    pub source_units: String,
    pub destination_units: String,
    pub body: Option<Node>,
}

/// A `unit <source> { ... }` stanza.
#[derive(Debug, Clone)]
pub struct UnitNode {
    pub source_units: String,
    pub conversions: Vec<ConversionNode>,
}

/// A `simulation <name> { ... }` stanza: reuses [`EntityNode`]'s shape since a
/// simulation is a stanza of state/handler-group stanzas like any other
/// entity type.
pub type SimulationNode = EntityNode;

/// A full compiled program: every entity/unit/simulation stanza the syntax
/// tree contained.
#[derive(Debug, Clone, Default)]
pub struct ProgramNode {
    pub entities: Vec<EntityNode>,
    pub units: Vec<UnitNode>,
    pub simulations: Vec<SimulationNode>,
}

/// Every syntax-tree node kind the compile visitor is total over.
/// Expression, statement, and stanza nodes share one enum because the
/// visitor's dispatch is a single exhaustive `match`.
#[derive(Debug, Clone)]
pub enum Node {
    Literal(Literal),
    /// A bare identifier, possibly dotted (`here.soil.moisture`).
    Identifier(String),
    Binary {
        op: BinaryOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Map(MapNode),
    Sample(SampleNode),
    Limit(LimitNode),
    /// `cast <expr> to <units>` / `force <expr> to <units>`.
    Cast { operand: Box<Node>, units: String, force: bool },
    /// `create <count> of <type>` / `create <type>` (count defaults to `1 count`).
    Create { entity_type: String, count: Option<Box<Node>> },
    /// `<entity-expr>.<attribute>`.
    AttributeAccess { subject: Box<Node>, resolver: String },
    /// `<entity-expr> within <distance>`.
    SpatialQuery { subject: Box<Node>, distance: Box<Node> },
    /// `return <expr>` (appears as the final statement of a lambda/full body).
    Return(Box<Node>),
    /// A full handler body: statements executed in source order, ending the
    /// machine once the last value is pushed.
    FullBody(Vec<Node>),
    /// A single-expression lambda body.
    Lambda(Box<Node>),
    /// `<name> = <expr>` — binds a local variable for the rest of the handler.
    Assignment { name: String, value: Box<Node> },
    /// `config("name")` / `config("name", default)`.
    ConfigRef { name: String, default: Option<Box<Node>> },
    /// `external("name")` (current step) / `external("name", step)`.
    ExternalRef { name: String, step: Option<Box<Node>> },
    Entity(EntityNode),
    Unit(UnitNode),
    Simulation(SimulationNode),
    Program(ProgramNode),
}

impl Node {
    pub fn literal(value: Literal) -> Self {
        Self::Literal(value)
    }
}

/// Maps a reserved dotted-handler event suffix to [`Event`]; re-exported here
/// so callers building a [`HandlerGroupNode`] do not need to import
/// `crate::entity` directly just to spell out a reserved name.
pub fn event_keyword(s: &str) -> Option<Event> {
    Event::from_keyword(s)
}
