//! Error kinds produced by compiling and evaluating a Josh program.
//!
//! Each stage of the pipeline (parse, compile, run) has its own error kind;
//! [`JoshError`] is the union every public entry point returns. None of these
//! variants attempt to recover automatically — propagation stops the current
//! handler evaluation and hands the error to the driver (see module docs on
//! `crate::machine`).

use std::fmt;

/// Errors re-surfaced from the (external) grammar/parser front end.
///
/// The parser itself is outside this crate; this variant only carries its
/// message forward so callers see a single error type.
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error: {}", self.message)
    }
}

/// Errors raised while compiling a syntax tree into actions.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// A stanza (`entity`, `state`, `unit`) was closed without a matching open, or vice versa.
    MismatchedStanza { stanza: String },
    /// `create`/`within` referenced an entity type the program never declares.
    UnknownEntityType { name: String },
    /// A binary/unary node named an operator this machine does not implement.
    UnknownOperator { op: String },
    /// An assignment target collides with a reserved name (e.g. `meta`).
    ReservedNameAssignment { name: String },
    /// An `else`/unconditional handler carried a selector it should not have.
    NonConditionalWithSelector { attribute: String },
    /// A `map` stanza named a strategy this compiler does not implement.
    UnsupportedMapStrategy { strategy: String },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MismatchedStanza { stanza } => write!(f, "mismatched stanza: {stanza}"),
            Self::UnknownEntityType { name } => write!(f, "unknown entity type: {name}"),
            Self::UnknownOperator { op } => write!(f, "unknown operator: {op}"),
            Self::ReservedNameAssignment { name } => {
                write!(f, "cannot assign to reserved name: {name}")
            }
            Self::NonConditionalWithSelector { attribute } => write!(
                f,
                "unconditional handler for {attribute} may not carry a selector"
            ),
            Self::UnsupportedMapStrategy { strategy } => {
                write!(f, "unsupported map strategy: {strategy}")
            }
        }
    }
}

/// Errors raised by misuse of the push-down machine or bridge indirection.
#[derive(Debug, Clone)]
pub enum StateError {
    /// The bridge-getter was bound a second time.
    BridgeAlreadySet,
    /// The bridge-getter was read before anything bound it.
    BridgeNotSet,
    /// `get_result` or a pop was attempted on a machine that never called `end`.
    MachineNotEnded,
    /// `end` was called a second time on the same machine.
    MachineAlreadyEnded,
    /// A conversion group was opened while another was already open.
    NestedConversionGroup,
    /// An entity's substep was opened a second time without closing the first.
    SubstepAlreadyOpen { substep: String },
    /// An entity's substep was closed without ever being opened.
    SubstepNotOpen,
    /// The evaluation stack was popped while empty.
    StackUnderflow { op: String },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BridgeAlreadySet => write!(f, "bridge was already bound"),
            Self::BridgeNotSet => write!(f, "bridge was read before it was bound"),
            Self::MachineNotEnded => write!(f, "machine result requested before `end`"),
            Self::MachineAlreadyEnded => write!(f, "machine `end` called twice"),
            Self::NestedConversionGroup => write!(f, "conversion groups may not nest"),
            Self::SubstepAlreadyOpen { substep } => {
                write!(f, "substep {substep} is already open")
            }
            Self::SubstepNotOpen => write!(f, "no substep is open to close"),
            Self::StackUnderflow { op } => write!(f, "stack underflow evaluating {op}"),
        }
    }
}

/// Errors raised by an operation applied to a value it does not support.
#[derive(Debug, Clone)]
pub enum DomainError {
    /// `log10`/`ln` of a value <= 0.
    NonPositiveLog { op: String, value: String },
    /// `abs`/`ceil`/`floor`/`round`/`ln`/`log10` applied to a distribution.
    OperatorOnDistribution { op: String },
    /// A statistic (`min`/`max`/`mean`/`std`/`sum`/`count`) over a virtualized distribution.
    StatisticOnVirtualized { statistic: String },
    /// `create N of T` with a negative `N`.
    NegativeEntityCount { count: String },
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveLog { op, value } => {
                write!(f, "{op} requires a positive operand, got {value}")
            }
            Self::OperatorOnDistribution { op } => {
                write!(f, "{op} cannot be applied to a distribution")
            }
            Self::StatisticOnVirtualized { statistic } => write!(
                f,
                "{statistic} is unavailable on a virtualized distribution"
            ),
            Self::NegativeEntityCount { count } => {
                write!(f, "entity creation count must be non-negative, got {count}")
            }
        }
    }
}

/// A conversion group needed a conversion the converter does not have registered.
#[derive(Debug, Clone)]
pub struct UnitsError {
    pub source: String,
    pub destination: String,
}

impl fmt::Display for UnitsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no conversion registered from {} to {}",
            self.source, self.destination
        )
    }
}

/// A [`crate::scope::ValueResolver`] could not find any prefix of its path in a scope.
#[derive(Debug, Clone)]
pub struct ResolutionError {
    pub path: String,
    pub available: Vec<String>,
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(attribute) = self.path.strip_prefix("meta.") {
            write!(
                f,
                "could not resolve {}: attribute `{attribute}` is not declared on the simulation; \
                 did you mean to declare it under the simulation's `meta` stanza? available: {}",
                self.path,
                self.available.join(", ")
            )
        } else {
            write!(
                f,
                "could not resolve {}: available attributes are {}",
                self.path,
                self.available.join(", ")
            )
        }
    }
}

/// Top-level error type every public entry point of this crate returns.
#[derive(Debug, Clone)]
pub enum JoshError {
    Parse(ParseError),
    Compile(CompileError),
    State(StateError),
    Domain(DomainError),
    Units(UnitsError),
    Resolution(ResolutionError),
}

impl fmt::Display for JoshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(e) => write!(f, "{e}"),
            Self::Compile(e) => write!(f, "{e}"),
            Self::State(e) => write!(f, "{e}"),
            Self::Domain(e) => write!(f, "{e}"),
            Self::Units(e) => write!(f, "{e}"),
            Self::Resolution(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for JoshError {}

impl From<ParseError> for JoshError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<CompileError> for JoshError {
    fn from(e: CompileError) -> Self {
        Self::Compile(e)
    }
}

impl From<StateError> for JoshError {
    fn from(e: StateError) -> Self {
        Self::State(e)
    }
}

impl From<DomainError> for JoshError {
    fn from(e: DomainError) -> Self {
        Self::Domain(e)
    }
}

impl From<UnitsError> for JoshError {
    fn from(e: UnitsError) -> Self {
        Self::Units(e)
    }
}

impl From<ResolutionError> for JoshError {
    fn from(e: ResolutionError) -> Self {
        Self::Resolution(e)
    }
}

/// Result alias used throughout the crate.
pub type JoshResult<T> = Result<T, JoshError>;
