//! A thin demo binary exercising `josh`'s public surface.
//!
//! The grammar/parser front end is out of scope for this workspace, so
//! there is no source-text argument to read: there is nothing installed to
//! turn text into a syntax tree. Instead this binary builds a handful of
//! small `josh::ast::ProgramNode` values directly (the "syntax tree
//! consumer" contract the library exposes), compiles each with
//! `CompileVisitor`, runs it against an in-memory demo bridge, and prints
//! the result.

use std::{env, process::ExitCode, rc::Rc, time::Instant};

use indexmap::IndexMap;

use josh::{
    BridgeGetter, CompileVisitor, EngineBridge, EngineValue, EngineValueFactory, EntityHandle, EntityPrototype,
    Geometry, GeometryFactory, JoshResult, LocalScope, Machine, Scope, SharedRng, Substep, Units,
};
use josh::ast::{BinaryOp, EntityNode, HandlerGroupNode, HandlerMember, Literal, Node, ProgramNode};
use josh::converter::{Conversion, Converter};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let demo = args.get(1).map(String::as_str).unwrap_or("basic");

    let start = Instant::now();
    let result = match demo {
        "basic" => run_basic_demo(),
        "units" => run_units_demo(),
        "entity" => run_entity_demo(),
        other => {
            eprintln!("unknown demo: {other} (expected one of: basic, units, entity)");
            return ExitCode::FAILURE;
        }
    };
    let elapsed = start.elapsed();

    match result {
        Ok(value) => {
            eprintln!("success after: {elapsed:?}\n{value}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error after: {elapsed:?}\n{err}");
            ExitCode::FAILURE
        }
    }
}

/// `5 meters + 3 meters`, compiled and run against a converter with nothing
/// registered (no conversion needed since the units already match).
fn run_basic_demo() -> JoshResult<EngineValue> {
    let factory = EngineValueFactory::new(false);
    let visitor = CompileVisitor::new(factory);
    let node = Node::Binary {
        op: BinaryOp::Add,
        left: Box::new(Node::literal(Literal::UnitsValue(5.0, "meters".to_owned()))),
        right: Box::new(Node::literal(Literal::UnitsValue(3.0, "meters".to_owned()))),
    };
    let action = visitor
        .compile(&node)?
        .into_action()
        .expect("binary expressions always compile to an action");
    run_action(&action, factory, Converter::new())
}

/// Registers `1 km = 1000 m`, then adds `2 km` to `500 m` — demonstrates
/// the conversion-group rule that the target units are whichever operand's
/// units were popped first.
fn run_units_demo() -> JoshResult<EngineValue> {
    let factory = EngineValueFactory::new(false);
    let visitor = CompileVisitor::new(factory);
    let node = Node::Binary {
        op: BinaryOp::Add,
        left: Box::new(Node::literal(Literal::UnitsValue(2.0, "km".to_owned()))),
        right: Box::new(Node::literal(Literal::UnitsValue(500.0, "m".to_owned()))),
    };
    let action = visitor
        .compile(&node)?
        .into_action()
        .expect("binary expressions always compile to an action");

    let mut converter = Converter::new();
    converter.register(Conversion::Direct {
        source_units: Units::new("km"),
        destination_units: Units::new("m"),
        callable: Rc::new(|v: &EngineValue| {
            Ok(EngineValue::scalar_double(v.as_double()? * 1000.0, Units::new("m")))
        }),
    });
    run_action(&action, factory, converter)
}

/// Compiles a one-attribute `Plot` entity (`height.step` from a linear map
/// over a `position` input) and fast-forwards a freshly created instance up
/// to `step`.
fn run_entity_demo() -> JoshResult<EngineValue> {
    let factory = EngineValueFactory::new(false);
    let visitor = CompileVisitor::new(factory);

    let program = ProgramNode {
        entities: vec![EntityNode {
            entity_type: "Plot".to_owned(),
            top_level_groups: vec![HandlerGroupNode {
                name: "height.step".to_owned(),
                members: vec![HandlerMember {
                    condition: None,
                    body: vec![Node::Return(Box::new(Node::literal(Literal::UnitsValue(
                        2.0, "meters".to_owned(),
                    ))))],
                }],
            }],
            states: vec![],
        }],
        units: vec![],
        simulations: vec![],
    };

    let compiled = visitor.compile_program(&program)?;
    let prototype = compiled
        .get_prototypes()
        .get("Plot")
        .expect("Plot prototype registered above")
        .clone();
    let entity = prototype.build("plot-0");

    let bridge_getter = Rc::new(BridgeGetter::new());
    let bridge: Rc<dyn EngineBridge> = Rc::new(DemoBridge::new(Converter::new(), prototype.clone()));
    bridge_getter.set(bridge)?;

    josh::EntityFastForwarder::fast_forward(&entity, Substep::Step, bridge_getter, SharedRng::seeded(7), factory)?;

    Ok(entity.borrow().get_attribute("height").cloned().expect("height set by fast-forward"))
}

fn run_action(
    action: &josh::HandlerAction,
    factory: EngineValueFactory,
    converter: Converter,
) -> JoshResult<EngineValue> {
    let root: Rc<dyn Scope> = Rc::new(RootScope(Rc::new(converter.clone())));
    let scope = Rc::new(LocalScope::new(root));
    let bridge_getter = Rc::new(BridgeGetter::new());
    let bridge: Rc<dyn EngineBridge> = Rc::new(DemoBridge::new(
        converter,
        EntityPrototype::new("Plot", IndexMap::new()),
    ));
    bridge_getter.set(bridge)?;
    let mut machine = Machine::new(scope, bridge_getter, SharedRng::seeded(1), factory, Substep::Step);
    action(&mut machine)?;
    if !machine.is_ended() {
        machine.end()?;
    }
    machine.get_result()
}

/// A scope with nothing bound but a converter, the root every demo's
/// `LocalScope` falls back to.
struct RootScope(Rc<Converter>);

impl Scope for RootScope {
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

struct DemoGeometryFactory;

impl GeometryFactory for DemoGeometryFactory {
    fn from_position(&self, description: &str) -> JoshResult<Geometry> {
        Ok(Geometry(description.to_owned()))
    }
}

/// A bridge good enough to drive the demos above: no external/config data, no
/// prior-step patches, one entity prototype it was built with. A real host's
/// `EngineBridge` (converter registry, geometry factory, prior-step patch
/// index, external data providers) is a much larger thing.
struct DemoBridge {
    converter: Converter,
    prototype: EntityPrototype,
    geometry_factory: DemoGeometryFactory,
}

impl DemoBridge {
    fn new(converter: Converter, prototype: EntityPrototype) -> Self {
        Self {
            converter,
            prototype,
            geometry_factory: DemoGeometryFactory,
        }
    }
}

impl EngineBridge for DemoBridge {
    fn convert(&self, value: &EngineValue, target_units: &Units) -> JoshResult<EngineValue> {
        self.converter.convert(value, target_units)
    }

    fn get_prototype(&self, entity_type_name: &str) -> JoshResult<EntityPrototype> {
        if entity_type_name == self.prototype.entity_type {
            Ok(self.prototype.clone())
        } else {
            Err(josh::JoshError::Compile(josh::CompileError::UnknownEntityType {
                name: entity_type_name.to_owned(),
            }))
        }
    }

    fn geometry_factory(&self) -> &dyn GeometryFactory {
        &self.geometry_factory
    }

    fn converter(&self) -> Rc<Converter> {
        Rc::new(self.converter.clone())
    }

    fn get_prior_patches(&self, _geometry: &Geometry, _radius_meters: f64) -> JoshResult<Vec<EntityHandle>> {
        Ok(vec![])
    }

    fn get_external(&self, _geo_key: &str, name: &str, _step: i64) -> JoshResult<EngineValue> {
        Err(josh::JoshError::Resolution(josh::ResolutionError {
            path: format!("external.{name}"),
            available: vec![],
        }))
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
