//! Wires every core component together against a tiny embedded program, so
//! `trenchd demo` can smoke-test the callgraph + fixpoint wiring without a
//! real Dex loader on hand. Shape mirrors §8 scenario 1 of the design: a
//! source on a caller's argument reaches a callee's declared sink.

use chrono::Local;
use console::style;
use std::collections::{HashMap, HashSet};
use trench_core::access_path::{AccessPath, Root};
use trench_core::callgraph::CallGraph;
use trench_core::config::Configuration;
use trench_core::errors::TrenchResult;
use trench_core::fixpoint::Fixpoint;
use trench_core::frame::Frame;
use trench_core::interfaces::{
    BasicBlock, ClassHierarchy, ControlFlowGraph, Instruction, Opcode, ProgramView, TypeEnvironment, TypeOracle,
};
use trench_core::interning::MethodId;
use trench_core::kind::{Kind, NamedKindRole};
use trench_core::model::Model;
use trench_core::rules::{RuleDefinition, Rules};
use trench_core::taint::Taint;

struct DemoProgram {
    methods: Vec<MethodId>,
    code: HashMap<MethodId, ControlFlowGraph>,
}

impl ProgramView for DemoProgram {
    fn parameter_type(&self, _method: MethodId, _index: u32) -> Option<String> {
        Some("Ljava/lang/String;".to_string())
    }
    fn get_class(&self, method: MethodId) -> Option<String> {
        Some(method.name().split('.').next().unwrap_or_default().to_string())
    }
    fn signature(&self, method: MethodId) -> String {
        method.name().to_string()
    }
    fn returns_void(&self, _method: MethodId) -> bool {
        true
    }
    fn get_code(&self, method: MethodId) -> Option<&ControlFlowGraph> {
        self.code.get(&method)
    }
    fn is_static(&self, _method: MethodId) -> bool {
        true
    }
    fn is_constructor(&self, _method: MethodId) -> bool {
        false
    }
    fn is_native(&self, _method: MethodId) -> bool {
        false
    }
    fn parameter_count(&self, _method: MethodId) -> u32 {
        1
    }
    fn methods(&self) -> Vec<MethodId> {
        self.methods.clone()
    }
}

struct NoOracle;
impl TypeOracle for NoOracle {
    fn receiver_type(&self, _caller: MethodId, _instruction: u32) -> Option<String> {
        None
    }
    fn register_type(&self, _caller: MethodId, _instruction: u32, _register: u32) -> Option<String> {
        None
    }
    fn register_const_class_type(&self, _caller: MethodId, _instruction: u32, _register: u32) -> Option<String> {
        None
    }
    fn environment(&self, _caller: MethodId, _instruction: u32) -> TypeEnvironment {
        TypeEnvironment::new()
    }
}

struct NoHierarchy;
impl ClassHierarchy for NoHierarchy {
    fn extends(&self, _class: &str) -> HashSet<String> {
        HashSet::new()
    }
    fn overrides(&self, _method: MethodId) -> Vec<MethodId> {
        Vec::new()
    }
}

/// Runs a one-call program — `run(s) { sink(s); }` where `s` is a
/// declared `UserInput` source and the callee declares a `SqlQuery` sink
/// on its only argument — through the real callgraph + fixpoint, and
/// reports the issue it finds.
pub fn handle(config: &Configuration) -> TrenchResult<()> {
    let caller = MethodId::intern("Lcom/app/Caller;.run:(Ljava/lang/String;)V");
    let callee = MethodId::intern("Lcom/app/Callee;.sink:(Ljava/lang/String;)V");

    let cfg = ControlFlowGraph {
        blocks: vec![BasicBlock {
            instructions: vec![
                Instruction { id: 0, op: Opcode::LoadParam { register: 0, parameter: 0 } },
                Instruction {
                    id: 1,
                    op: Opcode::Invoke { callee, is_static: true, arguments: vec![0], result_register: None },
                },
            ],
        }],
        edges: Vec::new(),
        entry: 0,
        exits: vec![0],
    };

    let program = DemoProgram { methods: vec![caller, callee], code: HashMap::from([(caller, cfg)]) };

    let rule = RuleDefinition {
        code: 1,
        name: "user input flows into sql query".to_string(),
        description: "demo rule".to_string(),
        source_kinds: vec!["UserInput".to_string()],
        sink_kinds: vec!["SqlQuery".to_string()],
        partial_sink_labels: HashMap::new(),
    };
    let rules = Rules::from_definitions(vec![rule]);

    let callgraph = CallGraph::build(&program, &NoOracle, &NoHierarchy, config, &[], &HashMap::new());
    let fixpoint = Fixpoint::new(&program, &callgraph, &rules, config);

    let source_kind = Kind::named("UserInput", NamedKindRole::Source);
    let arg0 = AccessPath::of_root(Root::Argument(0));
    let mut caller_model = Model::new(caller);
    caller_model.add_inferred_parameter_source(arg0.clone(), Taint::leaf(source_kind.clone(), Frame::declaration(source_kind, arg0.clone())));
    fixpoint.seed(caller, caller_model);

    let sink_kind = Kind::named("SqlQuery", NamedKindRole::Sink);
    let mut callee_model = Model::new(callee);
    callee_model.add_inferred_sink(arg0.clone(), Taint::leaf(sink_kind.clone(), Frame::declaration(sink_kind, arg0)));
    fixpoint.seed(callee, callee_model);

    let models = fixpoint.run();

    println!("{} {}", style("Demo fixpoint run").green().bold(), Local::now().format("%Y-%m-%d %H:%M:%S"));
    let caller_result = &models[&caller];
    println!("  {} issue(s) found in {}", caller_result.issues().len(), program.signature(caller));
    for issue in caller_result.issues() {
        println!("    rule {:?} at sink index {}", issue.rule, issue.sink_index);
    }

    Ok(())
}
