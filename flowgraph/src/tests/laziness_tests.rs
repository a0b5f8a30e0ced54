use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::data::{DataType, SocketType, Value};
use crate::elements::basic_funclib::BasicFuncLib;
use crate::evaluator::{evaluate, EvaluationParams};
use crate::function::{Execution, Func, FuncId, FuncInput, FuncLib, FuncOutput};
use crate::graph::{Binding, Graph, InputRef, Node};

use super::support::*;

/// Lazy two-way selector that requests its selector first and exactly one
/// branch afterwards.
fn lazy_gate_func(counter: &RunCounter, name: &str) -> Func {
    let counter = counter.clone();
    let record_name = name.to_string();
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        supports_laziness: true,
        inputs: vec![
            FuncInput::new("switch", SocketType::value(DataType::Bool)).with_default(false),
            FuncInput::new("a", SocketType::value(DataType::Float)).with_default(0.0),
            FuncInput::new("b", SocketType::value(DataType::Float)).with_default(0.0),
        ],
        outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Float))],
        execution: Execution::Callback(Arc::new(move |params| {
            counter.record(&record_name);
            if params.lazy_require_input("switch") {
                return;
            }
            let use_b = params.get_input("switch").as_bool();
            let (taken, untaken) = if use_b { ("b", "a") } else { ("a", "b") };
            params.set_input_unused(untaken);
            if params.lazy_require_input(taken) {
                return;
            }
            let value = params.extract_input(taken);
            params.set_output("value", value);
        })),
        ..Default::default()
    }
}

#[test]
fn switch_skips_untaken_branch() -> anyhow::Result<()> {
    let counter = RunCounter::default();
    let func_lib_base = BasicFuncLib::default().into_func_lib();
    let taken_producer = float_source_func(&counter, "taken producer", 1.5);
    let skipped_producer = float_source_func(&counter, "skipped producer", 2.5);

    let mut graph = Graph::default();
    let taken_node = Node::from_func(&taken_producer);
    let taken_id = taken_node.id;
    let skipped_node = Node::from_func(&skipped_producer);
    let skipped_id = skipped_node.id;

    let switch_func = func_lib_base.by_name("switch").unwrap();
    let mut switch_node = Node::from_func(switch_func);
    // Selector stays at its const default (false): the "false" branch wins.
    switch_node.inputs[1].binding = Binding::from_output_binding(taken_id, 0);
    switch_node.inputs[2].binding = Binding::from_output_binding(skipped_id, 0);
    let switch_id = switch_node.id;

    let mut group_out = Node::group_output(&[("result", SocketType::field(DataType::Float))]);
    group_out.inputs[0].binding = Binding::from_output_binding(switch_id, 0);
    let output_socket = InputRef::new(group_out.id, 0);

    graph.add_node(taken_node);
    graph.add_node(skipped_node);
    graph.add_node(switch_node);
    graph.add_node(group_out);

    let mut func_lib = func_lib_base;
    func_lib.add(taken_producer);
    func_lib.add(skipped_producer);

    let outputs = run_graph(&graph, &func_lib, vec![output_socket])?;
    assert_eq!(outputs, vec![Value::Float(1.5)]);
    assert_eq!(counter.count("taken producer"), 1);
    assert_eq!(counter.count("skipped producer"), 0);

    Ok(())
}

#[test]
fn lazy_node_suspends_and_reruns_per_requested_input() -> anyhow::Result<()> {
    let counter = RunCounter::default();
    let selector = bool_source_func(&counter, "selector", true);
    let a_producer = float_source_func(&counter, "a producer", 1.5);
    let b_producer = float_source_func(&counter, "b producer", 2.5);
    let gate = lazy_gate_func(&counter, "gate");

    let mut graph = Graph::default();
    let selector_node = Node::from_func(&selector);
    let selector_id = selector_node.id;
    let a_node = Node::from_func(&a_producer);
    let a_id = a_node.id;
    let b_node = Node::from_func(&b_producer);
    let b_id = b_node.id;
    let mut gate_node = Node::from_func(&gate);
    gate_node.inputs[0].binding = Binding::from_output_binding(selector_id, 0);
    gate_node.inputs[1].binding = Binding::from_output_binding(a_id, 0);
    gate_node.inputs[2].binding = Binding::from_output_binding(b_id, 0);
    let gate_id = gate_node.id;

    let mut group_out = Node::group_output(&[("result", SocketType::value(DataType::Float))]);
    group_out.inputs[0].binding = Binding::from_output_binding(gate_id, 0);
    let output_socket = InputRef::new(group_out.id, 0);

    graph.add_node(selector_node);
    graph.add_node(a_node);
    graph.add_node(b_node);
    graph.add_node(gate_node);
    graph.add_node(group_out);

    let func_lib = FuncLib::from([selector, a_producer, b_producer, gate]);

    let outputs = run_graph(&graph, &func_lib, vec![output_socket])?;
    assert_eq!(outputs, vec![Value::Float(2.5)]);

    // First run suspends on the selector, the second on the taken branch,
    // the third produces the output.
    assert_eq!(counter.count("gate"), 3);
    assert_eq!(counter.count("selector"), 1);
    assert_eq!(counter.count("b producer"), 1);
    assert_eq!(counter.count("a producer"), 0);

    Ok(())
}

#[test]
fn inputs_feeding_only_unused_outputs_are_never_filled() -> anyhow::Result<()> {
    let counter = RunCounter::default();
    let x_producer = float_source_func(&counter, "x producer", 1.0);
    let y_producer = float_source_func(&counter, "y producer", 2.0);

    let gate_counter = counter.clone();
    let gate = Func {
        id: FuncId::unique(),
        name: "two way gate".to_string(),
        category: "test".to_string(),
        supports_laziness: true,
        inputs: vec![
            FuncInput::new("x", SocketType::value(DataType::Float)).with_default(0.0),
            FuncInput::new("y", SocketType::value(DataType::Float)).with_default(0.0),
        ],
        outputs: vec![
            FuncOutput::new("o_used", SocketType::value(DataType::Float)),
            FuncOutput::new("o_unused", SocketType::value(DataType::Float)),
        ],
        execution: Execution::Callback(Arc::new(move |params| {
            gate_counter.record("two way gate");
            if params.lazy_output_is_required("o_used") {
                if params.lazy_require_input("x") {
                    return;
                }
                let value = params.extract_input("x");
                params.set_output("o_used", value);
            }
            if params.lazy_output_is_required("o_unused") {
                if params.lazy_require_input("y") {
                    return;
                }
                let value = params.extract_input("y");
                params.set_output("o_unused", value);
            }
        })),
        ..Default::default()
    };

    let mut graph = Graph::default();
    let x_node = Node::from_func(&x_producer);
    let x_id = x_node.id;
    let y_node = Node::from_func(&y_producer);
    let y_id = y_node.id;
    let mut gate_node = Node::from_func(&gate);
    gate_node.inputs[0].binding = Binding::from_output_binding(x_id, 0);
    gate_node.inputs[1].binding = Binding::from_output_binding(y_id, 0);
    let gate_id = gate_node.id;

    let mut group_out = Node::group_output(&[("result", SocketType::value(DataType::Float))]);
    group_out.inputs[0].binding = Binding::from_output_binding(gate_id, 0);
    let output_socket = InputRef::new(group_out.id, 0);

    graph.add_node(x_node);
    graph.add_node(y_node);
    graph.add_node(gate_node);
    graph.add_node(group_out);

    let func_lib = FuncLib::from([x_producer, y_producer, gate]);

    let outputs = run_graph(&graph, &func_lib, vec![output_socket])?;
    assert_eq!(outputs, vec![Value::Float(1.0)]);
    assert_eq!(counter.count("x producer"), 1);
    // o_unused has no consumers, so the input that feeds only it is never
    // requested and its producer never runs.
    assert_eq!(counter.count("y producer"), 0);

    Ok(())
}

#[test]
fn set_default_remaining_outputs_fills_required_outputs() -> anyhow::Result<()> {
    let stub = Func {
        id: FuncId::unique(),
        name: "stub".to_string(),
        category: "test".to_string(),
        outputs: vec![
            FuncOutput::new("first", SocketType::value(DataType::Float)),
            FuncOutput::new("second", SocketType::value(DataType::Int)),
        ],
        execution: Execution::Callback(Arc::new(|params| {
            assert!(params.can_set_output("first"));
            params.set_default_remaining_outputs();
            assert!(!params.can_set_output("first"));
            assert!(!params.can_set_output("second"));
        })),
        ..Default::default()
    };

    let mut graph = Graph::default();
    let stub_node = Node::from_func(&stub);
    let stub_id = stub_node.id;
    let mut group_out = Node::group_output(&[
        ("r0", SocketType::value(DataType::Float)),
        ("r1", SocketType::value(DataType::Int)),
    ]);
    group_out.inputs[0].binding = Binding::from_output_binding(stub_id, 0);
    group_out.inputs[1].binding = Binding::from_output_binding(stub_id, 1);
    let output_sockets = vec![
        InputRef::new(group_out.id, 0),
        InputRef::new(group_out.id, 1),
    ];

    graph.add_node(stub_node);
    graph.add_node(group_out);

    let func_lib = FuncLib::from([stub]);
    let outputs = run_graph(&graph, &func_lib, output_sockets)?;
    assert_eq!(outputs, vec![Value::Float(0.0), Value::Int(0)]);

    Ok(())
}

#[test]
fn non_lazy_node_sees_every_input() -> anyhow::Result<()> {
    let counter = RunCounter::default();
    let producer = float_source_func(&counter, "producer", 3.0);

    let saw_linked = Arc::new(AtomicBool::new(false));
    let saw_unlinked = Arc::new(AtomicBool::new(false));
    let saw_linked_inner = saw_linked.clone();
    let saw_unlinked_inner = saw_unlinked.clone();

    let probe = Func {
        id: FuncId::unique(),
        name: "probe".to_string(),
        category: "test".to_string(),
        inputs: vec![
            FuncInput::new("linked", SocketType::value(DataType::Float)).with_default(0.0),
            FuncInput::new("unlinked", SocketType::value(DataType::Float)).with_default(4.0),
        ],
        outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Float))],
        execution: Execution::Callback(Arc::new(move |params| {
            assert!(params.output_is_required("value"));
            saw_linked_inner.store(params.can_get_input("linked"), Ordering::SeqCst);
            saw_unlinked_inner.store(params.can_get_input("unlinked"), Ordering::SeqCst);
            let sum =
                params.extract_input("linked").as_f64() + params.extract_input("unlinked").as_f64();
            params.set_output("value", Value::Float(sum));
        })),
        ..Default::default()
    };

    let mut graph = Graph::default();
    let producer_node = Node::from_func(&producer);
    let producer_id = producer_node.id;
    let mut probe_node = Node::from_func(&probe);
    probe_node.inputs[0].binding = Binding::from_output_binding(producer_id, 0);
    let probe_id = probe_node.id;

    let mut group_out = Node::group_output(&[("result", SocketType::value(DataType::Float))]);
    group_out.inputs[0].binding = Binding::from_output_binding(probe_id, 0);
    let output_socket = InputRef::new(group_out.id, 0);

    graph.add_node(producer_node);
    graph.add_node(probe_node);
    graph.add_node(group_out);

    let func_lib = FuncLib::from([producer, probe]);
    let outputs = run_graph(&graph, &func_lib, vec![output_socket])?;

    // Non-lazy nodes only run once every input is present: the linked value
    // and the unlinked const default alike.
    assert_eq!(outputs, vec![Value::Float(7.0)]);
    assert!(saw_linked.load(Ordering::SeqCst));
    assert!(saw_unlinked.load(Ordering::SeqCst));

    Ok(())
}

#[test]
fn lazy_switch_execution_is_observable_by_the_logger() -> anyhow::Result<()> {
    let counter = RunCounter::default();
    let selector = bool_source_func(&counter, "selector", false);
    let a_producer = float_source_func(&counter, "a producer", 1.5);
    let gate = lazy_gate_func(&counter, "gate");

    let mut graph = Graph::default();
    let selector_node = Node::from_func(&selector);
    let selector_id = selector_node.id;
    let a_node = Node::from_func(&a_producer);
    let a_id = a_node.id;
    let mut gate_node = Node::from_func(&gate);
    gate_node.inputs[0].binding = Binding::from_output_binding(selector_id, 0);
    gate_node.inputs[1].binding = Binding::from_output_binding(a_id, 0);
    let gate_id = gate_node.id;

    let mut group_out = Node::group_output(&[("result", SocketType::value(DataType::Float))]);
    group_out.inputs[0].binding = Binding::from_output_binding(gate_id, 0);
    let output_socket = InputRef::new(group_out.id, 0);

    graph.add_node(selector_node);
    graph.add_node(a_node);
    graph.add_node(gate_node);
    graph.add_node(group_out);

    let func_lib = FuncLib::from([selector, a_producer, gate]);
    let logger = CollectingLogger::default();

    let mut params = EvaluationParams::new(&graph, &func_lib);
    params.output_sockets = vec![output_socket];
    params.logger = Some(&logger);

    let outputs = evaluate(params)?;
    assert_eq!(outputs, vec![Value::Float(1.5)]);
    // One timing entry per execution, three executions of the lazy node.
    assert_eq!(logger.execution_count(gate_id), 3);
    assert_eq!(logger.execution_count(selector_id), 1);

    Ok(())
}
