use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::data::{DataType, SocketType, TypeDef, TypeId, Value};
use crate::evaluator::{evaluate, EvalResult, EvaluationParams};
use crate::function::{Execution, Func, FuncId, FuncInput, FuncLib, FuncOutput};
use crate::graph::{Graph, InputRef, NodeId, SocketRef};
use crate::logger::EvalLogger;

/// Counts executions per function-instance name.
#[derive(Clone, Default, Debug)]
pub struct RunCounter {
    counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl RunCounter {
    pub fn record(&self, name: &str) {
        *self.counts.lock().entry(name.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, name: &str) -> usize {
        self.counts.lock().get(name).copied().unwrap_or(0)
    }
}

pub fn run_graph(
    graph: &Graph,
    func_lib: &FuncLib,
    output_sockets: Vec<InputRef>,
) -> EvalResult<Vec<Value>> {
    let mut params = EvaluationParams::new(graph, func_lib);
    params.output_sockets = output_sockets;
    evaluate(params)
}

fn counted_callback(
    counter: &RunCounter,
    name: &str,
    body: impl Fn(&mut crate::params::ExecParams) + Send + Sync + 'static,
) -> Execution {
    let counter = counter.clone();
    let name = name.to_string();
    Execution::Callback(Arc::new(move |params| {
        counter.record(&name);
        body(params);
    }))
}

pub fn float_source_func(counter: &RunCounter, name: &str, value: f64) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Float))],
        execution: counted_callback(counter, name, move |params| {
            params.set_output("value", Value::Float(value));
        }),
        ..Default::default()
    }
}

pub fn int_source_func(counter: &RunCounter, name: &str, value: i64) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Int))],
        execution: counted_callback(counter, name, move |params| {
            params.set_output("value", Value::Int(value));
        }),
        ..Default::default()
    }
}

pub fn two_output_int_func(counter: &RunCounter, name: &str, first: i64, second: i64) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        outputs: vec![
            FuncOutput::new("first", SocketType::value(DataType::Int)),
            FuncOutput::new("second", SocketType::value(DataType::Int)),
        ],
        execution: counted_callback(counter, name, move |params| {
            params.set_output("first", Value::Int(first));
            params.set_output("second", Value::Int(second));
        }),
        ..Default::default()
    }
}

pub fn add_delta_func(counter: &RunCounter, name: &str, delta: f64) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        inputs: vec![FuncInput::new("a", SocketType::value(DataType::Float)).with_default(0.0)],
        outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Float))],
        execution: counted_callback(counter, name, move |params| {
            let a = params.extract_input("a").as_f64();
            params.set_output("value", Value::Float(a + delta));
        }),
        ..Default::default()
    }
}

pub fn identity_int_func(counter: &RunCounter, name: &str) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        inputs: vec![FuncInput::new("value", SocketType::value(DataType::Int)).with_default(0i64)],
        outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Int))],
        execution: counted_callback(counter, name, |params| {
            let value = params.extract_input("value");
            params.set_output("value", value);
        }),
        ..Default::default()
    }
}

/// Joins the values of an ordered multi-input into a comma-separated string,
/// making slot order observable.
pub fn join_ints_func(counter: &RunCounter, name: &str) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        inputs: vec![FuncInput::multi("values", SocketType::value(DataType::Int))],
        outputs: vec![FuncOutput::new("joined", SocketType::value(DataType::String))],
        execution: counted_callback(counter, name, |params| {
            let values = params.extract_multi_input("values");
            let joined = values
                .iter()
                .map(|value| value.as_i64().to_string())
                .collect::<Vec<_>>()
                .join(",");
            params.set_output("joined", Value::String(joined));
        }),
        ..Default::default()
    }
}

pub fn bool_source_func(counter: &RunCounter, name: &str, value: bool) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Bool))],
        execution: counted_callback(counter, name, move |params| {
            params.set_output("value", Value::Bool(value));
        }),
        ..Default::default()
    }
}

pub fn sum2_func(counter: &RunCounter, name: &str) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        inputs: vec![
            FuncInput::new("a", SocketType::value(DataType::Float)).with_default(0.0),
            FuncInput::new("b", SocketType::value(DataType::Float)).with_default(0.0),
        ],
        outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Float))],
        execution: counted_callback(counter, name, |params| {
            let a = params.extract_input("a").as_f64();
            let b = params.extract_input("b").as_f64();
            params.set_output("value", Value::Float(a + b));
        }),
        ..Default::default()
    }
}

/// Produces a deferred int field so conversions can be observed at the
/// field level.
pub fn int_field_source_func(counter: &RunCounter, name: &str, value: i64) -> Func {
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        outputs: vec![FuncOutput::new("value", SocketType::field(DataType::Int))],
        execution: counted_callback(counter, name, move |params| {
            let field = crate::field::Field::constant(Value::Int(value));
            params.set_output("value", Value::Field(field));
        }),
        ..Default::default()
    }
}

pub const PAYLOAD_TYPE_ID: TypeId = TypeId::from_u128(0x0189beef_0000_4000_8000_000000000001);

pub fn payload_type_def() -> Arc<TypeDef> {
    Arc::new(TypeDef {
        type_id: PAYLOAD_TYPE_ID,
        display_name: "payload".to_string(),
        default_fn: None,
    })
}

/// Opaque payload that tracks how many instances are alive.
#[derive(Debug)]
pub struct LivePayload {
    live: Arc<AtomicUsize>,
    pub tag: i64,
}

impl LivePayload {
    pub fn new(live: &Arc<AtomicUsize>, tag: i64) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        LivePayload {
            live: live.clone(),
            tag,
        }
    }
}

impl Drop for LivePayload {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn payload_source_func(
    counter: &RunCounter,
    name: &str,
    live: Arc<AtomicUsize>,
    tag: i64,
) -> Func {
    let type_def = payload_type_def();
    let socket_type = SocketType::value(DataType::Custom(type_def.clone()));
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        outputs: vec![FuncOutput::new("value", socket_type)],
        execution: counted_callback(counter, name, move |params| {
            let payload = LivePayload::new(&live, tag);
            params.set_output("value", Value::custom(type_def.clone(), payload));
        }),
        ..Default::default()
    }
}

pub fn payload_passthrough_func(counter: &RunCounter, name: &str) -> Func {
    let socket_type = SocketType::value(DataType::Custom(payload_type_def()));
    Func {
        id: FuncId::unique(),
        name: name.to_string(),
        category: "test".to_string(),
        inputs: vec![FuncInput::new("value", socket_type.clone())],
        outputs: vec![FuncOutput::new("value", socket_type)],
        execution: counted_callback(counter, name, |params| {
            let value = params.extract_input("value");
            params.set_output("value", value);
        }),
        ..Default::default()
    }
}

/// Logger that records everything it observes.
#[derive(Default)]
pub struct CollectingLogger {
    pub socket_values: Mutex<Vec<(Vec<SocketRef>, Value)>>,
    pub multi_sockets: Mutex<Vec<(InputRef, usize)>>,
    pub timings: Mutex<Vec<(NodeId, Duration)>>,
    pub messages: Mutex<Vec<(NodeId, String)>>,
}

impl CollectingLogger {
    pub fn saw_value_at(&self, socket: SocketRef) -> bool {
        self.socket_values
            .lock()
            .iter()
            .any(|(sockets, _)| sockets.contains(&socket))
    }

    pub fn execution_count(&self, node_id: NodeId) -> usize {
        self.timings
            .lock()
            .iter()
            .filter(|(id, _)| *id == node_id)
            .count()
    }
}

impl EvalLogger for CollectingLogger {
    fn log_value_for_sockets(&self, sockets: &[SocketRef], value: &Value) {
        self.socket_values
            .lock()
            .push((sockets.to_vec(), value.clone()));
    }

    fn log_multi_value_socket(&self, socket: InputRef, values: &[&Value]) {
        self.multi_sockets.lock().push((socket, values.len()));
    }

    fn log_execution_time(&self, node_id: NodeId, duration: Duration) {
        self.timings.lock().push((node_id, duration));
    }

    fn log_debug_message(&self, node_id: NodeId, message: &str) {
        self.messages.lock().push((node_id, message.to_string()));
    }
}

