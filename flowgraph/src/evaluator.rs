use std::any::Any;
use std::mem::take;
use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use rayon::Scope;
use thiserror::Error;
use tracing::debug;

use common::is_debug;
use common::parallel::par_for_each_limited;

use crate::conversion::ConversionRegistry;
use crate::data::{SocketType, Value};
use crate::field::{Field, FieldOperation};
use crate::function::{ExecuteFn, Execution, FuncLib, MultiFunc};
use crate::graph::{Graph, InputRef, Node, NodeId, NodeKind, OutputRef, SocketRef};
use crate::logger::EvalLogger;
use crate::node_state::{
    InputState, InputValue, MultiInputValue, NodeScheduleState, NodeState, NodeStateInner,
    OutputState, ValueUsage,
};
use crate::params::ExecParams;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("Requested output socket {socket:?} was never computed")]
    OutputNotComputed { socket: InputRef },
}

pub type EvalResult<T> = std::result::Result<T, EvalError>;

/// Inputs of one evaluation run. The graph and function library are borrowed;
/// the provided input values are consumed.
pub struct EvaluationParams<'a> {
    pub graph: &'a Graph,
    pub func_lib: &'a FuncLib,
    /// Input sockets whose final values are returned, in order.
    pub output_sockets: Vec<InputRef>,
    /// Values treated as if they had been produced at their output sockets.
    pub input_values: Vec<(OutputRef, Value)>,
    /// Sockets that must be computed regardless of downstream demand.
    pub force_compute_sockets: Vec<SocketRef>,
    pub logger: Option<&'a dyn EvalLogger>,
    /// Caller-defined context exposed to node callbacks.
    pub self_context: Option<Arc<dyn Any + Send + Sync>>,
}

impl<'a> EvaluationParams<'a> {
    pub fn new(graph: &'a Graph, func_lib: &'a FuncLib) -> Self {
        EvaluationParams {
            graph,
            func_lib,
            output_sockets: vec![],
            input_values: vec![],
            force_compute_sockets: vec![],
            logger: None,
            self_context: None,
        }
    }
}

/// Evaluates the graph and returns one value per requested output socket.
/// The returned values outlive the evaluator; the caller owns them.
pub fn evaluate(params: EvaluationParams) -> EvalResult<Vec<Value>> {
    Evaluator::new(params).execute()
}

/// Carries the node that should run on the same worker task after the
/// current node finishes.
#[derive(Debug, Default)]
pub struct NodeTaskRunState {
    pub next_node_to_run: Option<NodeId>,
}

/// A node whose state is currently locked. Cross-node effects are collected
/// here and dispatched only after the lock is released, so no thread ever
/// holds more than one node lock.
pub(crate) struct LockedNode<'a> {
    pub node: &'a Node,
    pub state: &'a mut NodeStateInner,
    delayed_required_outputs: Vec<OutputRef>,
    delayed_unused_outputs: Vec<OutputRef>,
    delayed_scheduled_nodes: Vec<NodeId>,
}

impl<'a> LockedNode<'a> {
    fn new(node: &'a Node, state: &'a mut NodeStateInner) -> Self {
        LockedNode {
            node,
            state,
            delayed_required_outputs: vec![],
            delayed_unused_outputs: vec![],
            delayed_scheduled_nodes: vec![],
        }
    }
}

pub(crate) struct Evaluator<'g> {
    graph: &'g Graph,
    func_lib: &'g FuncLib,
    conversions: ConversionRegistry,
    /// One state per node reachable from the requested outputs. Written only
    /// during the single-threaded exploration phase; lookups afterwards are
    /// read-only and safe from any thread.
    node_states: HashMap<NodeId, NodeState>,
    output_sockets: Vec<InputRef>,
    input_values: Vec<(OutputRef, Value)>,
    force_compute_sockets: Vec<SocketRef>,
    logger: Option<&'g dyn EvalLogger>,
    self_context: Option<Arc<dyn Any + Send + Sync>>,
}

const STATE_INIT_CHUNK: usize = 50;

impl<'g> Evaluator<'g> {
    pub(crate) fn new(params: EvaluationParams<'g>) -> Self {
        Evaluator {
            graph: params.graph,
            func_lib: params.func_lib,
            conversions: ConversionRegistry::implicit(),
            node_states: HashMap::new(),
            output_sockets: params.output_sockets,
            input_values: params.input_values,
            force_compute_sockets: params.force_compute_sockets,
            logger: params.logger,
            self_context: params.self_context,
        }
    }

    pub(crate) fn execute(mut self) -> EvalResult<Vec<Value>> {
        if is_debug() {
            self.graph.validate().expect("Graph validation failed");
        }

        self.create_states_for_reachable_nodes();

        let input_values = take(&mut self.input_values);
        {
            let evaluator = &self;
            rayon::scope(|scope| {
                evaluator.forward_group_inputs(input_values, scope);
                evaluator.schedule_initial_nodes(scope);
                // The scope drains once all initially requested inputs have
                // been computed.
            });
        }

        let outputs = self.extract_group_outputs()?;
        self.destruct_node_states();
        Ok(outputs)
    }

    // Reverse depth-first search from the requested outputs; every visited
    // node gets a state.
    fn create_states_for_reachable_nodes(&mut self) {
        let mut nodes_to_check: Vec<NodeId> = vec![];
        for socket in &self.output_sockets {
            nodes_to_check.push(socket.node_id);
        }
        for socket in &self.force_compute_sockets {
            nodes_to_check.push(socket.node_id());
        }

        while let Some(node_id) = nodes_to_check.pop() {
            if self.node_states.contains_key(&node_id) {
                continue;
            }
            self.node_states.insert(node_id, NodeState::default());

            let node = self
                .graph
                .node_by_id(node_id)
                .expect("Requested node is missing from the graph");
            for input_index in 0..node.inputs.len() {
                self.graph
                    .foreach_origin_socket(InputRef::new(node_id, input_index), |origin| {
                        nodes_to_check.push(origin.node_id());
                    });
            }
        }

        // From here on no new states are added; the map can be read from
        // multiple threads while each state is initialized under its own lock.
        let node_ids: Vec<NodeId> = self.node_states.keys().copied().collect();
        let this = &*self;
        par_for_each_limited(&node_ids, STATE_INIT_CHUNK, |node_id| {
            this.initialize_node_state(*node_id);
        });

        for socket in &self.force_compute_sockets {
            if let SocketRef::Input(input) = socket {
                let mut state = self.node_state(input.node_id).lock();
                state.inputs[input.index].force_compute = true;
            }
        }
    }

    fn initialize_node_state(&self, node_id: NodeId) {
        let node = self.node(node_id);
        let mut state = self.node_state(node_id).lock();

        state.inputs.reserve(node.inputs.len());
        for (index, input) in node.inputs.iter().enumerate() {
            let mut input_state = InputState::default();
            match &input.socket_type {
                Some(socket_type) if input.available => {
                    input_state.socket_type = Some(socket_type.clone());
                    if input.is_multi {
                        let mut multi = MultiInputValue::default();
                        self.graph
                            .foreach_origin_socket(InputRef::new(node_id, index), |origin| {
                                multi.origins.push(origin);
                            });
                        // Unlinked multi-inputs read from the socket itself so
                        // defaults load the same way as linked values.
                        if multi.origins.is_empty() {
                            multi
                                .origins
                                .push(SocketRef::Input(InputRef::new(node_id, index)));
                        }
                        multi.values.resize_with(multi.origins.len(), || None);
                        input_state.value = InputValue::Multi(multi);
                    }
                }
                _ => {
                    // Unavailable and non-data sockets are never used.
                    input_state.usage = ValueUsage::Unused;
                }
            }
            state.inputs.push(input_state);
        }

        state.outputs.reserve(node.outputs.len());
        for (index, output) in node.outputs.iter().enumerate() {
            let mut output_state = OutputState::default();
            if !output.available || output.socket_type.is_none() {
                output_state.output_usage = ValueUsage::Unused;
                state.outputs.push(output_state);
                continue;
            }
            let mut potential_users = 0;
            self.graph
                .foreach_target_socket(OutputRef::new(node_id, index), |target, _path| {
                    // Targets outside the reachable set are never computed.
                    if self.node_states.contains_key(&target.node_id) {
                        potential_users += 1;
                    }
                });
            output_state.potential_users = potential_users;
            if potential_users == 0 {
                // May still be promoted by the force-compute pass later.
                output_state.output_usage = ValueUsage::Unused;
            }
            state.outputs.push(output_state);
        }
    }

    fn destruct_node_states(&mut self) {
        let node_ids: Vec<NodeId> = self.node_states.keys().copied().collect();
        let this = &*self;
        par_for_each_limited(&node_ids, STATE_INIT_CHUNK, |node_id| {
            let mut state = this.node_state(*node_id).lock();
            for input_state in state.inputs.iter_mut() {
                input_state.destruct_value();
            }
        });
    }

    fn forward_group_inputs<'s>(&'s self, input_values: Vec<(OutputRef, Value)>, scope: &Scope<'s>) {
        for (socket, value) in input_values {
            if !self.node_states.contains_key(&socket.node_id) {
                // The socket does not feed any requested output.
                self.log_socket_value(&[socket.into()], &value);
                drop(value);
                continue;
            }
            self.forward_output(socket, value, None, scope);
        }
    }

    fn schedule_initial_nodes<'s>(&'s self, scope: &Scope<'s>) {
        for socket in self.output_sockets.clone() {
            self.with_locked_node(socket.node_id, None, scope, |locked| {
                // Requiring the input schedules any linked producer.
                self.set_input_required(locked, socket);
            });
        }
        for socket in self.force_compute_sockets.clone() {
            self.with_locked_node(socket.node_id(), None, scope, |locked| match socket {
                SocketRef::Input(input) => {
                    self.set_input_required(locked, input);
                }
                SocketRef::Output(output) => {
                    let output_state = &mut locked.state.outputs[output.index];
                    output_state.output_usage = ValueUsage::Required;
                    self.schedule_node(locked);
                }
            });
        }
    }

    pub(crate) fn schedule_node(&self, locked_node: &mut LockedNode) {
        match locked_node.state.schedule_state {
            NodeScheduleState::NotScheduled => {
                // The actual enqueue happens once the node is unlocked;
                // enqueuing here could run the task immediately and relock.
                locked_node.state.schedule_state = NodeScheduleState::Scheduled;
                locked_node.delayed_scheduled_nodes.push(locked_node.node.id);
            }
            NodeScheduleState::Scheduled => {}
            NodeScheduleState::Running => {
                locked_node.state.schedule_state = NodeScheduleState::RunningAndRescheduled;
            }
            NodeScheduleState::RunningAndRescheduled => {}
        }
    }

    fn add_node_to_task_pool<'s>(&'s self, node_id: NodeId, scope: &Scope<'s>) {
        scope.spawn(move |scope| self.run_node_from_task_pool(node_id, scope));
    }

    fn run_node_from_task_pool<'s>(&'s self, node_id: NodeId, scope: &Scope<'s>) {
        // The first node scheduled by a finishing node is chained onto the
        // same task; later ones go back to the pool. This keeps the dominant
        // data path on one thread.
        let mut next_node_to_run = Some(node_id);
        while let Some(node_id) = next_node_to_run.take() {
            let mut run_state = NodeTaskRunState::default();
            self.node_task_run(node_id, &mut run_state, scope);
            next_node_to_run = run_state.next_node_to_run;
        }
    }

    fn node_task_run<'s>(
        &'s self,
        node_id: NodeId,
        run_state: &mut NodeTaskRunState,
        scope: &Scope<'s>,
    ) {
        let node = self.node(node_id);
        // These are sometimes scheduled by demand propagation but have
        // nothing to execute.
        if matches!(node.kind, NodeKind::GroupInput | NodeKind::GroupOutput) {
            return;
        }

        let do_execute_node = self.node_task_preprocessing(node_id, run_state, scope);
        if do_execute_node {
            self.execute_node(node_id, run_state, scope);
        }
        self.node_task_postprocessing(node_id, do_execute_node, run_state, scope);
    }

    fn node_task_preprocessing<'s>(
        &'s self,
        node_id: NodeId,
        run_state: &mut NodeTaskRunState,
        scope: &Scope<'s>,
    ) -> bool {
        let mut do_execute_node = false;
        self.with_locked_node(node_id, Some(run_state), scope, |locked| {
            assert_eq!(locked.state.schedule_state, NodeScheduleState::Scheduled);
            locked.state.schedule_state = NodeScheduleState::Running;

            if locked.state.node_has_finished {
                return;
            }
            if !Self::prepare_node_outputs_for_execution(locked) {
                return;
            }
            // Required after at least one output is known to be needed, and
            // before the readiness check below; this saves one round trip
            // through the task pool for most nodes.
            if !locked.state.non_lazy_inputs_handled {
                self.require_non_lazy_inputs(locked);
                locked.state.non_lazy_inputs_handled = true;
            }
            if !Self::prepare_node_inputs_for_execution(locked) {
                return;
            }
            do_execute_node = true;
        });
        do_execute_node
    }

    /// Snapshots output usage and reports whether any output is required but
    /// not computed yet.
    fn prepare_node_outputs_for_execution(locked_node: &mut LockedNode) -> bool {
        let mut execution_is_necessary = false;
        for output_state in locked_node.state.outputs.iter_mut() {
            output_state.output_usage_for_execution = output_state.output_usage;
            if !output_state.has_been_computed
                && output_state.output_usage == ValueUsage::Required
            {
                execution_is_necessary = true;
            }
        }
        execution_is_necessary
    }

    fn require_non_lazy_inputs(&self, locked_node: &mut LockedNode) {
        if self.node_supports_laziness(locked_node.node) {
            return;
        }
        // Nodes that don't support laziness block until every input arrives.
        for index in 0..locked_node.state.inputs.len() {
            if locked_node.state.inputs[index].socket_type.is_none() {
                continue;
            }
            self.set_input_required(locked_node, InputRef::new(locked_node.node.id, index));
        }
    }

    /// Freezes the set of inputs visible to this execution. Values provided
    /// after this point trigger another run instead of changing this one.
    fn prepare_node_inputs_for_execution(locked_node: &mut LockedNode) -> bool {
        for input_state in locked_node.state.inputs.iter_mut() {
            if input_state.socket_type.is_none() {
                continue;
            }
            if input_state.was_ready_for_execution {
                continue;
            }
            if input_state.all_values_available() {
                input_state.was_ready_for_execution = true;
            } else if input_state.usage == ValueUsage::Required {
                return false;
            }
        }
        true
    }

    fn execute_node<'s>(
        &'s self,
        node_id: NodeId,
        run_state: &mut NodeTaskRunState,
        scope: &Scope<'s>,
    ) {
        let node = self.node(node_id);
        {
            let mut state = self.node_state(node_id).lock();
            if state.has_been_executed {
                debug_assert!(
                    self.node_supports_laziness(node),
                    "Node {:?} does not support laziness and must not run twice",
                    node.name
                );
            }
            state.has_been_executed = true;
        }

        let execution = self
            .func_lib
            .by_id(node.func_id)
            .map(|func| func.execution.clone());
        match execution {
            Some(Execution::Callback(callback)) => {
                self.execute_callback_node(node, &callback, run_state, scope)
            }
            Some(Execution::MultiFunc(func)) => {
                self.execute_multi_function_node(node, func, run_state, scope)
            }
            _ => self.execute_unknown_node(node, run_state, scope),
        }
    }

    fn execute_callback_node<'s>(
        &'s self,
        node: &'g Node,
        callback: &ExecuteFn,
        run_state: &mut NodeTaskRunState,
        scope: &Scope<'s>,
    ) {
        let mut params = ExecParams::new(self, node, run_state, scope);
        let start = Instant::now();
        callback.as_ref()(&mut params);
        let duration = start.elapsed();
        if let Some(logger) = self.logger {
            logger.log_execution_time(node.id, duration);
        }
    }

    fn execute_multi_function_node<'s>(
        &'s self,
        node: &'g Node,
        func: Arc<MultiFunc>,
        run_state: &mut NodeTaskRunState,
        scope: &Scope<'s>,
    ) {
        // Multi-function nodes are non-lazy, so every data input has been
        // required and is ready by the time execution starts.
        let mut input_values: Vec<Value> = vec![];
        let mut any_input_is_field = false;
        {
            let state = self.node_state(node.id).lock();
            for (index, input) in node.inputs.iter().enumerate() {
                let input_state = &state.inputs[index];
                if input_state.socket_type.is_none() {
                    continue;
                }
                debug_assert!(!input.is_multi);
                debug_assert!(input_state.was_ready_for_execution);
                let value = input_state
                    .value
                    .as_single()
                    .value
                    .as_ref()
                    .expect("Multi-function input value missing")
                    .clone();
                any_input_is_field |= value.is_field();
                input_values.push(value);
            }
        }
        debug_assert_eq!(input_values.len(), func.input_types.len());

        let data_outputs: Vec<usize> = node
            .outputs
            .iter()
            .enumerate()
            .filter(|(_, output)| output.available && output.socket_type.is_some())
            .map(|(index, _)| index)
            .collect();
        debug_assert_eq!(data_outputs.len(), func.output_types.len());

        if any_input_is_field {
            // Wrap the function into a field operation so the computation
            // stays deferred.
            let input_fields: Vec<Field> =
                input_values.iter().map(Field::from_value_or_field).collect();
            let operation = FieldOperation::new(func, input_fields);
            for (operation_index, output_index) in data_outputs.into_iter().enumerate() {
                debug_assert!(
                    node.outputs[output_index]
                        .socket_type
                        .as_ref()
                        .is_some_and(|ty| ty.field_capable),
                    "Field output requires a field-capable socket"
                );
                let field = Field::new(operation.clone(), operation_index);
                self.forward_output(
                    OutputRef::new(node.id, output_index),
                    Value::Field(field),
                    Some(run_state),
                    scope,
                );
                self.set_output_computed(node.id, output_index);
            }
        } else {
            let mut output_values: Vec<Value> =
                func.output_types.iter().map(Value::from).collect();
            func.call(&input_values, &mut output_values);
            for (value, output_index) in output_values.into_iter().zip(data_outputs) {
                self.forward_output(
                    OutputRef::new(node.id, output_index),
                    value,
                    Some(run_state),
                    scope,
                );
                self.set_output_computed(node.id, output_index);
            }
        }
    }

    /// Fallback for nodes with no execution: every available data output gets
    /// its type's default value. Typically better than producing nothing.
    fn execute_unknown_node<'s>(
        &'s self,
        node: &'g Node,
        run_state: &mut NodeTaskRunState,
        scope: &Scope<'s>,
    ) {
        for (index, output) in node.outputs.iter().enumerate() {
            if !output.available {
                continue;
            }
            let Some(socket_type) = &output.socket_type else {
                continue;
            };
            self.set_output_computed(node.id, index);
            self.forward_output(
                OutputRef::new(node.id, index),
                socket_type.default_value(),
                Some(run_state),
                scope,
            );
        }
    }

    fn node_task_postprocessing<'s>(
        &'s self,
        node_id: NodeId,
        was_executed: bool,
        run_state: &mut NodeTaskRunState,
        scope: &Scope<'s>,
    ) {
        self.with_locked_node(node_id, Some(run_state), scope, |locked| {
            let node_has_finished = self.finish_node_if_possible(locked);

            let reschedule_requested =
                locked.state.schedule_state == NodeScheduleState::RunningAndRescheduled;
            locked.state.schedule_state = NodeScheduleState::NotScheduled;
            if reschedule_requested && !node_has_finished {
                // Either the node rescheduled itself or another node tried to
                // schedule it while it ran.
                self.schedule_node(locked);
            }

            if was_executed {
                self.assert_expected_outputs_have_been_computed(locked);
            }
        });
    }

    /// A node is finished when every output that may be used has been
    /// computed and no input is still forced to be computed. Finishing marks
    /// remaining maybe-inputs unused, which can cascade upstream.
    fn finish_node_if_possible(&self, locked_node: &mut LockedNode) -> bool {
        if locked_node.state.node_has_finished {
            return true;
        }

        for output_state in locked_node.state.outputs.iter() {
            if output_state.has_been_computed {
                continue;
            }
            if output_state.output_usage != ValueUsage::Unused {
                return false;
            }
        }

        for input_state in locked_node.state.inputs.iter() {
            if input_state.force_compute && !input_state.was_ready_for_execution {
                return false;
            }
        }

        for index in 0..locked_node.state.inputs.len() {
            let socket = InputRef::new(locked_node.node.id, index);
            let usage = locked_node.state.inputs[index].usage;
            match usage {
                ValueUsage::Maybe => self.set_input_unused(locked_node, socket),
                ValueUsage::Required => {
                    // Required values cannot become unused, but their
                    // lifetime is over now.
                    locked_node.state.inputs[index].destruct_value();
                }
                ValueUsage::Unused => {}
            }
        }

        locked_node.state.node_has_finished = true;
        true
    }

    fn assert_expected_outputs_have_been_computed(&self, locked_node: &mut LockedNode) {
        if !is_debug() {
            return;
        }
        // Outputs can only be computed once all required inputs arrived.
        if locked_node.state.missing_required_inputs > 0 {
            return;
        }
        if locked_node.state.schedule_state == NodeScheduleState::Scheduled {
            return;
        }

        let supports_laziness = self.node_supports_laziness(locked_node.node);
        for (index, output_state) in locked_node.state.outputs.iter().enumerate() {
            let computed_as_expected = if supports_laziness {
                // More outputs may become required later; the node runs again.
                output_state.output_usage_for_execution != ValueUsage::Required
                    || output_state.has_been_computed
            } else {
                output_state.output_usage_for_execution == ValueUsage::Unused
                    || output_state.has_been_computed
            };
            assert!(
                computed_as_expected,
                "Output {} of node {:?} was expected to be computed",
                index, locked_node.node.name
            );
        }
    }

    fn extract_group_outputs(&mut self) -> EvalResult<Vec<Value>> {
        let mut output_values = Vec::with_capacity(self.output_sockets.len());
        for socket in &self.output_sockets {
            let mut state = self.node_state(socket.node_id).lock();
            let input_state = &mut state.inputs[socket.index];
            let value = input_state
                .value
                .as_single_mut()
                .value
                .take()
                .ok_or(EvalError::OutputNotComputed { socket: *socket })?;
            // Moved out into the caller-owned result; the value outlives the
            // evaluator and all of its states.
            output_values.push(value);
        }
        Ok(output_values)
    }

    /// Loads the required input from the socket or triggers nodes to the left
    /// to compute it. Returns true when another node will trigger this node
    /// again once the value has been computed.
    pub(crate) fn set_input_required(
        &self,
        locked_node: &mut LockedNode,
        input_socket: InputRef,
    ) -> bool {
        debug_assert_eq!(locked_node.node.id, input_socket.node_id);
        let input_state = &mut locked_node.state.inputs[input_socket.index];

        // A value that was set to unused cannot become used again.
        debug_assert!(input_state.usage != ValueUsage::Unused);

        if input_state.was_ready_for_execution {
            return false;
        }
        if input_state.usage == ValueUsage::Required {
            // Not ready yet but required already: the node will be triggered
            // once the value arrives.
            return true;
        }
        input_state.usage = ValueUsage::Required;

        let missing_values = input_state.missing_values();
        if missing_values == 0 {
            return false;
        }
        locked_node.state.missing_required_inputs += missing_values;

        let mut origin_sockets: Vec<SocketRef> = vec![];
        self.graph
            .foreach_origin_socket(input_socket, |origin| origin_sockets.push(origin));

        if origin_sockets.is_empty() {
            // Unlinked: load the declared value from the socket directly.
            self.load_unlinked_input_value(locked_node, input_socket, input_socket.into());
            locked_node.state.missing_required_inputs -= 1;
            return false;
        }

        let mut requested_from_other_node = false;
        for origin_socket in origin_sockets {
            match origin_socket {
                SocketRef::Input(_) => {
                    // The origin is an input socket itself (e.g. an unlinked
                    // reroute); its value can be loaded immediately.
                    self.load_unlinked_input_value(locked_node, input_socket, origin_socket);
                    locked_node.state.missing_required_inputs -= 1;
                }
                SocketRef::Output(output) => {
                    requested_from_other_node = true;
                    locked_node.delayed_required_outputs.push(output);
                }
            }
        }
        requested_from_other_node
    }

    pub(crate) fn set_input_unused(&self, locked_node: &mut LockedNode, socket: InputRef) {
        let input_state = &mut locked_node.state.inputs[socket.index];

        // A required socket cannot become unused.
        debug_assert!(input_state.usage != ValueUsage::Required);

        if input_state.usage == ValueUsage::Unused {
            return;
        }
        input_state.usage = ValueUsage::Unused;
        input_state.destruct_value();

        if input_state.was_ready_for_execution {
            // The value arrived already; no producer left to notify.
            return;
        }

        let delayed_unused_outputs = &mut locked_node.delayed_unused_outputs;
        self.graph.foreach_origin_socket(socket, |origin| {
            if let SocketRef::Output(output) = origin {
                delayed_unused_outputs.push(output);
            }
        });
    }

    fn send_output_required_notification<'s>(
        &'s self,
        socket: OutputRef,
        run_state: Option<&mut NodeTaskRunState>,
        scope: &Scope<'s>,
    ) {
        self.with_locked_node(socket.node_id, run_state, scope, |locked| {
            let output_state = &mut locked.state.outputs[socket.index];
            if output_state.output_usage == ValueUsage::Required {
                // The producer is scheduled already.
                return;
            }
            output_state.output_usage = ValueUsage::Required;
            self.schedule_node(locked);
        });
    }

    fn send_output_unused_notification<'s>(
        &'s self,
        socket: OutputRef,
        run_state: Option<&mut NodeTaskRunState>,
        scope: &Scope<'s>,
    ) {
        self.with_locked_node(socket.node_id, run_state, scope, |locked| {
            let output_state = &mut locked.state.outputs[socket.index];
            // Each consumer reports unused at most once (usage transitions
            // are monotone), which bounds the number of these notifications
            // and guarantees the unused cascade converges.
            debug_assert!(output_state.potential_users > 0);
            output_state.potential_users -= 1;
            if output_state.potential_users == 0
                && output_state.output_usage != ValueUsage::Required
            {
                output_state.output_usage = ValueUsage::Unused;
                // The producer may want to set its own inputs unused.
                self.schedule_node(locked);
            }
        });
    }

    /// Moves a newly computed value to every input that might need it. Takes
    /// ownership; the value is dropped if nothing consumes it.
    pub(crate) fn forward_output<'s>(
        &'s self,
        from_socket: OutputRef,
        value_to_forward: Value,
        mut run_state: Option<&mut NodeTaskRunState>,
        scope: &Scope<'s>,
    ) {
        let from_type = self
            .graph
            .output(from_socket)
            .socket_type
            .clone()
            .expect("Forwarded output must be a data socket");

        let mut log_original_sockets: Vec<SocketRef> = vec![from_socket.into()];
        let mut unconverted_targets: Vec<InputRef> = vec![];
        let mut converted_targets: Vec<(InputRef, Value)> = vec![];

        self.graph.foreach_target_socket(from_socket, |to_socket, path| {
            if !self.should_forward_to_socket(to_socket) {
                return;
            }
            debug_assert_eq!(SocketRef::Input(to_socket), *path.sockets.last().unwrap());

            // None means the value is still the original, unconverted one.
            let mut current: Option<(SocketType, Value)> = None;
            for (hop_index, hop) in path.sockets.iter().enumerate() {
                let is_last_socket = hop_index + 1 == path.sockets.len();
                // Intermediate hops are reroute sockets and pass the value
                // through untouched; only the final destination converts.
                if is_last_socket {
                    let next_type = self
                        .graph
                        .socket_type(*hop)
                        .expect("Forward target must be a data socket")
                        .clone();
                    let (current_type, current_value) = match &current {
                        Some((ty, value)) => (ty, value),
                        None => (&from_type, &value_to_forward),
                    };
                    if *current_type != next_type {
                        let converted = self.convert_or_default(
                            current_value,
                            current_type,
                            &next_type,
                            hop.node_id(),
                        );
                        current = Some((next_type, converted));
                    }
                }
                match &current {
                    None => log_original_sockets.push(*hop),
                    Some((_, converted)) => {
                        // Multi-inputs are logged once all values arrived.
                        let is_multi_input = hop
                            .as_input()
                            .is_some_and(|input| self.graph.input(input).is_multi);
                        if !is_multi_input {
                            self.log_socket_value(&[*hop], converted);
                        }
                    }
                }
            }

            match current {
                None => unconverted_targets.push(to_socket),
                Some((_, converted)) => converted_targets.push((to_socket, converted)),
            }
        });

        self.log_socket_value(&log_original_sockets, &value_to_forward);
        for (to_socket, converted) in converted_targets {
            self.add_value_to_input_socket(
                to_socket,
                from_socket,
                converted,
                run_state.as_deref_mut(),
                scope,
            );
        }
        self.forward_to_sockets_with_same_type(
            unconverted_targets,
            value_to_forward,
            from_socket,
            run_state,
            scope,
        );
    }

    fn should_forward_to_socket(&self, socket: InputRef) -> bool {
        let Some(state) = self.node_states.get(&socket.node_id) else {
            // The whole target node is outside the reachable set.
            return false;
        };
        let guard = state.lock();
        guard.inputs[socket.index].usage != ValueUsage::Unused
    }

    /// Hands the original value to the targets that take it unconverted: none
    /// drops it, one takes it as is, many get one clone each except the first.
    fn forward_to_sockets_with_same_type<'s>(
        &'s self,
        to_sockets: Vec<InputRef>,
        value_to_forward: Value,
        from_socket: OutputRef,
        mut run_state: Option<&mut NodeTaskRunState>,
        scope: &Scope<'s>,
    ) {
        match to_sockets.len() {
            0 => drop(value_to_forward),
            1 => self.add_value_to_input_socket(
                to_sockets[0],
                from_socket,
                value_to_forward,
                run_state,
                scope,
            ),
            _ => {
                // Copies go out first so the receiving nodes cannot start
                // mutating the original while it is still being cloned.
                for to_socket in &to_sockets[1..] {
                    self.add_value_to_input_socket(
                        *to_socket,
                        from_socket,
                        value_to_forward.clone(),
                        run_state.as_deref_mut(),
                        scope,
                    );
                }
                self.add_value_to_input_socket(
                    to_sockets[0],
                    from_socket,
                    value_to_forward,
                    run_state,
                    scope,
                );
            }
        }
    }

    fn add_value_to_input_socket<'s>(
        &'s self,
        socket: InputRef,
        origin: OutputRef,
        value: Value,
        run_state: Option<&mut NodeTaskRunState>,
        scope: &Scope<'s>,
    ) {
        self.with_locked_node(socket.node_id, run_state, scope, |locked| {
            let input_state = &mut locked.state.inputs[socket.index];
            match &mut input_state.value {
                InputValue::Multi(multi) => {
                    multi.add_value(SocketRef::Output(origin), value);
                    if multi.all_values_available() {
                        let values: Vec<&Value> = multi
                            .values
                            .iter()
                            .map(|value| value.as_ref().expect("Multi-input slot must be filled"))
                            .collect();
                        self.log_multi_socket_value(socket, &values);
                    }
                }
                InputValue::Single(single) => {
                    debug_assert!(single.value.is_none());
                    single.value = Some(value);
                }
            }

            if input_state.usage == ValueUsage::Required {
                locked.state.missing_required_inputs -= 1;
                if locked.state.missing_required_inputs == 0 {
                    // All required inputs arrived; run the node.
                    self.schedule_node(locked);
                }
            }
        });
    }

    /// Loads the declared value of a socket that is not computed by another
    /// node: the socket's own constant or its type default.
    fn load_unlinked_input_value(
        &self,
        locked_node: &mut LockedNode,
        input_socket: InputRef,
        origin_socket: SocketRef,
    ) {
        let required_type = locked_node.state.inputs[input_socket.index]
            .socket_type
            .clone()
            .expect("Required input must be a data socket");
        let value = self.get_value_from_socket(origin_socket, &required_type);

        let input_state = &mut locked_node.state.inputs[input_socket.index];
        match &mut input_state.value {
            InputValue::Multi(multi) => {
                multi.add_value(origin_socket, value);
                if multi.all_values_available() {
                    let values: Vec<&Value> = multi
                        .values
                        .iter()
                        .map(|value| value.as_ref().expect("Multi-input slot must be filled"))
                        .collect();
                    self.log_multi_socket_value(input_socket, &values);
                }
            }
            InputValue::Single(single) => {
                debug_assert!(single.value.is_none());
                let mut sockets_to_log: Vec<SocketRef> = vec![input_socket.into()];
                if origin_socket != SocketRef::Input(input_socket) {
                    sockets_to_log.push(origin_socket);
                }
                self.log_socket_value(&sockets_to_log, &value);
                single.value = Some(value);
            }
        }
    }

    fn get_value_from_socket(&self, socket: SocketRef, required_type: &SocketType) -> Value {
        let (declared_type, const_value) = match socket {
            SocketRef::Input(input) => {
                let decl = self.graph.input(input);
                (
                    decl.socket_type.clone().expect("Socket must carry data"),
                    decl.const_value.clone(),
                )
            }
            SocketRef::Output(output) => {
                let decl = self.graph.output(output);
                (decl.socket_type.clone().expect("Socket must carry data"), None)
            }
        };

        let value = const_value
            .map(Value::from)
            .unwrap_or_else(|| declared_type.default_value());
        if declared_type == *required_type {
            return value;
        }
        self.convert_or_default(&value, &declared_type, required_type, socket.node_id())
    }

    fn convert_or_default(
        &self,
        value: &Value,
        from: &SocketType,
        to: &SocketType,
        node_id: NodeId,
    ) -> Value {
        match self.conversions.convert_value(value, from, to) {
            Some(converted) => converted,
            None => {
                debug!(
                    "No conversion from {} to {}; using the default value",
                    from.base, to.base
                );
                if let Some(logger) = self.logger {
                    logger.log_debug_message(
                        node_id,
                        &format!("No conversion from {} to {}", from.base, to.base),
                    );
                }
                to.default_value()
            }
        }
    }

    pub(crate) fn node_supports_laziness(&self, node: &Node) -> bool {
        self.func_lib
            .by_id(node.func_id)
            .is_some_and(|func| func.supports_laziness)
    }

    pub(crate) fn node(&self, node_id: NodeId) -> &'g Node {
        self.graph
            .node_by_id(node_id)
            .expect("Node is missing from the graph")
    }

    pub(crate) fn node_state(&self, node_id: NodeId) -> &NodeState {
        self.node_states
            .get(&node_id)
            .expect("Node has no state; it is not reachable from the requested outputs")
    }

    pub(crate) fn set_output_computed(&self, node_id: NodeId, output_index: usize) {
        let mut state = self.node_state(node_id).lock();
        let output_state = &mut state.outputs[output_index];
        debug_assert!(!output_state.has_been_computed);
        output_state.has_been_computed = true;
    }

    pub(crate) fn log_socket_value(&self, sockets: &[SocketRef], value: &Value) {
        if let Some(logger) = self.logger {
            logger.log_value_for_sockets(sockets, value);
        }
    }

    fn log_multi_socket_value(&self, socket: InputRef, values: &[&Value]) {
        if let Some(logger) = self.logger {
            logger.log_multi_value_socket(socket, values);
        }
    }

    pub(crate) fn logger(&self) -> Option<&'g dyn EvalLogger> {
        self.logger
    }

    pub(crate) fn self_context(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.self_context.as_deref()
    }

    /// Locks the node, runs `f`, then dispatches the collected cross-node
    /// notifications outside the lock. The first node scheduled from a
    /// running task is chained onto that task instead of the pool.
    pub(crate) fn with_locked_node<'s>(
        &'s self,
        node_id: NodeId,
        mut run_state: Option<&mut NodeTaskRunState>,
        scope: &Scope<'s>,
        f: impl FnOnce(&mut LockedNode),
    ) {
        let node = self.node(node_id);
        let state = self.node_state(node_id);

        let (required_outputs, unused_outputs, scheduled_nodes) = {
            let mut guard = state.lock();
            let mut locked = LockedNode::new(node, &mut *guard);
            // No task-pool calls may happen in `f`: a work-stealing pool
            // could re-enter the evaluator on this thread and relock.
            f(&mut locked);
            (
                take(&mut locked.delayed_required_outputs),
                take(&mut locked.delayed_unused_outputs),
                take(&mut locked.delayed_scheduled_nodes),
            )
        };

        for socket in required_outputs {
            self.send_output_required_notification(socket, run_state.as_deref_mut(), scope);
        }
        for socket in unused_outputs {
            self.send_output_unused_notification(socket, run_state.as_deref_mut(), scope);
        }
        for node_to_schedule in scheduled_nodes {
            match run_state.as_deref_mut() {
                Some(run_state) if run_state.next_node_to_run.is_none() => {
                    // Run on the same thread after the current node finishes;
                    // the first scheduled node usually continues the main
                    // data path.
                    run_state.next_node_to_run = Some(node_to_schedule);
                }
                _ => self.add_node_to_task_pool(node_to_schedule, scope),
            }
        }
    }
}
