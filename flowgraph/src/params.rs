use std::any::Any;

use rayon::Scope;

use crate::data::{SocketType, Value};
use crate::evaluator::{Evaluator, NodeTaskRunState};
use crate::graph::{InputRef, Node, NodeId, OutputRef};
use crate::node_state::ValueUsage;

/// Mediates every interaction between a running node callback and the
/// evaluator. Socket identifiers are the declared socket names.
pub struct ExecParams<'a, 's, 'g> {
    evaluator: &'s Evaluator<'g>,
    node: &'g Node,
    run_state: &'a mut NodeTaskRunState,
    scope: &'a Scope<'s>,
}

impl<'a, 's, 'g> ExecParams<'a, 's, 'g> {
    pub(crate) fn new(
        evaluator: &'s Evaluator<'g>,
        node: &'g Node,
        run_state: &'a mut NodeTaskRunState,
        scope: &'a Scope<'s>,
    ) -> Self {
        ExecParams {
            evaluator,
            node,
            run_state,
            scope,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    pub fn node_name(&self) -> &str {
        &self.node.name
    }

    /// Caller-defined context object passed through the evaluation.
    pub fn self_context(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.evaluator.self_context()
    }

    /// True when the input was ready in this execution's snapshot and its
    /// value has not been extracted yet.
    pub fn can_get_input(&self, identifier: &str) -> bool {
        let index = self.input_index(identifier);
        let state = self.evaluator.node_state(self.node.id).lock();
        let input_state = &state.inputs[index];
        input_state.was_ready_for_execution && input_state.all_values_available()
    }

    /// True while the output has not been computed.
    pub fn can_set_output(&self, identifier: &str) -> bool {
        let index = self.output_index(identifier);
        let state = self.evaluator.node_state(self.node.id).lock();
        !state.outputs[index].has_been_computed
    }

    /// Takes ownership of the input value; subsequent reads find it empty.
    pub fn extract_input(&mut self, identifier: &str) -> Value {
        debug_assert!(self.can_get_input(identifier));
        let index = self.input_index(identifier);
        let mut state = self.evaluator.node_state(self.node.id).lock();
        state.inputs[index]
            .value
            .as_single_mut()
            .value
            .take()
            .expect("Input value was already extracted")
    }

    /// Takes ownership of all values of a multi-input, in origin order.
    pub fn extract_multi_input(&mut self, identifier: &str) -> Vec<Value> {
        debug_assert!(self.can_get_input(identifier));
        let index = self.input_index(identifier);
        let mut state = self.evaluator.node_state(self.node.id).lock();
        let multi = state.inputs[index].value.as_multi_mut();
        let values: Vec<Value> = multi
            .values
            .iter_mut()
            .map(|value| value.take().expect("Multi-input slot was already extracted"))
            .collect();
        multi.provided_value_count = 0;
        values
    }

    /// Shared read access; ownership stays with the input state. Values are
    /// cheaply cloneable (opaque payloads are reference counted).
    pub fn get_input(&self, identifier: &str) -> Value {
        debug_assert!(self.can_get_input(identifier));
        let index = self.input_index(identifier);
        let state = self.evaluator.node_state(self.node.id).lock();
        state.inputs[index]
            .value
            .as_single()
            .value
            .clone()
            .expect("Input value was already extracted")
    }

    /// Constructs a default-initialized value of the given type.
    pub fn default_value(&self, socket_type: &SocketType) -> Value {
        socket_type.default_value()
    }

    /// Forwards the value to all consumers and marks the output computed.
    pub fn set_output(&mut self, identifier: &str, value: Value) {
        let index = self.output_index(identifier);
        debug_assert!(self.can_set_output(identifier));

        let evaluator = self.evaluator;
        evaluator.forward_output(
            OutputRef::new(self.node.id, index),
            value,
            Some(&mut *self.run_state),
            self.scope,
        );
        evaluator.set_output_computed(self.node.id, index);
    }

    /// Tells the evaluator this input will not be consumed; upstream work
    /// feeding only this input is cancelled.
    pub fn set_input_unused(&mut self, identifier: &str) {
        let index = self.input_index(identifier);
        let socket = InputRef::new(self.node.id, index);
        let evaluator = self.evaluator;
        evaluator.with_locked_node(
            self.node.id,
            Some(&mut *self.run_state),
            self.scope,
            |locked| {
                evaluator.set_input_unused(locked, socket);
            },
        );
    }

    /// Reads the execution snapshot: whether the output is still wanted.
    pub fn output_is_required(&self, identifier: &str) -> bool {
        let index = self.output_index(identifier);
        let state = self.evaluator.node_state(self.node.id).lock();
        let output_state = &state.outputs[index];
        if output_state.has_been_computed {
            return false;
        }
        output_state.output_usage_for_execution != ValueUsage::Unused
    }

    /// Like `output_is_required`, but only definite demand counts. Callable
    /// by laziness-supporting nodes.
    pub fn lazy_output_is_required(&self, identifier: &str) -> bool {
        debug_assert!(self.evaluator.node_supports_laziness(self.node));
        let index = self.output_index(identifier);
        let state = self.evaluator.node_state(self.node.id).lock();
        let output_state = &state.outputs[index];
        if output_state.has_been_computed {
            return false;
        }
        output_state.output_usage_for_execution == ValueUsage::Required
    }

    /// Requests an input during execution. Returns true when the value was
    /// not ready for this execution; the node must then suspend by returning,
    /// and it runs again once the value arrives.
    pub fn lazy_require_input(&mut self, identifier: &str) -> bool {
        debug_assert!(self.evaluator.node_supports_laziness(self.node));
        let index = self.input_index(identifier);
        let socket = InputRef::new(self.node.id, index);

        {
            let state = self.evaluator.node_state(self.node.id).lock();
            if state.inputs[index].was_ready_for_execution {
                return false;
            }
        }

        let evaluator = self.evaluator;
        evaluator.with_locked_node(
            self.node.id,
            Some(&mut *self.run_state),
            self.scope,
            |locked| {
                if !evaluator.set_input_required(locked, socket) {
                    // The value is available now but was not part of this
                    // execution's snapshot; run the node again to see it.
                    evaluator.schedule_node(locked);
                }
            },
        );
        true
    }

    /// Emergency fallback: every not-yet-computed output whose snapshot usage
    /// is not unused gets its type's default value.
    pub fn set_default_remaining_outputs(&mut self) {
        let evaluator = self.evaluator;
        for (index, output) in self.node.outputs.iter().enumerate() {
            if !output.available {
                continue;
            }
            let Some(socket_type) = &output.socket_type else {
                continue;
            };
            {
                let state = evaluator.node_state(self.node.id).lock();
                let output_state = &state.outputs[index];
                if output_state.has_been_computed
                    || output_state.output_usage_for_execution
                        == ValueUsage::Unused
                {
                    continue;
                }
            }
            evaluator.forward_output(
                OutputRef::new(self.node.id, index),
                socket_type.default_value(),
                Some(&mut *self.run_state),
                self.scope,
            );
            evaluator.set_output_computed(self.node.id, index);
        }
    }

    pub fn log_debug_message(&self, message: &str) {
        if let Some(logger) = self.evaluator.logger() {
            logger.log_debug_message(self.node.id, message);
        }
    }

    fn input_index(&self, identifier: &str) -> usize {
        self.node
            .inputs
            .iter()
            .position(|input| input.name == identifier)
            .unwrap_or_else(|| {
                panic!(
                    "Node {:?} has no input socket {:?}",
                    self.node.name, identifier
                )
            })
    }

    fn output_index(&self, identifier: &str) -> usize {
        self.node
            .outputs
            .iter()
            .position(|output| output.name == identifier)
            .unwrap_or_else(|| {
                panic!(
                    "Node {:?} has no output socket {:?}",
                    self.node.name, identifier
                )
            })
    }
}
