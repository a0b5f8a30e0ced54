use parking_lot::{Mutex, MutexGuard};

use crate::data::{SocketType, Value};
use crate::graph::SocketRef;

/// The evaluator's current judgement about whether a socket's value will be
/// consumed. Only `Maybe` may transition; `Required` and `Unused` are final.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum ValueUsage {
    Required,
    #[default]
    Maybe,
    Unused,
}

#[derive(Debug, Default)]
pub struct SingleInputValue {
    pub value: Option<Value>,
}

/// Values arriving over the ordered origin links of a multi-input socket.
/// The same origin can occur multiple times; a new value goes into the first
/// empty slot with a matching origin.
#[derive(Debug, Default)]
pub struct MultiInputValue {
    pub origins: Vec<SocketRef>,
    pub values: Vec<Option<Value>>,
    pub provided_value_count: usize,
}

impl MultiInputValue {
    pub fn all_values_available(&self) -> bool {
        self.missing_values() == 0
    }

    pub fn missing_values(&self) -> usize {
        self.values.len() - self.provided_value_count
    }

    pub fn add_value(&mut self, origin: SocketRef, value: Value) {
        let index = self
            .find_available_index(origin)
            .expect("No empty slot matches the origin socket");
        self.values[index] = Some(value);
        self.provided_value_count += 1;
    }

    fn find_available_index(&self, origin: SocketRef) -> Option<usize> {
        self.origins
            .iter()
            .enumerate()
            .position(|(i, slot_origin)| self.values[i].is_none() && *slot_origin == origin)
    }
}

#[derive(Debug)]
pub enum InputValue {
    Single(SingleInputValue),
    Multi(MultiInputValue),
}

impl InputValue {
    pub fn as_single(&self) -> &SingleInputValue {
        match self {
            InputValue::Single(single) => single,
            InputValue::Multi(_) => panic!("Input is a multi-input socket"),
        }
    }
    pub fn as_single_mut(&mut self) -> &mut SingleInputValue {
        match self {
            InputValue::Single(single) => single,
            InputValue::Multi(_) => panic!("Input is a multi-input socket"),
        }
    }
    pub fn as_multi(&self) -> &MultiInputValue {
        match self {
            InputValue::Multi(multi) => multi,
            InputValue::Single(_) => panic!("Input is not a multi-input socket"),
        }
    }
    pub fn as_multi_mut(&mut self) -> &mut MultiInputValue {
        match self {
            InputValue::Multi(multi) => multi,
            InputValue::Single(_) => panic!("Input is not a multi-input socket"),
        }
    }
}

#[derive(Debug)]
pub struct InputState {
    /// None when the socket is unavailable or carries no data; such inputs
    /// are ignored entirely.
    pub socket_type: Option<SocketType>,
    pub value: InputValue,
    pub usage: ValueUsage,
    /// Once set, the set of inputs presented to the current execution is
    /// frozen; values arriving later do not change that execution's view.
    pub was_ready_for_execution: bool,
    /// The value has to be computed for inspection even if no output needs it.
    pub force_compute: bool,
}

impl Default for InputState {
    fn default() -> Self {
        InputState {
            socket_type: None,
            value: InputValue::Single(SingleInputValue::default()),
            usage: ValueUsage::Maybe,
            was_ready_for_execution: false,
            force_compute: false,
        }
    }
}

impl InputState {
    /// True when every expected value has arrived (single slot filled, or all
    /// multi-input slots filled).
    pub fn all_values_available(&self) -> bool {
        match &self.value {
            InputValue::Single(single) => single.value.is_some(),
            InputValue::Multi(multi) => multi.all_values_available(),
        }
    }

    /// How many values still have to arrive. Each empty slot of a multi-input
    /// counts separately.
    pub fn missing_values(&self) -> usize {
        match &self.value {
            InputValue::Single(single) => usize::from(single.value.is_none()),
            InputValue::Multi(multi) => multi.missing_values(),
        }
    }

    /// Drops any values that have arrived already.
    pub fn destruct_value(&mut self) {
        match &mut self.value {
            InputValue::Single(single) => {
                single.value = None;
            }
            InputValue::Multi(multi) => {
                for value in multi.values.iter_mut() {
                    *value = None;
                }
                multi.provided_value_count = 0;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputState {
    /// Monotonic; an output is produced and forwarded at most once.
    pub has_been_computed: bool,
    /// Live consumer demand for this output.
    pub output_usage: ValueUsage,
    /// Snapshot of `output_usage` taken right before node execution starts,
    /// so the running node sees a consistent view.
    pub output_usage_for_execution: ValueUsage,
    /// Number of downstream input sockets still able to consume this output.
    /// At zero without a required bit the output becomes unused.
    pub potential_users: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub enum NodeScheduleState {
    #[default]
    NotScheduled,
    Scheduled,
    Running,
    /// Another schedule request arrived while the node was running; the node
    /// re-enqueues itself when the current run finishes instead of being
    /// enqueued twice.
    RunningAndRescheduled,
}

#[derive(Debug, Default)]
pub struct NodeStateInner {
    pub inputs: Vec<InputState>,
    pub outputs: Vec<OutputState>,
    /// One-shot flag: non-lazy nodes have had all their inputs marked required.
    pub non_lazy_inputs_handled: bool,
    /// Monotonic; nodes that don't support laziness must not run twice.
    pub has_been_executed: bool,
    /// Set once the node will never run again and its inputs were destructed.
    pub node_has_finished: bool,
    /// Not-yet-filled required input slots. The node is scheduled when this
    /// reaches zero.
    pub missing_required_inputs: usize,
    pub schedule_state: NodeScheduleState,
}

#[derive(Debug, Default)]
pub struct NodeState {
    mutex: Mutex<NodeStateInner>,
}

impl NodeState {
    pub fn lock(&self) -> MutexGuard<'_, NodeStateInner> {
        self.mutex.lock()
    }
}
