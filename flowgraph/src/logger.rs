use std::time::Duration;

use crate::data::Value;
use crate::graph::{InputRef, NodeId, SocketRef};

/// Observer of socket values and node timings during an evaluation.
///
/// Implementations are called from worker threads and must be thread-safe;
/// per-thread aggregation is the implementor's concern. All operations
/// default to no-ops.
pub trait EvalLogger: Send + Sync {
    /// A value passing through the given sockets, unconverted.
    fn log_value_for_sockets(&self, _sockets: &[SocketRef], _value: &Value) {}

    /// A fully assembled multi-input, in origin order.
    fn log_multi_value_socket(&self, _socket: InputRef, _values: &[&Value]) {}

    fn log_execution_time(&self, _node_id: NodeId, _duration: Duration) {}

    fn log_debug_message(&self, _node_id: NodeId, _message: &str) {}
}
