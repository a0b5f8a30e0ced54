pub mod conversion;
pub mod data;
pub mod elements;
pub mod evaluator;
pub mod field;
pub mod function;
pub mod graph;
pub mod logger;
pub mod node_state;
pub mod params;

pub mod prelude {
    pub use crate::conversion::ConversionRegistry;
    pub use crate::data::{DataType, SocketType, StaticValue, TypeDef, TypeId, Value};
    pub use crate::evaluator::{evaluate, EvalError, EvalResult, EvaluationParams};
    pub use crate::field::{Field, FieldOperation};
    pub use crate::function::{
        Execution, Func, FuncId, FuncInput, FuncLib, FuncOutput, MultiFunc,
    };
    pub use crate::graph::{
        Binding, Graph, InputRef, Node, NodeId, NodeKind, OutputBinding, OutputRef, SocketRef,
    };
    pub use crate::logger::EvalLogger;
    pub use crate::params::ExecParams;
}

#[cfg(test)]
mod tests;
