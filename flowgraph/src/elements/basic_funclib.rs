use std::sync::Arc;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use tracing::info;

use common::output_stream::OutputStream;

use crate::data::{DataType, SocketType, Value};
use crate::function::{
    Execution, Func, FuncId, FuncInput, FuncLib, FuncOutput, MultiFunc,
};

pub const FLOAT_VALUE_FUNC_ID: FuncId = FuncId::from_u128(0x01896910_0790_ad1b_aa12_3f1437196001);
pub const INT_VALUE_FUNC_ID: FuncId = FuncId::from_u128(0x01896910_0790_ad1b_aa12_3f1437196002);
pub const SWITCH_FUNC_ID: FuncId = FuncId::from_u128(0x01896910_0790_ad1b_aa12_3f1437196003);
pub const PRINT_FUNC_ID: FuncId = FuncId::from_u128(0x01896910_0790_ad1b_aa12_3f1437196004);
const MATH_FUNC_ID_BASE: u128 = 0x01896910_4bc9_77aa_6973_64cc1c56b000;

/// Standard functions: constant producers, two-argument float math over
/// fields, a lazy switch and a print sink.
#[derive(Debug)]
pub struct BasicFuncLib {
    func_lib: FuncLib,
}

#[repr(u32)]
#[derive(Debug, Display, EnumIter, Copy, Clone, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Math2ArgOp {
    Add = 0,
    Subtract = 1,
    Multiply = 2,
    Divide = 3,
    Power = 4,
    Min = 5,
    Max = 6,
}

impl Math2ArgOp {
    pub fn func_id(&self) -> FuncId {
        FuncId::from_u128(MATH_FUNC_ID_BASE + *self as u128)
    }

    fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            Math2ArgOp::Add => a + b,
            Math2ArgOp::Subtract => a - b,
            Math2ArgOp::Multiply => a * b,
            Math2ArgOp::Divide => a / b,
            Math2ArgOp::Power => a.powf(b),
            Math2ArgOp::Min => a.min(b),
            Math2ArgOp::Max => a.max(b),
        }
    }

    fn into_func(self) -> Func {
        let multi_func = MultiFunc::new(
            self.to_string(),
            vec![DataType::Float, DataType::Float],
            vec![DataType::Float],
            move |inputs, outputs| {
                outputs[0] = Value::Float(self.apply(inputs[0].as_f64(), inputs[1].as_f64()));
            },
        );

        Func {
            id: self.func_id(),
            name: self.to_string(),
            category: "math".to_string(),
            inputs: vec![
                FuncInput::new("a", SocketType::field(DataType::Float)).with_default(0.0),
                FuncInput::new("b", SocketType::field(DataType::Float)).with_default(0.0),
            ],
            outputs: vec![FuncOutput::new("value", SocketType::field(DataType::Float))],
            execution: Execution::MultiFunc(Arc::new(multi_func)),
            ..Default::default()
        }
    }
}

impl BasicFuncLib {
    pub fn with_output_stream(output_stream: OutputStream) -> Self {
        let mut func_lib = FuncLib::default();

        // constant producers
        func_lib.add(Func {
            id: FLOAT_VALUE_FUNC_ID,
            name: "float value".to_string(),
            category: "value".to_string(),
            inputs: vec![FuncInput::new("value", SocketType::value(DataType::Float))
                .with_default(0.0)],
            outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Float))],
            execution: Execution::MultiFunc(Arc::new(MultiFunc::new(
                "float value",
                vec![DataType::Float],
                vec![DataType::Float],
                |inputs, outputs| {
                    outputs[0] = inputs[0].clone();
                },
            ))),
            ..Default::default()
        });
        func_lib.add(Func {
            id: INT_VALUE_FUNC_ID,
            name: "int value".to_string(),
            category: "value".to_string(),
            inputs: vec![
                FuncInput::new("value", SocketType::value(DataType::Int)).with_default(0i64)
            ],
            outputs: vec![FuncOutput::new("value", SocketType::value(DataType::Int))],
            execution: Execution::MultiFunc(Arc::new(MultiFunc::new(
                "int value",
                vec![DataType::Int],
                vec![DataType::Int],
                |inputs, outputs| {
                    outputs[0] = inputs[0].clone();
                },
            ))),
            ..Default::default()
        });

        for op in Math2ArgOp::iter() {
            func_lib.add(op.into_func());
        }

        // Reads the selector first, cancels the untaken branch, then suspends
        // until the taken branch arrives.
        func_lib.add(Func {
            id: SWITCH_FUNC_ID,
            name: "switch".to_string(),
            category: "flow".to_string(),
            supports_laziness: true,
            inputs: vec![
                FuncInput::new("switch", SocketType::value(DataType::Bool)).with_default(false),
                FuncInput::new("false", SocketType::field(DataType::Float)).with_default(0.0),
                FuncInput::new("true", SocketType::field(DataType::Float)).with_default(0.0),
            ],
            outputs: vec![FuncOutput::new("output", SocketType::field(DataType::Float))],
            execution: Execution::Callback(Arc::new(|params| {
                if params.lazy_require_input("switch") {
                    return;
                }
                let pick_true = params.get_input("switch").as_bool();
                let (taken, untaken) = if pick_true {
                    ("true", "false")
                } else {
                    ("false", "true")
                };
                params.set_input_unused(untaken);
                if params.lazy_require_input(taken) {
                    return;
                }
                let value = params.extract_input(taken);
                params.set_output("output", value);
            })),
            ..Default::default()
        });

        // print, passes the value through and records it on the stream
        func_lib.add(Func {
            id: PRINT_FUNC_ID,
            name: "print".to_string(),
            category: "output".to_string(),
            inputs: vec![FuncInput::new("value", SocketType::value(DataType::String))],
            outputs: vec![FuncOutput::new("value", SocketType::value(DataType::String))],
            execution: Execution::Callback(Arc::new(move |params| {
                let value = params.extract_input("value");
                output_stream.write(value.as_str());
                info!("{}", value.as_str());
                params.set_output("value", value);
            })),
            ..Default::default()
        });

        BasicFuncLib { func_lib }
    }

    pub fn func_lib(&self) -> &FuncLib {
        &self.func_lib
    }

    pub fn into_func_lib(self) -> FuncLib {
        self.func_lib
    }
}

impl Default for BasicFuncLib {
    fn default() -> Self {
        Self::with_output_stream(OutputStream::new())
    }
}

impl From<BasicFuncLib> for FuncLib {
    fn from(basic: BasicFuncLib) -> Self {
        basic.func_lib
    }
}
