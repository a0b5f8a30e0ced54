use std::sync::Arc;

use crate::data::{DataType, Value};
use crate::function::MultiFunc;

/// A deferred scalar computation. Fields are cheap handles into an immutable
/// computation tree; combining them never evaluates anything.
#[derive(Clone, Debug)]
pub struct Field {
    node: Arc<FieldNode>,
    output_index: usize,
}

#[derive(Debug)]
pub enum FieldNode {
    Constant { value: Value },
    Operation(FieldOperation),
}

/// A multi-function applied to field inputs. One operation may back several
/// `Field` handles, one per function output.
#[derive(Debug)]
pub struct FieldOperation {
    pub func: Arc<MultiFunc>,
    pub inputs: Vec<Field>,
}

impl FieldOperation {
    pub fn new(func: Arc<MultiFunc>, inputs: Vec<Field>) -> Arc<FieldNode> {
        debug_assert_eq!(func.input_types.len(), inputs.len());
        Arc::new(FieldNode::Operation(FieldOperation { func, inputs }))
    }
}

impl Field {
    pub fn new(node: Arc<FieldNode>, output_index: usize) -> Field {
        if let FieldNode::Operation(operation) = &*node {
            debug_assert!(output_index < operation.func.output_types.len());
        }
        Field { node, output_index }
    }

    pub fn constant(value: Value) -> Field {
        debug_assert!(!value.is_field());
        Field {
            node: Arc::new(FieldNode::Constant { value }),
            output_index: 0,
        }
    }

    /// Wraps a socket value into a field: fields pass through, materialized
    /// scalars become constant fields.
    pub fn from_value_or_field(value: &Value) -> Field {
        match value {
            Value::Field(field) => field.clone(),
            other => Field::constant(other.clone()),
        }
    }

    pub fn base_type(&self) -> DataType {
        match &*self.node {
            FieldNode::Constant { value } => value.data_type(),
            FieldNode::Operation(operation) => {
                operation.func.output_types[self.output_index].clone()
            }
        }
    }

    pub fn same_field(&self, other: &Field) -> bool {
        Arc::ptr_eq(&self.node, &other.node) && self.output_index == other.output_index
    }

    /// Materializes the field by evaluating the computation tree bottom-up.
    pub fn evaluate(&self) -> Value {
        match &*self.node {
            FieldNode::Constant { value } => value.clone(),
            FieldNode::Operation(operation) => {
                let inputs: Vec<Value> = operation
                    .inputs
                    .iter()
                    .map(|field| field.evaluate())
                    .collect();
                let mut outputs: Vec<Value> = operation
                    .func
                    .output_types
                    .iter()
                    .map(Value::from)
                    .collect();
                operation.func.call(&inputs, &mut outputs);
                outputs.swap_remove(self.output_index)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::MultiFunc;

    fn add_func() -> Arc<MultiFunc> {
        Arc::new(MultiFunc::new(
            "add",
            vec![DataType::Float, DataType::Float],
            vec![DataType::Float],
            |inputs, outputs| {
                outputs[0] = Value::Float(inputs[0].as_f64() + inputs[1].as_f64());
            },
        ))
    }

    #[test]
    fn constant_field_evaluates_to_value() {
        let field = Field::constant(Value::Float(1.5));
        assert_eq!(field.base_type(), DataType::Float);
        assert_eq!(field.evaluate(), Value::Float(1.5));
    }

    #[test]
    fn operation_field_evaluates_tree() {
        let a = Field::constant(Value::Float(2.0));
        let b = Field::constant(Value::Float(3.0));
        let op = FieldOperation::new(add_func(), vec![a, b]);
        let sum = Field::new(op, 0);

        assert_eq!(sum.base_type(), DataType::Float);
        assert_eq!(sum.evaluate(), Value::Float(5.0));
    }

    #[test]
    fn nested_operations_compose() {
        let one = Field::constant(Value::Float(1.0));
        let two = Field::constant(Value::Float(2.0));
        let inner = Field::new(FieldOperation::new(add_func(), vec![one, two]), 0);
        let outer = Field::new(
            FieldOperation::new(add_func(), vec![inner, Field::constant(Value::Float(4.0))]),
            0,
        );
        assert_eq!(outer.evaluate(), Value::Float(7.0));
    }

    #[test]
    fn field_identity() {
        let shared = FieldOperation::new(
            add_func(),
            vec![
                Field::constant(Value::Float(0.0)),
                Field::constant(Value::Float(0.0)),
            ],
        );
        let a = Field::new(shared.clone(), 0);
        let b = Field::new(shared, 0);
        assert!(a.same_field(&b));

        let constant = Field::constant(Value::Float(0.0));
        assert!(!a.same_field(&constant));
    }
}
