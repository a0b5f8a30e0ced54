use std::sync::Arc;

use hashbrown::HashMap;

use common::EPSILON;

use crate::data::{DataType, SocketType, Value};
use crate::field::{Field, FieldOperation};
use crate::function::MultiFunc;

/// Registry of scalar conversions keyed by `(from, to)` base types. Each
/// conversion is a single-input single-output `MultiFunc` so it can also be
/// composed into a `FieldOperation` when the converted value is deferred.
#[derive(Debug)]
pub struct ConversionRegistry {
    funcs: HashMap<(DataType, DataType), Arc<MultiFunc>>,
}

impl Default for ConversionRegistry {
    fn default() -> Self {
        Self::implicit()
    }
}

impl ConversionRegistry {
    pub fn empty() -> Self {
        ConversionRegistry {
            funcs: HashMap::new(),
        }
    }

    /// The implicit conversions between the scalar base types.
    pub fn implicit() -> Self {
        let mut registry = Self::empty();

        registry.add_fn(DataType::Bool, DataType::Int, |v| {
            Value::Int(v.as_bool() as i64)
        });
        registry.add_fn(DataType::Bool, DataType::Float, |v| {
            Value::Float(v.as_bool() as i64 as f64)
        });
        registry.add_fn(DataType::Bool, DataType::String, |v| {
            Value::String(v.as_bool().to_string())
        });

        registry.add_fn(DataType::Int, DataType::Bool, |v| {
            Value::Bool(v.as_i64() != 0)
        });
        registry.add_fn(DataType::Int, DataType::Float, |v| {
            Value::Float(v.as_i64() as f64)
        });
        registry.add_fn(DataType::Int, DataType::String, |v| {
            Value::String(v.as_i64().to_string())
        });

        registry.add_fn(DataType::Float, DataType::Bool, |v| {
            Value::Bool(v.as_f64().abs() > EPSILON)
        });
        registry.add_fn(DataType::Float, DataType::Int, |v| {
            Value::Int(v.as_f64() as i64)
        });
        registry.add_fn(DataType::Float, DataType::String, |v| {
            Value::String(v.as_f64().to_string())
        });

        registry.add_fn(DataType::String, DataType::Int, |v| {
            Value::Int(v.as_str().parse().unwrap_or(0))
        });
        registry.add_fn(DataType::String, DataType::Float, |v| {
            Value::Float(v.as_str().parse().unwrap_or(0.0))
        });
        registry.add_fn(DataType::String, DataType::Bool, |v| {
            Value::Bool(v.as_str() == "true" || v.as_str() == "1")
        });

        registry
    }

    pub fn add(&mut self, func: Arc<MultiFunc>) {
        assert_eq!(func.input_types.len(), 1);
        assert_eq!(func.output_types.len(), 1);
        let key = (func.input_types[0].clone(), func.output_types[0].clone());
        self.funcs.insert(key, func);
    }

    fn add_fn(&mut self, from: DataType, to: DataType, f: fn(&Value) -> Value) {
        let name = format!("{} to {}", from, to);
        self.add(Arc::new(MultiFunc::new(
            name,
            vec![from],
            vec![to],
            move |inputs, outputs| {
                outputs[0] = f(&inputs[0]);
            },
        )));
    }

    pub fn is_convertible(&self, from: &DataType, to: &DataType) -> bool {
        from == to || self.funcs.contains_key(&(from.clone(), to.clone()))
    }

    pub fn conversion(&self, from: &DataType, to: &DataType) -> Option<&Arc<MultiFunc>> {
        self.funcs.get(&(from.clone(), to.clone()))
    }

    /// Converts a value declared as `from` into the `to` socket type.
    ///
    /// Field values destined for a field-capable socket are converted at the
    /// field level: the scalar conversion is composed into the field tree, so
    /// nothing is materialized. Returns None when no conversion applies.
    pub fn convert_value(
        &self,
        value: &Value,
        from: &SocketType,
        to: &SocketType,
    ) -> Option<Value> {
        if from == to {
            return Some(value.clone());
        }

        if from.base == to.base {
            // Only the field capability differs.
            return match value {
                Value::Field(_) if !to.field_capable => None,
                other => Some(other.clone()),
            };
        }

        let func = self.conversion(&from.base, &to.base)?;
        match value {
            Value::Field(field) if to.field_capable => {
                let operation = FieldOperation::new(func.clone(), vec![field.clone()]);
                Some(Value::Field(Field::new(operation, 0)))
            }
            // A deferred value cannot be materialized into a value-only socket.
            Value::Field(_) => None,
            scalar => {
                let mut outputs = vec![Value::from(&to.base)];
                func.call(std::slice::from_ref(scalar), &mut outputs);
                Some(outputs.swap_remove(0))
            }
        }
    }
}
