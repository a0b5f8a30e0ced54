use std::any::Any;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use common::id_type;

use crate::field::Field;

id_type!(TypeId);

pub type DefaultValueFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Definition of an opaque payload type for `DataType::Custom`.
///
/// `default_fn` produces the type's default value; it is required for custom
/// types that flow through sockets the evaluator may have to fill on its own.
#[derive(Clone, Serialize, Deserialize)]
pub struct TypeDef {
    pub type_id: TypeId,
    // display_name is not included in the hash or equality check
    pub display_name: String,
    #[serde(skip)]
    pub default_fn: Option<DefaultValueFn>,
}

impl std::fmt::Debug for TypeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDef")
            .field("type_id", &self.type_id)
            .field("display_name", &self.display_name)
            .finish()
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    Null,
    Float,
    Int,
    Bool,
    String,
    Custom(Arc<TypeDef>),
}

/// Declared type of a data socket. `field_capable` sockets carry either a
/// materialized scalar or a deferred `Field` over the same base type.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct SocketType {
    pub base: DataType,
    pub field_capable: bool,
}

impl SocketType {
    pub fn value(base: DataType) -> Self {
        SocketType {
            base,
            field_capable: false,
        }
    }

    pub fn field(base: DataType) -> Self {
        SocketType {
            base,
            field_capable: true,
        }
    }

    pub fn default_value(&self) -> Value {
        Value::from(&self.base)
    }
}

/// Serializable constant values used in graph descriptions.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub enum StaticValue {
    #[default]
    Null,
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
}

impl PartialEq for StaticValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StaticValue::Null, StaticValue::Null) => true,
            (StaticValue::Float(left), StaticValue::Float(right)) => {
                left.to_bits() == right.to_bits()
            }
            (StaticValue::Int(left), StaticValue::Int(right)) => left == right,
            (StaticValue::Bool(left), StaticValue::Bool(right)) => left == right,
            (StaticValue::String(left), StaticValue::String(right)) => left == right,
            _ => false,
        }
    }
}

impl Eq for StaticValue {}

/// A runtime value owned by exactly one holder. Moving, cloning and dropping a
/// `Value` are the move/copy/destruct operations of its type.
#[derive(Clone)]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    String(String),
    Custom {
        type_def: Arc<TypeDef>,
        data: Arc<dyn Any + Send + Sync>,
    },
    Field(Field),
}

impl Value {
    pub fn custom<T: Any + Send + Sync>(type_def: Arc<TypeDef>, data: T) -> Self {
        Value::Custom {
            type_def,
            data: Arc::new(data),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Float(_) => DataType::Float,
            Value::Int(_) => DataType::Int,
            Value::Bool(_) => DataType::Bool,
            Value::String(_) => DataType::String,
            Value::Custom { type_def, .. } => DataType::Custom(type_def.clone()),
            Value::Field(field) => field.base_type(),
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self, Value::Field(_))
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Float(value) => *value,
            _ => panic!("Value is not a float"),
        }
    }
    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int(value) => *value,
            _ => panic!("Value is not an int"),
        }
    }
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(value) => *value,
            _ => panic!("Value is not a bool"),
        }
    }
    pub fn as_str(&self) -> &str {
        match self {
            Value::String(value) => value,
            _ => panic!("Value is not a string"),
        }
    }
    pub fn as_custom<T: Any>(&self) -> &T {
        match self {
            Value::Custom { data, .. } => data
                .downcast_ref::<T>()
                .expect("Custom value type mismatch"),
            _ => panic!("Value is not a custom type"),
        }
    }
    pub fn as_field(&self) -> &Field {
        match self {
            Value::Field(field) => field,
            _ => panic!("Value is not a field"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Float(left), Value::Float(right)) => left.to_bits() == right.to_bits(),
            (Value::Int(left), Value::Int(right)) => left == right,
            (Value::Bool(left), Value::Bool(right)) => left == right,
            (Value::String(left), Value::String(right)) => left == right,
            (
                Value::Custom {
                    type_def: def_a,
                    data: data_a,
                },
                Value::Custom {
                    type_def: def_b,
                    data: data_b,
                },
            ) => def_a.type_id == def_b.type_id && Arc::ptr_eq(data_a, data_b),
            (Value::Field(left), Value::Field(right)) => left.same_field(right),
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Float(value) => write!(f, "Float({})", value),
            Value::Int(value) => write!(f, "Int({})", value),
            Value::Bool(value) => write!(f, "Bool({})", value),
            Value::String(value) => write!(f, "String({:?})", value),
            Value::Custom { type_def, .. } => write!(f, "Custom({})", type_def.display_name),
            Value::Field(field) => write!(f, "Field({})", field.base_type()),
        }
    }
}

impl From<StaticValue> for Value {
    fn from(value: StaticValue) -> Self {
        match value {
            StaticValue::Null => panic!("No runtime value for StaticValue::Null"),
            StaticValue::Float(value) => Value::Float(value),
            StaticValue::Int(value) => Value::Int(value),
            StaticValue::Bool(value) => Value::Bool(value),
            StaticValue::String(value) => Value::String(value),
        }
    }
}

impl From<&StaticValue> for Value {
    fn from(value: &StaticValue) -> Self {
        value.clone().into()
    }
}

impl From<&DataType> for Value {
    fn from(data_type: &DataType) -> Self {
        match data_type {
            DataType::Float => Value::Float(0.0),
            DataType::Int => Value::Int(0),
            DataType::Bool => Value::Bool(false),
            DataType::String => Value::String("".to_string()),
            DataType::Custom(type_def) => match &type_def.default_fn {
                Some(default_fn) => {
                    let default_fn: &(dyn Fn() -> Value + Send + Sync) = &**default_fn;
                    default_fn()
                }
                None => panic!("No default value for custom type {}", type_def.display_name),
            },
            DataType::Null => panic!("No value for {:?}", data_type),
        }
    }
}

impl From<i64> for StaticValue {
    fn from(value: i64) -> Self {
        StaticValue::Int(value)
    }
}

impl From<f64> for StaticValue {
    fn from(value: f64) -> Self {
        StaticValue::Float(value)
    }
}

impl From<bool> for StaticValue {
    fn from(value: bool) -> Self {
        StaticValue::Bool(value)
    }
}

impl From<&str> for StaticValue {
    fn from(value: &str) -> Self {
        StaticValue::String(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Field> for Value {
    fn from(field: Field) -> Self {
        Value::Field(field)
    }
}

impl DataType {
    pub fn is_custom(&self) -> bool {
        matches!(self, DataType::Custom(_))
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match &self {
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::Bool => "bool",
            DataType::String => "string",
            DataType::Custom(def) => def.display_name.as_str(),
            DataType::Null => "null",
        };
        write!(f, "{}", str)
    }
}

impl FromStr for DataType {
    type Err = ();

    fn from_str(s: &str) -> Result<DataType, Self::Err> {
        match s {
            "float" => Ok(DataType::Float),
            "number" => Ok(DataType::Float),
            "int" => Ok(DataType::Int),
            "bool" => Ok(DataType::Bool),
            "string" => Ok(DataType::String),
            _ => Err(()),
        }
    }
}

impl PartialEq for DataType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DataType::Null, DataType::Null) => true,
            (DataType::Float, DataType::Float) => true,
            (DataType::Int, DataType::Int) => true,
            (DataType::Bool, DataType::Bool) => true,
            (DataType::String, DataType::String) => true,
            (DataType::Custom(def1), DataType::Custom(def2)) => def1.type_id == def2.type_id,
            _ => false,
        }
    }
}

impl Eq for DataType {}

impl Hash for DataType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            DataType::Null => 0.hash(state),
            DataType::Float => 1.hash(state),
            DataType::Int => 2.hash(state),
            DataType::Bool => 3.hash(state),
            DataType::String => 4.hash(state),
            DataType::Custom(def) => {
                5.hash(state);
                def.type_id.hash(state);
            }
        }
    }
}
