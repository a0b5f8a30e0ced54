use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use common::id_type;

use crate::data::{DataType, SocketType, StaticValue, Value};
use crate::params::ExecParams;

id_type!(FuncId);

pub type MultiFuncFn = Box<dyn Fn(&[Value], &mut [Value]) + Send + Sync>;

/// A pure function over scalar values: N base-typed inputs, M base-typed
/// outputs. Invoked directly for value inputs or composed into a
/// `FieldOperation` when any input is deferred.
pub struct MultiFunc {
    pub name: String,
    pub input_types: Vec<DataType>,
    pub output_types: Vec<DataType>,
    func: MultiFuncFn,
}

impl MultiFunc {
    pub fn new<F>(
        name: impl Into<String>,
        input_types: Vec<DataType>,
        output_types: Vec<DataType>,
        func: F,
    ) -> Self
    where
        F: Fn(&[Value], &mut [Value]) + Send + Sync + 'static,
    {
        MultiFunc {
            name: name.into(),
            input_types,
            output_types,
            func: Box::new(func),
        }
    }

    pub fn call(&self, inputs: &[Value], outputs: &mut [Value]) {
        debug_assert_eq!(inputs.len(), self.input_types.len());
        debug_assert_eq!(outputs.len(), self.output_types.len());
        (self.func)(inputs, outputs);
    }
}

impl Debug for MultiFunc {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiFunc")
            .field("name", &self.name)
            .field("input_types", &self.input_types)
            .field("output_types", &self.output_types)
            .finish()
    }
}

pub type ExecuteFn = Arc<dyn Fn(&mut ExecParams) + Send + Sync>;

/// How a node of this function kind is executed. Functions without an
/// execution fall back to producing default values for their outputs.
#[derive(Clone, Default)]
pub enum Execution {
    #[default]
    None,
    Callback(ExecuteFn),
    MultiFunc(Arc<MultiFunc>),
}

impl Debug for Execution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Execution::None => write!(f, "None"),
            Execution::Callback(_) => write!(f, "Callback"),
            Execution::MultiFunc(func) => write!(f, "MultiFunc({})", func.name),
        }
    }
}

#[derive(Clone, Debug)]
pub struct FuncInput {
    pub name: String,
    /// None marks a non-data socket the evaluator ignores entirely.
    pub socket_type: Option<SocketType>,
    pub is_multi: bool,
    pub available: bool,
    pub default_value: Option<StaticValue>,
}

impl FuncInput {
    pub fn new(name: impl Into<String>, socket_type: SocketType) -> Self {
        FuncInput {
            name: name.into(),
            socket_type: Some(socket_type),
            is_multi: false,
            available: true,
            default_value: None,
        }
    }

    pub fn multi(name: impl Into<String>, socket_type: SocketType) -> Self {
        FuncInput {
            is_multi: true,
            ..FuncInput::new(name, socket_type)
        }
    }

    pub fn with_default(mut self, default_value: impl Into<StaticValue>) -> Self {
        self.default_value = Some(default_value.into());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

#[derive(Clone, Debug)]
pub struct FuncOutput {
    pub name: String,
    pub socket_type: Option<SocketType>,
    pub available: bool,
}

impl FuncOutput {
    pub fn new(name: impl Into<String>, socket_type: SocketType) -> Self {
        FuncOutput {
            name: name.into(),
            socket_type: Some(socket_type),
            available: true,
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct Func {
    pub id: FuncId,
    pub name: String,
    pub category: String,
    /// Lazy functions may read a subset of their inputs, suspend, and run
    /// again; non-lazy functions get all inputs up front and run exactly once.
    pub supports_laziness: bool,
    pub inputs: Vec<FuncInput>,
    pub outputs: Vec<FuncOutput>,
    pub execution: Execution,
}

#[derive(Debug, Default, Clone)]
pub struct FuncLib {
    funcs: HashMap<FuncId, Func>,
}

impl FuncLib {
    pub fn by_id(&self, id: FuncId) -> Option<&Func> {
        self.funcs.get(&id)
    }
    pub fn by_name(&self, name: &str) -> Option<&Func> {
        self.funcs.values().find(|func| func.name == name)
    }

    pub fn add(&mut self, func: Func) {
        debug_assert!(socket_names_unique(&func));
        let entry = self.funcs.entry(func.id);
        match entry {
            Entry::Occupied(_) => {
                panic!("Func {}:{} already exists", func.id, func.name);
            }
            Entry::Vacant(_) => {
                entry.insert(func);
            }
        }
    }

    pub fn merge(&mut self, other: FuncLib) {
        for (_id, func) in other.funcs {
            self.add(func);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Func> {
        self.funcs.values()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }
}

impl<It> From<It> for FuncLib
where
    It: IntoIterator<Item = Func>,
{
    fn from(iter: It) -> Self {
        let mut func_lib = FuncLib::default();
        for func in iter {
            func_lib.add(func);
        }
        func_lib
    }
}

// Socket identifiers must be unique within their own category. Input and
// output sockets live in separate namespaces and may share a name.
fn socket_names_unique(func: &Func) -> bool {
    let unique = |names: &mut dyn Iterator<Item = &str>| {
        let mut seen: Vec<&str> = Vec::new();
        for name in names {
            if seen.contains(&name) {
                return false;
            }
            seen.push(name);
        }
        true
    };

    unique(&mut func.inputs.iter().map(|input| input.name.as_str()))
        && unique(&mut func.outputs.iter().map(|output| output.name.as_str()))
}
