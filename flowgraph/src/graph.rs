use serde::{Deserialize, Serialize};

use common::id_type;

use crate::data::{SocketType, StaticValue};
use crate::function::{Func, FuncId};

id_type!(NodeId);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct InputRef {
    pub node_id: NodeId,
    pub index: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct OutputRef {
    pub node_id: NodeId,
    pub index: usize,
}

impl InputRef {
    pub fn new(node_id: NodeId, index: usize) -> Self {
        InputRef { node_id, index }
    }
}

impl OutputRef {
    pub fn new(node_id: NodeId, index: usize) -> Self {
        OutputRef { node_id, index }
    }
}

/// Identity of a socket: node, side, index.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum SocketRef {
    Input(InputRef),
    Output(OutputRef),
}

impl SocketRef {
    pub fn node_id(&self) -> NodeId {
        match self {
            SocketRef::Input(input) => input.node_id,
            SocketRef::Output(output) => output.node_id,
        }
    }

    pub fn as_input(&self) -> Option<InputRef> {
        match self {
            SocketRef::Input(input) => Some(*input),
            SocketRef::Output(_) => None,
        }
    }
}

impl From<InputRef> for SocketRef {
    fn from(input: InputRef) -> Self {
        SocketRef::Input(input)
    }
}

impl From<OutputRef> for SocketRef {
    fn from(output: OutputRef) -> Self {
        SocketRef::Output(output)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub enum NodeKind {
    #[default]
    Standard,
    /// Sockets whose values are supplied by the caller; never executed.
    GroupInput,
    /// Holds the requested result sockets; never executed.
    GroupOutput,
    /// Transparent pass-through, resolved during traversal.
    Reroute,
}

#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct OutputBinding {
    pub output_node_id: NodeId,
    pub output_index: usize,
}

#[derive(Clone, Default, PartialEq, Debug, Serialize, Deserialize)]
pub enum Binding {
    #[default]
    None,
    Const,
    Output(OutputBinding),
    /// Ordered origin links of a multi-input socket. The same output may
    /// appear more than once.
    Multi(Vec<OutputBinding>),
}

impl Binding {
    pub fn from_output_binding(output_node_id: NodeId, output_index: usize) -> Binding {
        Binding::Output(OutputBinding {
            output_node_id,
            output_index,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Input {
    pub name: String,
    /// None marks a non-data socket that carries no value.
    pub socket_type: Option<SocketType>,
    pub is_multi: bool,
    pub available: bool,
    pub binding: Binding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub const_value: Option<StaticValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    pub socket_type: Option<SocketType>,
    pub available: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub func_id: FuncId,
    pub name: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Input>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,
}

impl Default for Node {
    fn default() -> Self {
        Node {
            id: NodeId::unique(),
            func_id: FuncId::nil(),
            name: "".to_string(),
            kind: NodeKind::Standard,
            inputs: vec![],
            outputs: vec![],
        }
    }
}

impl Node {
    /// Instantiates a node with socket declarations copied from the function.
    /// Inputs with a declared default start with a const binding.
    pub fn from_func(func: &Func) -> Node {
        let inputs: Vec<Input> = func
            .inputs
            .iter()
            .map(|func_input| Input {
                name: func_input.name.clone(),
                socket_type: func_input.socket_type.clone(),
                is_multi: func_input.is_multi,
                available: func_input.available,
                binding: func_input
                    .default_value
                    .as_ref()
                    .map_or(Binding::None, |_| Binding::Const),
                const_value: func_input.default_value.clone(),
            })
            .collect();

        let outputs: Vec<Output> = func
            .outputs
            .iter()
            .map(|func_output| Output {
                name: func_output.name.clone(),
                socket_type: func_output.socket_type.clone(),
                available: func_output.available,
            })
            .collect();

        Node {
            id: NodeId::unique(),
            func_id: func.id,
            name: func.name.clone(),
            kind: NodeKind::Standard,
            inputs,
            outputs,
        }
    }

    pub fn group_input(outputs: &[(&str, SocketType)]) -> Node {
        Node {
            name: "group input".to_string(),
            kind: NodeKind::GroupInput,
            outputs: outputs
                .iter()
                .map(|(name, socket_type)| Output {
                    name: name.to_string(),
                    socket_type: Some(socket_type.clone()),
                    available: true,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn group_output(inputs: &[(&str, SocketType)]) -> Node {
        Node {
            name: "group output".to_string(),
            kind: NodeKind::GroupOutput,
            inputs: inputs
                .iter()
                .map(|(name, socket_type)| Input {
                    name: name.to_string(),
                    socket_type: Some(socket_type.clone()),
                    is_multi: false,
                    available: true,
                    binding: Binding::None,
                    const_value: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    pub fn reroute(socket_type: SocketType) -> Node {
        Node {
            name: "reroute".to_string(),
            kind: NodeKind::Reroute,
            inputs: vec![Input {
                name: "input".to_string(),
                socket_type: Some(socket_type.clone()),
                is_multi: false,
                available: true,
                binding: Binding::None,
                const_value: None,
            }],
            outputs: vec![Output {
                name: "output".to_string(),
                socket_type: Some(socket_type),
                available: true,
            }],
            ..Default::default()
        }
    }
}

/// Chain of sockets a value passes through on its way from an output to a
/// real target input, including the final input itself.
#[derive(Debug, Default)]
pub struct TargetPath {
    pub sockets: Vec<SocketRef>,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<Node>,
}

impl Graph {
    pub fn add_node(&mut self, node: Node) {
        match self.nodes.iter().position(|n| n.id == node.id) {
            Some(index) => self.nodes[index] = node,
            None => self.nodes.push(node),
        }
    }

    pub fn remove_node_by_id(&mut self, id: NodeId) {
        assert!(!id.is_nil());

        self.nodes.retain(|node| node.id != id);

        for input in self
            .nodes
            .iter_mut()
            .flat_map(|node| node.inputs.iter_mut())
        {
            let rebind = match &mut input.binding {
                Binding::Output(output_binding) => output_binding.output_node_id == id,
                Binding::Multi(bindings) => {
                    bindings.retain(|binding| binding.output_node_id != id);
                    false
                }
                Binding::None | Binding::Const => false,
            };
            if rebind {
                input.binding = input
                    .const_value
                    .as_ref()
                    .map_or(Binding::None, |_| Binding::Const);
            }
        }
    }

    pub fn node_by_id(&self, id: NodeId) -> Option<&Node> {
        assert!(!id.is_nil());
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn input(&self, input: InputRef) -> &Input {
        let node = self
            .node_by_id(input.node_id)
            .expect("Input ref points to a missing node");
        &node.inputs[input.index]
    }

    pub fn output(&self, output: OutputRef) -> &Output {
        let node = self
            .node_by_id(output.node_id)
            .expect("Output ref points to a missing node");
        &node.outputs[output.index]
    }

    pub fn socket_type(&self, socket: SocketRef) -> Option<&SocketType> {
        match socket {
            SocketRef::Input(input) => self.input(input).socket_type.as_ref(),
            SocketRef::Output(output) => self.output(output).socket_type.as_ref(),
        }
    }

    /// Visits the origin socket of every link into `input`, in declared link
    /// order. Reroute chains are resolved to the real producing output; an
    /// unlinked reroute is reported as its own input socket, whose declared
    /// value can be loaded directly.
    pub fn foreach_origin_socket(&self, input: InputRef, mut f: impl FnMut(SocketRef)) {
        match &self.input(input).binding {
            Binding::None | Binding::Const => {}
            Binding::Output(binding) => self.resolve_origin(binding, &mut f),
            Binding::Multi(bindings) => {
                for binding in bindings {
                    self.resolve_origin(binding, &mut f);
                }
            }
        }
    }

    fn resolve_origin<F: FnMut(SocketRef)>(&self, binding: &OutputBinding, f: &mut F) {
        let origin_node = self
            .node_by_id(binding.output_node_id)
            .expect("Binding references a missing node");
        if origin_node.kind == NodeKind::Reroute {
            match &origin_node.inputs[0].binding {
                Binding::Output(next) => self.resolve_origin(next, f),
                _ => f(SocketRef::Input(InputRef::new(origin_node.id, 0))),
            }
        } else {
            f(SocketRef::Output(OutputRef::new(
                origin_node.id,
                binding.output_index,
            )));
        }
    }

    /// Visits every real target input reachable from `from`, once per link,
    /// together with the socket path leading there (through reroutes).
    pub fn foreach_target_socket(
        &self,
        from: OutputRef,
        mut f: impl FnMut(InputRef, &TargetPath),
    ) {
        let mut path = TargetPath::default();
        self.foreach_target_socket_impl(from, &mut path, &mut f);
    }

    fn foreach_target_socket_impl<F: FnMut(InputRef, &TargetPath)>(
        &self,
        from: OutputRef,
        path: &mut TargetPath,
        f: &mut F,
    ) {
        for node in &self.nodes {
            for (input_index, input) in node.inputs.iter().enumerate() {
                let link_count = match &input.binding {
                    Binding::None | Binding::Const => 0,
                    Binding::Output(binding) => usize::from(references(binding, from)),
                    Binding::Multi(bindings) => bindings
                        .iter()
                        .filter(|binding| references(binding, from))
                        .count(),
                };

                for _ in 0..link_count {
                    let target = InputRef::new(node.id, input_index);
                    if node.kind == NodeKind::Reroute {
                        let reroute_output = OutputRef::new(node.id, 0);
                        path.sockets.push(SocketRef::Input(target));
                        path.sockets.push(SocketRef::Output(reroute_output));
                        self.foreach_target_socket_impl(reroute_output, path, f);
                        path.sockets.pop();
                        path.sockets.pop();
                    } else {
                        path.sockets.push(SocketRef::Input(target));
                        f(target, path);
                        path.sockets.pop();
                    }
                }
            }
        }
    }

    pub fn to_yaml(&self) -> String {
        serde_yml::to_string(&self).expect("Failed to serialize graph to YAML")
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Graph> {
        let graph: Graph = serde_yml::from_str(yaml)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen_ids: Vec<NodeId> = Vec::with_capacity(self.nodes.len());

        for node in self.nodes.iter() {
            if node.id.is_nil() {
                anyhow::bail!("Node {:?} has invalid id", node.name);
            }
            if seen_ids.contains(&node.id) {
                anyhow::bail!("Duplicate node id {:?}", node.id);
            }
            seen_ids.push(node.id);

            if node.kind == NodeKind::Standard && !node.inputs.is_empty() && node.func_id.is_nil()
            {
                anyhow::bail!("Node {:?} has inputs but no function id", node.name);
            }
            if node.kind == NodeKind::Reroute
                && (node.inputs.len() != 1 || node.outputs.len() != 1)
            {
                anyhow::bail!("Reroute node {:?} must have one input and one output", node.name);
            }

            // Socket names must be unique within their own category; the same
            // name on an input and an output is fine.
            for sockets in [
                node.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
                node.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            ] {
                for (idx, name) in sockets.iter().enumerate() {
                    if sockets[..idx].contains(name) {
                        anyhow::bail!("Node {:?} has duplicate socket name {:?}", node.name, name);
                    }
                }
            }

            for input in node.inputs.iter() {
                match &input.binding {
                    Binding::None => {}
                    Binding::Const => {
                        if input.const_value.is_none() {
                            anyhow::bail!("Const binding missing const_value");
                        }
                    }
                    Binding::Output(binding) => {
                        if input.is_multi {
                            anyhow::bail!("Multi-input socket requires a multi binding");
                        }
                        self.validate_binding(node.id, binding)?;
                    }
                    Binding::Multi(bindings) => {
                        if !input.is_multi {
                            anyhow::bail!("Multi binding on a single-input socket");
                        }
                        for binding in bindings {
                            self.validate_binding(node.id, binding)?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_binding(&self, node_id: NodeId, binding: &OutputBinding) -> anyhow::Result<()> {
        if binding.output_node_id == node_id {
            anyhow::bail!("Node input connected to the node's own output");
        }
        let Some(origin) = self
            .nodes
            .iter()
            .find(|node| node.id == binding.output_node_id)
        else {
            anyhow::bail!("Node input connected to a non-existent node");
        };
        if binding.output_index >= origin.outputs.len() {
            anyhow::bail!(
                "Node input connected to a non-existent output {} of {:?}",
                binding.output_index,
                origin.name
            );
        }
        Ok(())
    }
}

fn references(binding: &OutputBinding, from: OutputRef) -> bool {
    binding.output_node_id == from.node_id && binding.output_index == from.index
}
