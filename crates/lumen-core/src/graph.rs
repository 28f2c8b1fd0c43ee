//! Graph descriptors consumed from the IR producer.
//!
//! A `GraphDesc` is an already topologically ordered list of operation
//! descriptors plus the graph-wide tensor table. Tensor ids double as buffer
//! table indices: every tensor occupies exactly one slot of the table that
//! the execution driver binds per request.

use crate::types::ElementType;
use crate::{Error, Result};
use std::collections::HashMap;

/// Index of a node in the ordered node list.
pub type NodeId = usize;

/// Index of a tensor in the tensor table (and of its buffer-table slot).
pub type TensorId = usize;

/// Ordered operation list plus tensor table.
#[derive(Debug, Clone, Default)]
pub struct GraphDesc {
    /// Operations in execution order.
    pub nodes: Vec<NodeDesc>,

    /// Tensor metadata, indexed by `TensorId`.
    pub tensors: Vec<TensorDesc>,

    /// Tensor ids indexed by name.
    pub names: HashMap<String, TensorId>,

    /// Graph inputs, in the order callers bind them.
    pub inputs: Vec<TensorId>,

    /// Graph outputs, in the order callers bind them.
    pub outputs: Vec<TensorId>,

    /// Graph name (for diagnostics).
    pub name: String,
}

impl GraphDesc {
    /// Create a new empty graph.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Add a tensor to the table.
    pub fn add_tensor(&mut self, desc: TensorDesc) -> TensorId {
        let id = self.tensors.len();
        self.names.insert(desc.name.clone(), id);
        self.tensors.push(desc);
        id
    }

    /// Add a graph input tensor.
    pub fn add_input(&mut self, name: &str, dtype: ElementType, shape: &[usize]) -> TensorId {
        let id = self.add_tensor(TensorDesc::new(name, dtype, shape, TensorKind::Input));
        self.inputs.push(id);
        id
    }

    /// Add a graph output tensor.
    pub fn add_output(&mut self, name: &str, dtype: ElementType, shape: &[usize]) -> TensorId {
        let id = self.add_tensor(TensorDesc::new(name, dtype, shape, TensorKind::Output));
        self.outputs.push(id);
        id
    }

    /// Add an intermediate tensor.
    pub fn add_intermediate(
        &mut self,
        name: &str,
        dtype: ElementType,
        shape: &[usize],
    ) -> TensorId {
        self.add_tensor(TensorDesc::new(
            name,
            dtype,
            shape,
            TensorKind::Intermediate,
        ))
    }

    /// Add a constant tensor with little-endian element bytes.
    pub fn add_constant(
        &mut self,
        name: &str,
        dtype: ElementType,
        shape: &[usize],
        data: Vec<u8>,
    ) -> TensorId {
        let mut desc = TensorDesc::new(name, dtype, shape, TensorKind::Constant);
        desc.data = Some(data);
        self.add_tensor(desc)
    }

    /// Append a node to the ordered list.
    pub fn add_node(&mut self, node: NodeDesc) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(node);
        id
    }

    /// Get tensor metadata by id.
    pub fn tensor(&self, id: TensorId) -> Result<&TensorDesc> {
        self.tensors
            .get(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Invalid tensor ID: {id}")))
    }

    /// Get tensor id by name.
    pub fn tensor_id(&self, name: &str) -> Result<TensorId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidGraph(format!("Missing tensor: {name}")))
    }

    /// Get a node by id.
    pub fn node(&self, id: NodeId) -> Result<&NodeDesc> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::InvalidGraph(format!("Invalid node ID: {id}")))
    }

    /// Nodes that read `tensor`, in list order.
    pub fn consumers(&self, tensor: TensorId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.inputs.contains(&tensor))
            .map(|(id, _)| id)
            .collect()
    }

    /// The node that writes `tensor`, if any.
    pub fn producer(&self, tensor: TensorId) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.outputs.contains(&tensor))
    }

    /// Check if a tensor is one of the graph outputs.
    pub fn is_graph_output(&self, tensor: TensorId) -> bool {
        self.outputs.contains(&tensor)
    }

    /// Validate graph structure.
    ///
    /// Checks that every referenced tensor exists, that each tensor has at
    /// most one producer, that no node reads a tensor before it is produced,
    /// and that every graph output is produced.
    pub fn validate(&self) -> Result<()> {
        for &id in self.inputs.iter().chain(&self.outputs) {
            self.tensor(id)?;
        }

        let mut produced = vec![false; self.tensors.len()];
        for (node_id, node) in self.nodes.iter().enumerate() {
            for &input in &node.inputs {
                let tensor = self.tensor(input)?;
                let available = match tensor.kind {
                    TensorKind::Input | TensorKind::Constant => true,
                    TensorKind::Intermediate | TensorKind::Output => produced[input],
                };
                if !available {
                    return Err(Error::InvalidGraph(format!(
                        "Node {node_id} ('{}') reads tensor '{}' before it is produced",
                        node.name, tensor.name
                    )));
                }
            }
            for &output in &node.outputs {
                let tensor = self.tensor(output)?;
                if matches!(tensor.kind, TensorKind::Input | TensorKind::Constant) {
                    return Err(Error::InvalidGraph(format!(
                        "Node {node_id} ('{}') writes read-only tensor '{}'",
                        node.name, tensor.name
                    )));
                }
                if produced[output] {
                    return Err(Error::InvalidGraph(format!(
                        "Tensor '{}' has more than one producer",
                        tensor.name
                    )));
                }
                produced[output] = true;
            }
        }

        for &output in &self.outputs {
            if !produced[output] {
                return Err(Error::InvalidGraph(format!(
                    "Graph output '{}' is never produced",
                    self.tensors[output].name
                )));
            }
        }

        for tensor in &self.tensors {
            if tensor.kind == TensorKind::Constant {
                let expected = tensor.size_bytes()?;
                let actual = tensor.data.as_ref().map_or(0, Vec::len);
                if actual != expected {
                    return Err(Error::InvalidGraph(format!(
                        "Constant '{}' holds {actual} bytes, expected {expected}",
                        tensor.name
                    )));
                }
            }
        }

        Ok(())
    }
}

/// An operation descriptor.
#[derive(Debug, Clone)]
pub struct NodeDesc {
    /// Node name (may be empty).
    pub name: String,

    /// Operation type (e.g., "Convolution", "Add", "ReduceMax").
    pub op_type: String,

    /// Input tensor ids, in argument order.
    pub inputs: Vec<TensorId>,

    /// Output tensor ids, in argument order.
    pub outputs: Vec<TensorId>,

    /// Node attributes.
    pub attributes: HashMap<String, AttributeValue>,
}

impl NodeDesc {
    /// Create a new node.
    pub fn new(op_type: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            op_type: op_type.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            attributes: HashMap::new(),
        }
    }

    /// Set the node name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set input and output tensors.
    pub fn with_io(mut self, inputs: &[TensorId], outputs: &[TensorId]) -> Self {
        self.inputs = inputs.to_vec();
        self.outputs = outputs.to_vec();
        self
    }

    /// Add an attribute.
    pub fn with_attr(mut self, name: &str, value: AttributeValue) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    /// Check if an attribute exists.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }
}

/// Attribute value types.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

/// Kind of tensor (determines storage and lifetime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorKind {
    /// Graph input (bound by the caller per request).
    Input,

    /// Graph output (bound by the caller per request).
    Output,

    /// Constant data uploaded once at compile time.
    Constant,

    /// Value produced and consumed inside the graph.
    Intermediate,
}

/// Information about a tensor.
#[derive(Debug, Clone)]
pub struct TensorDesc {
    /// Tensor name.
    pub name: String,

    /// Element type.
    pub dtype: ElementType,

    /// Static shape.
    pub shape: Vec<usize>,

    /// Tensor kind.
    pub kind: TensorKind,

    /// Raw little-endian element bytes (constants only).
    pub data: Option<Vec<u8>>,
}

impl TensorDesc {
    /// Create a tensor descriptor without data.
    pub fn new(name: &str, dtype: ElementType, shape: &[usize], kind: TensorKind) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            shape: shape.to_vec(),
            kind,
            data: None,
        }
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size in bytes on the device.
    pub fn size_bytes(&self) -> Result<usize> {
        Ok(self.num_elements() * self.dtype.size()?)
    }
}
