//! Node view used by operation constructors.
//!
//! `NodeView` gives an operation constructor read access to one node's
//! attributes and to the static metadata (shape, element type, constant
//! data) of its input and output tensors.

use crate::graph::{AttributeValue, GraphDesc, NodeDesc, TensorDesc, TensorKind};
use crate::types::ElementType;
use crate::{Error, Result};

/// A node plus the graph it lives in.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    /// The node being constructed.
    pub node: &'a NodeDesc,

    /// The graph containing the node.
    pub graph: &'a GraphDesc,
}

impl<'a> NodeView<'a> {
    /// Create a new node view.
    pub fn new(node: &'a NodeDesc, graph: &'a GraphDesc) -> Self {
        Self { node, graph }
    }

    /// Operation type string.
    pub fn op_type(&self) -> &'a str {
        &self.node.op_type
    }

    /// Node name, falling back to the op type when empty.
    pub fn display_name(&self) -> &'a str {
        if self.node.name.is_empty() {
            &self.node.op_type
        } else {
            &self.node.name
        }
    }

    /// Get the number of inputs to this node.
    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    /// Get the number of outputs from this node.
    pub fn output_count(&self) -> usize {
        self.node.outputs.len()
    }

    /// Get input tensor metadata.
    pub fn input(&self, index: usize) -> Result<&'a TensorDesc> {
        let id = self.node.inputs.get(index).ok_or_else(|| {
            Error::ShapeMismatch(format!(
                "{}: input {index} out of range (node has {} inputs)",
                self.display_name(),
                self.node.inputs.len()
            ))
        })?;
        self.graph.tensor(*id)
    }

    /// Get output tensor metadata.
    pub fn output(&self, index: usize) -> Result<&'a TensorDesc> {
        let id = self.node.outputs.get(index).ok_or_else(|| {
            Error::ShapeMismatch(format!(
                "{}: output {index} out of range (node has {} outputs)",
                self.display_name(),
                self.node.outputs.len()
            ))
        })?;
        self.graph.tensor(*id)
    }

    /// Shape of input `index`.
    pub fn input_shape(&self, index: usize) -> Result<&'a [usize]> {
        Ok(&self.input(index)?.shape)
    }

    /// Element type of input `index`.
    pub fn input_dtype(&self, index: usize) -> Result<ElementType> {
        Ok(self.input(index)?.dtype)
    }

    /// Shape of output `index`.
    pub fn output_shape(&self, index: usize) -> Result<&'a [usize]> {
        Ok(&self.output(index)?.shape)
    }

    /// Element type of output `index`.
    pub fn output_dtype(&self, index: usize) -> Result<ElementType> {
        Ok(self.output(index)?.dtype)
    }

    /// Raw bytes of input `index` if it is a graph constant.
    pub fn constant_input(&self, index: usize) -> Result<Option<&'a [u8]>> {
        let tensor = self.input(index)?;
        Ok(match tensor.kind {
            TensorKind::Constant => tensor.data.as_deref(),
            _ => None,
        })
    }

    /// Decode constant input `index` as integers.
    ///
    /// Supports I32 and I64 constants; returns `None` for runtime inputs.
    pub fn constant_ints(&self, index: usize) -> Result<Option<Vec<i64>>> {
        let Some(bytes) = self.constant_input(index)? else {
            return Ok(None);
        };
        let dtype = self.input_dtype(index)?;
        let values = match dtype {
            ElementType::I64 => bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
            ElementType::I32 => bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                .collect(),
            other => {
                return Err(Error::unsupported_type(
                    other,
                    format!("integer constant input of {}", self.display_name()),
                ))
            }
        };
        Ok(Some(values))
    }

    /// Get a node attribute by name.
    pub fn attr(&self, name: &str) -> Option<&'a AttributeValue> {
        self.node.attributes.get(name)
    }

    /// Get a required i64 attribute.
    pub fn attr_i64(&self, name: &str) -> Result<i64> {
        match self.attr(name) {
            Some(AttributeValue::Int(v)) => Ok(*v),
            _ => Err(Error::Attribute(format!(
                "Missing required i64 attribute '{name}' on {}",
                self.display_name()
            ))),
        }
    }

    /// Get an i64 attribute or a default.
    pub fn attr_i64_or(&self, name: &str, default: i64) -> Result<i64> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttributeValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.type_error(name, "int", other)),
        }
    }

    /// Get an f32 attribute or a default.
    pub fn attr_f32_or(&self, name: &str, default: f32) -> Result<f32> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttributeValue::Float(v)) => Ok(*v),
            Some(AttributeValue::Int(v)) => Ok(*v as f32),
            Some(other) => Err(self.type_error(name, "float", other)),
        }
    }

    /// Get an ints attribute, if present.
    pub fn attr_ints(&self, name: &str) -> Result<Option<&'a [i64]>> {
        match self.attr(name) {
            None => Ok(None),
            Some(AttributeValue::Ints(v)) => Ok(Some(v.as_slice())),
            Some(AttributeValue::Int(v)) => Ok(Some(std::slice::from_ref(v))),
            Some(other) => Err(self.type_error(name, "ints", other)),
        }
    }

    /// Get a string attribute or a default.
    pub fn attr_string_or(&self, name: &str, default: &'a str) -> Result<&'a str> {
        match self.attr(name) {
            None => Ok(default),
            Some(AttributeValue::String(v)) => Ok(v.as_str()),
            Some(other) => Err(self.type_error(name, "string", other)),
        }
    }

    fn type_error(&self, name: &str, expected: &str, found: &AttributeValue) -> Error {
        Error::Attribute(format!(
            "Attribute '{name}' on {} must be {expected}, got {found:?}",
            self.display_name()
        ))
    }
}
