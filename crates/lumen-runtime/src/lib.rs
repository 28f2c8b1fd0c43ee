//! Execution driver for compiled Lumen graphs.
//!
//! This crate binds plans from `lumen-compiler` to device memory and runs
//! them request after request.
//!
//! # Architecture
//!
//! The runtime manages three main responsibilities:
//! 1. **Resource setup** - Allocate constants, intermediates and the
//!    workbuffer arenas, then initialize immutable workbuffers once
//! 2. **Dispatch** - Bind caller buffers and enqueue every operation on its
//!    assigned stream, with events across streams
//! 3. **Completion** - Synchronize (or resolve a `RunHandle`) and attribute
//!    deferred device faults to the operation that launched them
//!
//! # Example
//!
//! ```no_run
//! use lumen_runtime::{Runtime, Tensor};
//! use lumen_compiler::CompileOptions;
//! use lumen_core::{ElementType, GraphDesc, NodeDesc};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut graph = GraphDesc::new("relu");
//!     let x = graph.add_input("x", ElementType::F32, &[4]);
//!     let y = graph.add_output("y", ElementType::F32, &[4]);
//!     graph.add_node(NodeDesc::new("Relu").with_io(&[x], &[y]));
//!
//!     let runtime = Runtime::new();
//!     let compiled = runtime.compile(&graph, &CompileOptions::default())?;
//!
//!     let input = Tensor::from_vec(vec![-1.0f32, 2.0, -3.0, 4.0], &[4])?;
//!     let outputs = compiled.run_host(&[input])?;
//!
//!     println!("Result: {:?}", outputs[0].to_vec::<f32>()?);
//!     Ok(())
//! }
//! ```

mod arena;
mod error;
mod graph;
mod handle;
mod runtime;
mod tensor;

// Public exports
pub use arena::DeviceBuffer;
pub use error::{ExecutionErrorKind, Result, RuntimeError};
pub use graph::CompiledGraph;
pub use handle::RunHandle;
pub use lumen_compiler::CompileOptions;
pub use runtime::Runtime;
pub use tensor::Tensor;
