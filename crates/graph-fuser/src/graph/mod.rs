//! Graph adapter: the compiled graph as seen and edited by the fusion pass.

mod adapter;
mod builder;
mod compiled;
mod node;
mod tensor;
pub mod topology;

pub use adapter::{ComplexGroup, GraphAdapter, GraphError};
pub use builder::{ControlEdge, GraphBuilder, GraphDescription};
pub use compiled::CompiledGraph;
pub use node::{ControlKind, EngineClass, Node, NodeAnnotation, NodeId};
pub use tensor::{
    DType, SectionBinding, SectionKind, SectionRange, Tensor, TensorId, WORKSPACE_SECTION_ID,
};
