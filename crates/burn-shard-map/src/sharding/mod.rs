//! Device meshes, partition specs and the ambient mesh context.

mod context;
mod grid;
mod mesh;
mod spec;

pub use context::*;
pub use grid::*;
pub use mesh::*;
pub use spec::*;
