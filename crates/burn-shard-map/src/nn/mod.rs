//! Layers with persistent state.

mod batch_norm;
mod state;

pub use batch_norm::*;
pub use state::*;
