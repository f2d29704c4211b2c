//! Error handling for the MCP control plane.

mod error;

pub use error::{ControlPlaneError, Result};
