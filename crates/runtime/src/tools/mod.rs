//! Tool contracts, registry and built-in tools.

pub mod builtin;
pub mod errors;
mod registry;
mod r#trait;

pub use errors::{RegistryError, ToolError};
pub use registry::ToolRegistry;
pub use r#trait::Tool;
