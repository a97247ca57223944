//! Model protocol types, client trait and call policy.

pub mod errors;
mod retry;
pub mod types;

pub use errors::ModelError;
pub use retry::CallPolicy;
pub use types::{
    Message, ModelClient, ModelRequest, ModelResponse, Part, Role, ToolCall, ToolResult, ToolSpec,
    Usage,
};
