//! Tool trait.

use crate::model::ToolSpec;
use crate::tools::ToolError;
use serde_json::Value;

/// A named, synchronous capability an agent can call.
///
/// This is the boundary between the model loop and side effects.
pub trait Tool: Send + Sync {
    /// The declared contract. Must be stable for the lifetime of the tool.
    fn spec(&self) -> ToolSpec;

    /// Execute with already-validated input.
    fn call(&self, input: Value) -> Result<Value, ToolError>;
}
