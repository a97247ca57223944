//! Model provider adapters.
//!
//! Each provider implements [`ModelClient`](crate::model::ModelClient) for its API.

mod anthropic;
mod mock;
mod scripted;

pub use anthropic::{AnthropicAuth, AnthropicModel, AnthropicModelBuilder};
pub use mock::MockModel;
pub use scripted::ScriptedModel;
