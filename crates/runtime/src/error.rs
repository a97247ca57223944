use thiserror::Error;

use crate::model::ModelError;
use crate::tools::{RegistryError, ToolError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid agent tree or credentials. Raised before any run starts.
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Session(#[from] storage::SessionError),

    #[error(transparent)]
    Memory(#[from] storage::MemoryError),

    #[error("model call failed: {0}")]
    Model(#[from] ModelError),

    #[error("tool '{tool}' failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("{agent} requested tools after {limit} tool round(s)")]
    ToolRounds { agent: String, limit: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A failure inside an agent, tagged with the agent's name.
    #[error("{agent}: {source}")]
    Agent {
        agent: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The innermost error, past every agent wrapper.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::Agent { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Agent names from the outermost wrapper inward.
    pub fn agent_path(&self) -> Vec<&str> {
        let mut path = Vec::new();
        let mut current = self;
        while let Self::Agent { agent, source } = current {
            path.push(agent.as_str());
            current = source.as_ref();
        }
        path
    }
}

pub type Result<T> = std::result::Result<T, Error>;
