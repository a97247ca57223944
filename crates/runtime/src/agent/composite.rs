use serde_json::Value;

use super::{Agent, AgentInput, AgentOutput, Invocation};
use crate::Result;

/// An agent that delegates to its children, one after another.
///
/// Each child sees the original context plus the slots written by every
/// child before it. The result is the last child's value; a failing child
/// fails the whole composite with nothing merged.
#[derive(Debug)]
pub struct CompositeAgent {
    pub(super) name: String,
    pub(super) output_slot: String,
    pub(super) children: Vec<Agent>,
}

impl CompositeAgent {
    pub fn new(name: impl Into<String>, output_slot: impl Into<String>, children: Vec<Agent>) -> Self {
        Self {
            name: name.into(),
            output_slot: output_slot.into(),
            children,
        }
    }

    pub(super) async fn run<'a>(
        &'a self,
        cx: &'a Invocation<'a>,
        input: AgentInput,
        depth: usize,
    ) -> Result<AgentOutput> {
        let mut context = input.context;
        let mut slots = Vec::new();
        let mut last = Value::Null;

        for child in &self.children {
            tracing::debug!(agent = %self.name, child = child.name(), "delegating");
            let child_input = AgentInput {
                message: input.message.clone(),
                context: context.clone(),
            };
            let output = child.invoke(cx, child_input, depth + 1).await?;

            for (slot, value) in &output.slots {
                context.insert(slot.clone(), value.clone());
            }
            slots.extend(output.slots);
            last = output.value;
        }

        Ok(AgentOutput { value: last, slots })
    }
}
