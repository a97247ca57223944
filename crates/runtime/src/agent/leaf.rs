use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use storage::{Event, Role as EventRole};

use super::{AgentInput, Invocation};
use crate::model::{CallPolicy, Message, ModelClient, ModelRequest, Part, Role, ToolResult};
use crate::tools::ToolRegistry;
use crate::{Error, Result};

/// Tool rounds a leaf may run before it must answer with text.
pub const MAX_TOOL_ROUNDS: usize = 1;

/// An agent that calls a model directly.
pub struct LeafAgent {
    pub(super) name: String,
    pub(super) output_slot: String,
    model_id: Option<String>,
    instruction: String,
    tools: ToolRegistry,
    client: Arc<dyn ModelClient>,
    policy: CallPolicy,
}

impl std::fmt::Debug for LeafAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafAgent")
            .field("name", &self.name)
            .field("output_slot", &self.output_slot)
            .field("model_id", &self.model_id)
            .field("provider", &self.client.name())
            .field("tools", &self.tools)
            .finish()
    }
}

/// Builder for [`LeafAgent`].
pub struct LeafAgentBuilder {
    agent: LeafAgent,
}

impl LeafAgentBuilder {
    /// Model identifier passed to the provider; it falls back to its own default.
    pub fn model_id(mut self, model: impl Into<String>) -> Self {
        self.agent.model_id = Some(model.into());
        self
    }

    pub fn instruction(mut self, instruction: impl Into<String>) -> Self {
        self.agent.instruction = instruction.into();
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.agent.tools = tools;
        self
    }

    pub fn policy(mut self, policy: CallPolicy) -> Self {
        self.agent.policy = policy;
        self
    }

    pub fn build(self) -> LeafAgent {
        self.agent
    }
}

impl LeafAgent {
    pub fn builder(
        name: impl Into<String>,
        output_slot: impl Into<String>,
        client: Arc<dyn ModelClient>,
    ) -> LeafAgentBuilder {
        LeafAgentBuilder {
            agent: LeafAgent {
                name: name.into(),
                output_slot: output_slot.into(),
                model_id: None,
                instruction: String::new(),
                tools: ToolRegistry::new(),
                client,
                policy: CallPolicy::default(),
            },
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub(super) async fn run(&self, cx: &Invocation<'_>, input: &AgentInput) -> Result<Value> {
        let mut messages = vec![Message::user(render_input(input))];
        let tools = self.tools.specs();
        let mut rounds = 0;

        loop {
            let request = ModelRequest {
                agent: self.name.clone(),
                model: self.model_id.clone(),
                instruction: self.instruction.clone(),
                messages: messages.clone(),
                tools: tools.clone(),
            };

            let start = cx.now();
            let started = Instant::now();
            let response = self.policy.call(self.client.as_ref(), &request).await;
            cx.span(format!("model:{}", self.name), start);
            let metrics = &cx.telemetry.metrics;
            let agent_label = [("agent", self.name.as_str())];
            metrics.increment_with("model.calls", &agent_label, 1);
            metrics.histogram_record_with(
                "model.latency_ms",
                &agent_label,
                started.elapsed().as_secs_f64() * 1000.0,
            );
            let response =
                response.inspect_err(|_| metrics.increment_with("model.failures", &agent_label, 1))?;

            let calls = response.message.tool_calls();
            if calls.is_empty() {
                let text = response.message.text();
                tracing::debug!(agent = %self.name, rounds, chars = text.len(), "model answered");
                return Ok(parse_output(&text));
            }
            if rounds == MAX_TOOL_ROUNDS {
                return Err(Error::ToolRounds {
                    agent: self.name.clone(),
                    limit: MAX_TOOL_ROUNDS,
                });
            }
            rounds += 1;

            let mut results = Vec::with_capacity(calls.len());
            for call in calls {
                tracing::debug!(agent = %self.name, tool = %call.name, "calling tool");
                let start = cx.now();
                let output = self.tools.call(&call.name, call.input);
                cx.span(format!("tool:{}", call.name), start);
                let tool_labels = [("agent", self.name.as_str()), ("tool", call.name.as_str())];
                metrics.increment_with("tool.calls", &tool_labels, 1);

                let output = match output {
                    Ok(output) => output,
                    Err(source) => {
                        metrics.increment_with("tool.failures", &tool_labels, 1);
                        let mut event = Event::error(
                            self.name.clone(),
                            format!("tool '{}' failed: {source}", call.name),
                        )
                        .suppressed();
                        event.role = EventRole::Tool;
                        cx.sink.emit(event)?;
                        return Err(Error::Tool {
                            tool: call.name,
                            source,
                        });
                    }
                };
                results.push(Part::ToolResult(ToolResult {
                    tool_call_id: call.id,
                    output,
                }));
            }

            messages.push(response.message);
            messages.push(Message {
                role: Role::User,
                parts: results,
            });
        }
    }
}

/// The user turn: the message, then the context as pretty JSON.
fn render_input(input: &AgentInput) -> String {
    if input.context.is_empty() {
        return input.message.clone();
    }
    let context = serde_json::to_string_pretty(&input.context).unwrap_or_default();
    format!("{}\n\nContext:\n{context}", input.message)
}

/// Model text as JSON when it parses, otherwise as a plain string.
fn parse_output(text: &str) -> Value {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);
    serde_json::from_str(unfenced).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agent::testing::RecordingSink;
    use crate::agent::{Agent, Context};
    use crate::model::{ModelError, ToolSpec};
    use crate::providers::ScriptedModel;
    use crate::tools::{Tool, ToolError};
    use telemetry::Telemetry;

    struct Failing;

    impl Tool for Failing {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "failing".into(),
                description: "Always fails.".into(),
                input_schema: json!({"type": "object"}),
                output_schema: json!({"type": "object"}),
            }
        }

        fn call(&self, _input: Value) -> std::result::Result<Value, ToolError> {
            Err(ToolError::Execution("disk on fire".into()))
        }
    }

    fn builtin_tools() -> ToolRegistry {
        crate::tools::builtin::registry().unwrap()
    }

    fn fast() -> CallPolicy {
        CallPolicy {
            max_attempts: 1,
            ..CallPolicy::default()
        }
    }

    async fn invoke(agent: &Agent, input: AgentInput) -> (Result<Value>, RecordingSink, Telemetry) {
        let sink = RecordingSink::default();
        let telemetry = Telemetry::new();
        let result = {
            let cx = Invocation {
                sink: &sink,
                telemetry: &telemetry,
                trace: None,
            };
            agent.invoke(&cx, input, 1).await.map(|o| o.value)
        };
        (result, sink, telemetry)
    }

    #[test]
    fn parse_output_variants() {
        assert_eq!(parse_output(r#" {"a": 1} "#), json!({"a": 1}));
        assert_eq!(parse_output("```json\n[1, 2]\n```"), json!([1, 2]));
        assert_eq!(parse_output("plain words"), json!("plain words"));
    }

    #[test]
    fn context_is_rendered_after_message() {
        let mut context = Context::new();
        context.insert("classification".into(), json!(["a"]));
        let rendered = render_input(&AgentInput::new("Analyze").with_context(context));
        assert!(rendered.starts_with("Analyze\n\nContext:\n"));
        assert!(rendered.contains("\"classification\""));
        assert_eq!(render_input(&AgentInput::new("Analyze")), "Analyze");
    }

    #[tokio::test]
    async fn text_answer_is_published_suppressed() {
        let model = Arc::new(ScriptedModel::new());
        model.push_json(json!({"items": 3}));
        let agent: Agent = LeafAgent::builder("classifier", "classification", model.clone())
            .instruction("Classify.")
            .build()
            .into();

        let (result, sink, telemetry) = invoke(&agent, AgentInput::new("go")).await;
        assert_eq!(result.unwrap(), json!({"items": 3}));

        let state = sink.state.lock().unwrap();
        assert_eq!(state.as_slice(), &[("classification".to_string(), json!({"items": 3}))]);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(!events[0].visible);
        assert!(!events[0].terminal);

        let request = &model.requests()[0];
        assert_eq!(request.instruction, "Classify.");
        assert_eq!(request.agent, "classifier");
        assert_eq!(
            telemetry
                .metrics
                .counter_with("model.calls", &[("agent", "classifier")]),
            1
        );
    }

    #[tokio::test]
    async fn one_tool_round_feeds_result_back() {
        let model = Arc::new(ScriptedModel::new());
        model.push_tool_call(
            "analyze_statistics",
            json!({"questions": [{"topic": "Optics", "bloom_level": "Apply"}]}),
        );
        model.push_json(json!({"mean_difficulty": 2.5, "top_topic": "Optics"}));

        let agent: Agent = LeafAgent::builder("analyst", "analysis", model.clone())
            .tools(builtin_tools().select(&["analyze_statistics"]).unwrap())
            .policy(fast())
            .build()
            .into();

        let (result, _, telemetry) = invoke(&agent, AgentInput::new("stats")).await;
        assert_eq!(result.unwrap()["top_topic"], "Optics");

        let requests = model.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.len(), 1);
        let Part::ToolResult(result) = &requests[1].messages[2].parts[0] else {
            panic!("expected a tool result");
        };
        assert_eq!(result.output["total_questions"], 1);
        assert_eq!(
            telemetry.metrics.counter_with(
                "tool.calls",
                &[("agent", "analyst"), ("tool", "analyze_statistics")]
            ),
            1
        );
    }

    #[tokio::test]
    async fn second_tool_round_is_an_error() {
        let model = Arc::new(ScriptedModel::new());
        model.push_tool_call("analyze_statistics", json!({"questions": []}));
        model.push_tool_call("analyze_statistics", json!({"questions": []}));

        let agent: Agent = LeafAgent::builder("analyst", "analysis", model)
            .tools(builtin_tools())
            .policy(fast())
            .build()
            .into();

        let (result, sink, _) = invoke(&agent, AgentInput::new("stats")).await;
        let err = result.unwrap_err();
        assert!(matches!(err.root_cause(), Error::ToolRounds { limit: 1, .. }));
        assert!(sink.state.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tool_failure_fails_agent_with_error_event() {
        let model = Arc::new(ScriptedModel::new());
        model.push_tool_call("failing", json!({}));
        model.push_text("never used");

        let mut tools = ToolRegistry::new();
        tools.register(Failing).unwrap();
        let agent: Agent = LeafAgent::builder("reader", "document", model.clone())
            .tools(tools)
            .policy(fast())
            .build()
            .into();

        let (result, sink, _) = invoke(&agent, AgentInput::new("read")).await;
        let err = result.unwrap_err();
        assert_eq!(err.agent_path(), vec!["reader"]);
        assert!(matches!(err.root_cause(), Error::Tool { tool, .. } if tool == "failing"));

        // Not retried: the second scripted reply is left over.
        assert_eq!(model.remaining(), 1);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].is_error());
        assert!(!events[0].terminal);
    }

    #[tokio::test]
    async fn model_error_fails_agent() {
        let model = Arc::new(ScriptedModel::new());
        model.push_error(ModelError::InvalidResponse("garbage".into()));
        let agent: Agent = LeafAgent::builder("classifier", "classification", model)
            .policy(fast())
            .build()
            .into();

        let (result, sink, telemetry) = invoke(&agent, AgentInput::new("go")).await;
        assert!(matches!(result.unwrap_err().root_cause(), Error::Model(_)));
        assert!(sink.events.lock().unwrap().is_empty());
        assert_eq!(
            telemetry
                .metrics
                .counter_with("agent.failures", &[("agent", "classifier")]),
            1
        );
    }
}
