use anyhow::Result;
use codeagent_core::{
    AgentError, ChatMessage, FINISH_ACTION, PlanStep, Planner, Step, TASK_COMPLETE_TOOL, Tool,
};
use codeagent_llm::{ChatOptions, LlmClient};
use codeagent_memory::ContextCompressor;
use codeagent_observe::Observer;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod prompts;

pub use prompts::build_code_agent_prompt;

const BUDGET_EXHAUSTED: &str = "step budget exhausted, task incomplete";
const MISSING_ARGUMENTS: &str =
    "missing arguments: action_input must be a JSON object of tool arguments.";
const INVALID_ARGUMENTS: &str = "invalid arguments: action_input must be a JSON object.";
const JSON_REMINDER: &str = "respond with a single JSON object with exactly the keys \"thought\", \"action\" and \"action_input\".";

type StepCallback = Box<dyn FnMut(usize, &Step) + Send>;

/// Result of one `run`: the final answer plus every recorded step.
#[derive(Debug)]
pub struct RunOutcome {
    pub final_answer: String,
    pub steps: Vec<Step>,
}

/// The ReAct control loop. Owns the conversation history and a map of
/// tools; everything else (model client, planner, compressor, observer,
/// step callback) is an injected collaborator.
pub struct ReActAgent {
    client: Box<dyn LlmClient>,
    tools: BTreeMap<String, Arc<dyn Tool>>,
    system_prompt: String,
    planner: Option<Box<dyn Planner>>,
    compressor: Option<ContextCompressor>,
    observer: Option<Observer>,
    step_callback: Option<StepCallback>,
    history: Vec<ChatMessage>,
    max_steps: usize,
    temperature: Option<f64>,
    completion_tool: String,
}

impl ReActAgent {
    pub fn new(client: Box<dyn LlmClient>, tools: Vec<Arc<dyn Tool>>) -> Result<Self> {
        if tools.is_empty() {
            return Err(
                AgentError::InvalidInput("the agent needs at least one tool".to_string()).into(),
            );
        }
        let system_prompt = build_code_agent_prompt(&tools);
        let tools = tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        Ok(Self {
            client,
            tools,
            system_prompt,
            planner: None,
            compressor: None,
            observer: None,
            step_callback: None,
            history: Vec::new(),
            max_steps: 200,
            temperature: None,
            completion_tool: TASK_COMPLETE_TOOL.to_string(),
        })
    }

    pub fn with_planner(mut self, planner: Box<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_compressor(mut self, compressor: ContextCompressor) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_step_callback(mut self, callback: StepCallback) -> Self {
        self.step_callback = Some(callback);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_completion_tool(mut self, name: impl Into<String>) -> Self {
        self.completion_tool = name.into();
        self
    }

    /// The conversation so far. Carried across `run` calls until
    /// `reset_conversation`.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Forget the conversation; the next `run` starts fresh.
    pub fn reset_conversation(&mut self) {
        self.history.clear();
    }

    /// Drive the reason-act loop until the model finishes, the completion
    /// tool succeeds, or the step budget runs out. Unknown tools, bad
    /// arguments, tool failures and unparsable replies are all fed back to
    /// the model as observations; only an empty task or a transport
    /// failure is an error.
    pub fn run(&mut self, task: &str, step_budget: Option<usize>) -> Result<RunOutcome> {
        if task.trim().is_empty() {
            return Err(AgentError::InvalidInput("task is empty".to_string()).into());
        }
        let budget = step_budget.unwrap_or(self.max_steps).max(1);

        let mut plan_steps = self.make_plan(task);
        self.history.push(ChatMessage::user(seed_message(
            task,
            self.planner.as_deref(),
            &plan_steps,
        )));

        let options = ChatOptions {
            temperature: self.temperature,
            ..ChatOptions::default()
        };
        let mut steps = Vec::new();

        for index in 1..=budget {
            self.maybe_compress();

            let mut messages = Vec::with_capacity(self.history.len() + 1);
            messages.push(ChatMessage::system(self.system_prompt.clone()));
            messages.extend(self.history.iter().cloned());

            let reply = self.client.chat(&messages, &options)?;
            // Exactly one assistant message per iteration.
            self.history.push(ChatMessage::assistant(reply.clone()));

            let mut step = Step {
                raw: reply.clone(),
                ..Step::default()
            };

            let (thought, action, input) = match parse_react_reply(&reply) {
                Ok(parsed) => parsed,
                Err(detail) => {
                    step.action = "error".to_string();
                    step.observation = format!("could not parse the response as JSON: {detail}");
                    self.history.push(ChatMessage::user(format!(
                        "observation: {}\n{JSON_REMINDER}",
                        step.observation
                    )));
                    self.invoke_callback(index, &step);
                    steps.push(step);
                    continue;
                }
            };
            step.thought = thought;
            step.action = action.clone();
            step.action_input = input.clone();

            if action == FINISH_ACTION {
                let final_answer = coerce_final_answer(&input);
                step.observation = final_answer.clone();
                self.history.push(ChatMessage::user(format!(
                    "final answer recorded: {final_answer}"
                )));
                self.invoke_callback(index, &step);
                steps.push(step);
                return Ok(RunOutcome {
                    final_answer,
                    steps,
                });
            }

            let (executed, observation) = self.dispatch(&action, &input);
            step.observation = observation;
            if executed {
                self.history.push(ChatMessage::user(format!(
                    "executed tool {}, input: {}\nobservation: {}",
                    step.action, step.action_input, step.observation
                )));
                // Only a tool that actually ran can advance the plan.
                self.mark_plan_progress(&mut plan_steps, &action, &step.observation);
            } else {
                self.history.push(ChatMessage::user(format!(
                    "observation: {}",
                    step.observation
                )));
            }
            self.invoke_callback(index, &step);

            let completed = executed
                && action == self.completion_tool
                && !step.observation.starts_with("tool execution failed");
            let observation = step.observation.clone();
            steps.push(step);
            if completed {
                return Ok(RunOutcome {
                    final_answer: observation,
                    steps,
                });
            }
        }

        Ok(RunOutcome {
            final_answer: BUDGET_EXHAUSTED.to_string(),
            steps,
        })
    }

    fn make_plan(&mut self, task: &str) -> Vec<PlanStep> {
        let Some(planner) = self.planner.as_mut() else {
            return Vec::new();
        };
        match planner.plan(task) {
            Ok(steps) => steps,
            Err(e) => {
                if let Some(observer) = &self.observer {
                    observer.warn_log(&format!("planner failed, continuing without a plan: {e}"));
                }
                Vec::new()
            }
        }
    }

    fn maybe_compress(&mut self) {
        let Some(compressor) = self.compressor.as_mut() else {
            return;
        };
        if !compressor.should_compress(&self.history) {
            return;
        }
        let before = self.history.len();
        self.history = compressor.compress(&self.history);
        if let Some(observer) = &self.observer {
            observer.verbose_log(&format!(
                "compressed history from {before} to {} messages",
                self.history.len()
            ));
        }
    }

    /// Resolve and execute one action. Every failure mode comes back as
    /// observation text; the flag says whether a registered tool was
    /// actually invoked.
    fn dispatch(&self, action: &str, input: &Value) -> (bool, String) {
        let Some(tool) = self.tools.get(action) else {
            return (false, format!("unknown tool '{action}'."));
        };

        let args: Map<String, Value> = if action == self.completion_tool {
            match input {
                Value::String(message) => {
                    let mut map = Map::new();
                    map.insert("message".to_string(), Value::String(message.clone()));
                    map
                }
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            }
        } else {
            match input {
                Value::Object(map) => map.clone(),
                Value::Null => return (false, MISSING_ARGUMENTS.to_string()),
                _ => return (false, INVALID_ARGUMENTS.to_string()),
            }
        };

        match tool.execute(&args) {
            Ok(observation) => (true, observation),
            Err(e) => (true, format!("tool execution failed: {e}")),
        }
    }

    /// Mark the first unfinished plan step matching the dispatched action,
    /// both locally and in the planner.
    fn mark_plan_progress(&mut self, plan_steps: &mut [PlanStep], action: &str, observation: &str) {
        let Some(planner) = self.planner.as_mut() else {
            return;
        };
        if let Some(step) = plan_steps
            .iter_mut()
            .find(|s| !s.completed && s.action == action)
        {
            step.completed = true;
            planner.mark_completed(step.step_number, observation);
        }
    }

    fn invoke_callback(&mut self, index: usize, step: &Step) {
        if let Some(callback) = self.step_callback.as_mut() {
            callback(index, step);
        }
    }
}

fn seed_message(task: &str, planner: Option<&dyn Planner>, plan_steps: &[PlanStep]) -> String {
    let mut seed = format!("task: {task}\n");
    if let Some(planner) = planner {
        if !plan_steps.is_empty() {
            seed.push_str(&format!("\nplan:\n{}\n", planner.render()));
        }
    }
    seed.push('\n');
    seed.push_str(JSON_REMINDER);
    seed
}

/// Parse a model reply into (thought, action, action_input). Tries the
/// whole reply as JSON first, then the substring between the first `{`
/// and the last `}` for replies wrapped in prose.
fn parse_react_reply(raw: &str) -> std::result::Result<(String, String, Value), String> {
    let value = match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) => value,
        Err(first_err) => {
            let salvaged = raw
                .find('{')
                .and_then(|start| raw.rfind('}').map(|end| (start, end)))
                .filter(|(start, end)| start < end)
                .map(|(start, end)| &raw[start..=end]);
            match salvaged {
                Some(fragment) => {
                    serde_json::from_str::<Value>(fragment).map_err(|e| e.to_string())?
                }
                None => return Err(first_err.to_string()),
            }
        }
    };

    let Value::Object(map) = value else {
        return Err("the reply is not a JSON object".to_string());
    };
    let action = map
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| "the reply has no string 'action' key".to_string())?
        .to_string();
    let thought = map
        .get("thought")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let input = map.get("action_input").cloned().unwrap_or(Value::Null);
    Ok((thought, action, input))
}

/// The final answer for a `finish` action: a string input verbatim, a
/// mapping's string `answer`, anything else serialized.
fn coerce_final_answer(input: &Value) -> String {
    match input {
        Value::String(answer) => answer.clone(),
        Value::Object(map) => match map.get("answer").and_then(Value::as_str) {
            Some(answer) => answer.to_string(),
            None => Value::Object(map.clone()).to_string(),
        },
        other => other.to_string(),
    }
}
