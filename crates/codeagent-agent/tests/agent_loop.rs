use codeagent_agent::ReActAgent;
use codeagent_core::{ChatMessage, Role, Tool};
use codeagent_memory::{ContextCompressor, SUMMARY_MARKER};
use codeagent_testkit::{EchoTool, FailingTool, ScriptedLlm, ScriptedPlanner};
use codeagent_tools::TaskCompleteTool;
use std::sync::{Arc, Mutex};

fn agent_with<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> ReActAgent {
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(EchoTool),
        Arc::new(FailingTool),
        Arc::new(TaskCompleteTool),
    ];
    ReActAgent::new(Box::new(ScriptedLlm::new(replies)), tools).expect("agent")
}

#[test]
fn immediate_finish_returns_the_answer() {
    let mut agent =
        agent_with([r#"{"thought": "done already", "action": "finish", "action_input": "42"}"#]);
    let outcome = agent.run("what is six times seven", None).expect("run");

    assert_eq!(outcome.final_answer, "42");
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(outcome.steps[0].action, "finish");
    assert_eq!(outcome.steps[0].thought, "done already");
}

#[test]
fn finish_answer_comes_from_the_answer_key() {
    let mut agent = agent_with(
        [r#"{"thought": "t", "action": "finish", "action_input": {"answer": "all set"}}"#],
    );
    let outcome = agent.run("task", None).expect("run");
    assert_eq!(outcome.final_answer, "all set");
}

#[test]
fn unparsable_reply_is_a_recoverable_error_step() {
    let mut agent = agent_with([
        "I think I should look around first.",
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ]);
    let outcome = agent.run("task", None).expect("run");

    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.steps[0].action, "error");
    assert!(outcome.steps[0].observation.contains("JSON"));
    assert_eq!(outcome.final_answer, "ok");
}

#[test]
fn json_is_salvaged_from_surrounding_prose() {
    let mut agent = agent_with([
        "Here you go:\n{\"thought\": \"t\", \"action\": \"finish\", \"action_input\": \"ok\"}\nDone!",
    ]);
    let outcome = agent.run("task", None).expect("run");
    assert_eq!(outcome.final_answer, "ok");
    assert_eq!(outcome.steps.len(), 1);
}

#[test]
fn unknown_tool_becomes_an_observation() {
    let mut agent = agent_with([
        r#"{"thought": "t", "action": "frobnicate", "action_input": {}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ]);
    let outcome = agent.run("task", None).expect("run");

    assert_eq!(outcome.steps[0].observation, "unknown tool 'frobnicate'.");
    assert_eq!(outcome.final_answer, "ok");
}

#[test]
fn tool_failure_becomes_an_observation() {
    let mut agent = agent_with([
        r#"{"thought": "t", "action": "broken", "action_input": {}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ]);
    let outcome = agent.run("task", None).expect("run");

    assert_eq!(outcome.steps[0].observation, "tool execution failed: boom");
    assert_eq!(outcome.final_answer, "ok");
}

#[test]
fn argument_shape_is_validated_before_dispatch() {
    let mut agent = agent_with([
        r#"{"thought": "t", "action": "echo"}"#,
        r#"{"thought": "t", "action": "echo", "action_input": 42}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ]);
    let outcome = agent.run("task", None).expect("run");

    assert!(outcome.steps[0].observation.starts_with("missing arguments"));
    assert!(outcome.steps[1].observation.starts_with("invalid arguments"));
}

#[test]
fn budget_exhaustion_yields_the_fixed_answer() {
    let mut agent = agent_with([r#"{"thought": "t", "action": "echo", "action_input": {"text": "hi"}}"#]);
    let outcome = agent.run("task", Some(1)).expect("run");

    assert_eq!(outcome.final_answer, "step budget exhausted, task incomplete");
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(outcome.steps[0].observation, "hi");
}

#[test]
fn each_iteration_appends_exactly_one_assistant_message() {
    let mut agent = agent_with([
        r#"{"thought": "t", "action": "echo", "action_input": {"text": "hi"}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ]);
    agent.run("task", None).expect("run");

    let assistant_count = agent
        .history()
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .count();
    assert_eq!(assistant_count, 2);

    // seed, assistant, observation, assistant, final marker
    let roles: Vec<Role> = agent.history().iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Assistant,
            Role::User,
            Role::Assistant,
            Role::User
        ]
    );
}

#[test]
fn observation_messages_use_the_executed_tool_format() {
    let mut agent = agent_with([
        r#"{"thought": "t", "action": "echo", "action_input": {"text": "hi"}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ]);
    agent.run("task", None).expect("run");

    let observation = &agent.history()[2];
    assert_eq!(observation.role, Role::User);
    assert!(observation.content.starts_with("executed tool echo, input: "));
    assert!(observation.content.contains("\nobservation: hi"));
}

#[test]
fn empty_task_fails_before_any_llm_call() {
    let client = ScriptedLlm::new([r#"{"action": "finish", "action_input": "x"}"#]);
    let calls = client.calls();
    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
    let mut agent = ReActAgent::new(Box::new(client), tools).expect("agent");

    let err = agent.run("   ", None).expect_err("should fail");
    assert!(err.to_string().contains("invalid input"));
    assert!(calls.lock().expect("lock").is_empty());
    assert!(agent.history().is_empty());
}

#[test]
fn agent_requires_at_least_one_tool() {
    let err = ReActAgent::new(Box::new(ScriptedLlm::new(Vec::<String>::new())), Vec::new())
        .err()
        .expect("should fail");
    assert!(err.to_string().contains("at least one tool"));
}

#[test]
fn completion_tool_string_input_is_coerced_and_terminates() {
    let mut agent = agent_with(
        [r#"{"thought": "t", "action": "task_complete", "action_input": "refactor finished"}"#],
    );
    let outcome = agent.run("task", None).expect("run");

    assert_eq!(outcome.final_answer, "task complete: refactor finished");
    assert_eq!(outcome.steps.len(), 1);
}

#[test]
fn completion_tool_with_odd_input_still_terminates() {
    let mut agent =
        agent_with([r#"{"thought": "t", "action": "task_complete", "action_input": 7}"#]);
    let outcome = agent.run("task", None).expect("run");
    assert_eq!(outcome.final_answer, "task complete");
}

#[test]
fn step_callback_sees_one_based_indices_including_error_steps() {
    let seen: Arc<Mutex<Vec<(usize, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let mut agent = agent_with([
        "not json",
        r#"{"thought": "t", "action": "echo", "action_input": {"text": "hi"}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ])
    .with_step_callback(Box::new(move |index, step| {
        sink.lock().expect("lock").push((index, step.action.clone()));
    }));
    agent.run("task", None).expect("run");

    let seen = seen.lock().expect("lock");
    assert_eq!(
        seen.as_slice(),
        &[
            (1, "error".to_string()),
            (2, "echo".to_string()),
            (3, "finish".to_string())
        ]
    );
}

#[test]
fn unknown_tool_marks_no_plan_step() {
    let planner = ScriptedPlanner::new(&["frobnicate"]);
    let completions = planner.completions();

    let mut agent = agent_with([
        r#"{"thought": "t", "action": "frobnicate", "action_input": {}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ])
    .with_planner(Box::new(planner));
    let outcome = agent.run("task", None).expect("run");

    assert_eq!(outcome.steps[0].observation, "unknown tool 'frobnicate'.");
    assert!(completions.lock().expect("lock").is_empty());
}

#[test]
fn non_dispatched_actions_use_plain_observation_wording() {
    let mut agent = agent_with([
        r#"{"thought": "t", "action": "frobnicate", "action_input": {}}"#,
        r#"{"thought": "t", "action": "echo"}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ]);
    agent.run("task", None).expect("run");

    let unknown = &agent.history()[2];
    assert_eq!(unknown.content, "observation: unknown tool 'frobnicate'.");
    let missing = &agent.history()[4];
    assert!(missing.content.starts_with("observation: missing arguments"));
    assert!(
        agent
            .history()
            .iter()
            .all(|m| !m.content.contains("executed tool frobnicate"))
    );
}

#[test]
fn matching_plan_step_is_marked_completed() {
    let planner = ScriptedPlanner::new(&["echo", "task_complete"]);
    let completions = planner.completions();

    let mut agent = agent_with([
        r#"{"thought": "t", "action": "echo", "action_input": {"text": "hi"}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ])
    .with_planner(Box::new(planner));
    agent.run("task", None).expect("run");

    let completions = completions.lock().expect("lock");
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].0, 1);
    assert_eq!(completions[0].1, "hi");
}

#[test]
fn plan_is_rendered_into_the_seed_message() {
    let planner = ScriptedPlanner::new(&["echo"]);
    let mut agent = agent_with([r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#])
        .with_planner(Box::new(planner));
    agent.run("find the bug", None).expect("run");

    let seed = &agent.history()[0].content;
    assert!(seed.starts_with("task: find the bug"));
    assert!(seed.contains("plan:"));
    assert!(seed.contains("1. echo"));
}

#[test]
fn planner_failure_is_tolerated() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let observer = codeagent_observe::Observer::new(tmp.path()).expect("observer");

    let mut agent = agent_with([r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#])
        .with_planner(Box::new(ScriptedPlanner::failing()))
        .with_observer(observer);
    let outcome = agent.run("task", None).expect("run");

    assert_eq!(outcome.final_answer, "ok");
    assert!(!agent.history()[0].content.contains("plan:"));

    let log = std::fs::read_to_string(tmp.path().join(".codeagent/agent.log")).expect("log");
    assert!(log.contains("planner failed"));
}

#[test]
fn compression_replaces_the_canonical_history() {
    let mut agent = agent_with([
        r#"{"thought": "t", "action": "echo", "action_input": {"text": "one"}}"#,
        r#"{"thought": "t", "action": "echo", "action_input": {"text": "two"}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#,
    ])
    .with_compressor(ContextCompressor::new(2, 1));
    let outcome = agent.run("task", None).expect("run");

    assert_eq!(outcome.final_answer, "ok");
    let summary = agent
        .history()
        .iter()
        .find(|m| m.content.starts_with(SUMMARY_MARKER))
        .expect("summary message");
    assert!(summary.content.contains("echo"));
}

#[test]
fn reset_conversation_supports_a_second_run() {
    let mut agent = agent_with([
        r#"{"thought": "t", "action": "finish", "action_input": "first"}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "second"}"#,
    ]);
    let first = agent.run("task one", None).expect("run");
    assert_eq!(first.final_answer, "first");

    agent.reset_conversation();
    assert!(agent.history().is_empty());

    let second = agent.run("task two", None).expect("run");
    assert_eq!(second.final_answer, "second");
    assert!(agent.history()[0].content.starts_with("task: task two"));
}

#[test]
fn system_prompt_is_prepended_only_at_send_time() {
    let client = ScriptedLlm::new([r#"{"thought": "t", "action": "finish", "action_input": "ok"}"#]);
    let calls = client.calls();
    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
    let mut agent = ReActAgent::new(Box::new(client), tools).expect("agent");
    agent.run("task", None).expect("run");

    let calls = calls.lock().expect("lock");
    assert_eq!(calls.len(), 1);
    let sent: &Vec<ChatMessage> = &calls[0];
    assert_eq!(sent[0].role, Role::System);
    assert!(sent[0].content.contains("- echo:"));
    // The stored history never contains the system prompt.
    assert!(agent.history().iter().all(|m| m.role != Role::System));
}
