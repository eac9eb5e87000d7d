use codeagent_agent::ReActAgent;
use codeagent_mcp::{McpConfig, McpRegistry, McpServerConfig, RpcBudget};
use codeagent_testkit::{ScriptedLlm, write_fake_mcp_server};
use std::time::Duration;

#[test]
fn remote_tools_are_driven_through_the_loop() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let script = write_fake_mcp_server(tmp.path()).expect("script");

    let mut config = McpConfig::default();
    config.servers.insert(
        "fake".to_string(),
        McpServerConfig {
            command: "sh".to_string(),
            args: vec![script.to_string_lossy().into_owned()],
            env: None,
            enabled: true,
        },
    );
    let mut registry = McpRegistry::new(
        config,
        RpcBudget {
            attempts: 40,
            interval: Duration::from_millis(50),
        },
    );
    assert_eq!(registry.start_all(), 1);

    let client = ScriptedLlm::new([
        r#"{"thought": "t", "action": "mcp_fake_ping", "action_input": {}}"#,
        r#"{"thought": "t", "action": "finish", "action_input": "done"}"#,
    ]);
    let mut agent = ReActAgent::new(Box::new(client), registry.tools()).expect("agent");
    let outcome = agent.run("ping the capability server", None).expect("run");

    assert_eq!(outcome.steps[0].action, "mcp_fake_ping");
    assert_eq!(outcome.steps[0].observation, "pong");
    assert_eq!(outcome.final_answer, "done");
    registry.stop_all();
}
