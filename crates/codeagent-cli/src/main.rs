use anyhow::{Result, anyhow};
use clap::Parser;
use codeagent_agent::ReActAgent;
use codeagent_core::{AppConfig, Tool};
use codeagent_llm::HttpLlmClient;
use codeagent_mcp::{McpConfig, McpRegistry, RpcBudget};
use codeagent_memory::ContextCompressor;
use codeagent_observe::Observer;
use codeagent_tools::default_tools;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "codeagent")]
#[command(about = "An autonomous coding agent for the terminal", long_about = None)]
struct Cli {
    /// The task to run. Omit it with --interactive to start a chat session.
    task: Option<String>,

    /// Workspace the agent operates in.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Override the configured step budget.
    #[arg(long)]
    max_steps: Option<usize>,

    /// Override the configured sampling temperature.
    #[arg(long)]
    temperature: Option<f64>,

    /// Print every reasoning step as it happens.
    #[arg(long)]
    show_steps: bool,

    /// Enable verbose logging to stderr.
    #[arg(short, long)]
    verbose: bool,

    /// Skip starting MCP servers even when configured.
    #[arg(long)]
    no_mcp: bool,

    /// Multi-turn mode: keep the conversation open across tasks.
    #[arg(short, long)]
    interactive: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.task.is_none() && !cli.interactive {
        return Err(anyhow!("give a task to run, or pass --interactive"));
    }

    let config = AppConfig::load(&cli.workspace)?;
    let mut observer = Observer::new(&cli.workspace)?;
    observer.set_verbose(cli.verbose);

    let mut registry = if cli.no_mcp {
        None
    } else {
        let mcp_config = McpConfig::load(&cli.workspace.join(&config.mcp.config_path));
        let mut registry = McpRegistry::new(mcp_config, RpcBudget::from(&config.mcp));
        let started = registry.start_all();
        observer.verbose_log(&format!("started {started} mcp server(s)"));
        for (name, running) in registry.server_status() {
            if !running {
                observer.warn_log(&format!("mcp server '{name}' is not running"));
            }
        }
        Some(registry)
    };

    let result = run_agent(&cli, &config, observer, registry.as_ref());
    if let Some(registry) = registry.as_mut() {
        registry.stop_all();
    }
    result
}

fn run_agent(
    cli: &Cli,
    config: &AppConfig,
    observer: Observer,
    registry: Option<&McpRegistry>,
) -> Result<()> {
    let mut tools: Vec<Arc<dyn Tool>> = default_tools(&cli.workspace);
    if let Some(registry) = registry {
        tools.extend(registry.tools());
    }

    let client = HttpLlmClient::new(config.llm.clone())?;
    let mut agent = ReActAgent::new(Box::new(client), tools)?
        .with_max_steps(cli.max_steps.unwrap_or(config.agent.max_steps))
        .with_temperature(cli.temperature.unwrap_or(config.llm.temperature))
        .with_completion_tool(config.agent.completion_tool.clone())
        .with_observer(observer);
    if config.agent.enable_compression {
        agent = agent.with_compressor(ContextCompressor::new(
            config.agent.compress_every,
            config.agent.keep_recent,
        ));
    }
    if cli.show_steps {
        agent = agent.with_step_callback(Box::new(|index, step| {
            println!("[step {index}] {}", step.action);
            if !step.thought.is_empty() {
                println!("  thought: {}", step.thought);
            }
            println!("  observation: {}", step.observation);
        }));
    }

    if let Some(task) = &cli.task {
        let outcome = agent.run(task, None)?;
        println!("{}", outcome.final_answer);
        return Ok(());
    }
    interactive_loop(&mut agent)
}

fn interactive_loop(agent: &mut ReActAgent) -> Result<()> {
    let stdin = std::io::stdin();
    println!("interactive mode. type a task, '/reset' to clear the conversation, 'exit' to quit.");
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let task = line.trim();
        match task {
            "" => continue,
            "exit" | "quit" => return Ok(()),
            "/reset" => {
                agent.reset_conversation();
                println!("conversation cleared");
            }
            task => match agent.run(task, None) {
                Ok(outcome) => println!("{}", outcome.final_answer),
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }
}
