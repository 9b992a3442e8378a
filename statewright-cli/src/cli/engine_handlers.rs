//! Commands that run the engine in this process: validate, run and serve

use anyhow::{Context, Result};
use serde_json::{json, Value};
use statewright_core::models::{
    Configuration, Execution, ExecutionStatus, LogLevel, StateDefinition, StateMachineDefinition,
    TaskMode,
};
use statewright_core::server::api::create_api_routes;
use statewright_core::server::StatewrightServer;
use statewright_core::services::init_logging;
use statewright_core::workflow::{
    compile, CommandExecutor, EngineSettings, ExecutionStore, ExecutorRegistry, JsonFileStore,
    MemoryStore, Orchestrator, SystemClock,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Resource name the server binds the command executor to
pub const COMMAND_RESOURCE: &str = "command";

/// Parse `--input`: inline JSON, `@path` to a JSON file, or `{}` when absent
pub fn parse_input(raw: Option<&str>) -> Result<Value> {
    match raw {
        None => Ok(json!({})),
        Some(raw) => {
            let content = match raw.strip_prefix('@') {
                Some(path) => std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read input file {}", path))?,
                None => raw.to_string(),
            };
            serde_json::from_str(&content).context("Input is not valid JSON")
        }
    }
}

/// Resources named by task states, nested branches included, and whether any
/// of them runs in callback mode
pub fn task_resources(definition: &StateMachineDefinition) -> (BTreeSet<String>, bool) {
    fn walk(states: &[StateDefinition], resources: &mut BTreeSet<String>, callbacks: &mut bool) {
        for state in states {
            match state {
                StateDefinition::Task(task) => {
                    resources.insert(task.resource.clone());
                    *callbacks |= task.mode == TaskMode::Callback;
                }
                StateDefinition::Parallel(parallel) => {
                    for branch in &parallel.branches {
                        walk(&branch.states, resources, callbacks);
                    }
                }
                _ => {}
            }
        }
    }

    let mut resources = BTreeSet::new();
    let mut callbacks = false;
    walk(&definition.states, &mut resources, &mut callbacks);
    (resources, callbacks)
}

fn load_configuration(path: Option<PathBuf>) -> Result<Configuration> {
    let path = match path {
        Some(path) => path,
        None => Configuration::default_config_path()
            .map_err(|e| anyhow::anyhow!("Failed to get default config path: {}", e))?,
    };
    Configuration::load_from_file(&path)
        .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e))
}

/// Handle the 'validate' command
pub async fn handle_validate(file: PathBuf, json: bool) -> Result<()> {
    let definition = StateMachineDefinition::load_from_file(&file)?;
    let result = compile(&definition);

    if json {
        let output = match &result {
            Ok(machine) => json!({
                "valid": true,
                "name": definition.name,
                "states": definition.states.len(),
                "warnings": machine.warnings(),
            }),
            Err(e) => json!({
                "valid": false,
                "name": definition.name,
                "error": e.to_string(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Validating state machine: {}", definition.name);
        println!("File: {}", file.display());
        println!();
        match &result {
            Ok(machine) => {
                println!("✓ Definition is valid");
                println!();
                println!("Summary:");
                println!("  Name:         {}", definition.name);
                if let Some(description) = &definition.description {
                    println!("  Description:  {}", description);
                }
                println!("  Start state:  {}", definition.start_at);
                println!("  Total states: {}", definition.states.len());
                if !machine.warnings().is_empty() {
                    println!();
                    println!("Warnings:");
                    for warning in machine.warnings() {
                        println!("  ⚠  {}", warning);
                    }
                }
            }
            Err(e) => println!("✗ {}", e),
        }
    }

    result
        .map(|_| ())
        .context("State machine validation failed")
}

/// Handle the 'run' command: execute a definition locally until it finishes
pub async fn handle_run(
    file: PathBuf,
    input: Option<String>,
    store: Option<PathBuf>,
    timeout: u64,
    verbose: bool,
    json: bool,
) -> Result<()> {
    let level = if verbose { LogLevel::Debug } else { LogLevel::Warn };
    if let Err(e) = init_logging(level) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    let definition = StateMachineDefinition::load_from_file(&file)?;
    let input = parse_input(input.as_deref())?;
    let execution = run_local(definition, input, store.as_deref(), Duration::from_secs(timeout)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        print_execution(&execution);
    }

    match execution.status {
        ExecutionStatus::Succeeded => Ok(()),
        _ => anyhow::bail!("Execution {} did not succeed", execution.id),
    }
}

/// Run one execution on an in-process orchestrator and return it once terminal.
///
/// Every task resource is served by a [`CommandExecutor`]. When callback
/// tasks are present the completion API is bound to an ephemeral local port
/// and handed to the jobs through their environment.
pub async fn run_local(
    definition: StateMachineDefinition,
    input: Value,
    store_path: Option<&Path>,
    timeout: Duration,
) -> Result<Execution> {
    let store: Arc<dyn ExecutionStore> = match store_path {
        Some(path) => Arc::new(JsonFileStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    };
    let orchestrator = Orchestrator::new(
        store,
        ExecutorRegistry::new(),
        Arc::new(SystemClock),
        EngineSettings::from(&Configuration::default()),
    )?;

    let (resources, has_callbacks) = task_resources(&definition);
    let mut executor = CommandExecutor::new();
    let mut api_task = None;
    if has_callbacks {
        let routes = create_api_routes(orchestrator.clone());
        let (address, server) = warp::serve(routes)
            .try_bind_ephemeral(([127, 0, 0, 1], 0))
            .context("Failed to bind the completion API")?;
        let url = format!("http://{}", address);
        eprintln!("Completion API listening on {}", url);
        executor = executor.callback_url(url);
        api_task = Some(tokio::spawn(server));
    }
    let executor = Arc::new(executor);
    for resource in resources {
        orchestrator.executors().register(resource, executor.clone());
    }

    let name = definition.name.clone();
    orchestrator.register_definition(definition)?;
    let timer_task = orchestrator.spawn_timer_loop(Duration::from_millis(100));
    let id = orchestrator.start_execution(&name, input)?;

    let result = orchestrator.wait_for_completion(id, timeout).await;
    timer_task.abort();
    if let Some(task) = api_task {
        task.abort();
    }
    Ok(result?)
}

fn print_execution(execution: &Execution) {
    println!("Execution:     {}", execution.id);
    println!("Definition:    {}", execution.definition_id);
    println!("Status:        {}", execution.status);
    println!("Final state:   {}", execution.current_state());
    if let Some(completed_at) = execution.completed_at {
        let millis = (completed_at - execution.started_at).num_milliseconds();
        println!("Duration:      {} ms", millis);
    }
    if let Some(output) = &execution.output {
        println!("Output:");
        println!(
            "{}",
            serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string())
        );
    }
    if let Some(error) = &execution.error {
        println!("Error:         {}", error.error);
        println!("Cause:         {}", error.cause);
    }
}

/// Handle the 'serve' command
pub async fn handle_serve(
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    definitions: Option<PathBuf>,
) -> Result<()> {
    let mut config = load_configuration(config)?;
    if let Some(host) = host {
        config.server_host = host;
    }
    if let Some(port) = port {
        config.server_port = port;
    }
    if definitions.is_some() {
        config.definitions_dir = definitions;
    }
    if let Err(errors) = config.validate() {
        anyhow::bail!("Invalid configuration:\n  {}", errors.join("\n  "));
    }

    if let Err(e) = init_logging(config.log_level) {
        eprintln!("Warning: failed to initialize logging: {}", e);
    }

    let executors = ExecutorRegistry::new();
    executors.register(
        COMMAND_RESOURCE,
        Arc::new(CommandExecutor::new().callback_url(format!(
            "http://{}:{}",
            config.server_host, config.server_port
        ))),
    );
    let orchestrator = Orchestrator::from_config(&config, executors)?;

    StatewrightServer::new(config, orchestrator).start().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(yaml: &str) -> StateMachineDefinition {
        StateMachineDefinition::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_parse_input_variants() {
        assert_eq!(parse_input(None).unwrap(), json!({}));
        assert_eq!(parse_input(Some(r#"{"a": 1}"#)).unwrap(), json!({"a": 1}));
        assert!(parse_input(Some("{not json")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.json");
        std::fs::write(&path, r#"[1, 2]"#).unwrap();
        let arg = format!("@{}", path.display());
        assert_eq!(parse_input(Some(&arg)).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_task_resources_walk_branches() {
        let (resources, callbacks) = task_resources(&definition(
            r#"
name: nested
start_at: Fork
states:
  - type: parallel
    name: Fork
    branches:
      - start_at: A
        states:
          - {type: task, name: A, resource: build, end: true}
      - start_at: B
        states:
          - {type: task, name: B, resource: review, mode: callback, end: true}
    next: Ship
  - {type: task, name: Ship, resource: build, end: true}
"#,
        ));
        assert_eq!(
            resources.into_iter().collect::<Vec<_>>(),
            vec!["build", "review"]
        );
        assert!(callbacks);
    }

    #[tokio::test]
    async fn test_run_local_executes_commands() {
        let execution = run_local(
            definition(
                r#"
name: local
start_at: Greet
states:
  - {type: pass, name: Greet, result: "echo hi", result_path: $.command, next: Shell}
  - {type: task, name: Shell, resource: sh, result_path: $.job, end: true}
"#,
            ),
            json!({}),
            None,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        let output = execution.output.unwrap();
        assert_eq!(output["job"]["stdout"], json!("hi"));
        assert_eq!(output["job"]["exit_code"], json!(0));
    }
}
