//! Commands that talk to a running server

use super::client::ApiClient;
use super::engine_handlers::parse_input;
use anyhow::{Context, Result};
use serde_json::json;
use statewright_core::models::{StateMachineDefinition, TransitionRecord};
use std::path::PathBuf;
use uuid::Uuid;

fn parse_execution_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).context("Invalid execution ID format (expected UUID)")
}

/// Handle the 'definitions' command
pub async fn handle_definitions(server: String, json: bool) -> Result<()> {
    let client = ApiClient::new(&server)?;
    let names = client.list_definitions().await?;

    if json {
        let output = json!({ "definitions": names, "count": names.len() });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if names.is_empty() {
        println!("No state machines registered.");
        println!();
        println!("Register one with 'statewright deploy <file>'.");
    } else {
        println!("Registered state machines:");
        for name in names {
            println!("  • {}", name);
        }
    }
    Ok(())
}

/// Handle the 'deploy' command
pub async fn handle_deploy(file: PathBuf, server: String, json: bool) -> Result<()> {
    let definition = StateMachineDefinition::load_from_file(&file)?;
    let client = ApiClient::new(&server)?;
    let warnings = client.put_definition(&definition).await?;

    if json {
        let output = json!({ "name": definition.name, "warnings": warnings });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✅ Registered '{}'", definition.name);
        for warning in warnings {
            println!("  ⚠  {}", warning);
        }
    }
    Ok(())
}

/// Handle the 'start' command
pub async fn handle_start(
    definition: String,
    input: Option<String>,
    server: String,
    json: bool,
) -> Result<()> {
    let input = parse_input(input.as_deref())?;
    let client = ApiClient::new(&server)?;
    let execution_id = client.start_execution(&definition, input).await?;

    if json {
        let output = json!({ "execution_id": execution_id, "definition": definition });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("✅ Started '{}'", definition);
        println!("   Execution ID: {}", execution_id);
        println!();
        println!("Use 'statewright status {}' to check progress", execution_id);
    }
    Ok(())
}

/// Handle the 'list' command
pub async fn handle_list(server: String, json: bool) -> Result<()> {
    let client = ApiClient::new(&server)?;
    let executions = client.list_executions().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&executions)?);
        return Ok(());
    }
    if executions.is_empty() {
        println!("No executions.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<20}  {:<10}  {}",
        "ID", "DEFINITION", "STATUS", "STATE"
    );
    for execution in executions {
        println!(
            "{:<36}  {:<20}  {:<10}  {}",
            execution.id, execution.definition_id, execution.status, execution.current_state
        );
    }
    Ok(())
}

/// Handle the 'status' command
pub async fn handle_status(execution_id: String, server: String, json: bool) -> Result<()> {
    let id = parse_execution_id(&execution_id)?;
    let client = ApiClient::new(&server)?;
    let execution = client.get_execution(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
        return Ok(());
    }

    println!("Execution Status");
    println!("================");
    println!("Execution ID:   {}", execution.id);
    println!("Definition:     {}", execution.definition_id);
    println!("Current State:  {}", execution.current_state());
    println!("Status:         {}", execution.status);
    println!(
        "Started At:     {}",
        execution.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(completed_at) = execution.completed_at {
        println!(
            "Completed At:   {}",
            completed_at.format("%Y-%m-%d %H:%M:%S")
        );
        let duration = (completed_at - execution.started_at).num_seconds();
        println!("Duration:       {} seconds", duration);
    }
    let tokens = execution.root.pending_tokens();
    if !tokens.is_empty() {
        println!();
        println!("Waiting on task tokens:");
        for token in tokens {
            println!("  {}", token);
        }
    }
    if let Some(error) = &execution.error {
        println!();
        println!("Error:          {}", error.error);
        println!("Cause:          {}", error.cause);
    }
    if let Some(output) = &execution.output {
        println!();
        println!("Output:");
        println!("{}", serde_json::to_string_pretty(output)?);
    }
    Ok(())
}

fn describe(record: &TransitionRecord) -> String {
    let mut line = format!(
        "#{:<4} {:<8} {:<10}",
        record.sequence,
        record.branch.to_string(),
        format!("{:?}", record.kind)
    );
    match (&record.from_state, &record.to_state) {
        (Some(from), Some(to)) => line.push_str(&format!(" {} -> {}", from, to)),
        (None, Some(to)) => line.push_str(&format!(" -> {}", to)),
        (Some(from), None) => line.push_str(&format!(" {}", from)),
        (None, None) => {}
    }
    if let Some(attempt) = record.attempt {
        line.push_str(&format!(" (attempt {})", attempt));
    }
    if let Some(error) = &record.error {
        line.push_str(&format!(" [{}: {}]", error.error, error.cause));
    }
    line
}

/// Handle the 'history' command
pub async fn handle_history(execution_id: String, server: String, json: bool) -> Result<()> {
    let id = parse_execution_id(&execution_id)?;
    let client = ApiClient::new(&server)?;
    let history = client.history(id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }
    println!("History of {}", id);
    for record in &history {
        println!(
            "  {}  {}",
            record.timestamp.format("%H:%M:%S%.3f"),
            describe(record)
        );
    }
    Ok(())
}

/// Handle the 'stop' command
pub async fn handle_stop(
    execution_id: String,
    cause: Option<String>,
    server: String,
    json: bool,
) -> Result<()> {
    let id = parse_execution_id(&execution_id)?;
    let client = ApiClient::new(&server)?;
    let summary = client.stop_execution(id, cause).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Execution {} is {}", summary.id, summary.status);
        if let Some(error) = summary.error {
            println!("  {}: {}", error.error, error.cause);
        }
    }
    Ok(())
}

/// Handle the 'complete' command
pub async fn handle_complete(token: String, output: Option<String>, server: String) -> Result<()> {
    let output = match output {
        Some(raw) => parse_input(Some(&raw))?,
        None => serde_json::Value::Null,
    };
    let client = ApiClient::new(&server)?;
    client.complete_task(&token, output).await?;
    println!("✅ Task token {} completed", token);
    Ok(())
}

/// Handle the 'fail' command
pub async fn handle_fail(
    token: String,
    error: String,
    cause: Option<String>,
    server: String,
) -> Result<()> {
    let client = ApiClient::new(&server)?;
    client
        .fail_task(&token, error.clone(), cause.unwrap_or_default())
        .await?;
    println!("Task token {} failed with {}", token, error);
    Ok(())
}
