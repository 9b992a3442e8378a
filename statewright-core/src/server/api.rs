//! HTTP API: definitions, executions and task-token completion

use crate::models::definition::StateMachineDefinition;
use crate::models::execution::{ErrorInfo, Execution, ExecutionStatus};
use crate::workflow::callback_registry::{CallbackError, CallbackOutcome};
use crate::workflow::orchestrator::{Orchestrator, OrchestratorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::Filter;

const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;

/// API error types
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    ValidationError(String),
    Internal(String),
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::NotFound(m)
            | ApiError::Conflict(m)
            | ApiError::ValidationError(m)
            | ApiError::Internal(m) => m,
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::DefinitionNotFound(_)
            | OrchestratorError::ExecutionNotFound(_)
            | OrchestratorError::Callback(CallbackError::UnknownToken(_)) => {
                ApiError::NotFound(message)
            }
            OrchestratorError::Callback(CallbackError::AlreadyResolved(_)) => {
                ApiError::Conflict(message)
            }
            OrchestratorError::InvalidDefinition(_) => ApiError::ValidationError(message),
            OrchestratorError::Timeout(_)
            | OrchestratorError::Callback(CallbackError::Store(_))
            | OrchestratorError::Internal(_) => {
                tracing::error!("API request failed: {}", message);
                ApiError::Internal(message)
            }
        }
    }
}

fn reject(err: OrchestratorError) -> warp::Rejection {
    warp::reject::custom(ApiError::from(err))
}

/// Request body for POST /api/v1/executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    pub definition: String,
    #[serde(default = "empty_object")]
    pub input: Value,
}

fn empty_object() -> Value {
    json!({})
}

/// Response for a started execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartExecutionResponse {
    pub execution_id: Uuid,
    pub definition: String,
}

/// Request body for POST /api/v1/executions/:id/stop
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub cause: Option<String>,
}

/// Request body for POST /api/v1/callbacks/:token/success
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSuccessRequest {
    #[serde(default)]
    pub output: Value,
}

/// Request body for POST /api/v1/callbacks/:token/failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailureRequest {
    pub error: String,
    #[serde(default)]
    pub cause: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListExecutionsQuery {
    pub status: Option<ExecutionStatus>,
}

/// Row of GET /api/v1/executions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub definition_id: String,
    pub status: ExecutionStatus,
    pub current_state: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl From<&Execution> for ExecutionSummary {
    fn from(execution: &Execution) -> Self {
        Self {
            id: execution.id,
            definition_id: execution.definition_id.clone(),
            status: execution.status,
            current_state: execution.current_state().to_string(),
            started_at: execution.started_at,
            updated_at: execution.updated_at,
            error: execution.error.clone(),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub definitions: usize,
    pub pending_callbacks: usize,
    pub pending_timers: usize,
}

fn with_orchestrator(
    orchestrator: Orchestrator,
) -> impl Filter<Extract = (Orchestrator,), Error = Infallible> + Clone {
    warp::any().map(move || orchestrator.clone())
}

fn json_body<T: serde::de::DeserializeOwned + Send>(
) -> impl Filter<Extract = (T,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

/// Create HTTP API routes
pub fn create_api_routes(
    orchestrator: Orchestrator,
) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
    let health = warp::path!("api" / "v1" / "health")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_health);

    let list_definitions = warp::path!("api" / "v1" / "definitions")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_list_definitions);

    let get_definition = warp::path!("api" / "v1" / "definitions" / String)
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_get_definition);

    let put_definition = warp::path!("api" / "v1" / "definitions" / String)
        .and(warp::put())
        .and(json_body::<StateMachineDefinition>())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_put_definition);

    let start_execution = warp::path!("api" / "v1" / "executions")
        .and(warp::post())
        .and(json_body::<StartExecutionRequest>())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_start_execution);

    let list_executions = warp::path!("api" / "v1" / "executions")
        .and(warp::get())
        .and(warp::query::<ListExecutionsQuery>())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_list_executions);

    let get_execution = warp::path!("api" / "v1" / "executions" / Uuid)
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_get_execution);

    let get_history = warp::path!("api" / "v1" / "executions" / Uuid / "history")
        .and(warp::get())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_get_history);

    let stop_execution = warp::path!("api" / "v1" / "executions" / Uuid / "stop")
        .and(warp::post())
        .and(json_body::<StopRequest>())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_stop_execution);

    let task_success = warp::path!("api" / "v1" / "callbacks" / String / "success")
        .and(warp::post())
        .and(json_body::<TaskSuccessRequest>())
        .and(with_orchestrator(orchestrator.clone()))
        .and_then(handle_task_success);

    let task_failure = warp::path!("api" / "v1" / "callbacks" / String / "failure")
        .and(warp::post())
        .and(json_body::<TaskFailureRequest>())
        .and(with_orchestrator(orchestrator))
        .and_then(handle_task_failure);

    health
        .or(list_definitions)
        .or(get_definition)
        .or(put_definition)
        .or(start_execution)
        .or(list_executions)
        .or(get_execution)
        .or(get_history)
        .or(stop_execution)
        .or(task_success)
        .or(task_failure)
        .recover(handle_rejection)
}

/// Handle GET /api/v1/health
async fn handle_health(orchestrator: Orchestrator) -> Result<impl warp::Reply, warp::Rejection> {
    let definitions = orchestrator.list_definitions().map_err(reject)?.len();
    let response = HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        definitions,
        pending_callbacks: orchestrator.callbacks().pending().len(),
        pending_timers: orchestrator.pending_timers(),
    };
    Ok(warp::reply::json(&response))
}

/// Handle GET /api/v1/definitions
async fn handle_list_definitions(
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let names = orchestrator.list_definitions().map_err(reject)?;
    Ok(warp::reply::json(&json!({ "definitions": names })))
}

/// Handle GET /api/v1/definitions/:name
async fn handle_get_definition(
    name: String,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let definition = orchestrator.get_definition(&name).map_err(reject)?;
    Ok(warp::reply::json(&definition))
}

/// Handle PUT /api/v1/definitions/:name
async fn handle_put_definition(
    name: String,
    definition: StateMachineDefinition,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    if definition.name != name {
        return Err(warp::reject::custom(ApiError::ValidationError(format!(
            "definition name '{}' does not match path '{}'",
            definition.name, name
        ))));
    }
    let machine = orchestrator.register_definition(definition).map_err(reject)?;
    Ok(warp::reply::json(&json!({
        "name": machine.name(),
        "warnings": machine.warnings(),
    })))
}

/// Handle POST /api/v1/executions
async fn handle_start_execution(
    request: StartExecutionRequest,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let execution_id = orchestrator
        .start_execution(&request.definition, request.input)
        .map_err(reject)?;
    Ok(warp::reply::with_status(
        warp::reply::json(&StartExecutionResponse {
            execution_id,
            definition: request.definition,
        }),
        StatusCode::CREATED,
    ))
}

/// Handle GET /api/v1/executions
async fn handle_list_executions(
    query: ListExecutionsQuery,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let executions = orchestrator
        .list_executions(query.status)
        .map_err(reject)?;
    let summaries: Vec<ExecutionSummary> = executions.iter().map(ExecutionSummary::from).collect();
    Ok(warp::reply::json(&summaries))
}

/// Handle GET /api/v1/executions/:id
async fn handle_get_execution(
    id: Uuid,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let execution = orchestrator.get_execution(id).map_err(reject)?;
    Ok(warp::reply::json(&execution))
}

/// Handle GET /api/v1/executions/:id/history
async fn handle_get_history(
    id: Uuid,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let history = orchestrator.history(id).map_err(reject)?;
    Ok(warp::reply::json(&history))
}

/// Handle POST /api/v1/executions/:id/stop
async fn handle_stop_execution(
    id: Uuid,
    request: StopRequest,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    let execution = orchestrator
        .stop_execution(id, request.cause)
        .await
        .map_err(reject)?;
    Ok(warp::reply::json(&ExecutionSummary::from(&execution)))
}

/// Handle POST /api/v1/callbacks/:token/success
async fn handle_task_success(
    token: String,
    request: TaskSuccessRequest,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    orchestrator
        .complete_task(&token, CallbackOutcome::Success(request.output))
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({ "token": token, "accepted": true })))
}

/// Handle POST /api/v1/callbacks/:token/failure
async fn handle_task_failure(
    token: String,
    request: TaskFailureRequest,
    orchestrator: Orchestrator,
) -> Result<impl warp::Reply, warp::Rejection> {
    if request.error.is_empty() {
        return Err(warp::reject::custom(ApiError::ValidationError(
            "error code must not be empty".to_string(),
        )));
    }
    let error = ErrorInfo::new(request.error, request.cause);
    orchestrator
        .complete_task(&token, CallbackOutcome::Failure(error))
        .map_err(reject)?;
    Ok(warp::reply::json(&json!({ "token": token, "accepted": true })))
}

/// Turn rejections into JSON error bodies
async fn handle_rejection(rejection: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
    let (status, message) = if let Some(err) = rejection.find::<ApiError>() {
        (err.status(), err.message().to_string())
    } else if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "route not found".to_string())
    } else if let Some(err) = rejection.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("invalid request body: {}", err))
    } else if let Some(err) = rejection.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, err.to_string())
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
    } else if rejection.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "request body too large".to_string())
    } else {
        tracing::warn!("Unhandled rejection: {:?}", rejection);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}
