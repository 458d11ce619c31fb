use crate::contract::{
    ResponseContract, RouteContract, RouteRequest, StreamHandler, SyncHandler, SyncResponse,
};
use crate::dispatch::Responder;
use crate::error::{Error, ErrorKind};
use crate::negotiate::Mode;
use crate::schema::{FnSchema, RequiredFields, Schema, Typed, ValidationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sse::{BoxError, Message};
use std::time::Duration;

pub const MAX_STEPS: u32 = 100;

/// Simulated work per step.
const STEP_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize, Serialize)]
pub struct TaskParams {
    pub steps: u32,
}

fn validate_params(value: &Value) -> Result<Value, ValidationError> {
    let value = Typed::<TaskParams>::new().validate(value)?;
    match value["steps"].as_u64() {
        Some(steps) if (1..=u64::from(MAX_STEPS)).contains(&steps) => Ok(value),
        _ => Err(ValidationError::new(format!(
            "steps must be between 1 and {MAX_STEPS}"
        ))),
    }
}

fn params(request: &RouteRequest) -> Result<TaskParams, serde_json::Error> {
    serde_json::from_value(request.body.clone())
}

/// POST /tasks: runs `steps` units of work, answering with the final result
/// or streaming `progress` events and a closing `done` event.
pub(crate) fn contract() -> RouteContract {
    RouteContract::dual_with_body(
        FnSchema(validate_params),
        ResponseContract::new(RequiredFields::new(&["steps", "status"])),
        RunToCompletion,
        RunWithProgress,
    )
    .event("progress", RequiredFields::new(&["step", "of"]))
    .event("done", RequiredFields::new(&["steps", "status"]))
    .default_mode(Mode::Sync)
}

fn done(steps: u32) -> Value {
    json!({ "steps": steps, "status": "done" })
}

struct RunToCompletion;

#[async_trait]
impl SyncHandler for RunToCompletion {
    async fn handle(&self, request: RouteRequest) -> Result<SyncResponse, Error> {
        let TaskParams { steps } = params(&request)
            .map_err(|e| Error::new(ErrorKind::InvalidBody(e.to_string())))?;
        for _ in 0..steps {
            tokio::time::sleep(STEP_DELAY).await;
        }
        Ok(SyncResponse::ok(done(steps)))
    }
}

struct RunWithProgress;

#[async_trait]
impl StreamHandler for RunWithProgress {
    async fn handle(&self, request: RouteRequest, responder: &mut Responder) -> Result<(), BoxError> {
        let TaskParams { steps } = params(&request)?;
        let stream = responder.start().await?;

        for step in 1..=steps {
            tokio::time::sleep(STEP_DELAY).await;
            let progress = Message::new(json!({ "step": step, "of": steps })).with_event("progress");
            if !stream.send(progress) {
                // Client went away
                return Ok(());
            }
        }
        stream.send(Message::new(done(steps)).with_event("done"));
        Ok(())
    }
}
