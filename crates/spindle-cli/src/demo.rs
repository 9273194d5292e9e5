//! Demo pipeline: script -> render (rate-limited `video_api`) -> upload.
//!
//! The steps only fabricate result fields; they stand in for the real
//! script generator, video API and upload client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use spindle_core::domain::{
    Pipeline, PipelineBuilder, PipelineError, StageName, StepFailure, StepOutcome,
};
use spindle_core::ports::{StepContext, StepHandler};

pub const VIDEO_API: &str = "video_api";

pub fn pipeline() -> Result<Pipeline, PipelineError> {
    PipelineBuilder::new()
        .step("script")
        .service_step("render", VIDEO_API)
        .step("upload")
        .build()
}

pub fn handlers() -> Vec<(StageName, Arc<dyn StepHandler>)> {
    let script: Arc<dyn StepHandler> = Arc::new(ScriptStep);
    let render: Arc<dyn StepHandler> = Arc::new(RenderStep);
    let upload: Arc<dyn StepHandler> = Arc::new(UploadStep);
    vec![
        (StageName::new("script"), script),
        (StageName::new("render"), render),
        (StageName::new("upload"), upload),
    ]
}

pub fn task_payload(n: usize) -> serde_json::Value {
    json!({
        "title": format!("demo video #{n}"),
        // every fifth task hits a flaky render on its first attempt
        "flaky_render": n % 5 == 0,
    })
}

struct ScriptStep;

#[async_trait]
impl StepHandler for ScriptStep {
    async fn run(&self, ctx: StepContext) -> StepOutcome {
        let Some(title) = ctx.payload.get("title").and_then(|t| t.as_str()) else {
            return StepFailure::validation("payload has no title").into();
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        StepOutcome::success_field("script", json!(format!("A short video about {title}.")))
    }
}

struct RenderStep;

#[async_trait]
impl StepHandler for RenderStep {
    async fn run(&self, ctx: StepContext) -> StepOutcome {
        let flaky = ctx
            .payload
            .get("flaky_render")
            .and_then(|f| f.as_bool())
            .unwrap_or(false);
        if flaky && ctx.attempt == 1 {
            return StepFailure::http(503, "video api unavailable").into();
        }
        if ctx.credentials.is_none() {
            tracing::debug!(tenant = %ctx.tenant_id, "rendering without tenant credentials");
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        StepOutcome::success_field(
            "video_url",
            json!(format!("https://videos.example.test/{}.mp4", ctx.task_id)),
        )
    }
}

struct UploadStep;

#[async_trait]
impl StepHandler for UploadStep {
    async fn run(&self, ctx: StepContext) -> StepOutcome {
        tokio::time::sleep(Duration::from_millis(50)).await;
        StepOutcome::success_field(
            "published_url",
            json!(format!("https://watch.example.test/{}/{}", ctx.tenant_id, ctx.task_id)),
        )
    }
}
