use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::image_store::{ImageReference, ImageStore};
use crate::models::ToolDeclaration;
use crate::search::SearchProvider;
use crate::session::{ToolPayload, ToolResult};
use crate::settings::EffectiveSettings;
use crate::telemetry;

pub mod crop_image;
pub mod web_search;

pub struct ToolContext<'a> {
    pub images: &'a ImageStore,
    pub search: &'a dyn SearchProvider,
    /// The session's target image; crops are always taken from it.
    pub source: &'a ImageReference,
    pub settings: &'a EffectiveSettings,
}

#[derive(Debug, Error)]
pub enum ToolArgsError {
    #[error("invalid arguments for {tool}: {reason}")]
    Invalid { tool: &'static str, reason: String },
}

/// Decode `args` into the tool's argument schema. Extra fields are ignored;
/// missing or mistyped required fields are an error.
pub fn parse_args<T: DeserializeOwned>(tool: &'static str, args: &Value) -> Result<T, ToolArgsError> {
    serde_json::from_value(args.clone()).map_err(|e| ToolArgsError::Invalid { tool, reason: e.to_string() })
}

pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn declaration(&self) -> ToolDeclaration;
    fn run<'a>(&'a self, ctx: ToolContext<'a>, args: Value) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ToolPayload>> + Send + 'a>>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self { Self { tools: Vec::new() } }
    pub fn with_default_tools() -> Self {
        let mut r = Self::new();
        r.register(Box::new(crop_image::CropImageTool));
        r.register(Box::new(web_search::WebSearchTool));
        r
    }
    pub fn register(&mut self, t: Box<dyn Tool>) { self.tools.push(t); }
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().map(|b| b.as_ref()).find(|t| t.name() == name)
    }
    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.iter().map(|t| t.declaration()).collect()
    }

    /// Run `name` with `args`. Never fails: unknown tools, bad arguments and
    /// execution errors all come back as a failed `ToolResult` for the model
    /// to read.
    pub async fn execute(&self, ctx: ToolContext<'_>, name: &str, args: Value) -> ToolResult {
        let Some(tool) = self.get(name) else {
            warn!(tool = name, "unknown tool requested");
            return ToolResult::failure(
                name,
                format!("Unknown tool `{}`. Available tools: {}.", name, self.names().join(", ")),
            );
        };
        match tool.run(ctx, args).await {
            Ok(payload) => {
                metrics::counter!(telemetry::TOOL_CALLS_TOTAL, "tool" => tool.name(), "ok" => "true").increment(1);
                ToolResult::success(tool.name(), payload)
            }
            Err(e) => {
                metrics::counter!(telemetry::TOOL_CALLS_TOTAL, "tool" => tool.name(), "ok" => "false").increment(1);
                warn!(tool = tool.name(), error = %e, "tool failed");
                ToolResult::failure(tool.name(), format!("Error: {e:#}"))
            }
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::with_default_tools() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{FakeSearch, Fixture};
    use serde_json::json;

    #[tokio::test]
    async fn unknown_tool_is_a_failure_result() {
        let fx = Fixture::new(100, 100);
        let search = FakeSearch::empty();
        let registry = ToolRegistry::with_default_tools();
        let res = registry.execute(fx.ctx(&search), "street_view", json!({})).await;
        assert!(!res.ok);
        assert_eq!(res.tool, "street_view");
        assert!(res.payload.text().contains("Unknown tool `street_view`"));
        assert!(res.payload.text().contains("crop_image, web_search"));
    }

    #[tokio::test]
    async fn malformed_args_are_a_failure_result() {
        let fx = Fixture::new(100, 100);
        let search = FakeSearch::empty();
        let registry = ToolRegistry::with_default_tools();
        let res = registry.execute(fx.ctx(&search), "web_search", json!({"q": 3})).await;
        assert!(!res.ok);
        assert!(res.payload.text().contains("invalid arguments for web_search"));
        let res = registry.execute(fx.ctx(&search), "crop_image", json!({"region": "top left"})).await;
        assert!(!res.ok);
        assert!(res.payload.text().contains("invalid arguments for crop_image"));
    }

    #[test]
    fn declarations_cover_registered_tools() {
        let registry = ToolRegistry::default();
        let decls = registry.declarations();
        let names: Vec<&str> = decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["crop_image", "web_search"]);
        assert!(decls.iter().all(|d| d.parameters["type"] == "object"));
    }

    #[test]
    fn parse_args_ignores_extra_fields() {
        #[derive(serde::Deserialize)]
        struct A { query: String }
        let a: A = parse_args("t", &json!({"query": "x", "extra": 1})).unwrap();
        assert_eq!(a.query, "x");
        assert!(parse_args::<A>("t", &json!({})).is_err());
    }
}
