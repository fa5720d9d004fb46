use serde::Deserialize;
use serde_json::{json, Value};

use super::{parse_args, Tool, ToolContext};
use crate::models::ToolDeclaration;
use crate::search::format_snippets;
use crate::session::ToolPayload;

pub struct WebSearchTool;

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
}

impl Tool for WebSearchTool {
    fn name(&self) -> &'static str { "web_search" }

    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().into(),
            description: "Performs a web search to verify location clues such as shop names, \
                street signs, phone numbers or landmarks."
                .into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query, e.g. a shop name plus a suspected town" }
                },
                "required": ["query"]
            }),
        }
    }

    fn run<'a>(&'a self, ctx: ToolContext<'a>, args: Value) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<ToolPayload>> + Send + 'a>> {
        Box::pin(async move {
            let SearchArgs { query } = parse_args(self.name(), &args)?;
            let query = query.trim();
            if query.is_empty() {
                anyhow::bail!("query must not be empty");
            }
            let limit = ctx.settings.search_top_n;
            let timeout = ctx.settings.search_timeout;
            tracing::debug!(provider = ctx.search.name(), query, "web search");
            let snippets = tokio::time::timeout(timeout, ctx.search.search(query, limit))
                .await
                .map_err(|_| anyhow::anyhow!("search timed out after {}s", timeout.as_secs_f64()))??;
            Ok(ToolPayload::Text { text: format_snippets(&snippets, limit) })
        })
    }
}
