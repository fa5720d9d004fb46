use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geometry::Dimensions;

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-exp";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TAVILY_BASE_URL: &str = "https://api.tavily.com";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LoopPolicies {
    pub max_turns: Option<u32>,
    pub model_retries: Option<u32>,
    pub model_retry_backoff_ms: Option<u64>,
    pub model_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SearchPolicies {
    pub timeout_secs: Option<u64>,
    pub top_n: Option<usize>,
    pub depth: Option<String>,
}

/// One source of configuration. Built-in defaults, the environment and
/// command-line overrides are each a layer; later layers win field by field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SettingsLayer {
    pub model: Option<String>,
    pub model_base_url: Option<String>,
    pub gemini_api_key: Option<String>,
    pub model_params: Option<ModelParams>,
    pub loop_policies: Option<LoopPolicies>,
    pub search_base_url: Option<String>,
    pub tavily_api_key: Option<String>,
    pub search: Option<SearchPolicies>,
    /// Size of the coordinate space the model reasons in.
    pub shown_dimensions: Option<Dimensions>,
    pub static_dir: Option<String>,
    pub listen: Option<String>,
}

impl SettingsLayer {
    pub fn builtin() -> Self {
        Self {
            model: Some(DEFAULT_MODEL.into()),
            model_base_url: Some(DEFAULT_GEMINI_BASE_URL.into()),
            gemini_api_key: None,
            model_params: Some(ModelParams::default()),
            loop_policies: Some(LoopPolicies {
                max_turns: Some(10),
                model_retries: Some(2),
                model_retry_backoff_ms: Some(500),
                model_timeout_secs: Some(120),
            }),
            search_base_url: Some(DEFAULT_TAVILY_BASE_URL.into()),
            tavily_api_key: None,
            search: Some(SearchPolicies {
                timeout_secs: Some(15),
                top_n: Some(3),
                depth: Some("advanced".into()),
            }),
            shown_dimensions: Some(Dimensions::new(1000, 1000)),
            static_dir: Some("static".into()),
            listen: Some("127.0.0.1:8000".into()),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get = |k: &str| get(k).filter(|v| !v.trim().is_empty());
        let loop_policies = LoopPolicies {
            max_turns: parse_num(get("RECON_MAX_TURNS")),
            model_retries: parse_num(get("RECON_MODEL_RETRIES")),
            model_retry_backoff_ms: None,
            model_timeout_secs: parse_num(get("RECON_MODEL_TIMEOUT_SECS")),
        };
        let search = SearchPolicies {
            timeout_secs: parse_num(get("RECON_SEARCH_TIMEOUT_SECS")),
            top_n: parse_num(get("RECON_SEARCH_TOP_N")),
            depth: None,
        };
        Self {
            model: get("MODEL_NAME"),
            model_base_url: get("GEMINI_BASE_URL"),
            gemini_api_key: get("GEMINI_API_KEY"),
            model_params: None,
            loop_policies: Some(loop_policies),
            search_base_url: get("TAVILY_BASE_URL"),
            tavily_api_key: get("TAVILY_API_KEY"),
            search: Some(search),
            shown_dimensions: None,
            static_dir: get("RECON_STATIC_DIR"),
            listen: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSettings {
    pub model: String,
    pub model_base_url: String,
    pub gemini_api_key: Option<String>,
    pub model_params: ModelParams,
    pub max_turns: u32,
    pub model_retries: u32,
    pub model_retry_backoff: Duration,
    pub model_timeout: Duration,
    pub search_base_url: String,
    pub tavily_api_key: Option<String>,
    pub search_timeout: Duration,
    pub search_top_n: usize,
    pub search_depth: String,
    pub shown_dimensions: Dimensions,
    pub static_dir: PathBuf,
    pub listen: String,
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        resolve_effective_settings(&SettingsLayer::builtin(), &SettingsLayer::default(), &SettingsLayer::default())
    }
}

/// Values that do not fit the target type are dropped, not truncated.
fn parse_num<T: std::str::FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|v| v.trim().parse().ok())
}

fn pick<T: Clone>(request: Option<&T>, env: Option<&T>, global: Option<&T>) -> Option<T> {
    request.or(env).or(global).cloned()
}

pub fn resolve_effective_settings(
    global: &SettingsLayer,
    env: &SettingsLayer,
    request: &SettingsLayer,
) -> EffectiveSettings {
    let layers = [request, env, global];

    let model_params = ModelParams {
        temperature: layers.iter().find_map(|l| l.model_params.as_ref().and_then(|p| p.temperature)),
        max_tokens: layers.iter().find_map(|l| l.model_params.as_ref().and_then(|p| p.max_tokens)),
        top_p: layers.iter().find_map(|l| l.model_params.as_ref().and_then(|p| p.top_p)),
    };

    let lp = |f: fn(&LoopPolicies) -> Option<u64>| {
        layers.iter().find_map(|l| l.loop_policies.as_ref().and_then(f))
    };
    let sp = |f: fn(&SearchPolicies) -> Option<u64>| layers.iter().find_map(|l| l.search.as_ref().and_then(f));

    let max_turns = lp(|p| p.max_turns.map(u64::from)).unwrap_or(10) as u32;
    let model_retries = lp(|p| p.model_retries.map(u64::from)).unwrap_or(2) as u32;
    let backoff_ms = lp(|p| p.model_retry_backoff_ms).unwrap_or(500);
    let model_timeout_secs = lp(|p| p.model_timeout_secs).unwrap_or(120);
    let search_timeout_secs = sp(|p| p.timeout_secs).unwrap_or(15);
    let search_top_n = sp(|p| p.top_n.map(|v| v as u64)).unwrap_or(3) as usize;
    let search_depth = layers
        .iter()
        .find_map(|l| l.search.as_ref().and_then(|p| p.depth.clone()))
        .unwrap_or_else(|| "advanced".into());

    EffectiveSettings {
        model: pick(request.model.as_ref(), env.model.as_ref(), global.model.as_ref())
            .unwrap_or_else(|| DEFAULT_MODEL.into()),
        model_base_url: pick(request.model_base_url.as_ref(), env.model_base_url.as_ref(), global.model_base_url.as_ref())
            .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.into()),
        gemini_api_key: pick(request.gemini_api_key.as_ref(), env.gemini_api_key.as_ref(), global.gemini_api_key.as_ref()),
        model_params,
        max_turns: max_turns.max(1),
        model_retries,
        model_retry_backoff: Duration::from_millis(backoff_ms),
        model_timeout: Duration::from_secs(model_timeout_secs),
        search_base_url: pick(request.search_base_url.as_ref(), env.search_base_url.as_ref(), global.search_base_url.as_ref())
            .unwrap_or_else(|| DEFAULT_TAVILY_BASE_URL.into()),
        tavily_api_key: pick(request.tavily_api_key.as_ref(), env.tavily_api_key.as_ref(), global.tavily_api_key.as_ref()),
        search_timeout: Duration::from_secs(search_timeout_secs),
        search_top_n: search_top_n.max(1),
        search_depth,
        shown_dimensions: pick(request.shown_dimensions.as_ref(), env.shown_dimensions.as_ref(), global.shown_dimensions.as_ref())
            .filter(|d| d.width > 0 && d.height > 0)
            .unwrap_or(Dimensions::new(1000, 1000)),
        static_dir: PathBuf::from(
            pick(request.static_dir.as_ref(), env.static_dir.as_ref(), global.static_dir.as_ref())
                .unwrap_or_else(|| "static".into()),
        ),
        listen: pick(request.listen.as_ref(), env.listen.as_ref(), global.listen.as_ref())
            .unwrap_or_else(|| "127.0.0.1:8000".into()),
    }
}
