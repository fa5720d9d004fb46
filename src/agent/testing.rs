//! Fakes shared by the agent and server tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use super::engine::Services;
use super::tools::{ToolContext, ToolRegistry};
use crate::image_store::tests::gradient_image;
use crate::image_store::{ImageReference, ImageStore};
use crate::models::{LanguageModel, ModelError, ModelReply, ModelRequest};
use crate::search::{SearchError, SearchProvider, SearchSnippet};
use crate::settings::EffectiveSettings;

pub(crate) struct FakeSearch {
    results: Vec<SearchSnippet>,
    delay: Option<Duration>,
    fail: bool,
    queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub(crate) fn empty() -> Self {
        Self::with_results(Vec::new())
    }

    pub(crate) fn with_results(results: Vec<SearchSnippet>) -> Self {
        Self { results, delay: None, fail: false, queries: Mutex::new(Vec::new()) }
    }

    pub(crate) fn failing() -> Self {
        Self { fail: true, ..Self::empty() }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchProvider for FakeSearch {
    fn name(&self) -> &str {
        "fake"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchSnippet>, SearchError> {
        self.queries.lock().unwrap().push(query.to_string());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.fail {
            return Err(SearchError::Status { status: 503, body: "unavailable".into() });
        }
        Ok(self.results.iter().take(max_results).cloned().collect())
    }
}

/// A store in a temp dir holding one gradient source image.
pub(crate) struct Fixture {
    _dir: TempDir,
    pub(crate) store: ImageStore,
    pub(crate) source: ImageReference,
    pub(crate) settings: EffectiveSettings,
}

impl Fixture {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path()).unwrap();
        let source = gradient_image(&store, "target.png", width, height);
        let settings = EffectiveSettings { static_dir: dir.path().to_path_buf(), ..Default::default() };
        Self { _dir: dir, store, source, settings }
    }

    pub(crate) fn ctx<'a>(&'a self, search: &'a dyn SearchProvider) -> ToolContext<'a> {
        ToolContext { images: &self.store, search, source: &self.source, settings: &self.settings }
    }

    /// Process-wide services over this fixture's store and settings.
    pub(crate) fn services(&self, model: Arc<dyn LanguageModel>, search: Arc<dyn SearchProvider>) -> Services {
        Services {
            model,
            search,
            tools: Arc::new(ToolRegistry::with_default_tools()),
            images: self.store.clone(),
            settings: Arc::new(self.settings.clone()),
        }
    }
}

/// Replays canned replies in order, then keeps answering with a plain thought.
pub(crate) struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelReply, ModelError>>>,
    fallback: ModelReply,
    delay: Option<Duration>,
    calls: AtomicUsize,
    history_lens: Mutex<Vec<usize>>,
}

impl ScriptedModel {
    pub(crate) fn new(script: Vec<Result<ModelReply, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: ModelReply::Thought { text: "Still thinking.".into() },
            delay: None,
            calls: AtomicUsize::new(0),
            history_lens: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// History length observed by each call, in order.
    pub(crate) fn history_lens(&self) -> Vec<usize> {
        self.history_lens.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, req: &ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history_lens.lock().unwrap().push(req.history.len());
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}
