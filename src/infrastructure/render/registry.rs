use std::collections::BTreeMap;
use std::sync::Arc;

use crate::application::ports::Renderer;

/// Renderer plugins keyed by name. GENERATE resolves plugins here and
/// treats their output as opaque bytes; the core never names a concrete
/// renderer type.
#[derive(Default)]
pub struct RendererRegistry {
    renderers: BTreeMap<String, Arc<dyn Renderer>>,
}

impl RendererRegistry {
    pub fn new() -> Self {
        RendererRegistry::default()
    }

    /// Registry preloaded with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = RendererRegistry::new();
        registry.register(Arc::new(super::MarkdownRenderer::new()));
        registry.register(Arc::new(super::SubtitleRenderer::new()));
        registry
    }

    pub fn register(&mut self, renderer: Arc<dyn Renderer>) {
        let name = renderer.name().to_string();
        if self.renderers.insert(name.clone(), renderer).is_some() {
            tracing::warn!(plugin = %name, "overwriting previously registered renderer");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Renderer>> {
        self.renderers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.renderers.keys().cloned().collect()
    }
}
