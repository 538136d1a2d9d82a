use crate::application::ports::{RenderError, RenderedArtifact, Renderer};
use crate::domain::{EnrichedContext, TranscriptSegment};

/// Renders markdown artifacts by applying the enriched context to a
/// template body.
pub struct MarkdownRenderer {
    env: minijinja::Environment<'static>,
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
        MarkdownRenderer { env }
    }
}

impl Default for MarkdownRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for MarkdownRenderer {
    fn name(&self) -> &str {
        "markdown"
    }

    fn extension(&self) -> &str {
        "md"
    }

    fn render(
        &self,
        template_body: &str,
        context: &EnrichedContext,
        _transcript: Option<&[TranscriptSegment]>,
    ) -> Result<RenderedArtifact, RenderError> {
        let template = self
            .env
            .template_from_str(template_body)
            .map_err(|e| RenderError::Template(e.to_string()))?;
        let rendered = template
            .render(&context.0)
            .map_err(|e| RenderError::Template(e.to_string()))?;

        Ok(RenderedArtifact {
            bytes: rendered.into_bytes(),
            suggested_filename: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(pairs: &[(&str, serde_json::Value)]) -> EnrichedContext {
        let mut ctx = EnrichedContext::default();
        for (key, value) in pairs {
            ctx.insert(key, value.clone());
        }
        ctx
    }

    #[test]
    fn fields_are_substituted_into_the_body() {
        let renderer = MarkdownRenderer::new();
        let ctx = context(&[
            ("summary", json!("Quarterly review")),
            ("participants", json!(["Ada", "Ben"])),
        ]);

        let out = renderer
            .render(
                "# {{ summary }}\n{% for p in participants %}- {{ p }}\n{% endfor %}",
                &ctx,
                None,
            )
            .unwrap();
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.contains("# Quarterly review"));
        assert!(text.contains("- Ada"));
        assert!(text.contains("- Ben"));
    }

    #[test]
    fn missing_fields_render_empty_rather_than_failing() {
        let renderer = MarkdownRenderer::new();
        let out = renderer
            .render("value: {{ absent_field }}", &EnrichedContext::default(), None)
            .unwrap();
        assert_eq!(String::from_utf8(out.bytes).unwrap(), "value: ");
    }

    #[test]
    fn broken_template_reports_a_render_error() {
        let renderer = MarkdownRenderer::new();
        let err = renderer
            .render("{% for x in %}", &EnrichedContext::default(), None)
            .unwrap_err();
        assert!(matches!(err, RenderError::Template(_)));
    }
}
