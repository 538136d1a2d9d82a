use std::fmt::Write;

use crate::application::ports::{RenderError, RenderedArtifact, Renderer};
use crate::domain::{EnrichedContext, TranscriptSegment};

/// Renders SRT subtitle files from the raw transcript. Requires timestamped
/// segments, so jobs in direct mode cannot produce these artifacts.
pub struct SubtitleRenderer;

impl SubtitleRenderer {
    pub fn new() -> Self {
        SubtitleRenderer
    }
}

impl Default for SubtitleRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for SubtitleRenderer {
    fn name(&self) -> &str {
        "subtitles"
    }

    fn extension(&self) -> &str {
        "srt"
    }

    fn needs_transcript(&self) -> bool {
        true
    }

    fn render(
        &self,
        _template_body: &str,
        _context: &EnrichedContext,
        transcript: Option<&[TranscriptSegment]>,
    ) -> Result<RenderedArtifact, RenderError> {
        let segments = transcript.ok_or(RenderError::TranscriptRequired)?;
        if segments.is_empty() {
            return Err(RenderError::TranscriptRequired);
        }

        let mut out = String::new();
        for (index, segment) in segments.iter().enumerate() {
            let _ = write!(
                out,
                "{}\n{} --> {}\n{}: {}\n\n",
                index + 1,
                srt_timestamp(segment.start_time),
                srt_timestamp(segment.end_time),
                segment.speaker_id,
                segment.text.trim()
            );
        }

        Ok(RenderedArtifact {
            bytes: out.into_bytes(),
            suggested_filename: None,
        })
    }
}

fn srt_timestamp(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(speaker: &str, start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            speaker_id: speaker.to_string(),
            start_time: start,
            end_time: end,
            text: text.to_string(),
            confidence: None,
        }
    }

    #[test]
    fn timestamps_follow_srt_format() {
        assert_eq!(srt_timestamp(0.0), "00:00:00,000");
        assert_eq!(srt_timestamp(61.5), "00:01:01,500");
        assert_eq!(srt_timestamp(3725.042), "01:02:05,042");
    }

    #[test]
    fn segments_become_numbered_cues() {
        let renderer = SubtitleRenderer::new();
        let segments = vec![
            seg("Ada", 0.0, 2.5, "Welcome."),
            seg("Ben", 2.5, 4.0, "Thanks."),
        ];

        let out = renderer
            .render("", &EnrichedContext::default(), Some(&segments))
            .unwrap();
        let text = String::from_utf8(out.bytes).unwrap();
        assert!(text.starts_with("1\n00:00:00,000 --> 00:00:02,500\nAda: Welcome.\n"));
        assert!(text.contains("2\n00:00:02,500 --> 00:00:04,000\nBen: Thanks.\n"));
    }

    #[test]
    fn missing_transcript_is_an_error() {
        let renderer = SubtitleRenderer::new();
        let err = renderer
            .render("", &EnrichedContext::default(), None)
            .unwrap_err();
        assert!(matches!(err, RenderError::TranscriptRequired));
    }
}
