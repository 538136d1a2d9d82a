use serde::{Deserialize, Serialize};

/// One labelled span of speech. A transcript is an ordered finite sequence
/// of segments, monotone-nondecreasing in `start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub speaker_id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl TranscriptSegment {
    /// A segment that ends before it starts is a provider bug, not data.
    pub fn is_well_ordered(&self) -> bool {
        self.end_time >= self.start_time
    }
}

/// Compact `[speaker, text]` representation used when feeding a transcript
/// to a refinement provider; timestamps add nothing to high-level analysis.
pub fn compact_pairs(segments: &[TranscriptSegment]) -> Vec<[String; 2]> {
    segments
        .iter()
        .map(|s| [s.speaker_id.clone(), s.text.clone()])
        .collect()
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
    fn inverted_segment_is_rejected() {
        assert!(seg("A", 1.0, 2.0, "hi").is_well_ordered());
        assert!(seg("A", 2.0, 2.0, "hi").is_well_ordered());
        assert!(!seg("A", 3.0, 2.0, "hi").is_well_ordered());
    }

    #[test]
    fn compact_pairs_keep_speaker_and_text_only() {
        let segments = vec![seg("Ada", 0.0, 4.5, "hello"), seg("Ben", 4.5, 6.0, "hey")];
        let pairs = compact_pairs(&segments);
        assert_eq!(
            pairs,
            vec![
                ["Ada".to_string(), "hello".to_string()],
                ["Ben".to_string(), "hey".to_string()]
            ]
        );
    }
}
