//! Reasoning content detection.
//!
//! Applied to the user input before the reflection pipeline runs. Marker
//! density drives the confidence; below the threshold the pipeline never
//! starts.

use regex::Regex;

pub const DEFAULT_DETECTOR_THRESHOLD: f32 = 0.55;

/// Detection verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub contains_reasoning: bool,
    pub confidence: f32,
}

pub struct ReasoningDetector {
    threshold: f32,
    markers: Vec<(Regex, f32)>,
}

impl ReasoningDetector {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_DETECTOR_THRESHOLD)
    }

    pub fn with_threshold(threshold: f32) -> Self {
        let markers = vec![
            (Regex::new(r"(?i)\bbecause\b").unwrap(), 0.3),
            (Regex::new(r"(?i)\b(?:therefore|thus|hence|so that)\b").unwrap(), 0.35),
            (Regex::new(r"(?i)\bif\b.+\bthen\b").unwrap(), 0.3),
            (Regex::new(r"(?i)\b(?:first|second|third|finally|next)\b[,:]").unwrap(), 0.25),
            (Regex::new(r"(?m)^\s*\d+[.)]\s").unwrap(), 0.3),
            (Regex::new(r"(?i)\b(?:since|given that|it follows)\b").unwrap(), 0.25),
            (Regex::new(r"(?i)\b(?:conclude|conclusion|implies)\b").unwrap(), 0.3),
            (Regex::new(r"(?i)\bstep\s+\d+\b").unwrap(), 0.3),
        ];
        Self { threshold, markers }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Score the text. Short inputs cannot carry a trace worth storing.
    pub fn detect(&self, text: &str) -> Detection {
        if text.trim().len() < 20 {
            return Detection {
                contains_reasoning: false,
                confidence: 0.0,
            };
        }

        let mut confidence: f32 = 0.0;
        for (marker, weight) in &self.markers {
            if marker.is_match(text) {
                confidence += weight;
            }
        }
        let confidence = confidence.min(1.0);

        Detection {
            contains_reasoning: confidence >= self.threshold,
            confidence,
        }
    }
}

impl Default for ReasoningDetector {
    fn default() -> Self {
        Self::new()
    }
}
