//! Fact extraction from interaction text.
//!
//! High-confidence pattern matching only; low-signal messages produce
//! nothing rather than polluting the memory collection.

use regex::Regex;

/// A fact extracted from one interaction, destined for the knowledge
/// memory.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFact {
    pub text: String,
    pub tags: Vec<String>,
    pub code_pattern: Option<String>,
    /// Extraction confidence; the decision engine produces its own.
    pub confidence: f32,
    /// Pattern that matched.
    pub source: String,
}

/// Pattern-based fact extractor.
pub struct FactExtractor {
    patterns: Vec<(Regex, String, f32)>,
    code_fence: Regex,
}

const KNOWN_TOPICS: &[&str] = &[
    "python", "rust", "javascript", "typescript", "go", "java", "c++", "sql", "bash", "docker",
    "kubernetes", "git", "linux", "react", "postgres", "sqlite", "http", "json", "yaml",
];

impl FactExtractor {
    pub fn new() -> Self {
        let patterns = vec![
            // Domain knowledge statements ("In Python, def defines a function.")
            (
                Regex::new(r"(?i)\bin\s+([A-Za-z][A-Za-z+#.]*)\s*,\s*(.{5,240})").unwrap(),
                "domain_knowledge".to_string(),
                0.85,
            ),
            // Definitions ("X is a Y", "X defines Y")
            (
                Regex::new(r"(?i)\b([`A-Za-z_][\w`.]{1,40})\s+(?:is|are|defines?|means?|returns?)\s+(?:a|an|the)?\s*(.{4,200})").unwrap(),
                "definition".to_string(),
                0.75,
            ),
            // Explicit preferences
            (
                Regex::new(r"(?i)(?:i prefer|i like|i always want|i never want|always use|never use)\s+(.{3,200})").unwrap(),
                "preference".to_string(),
                0.9,
            ),
            // Identity/context
            (
                Regex::new(r"(?i)(?:my name is|i work as|i'm working on|this project uses|we are building)\s+(.{2,150})").unwrap(),
                "context".to_string(),
                0.85,
            ),
            // Constraints
            (
                Regex::new(r"(?i)(?:must be|needs to be|has to be|should always)\s+(.{3,150})").unwrap(),
                "constraint".to_string(),
                0.85,
            ),
        ];
        Self {
            patterns,
            code_fence: Regex::new(r"`([^`]{2,120})`").unwrap(),
        }
    }

    /// Quick filter to skip obviously low-signal lines.
    pub fn should_extract(&self, text: &str) -> bool {
        let text = text.trim();
        if text.len() < 10 {
            return false;
        }
        if text.ends_with('?') {
            return false;
        }
        let lower = text.to_lowercase();
        if lower.starts_with("hi") || lower.starts_with("hello") || lower.starts_with("hey") {
            return false;
        }
        if ["ok", "okay", "got it", "thanks", "thank you"]
            .iter()
            .any(|&s| lower == s)
        {
            return false;
        }
        true
    }

    /// Extract facts from the ordered interaction lines.
    pub fn extract(&self, lines: &[String]) -> Vec<ExtractedFact> {
        let mut facts = Vec::new();
        for line in lines {
            if !self.should_extract(line) {
                continue;
            }
            for (regex, source, base_confidence) in &self.patterns {
                if let Some(cap) = regex.captures(line) {
                    // Keep the whole sentence as the fact; captures inform
                    // tags and confidence.
                    let text = line.trim().trim_end_matches('.').to_string();
                    let confidence = self.adjust_confidence(*base_confidence, &text);
                    if confidence < 0.6 {
                        continue;
                    }
                    let mut tags = self.infer_tags(line);
                    if source == "domain_knowledge" {
                        if let Some(topic) = cap.get(1) {
                            let topic = topic.as_str().to_lowercase();
                            if !tags.contains(&topic) {
                                tags.insert(0, topic);
                            }
                        }
                    }
                    facts.push(ExtractedFact {
                        text,
                        tags,
                        code_pattern: self.code_pattern(line),
                        confidence,
                        source: source.clone(),
                    });
                    break;
                }
            }
        }
        self.deduplicate(facts)
    }

    fn infer_tags(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        KNOWN_TOPICS
            .iter()
            .filter(|topic| lower.contains(*topic))
            .map(|t| t.to_string())
            .collect()
    }

    fn code_pattern(&self, text: &str) -> Option<String> {
        self.code_fence
            .captures(text)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().to_string())
    }

    fn adjust_confidence(&self, base: f32, text: &str) -> f32 {
        let mut adjustment = 0.0;
        if text.len() < 15 {
            adjustment -= 0.1;
        }
        let word_count = text.split_whitespace().count();
        if (3..=40).contains(&word_count) {
            adjustment += 0.05;
        }
        (base + adjustment).clamp(0.0, 1.0)
    }

    fn deduplicate(&self, mut facts: Vec<ExtractedFact>) -> Vec<ExtractedFact> {
        if facts.len() <= 1 {
            return facts;
        }
        facts.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut result: Vec<ExtractedFact> = Vec::new();
        for fact in facts {
            let duplicate = result
                .iter()
                .any(|existing| similarity(&fact.text, &existing.text) > 0.8);
            if !duplicate {
                result.push(fact);
            }
        }
        result
    }
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Jaccard-style word overlap.
fn similarity(a: &str, b: &str) -> f32 {
    let a_lower = a.to_lowercase();
    let b_lower = b.to_lowercase();
    if a_lower == b_lower {
        return 1.0;
    }
    if a_lower.contains(&b_lower) || b_lower.contains(&a_lower) {
        return 0.9;
    }
    let a_words: std::collections::HashSet<_> = a_lower.split_whitespace().collect();
    let b_words: std::collections::HashSet<_> = b_lower.split_whitespace().collect();
    let intersection = a_words.intersection(&b_words).count();
    let union = a_words.union(&b_words).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}
