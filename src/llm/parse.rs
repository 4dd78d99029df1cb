//! Model-output parsing.
//!
//! First pass looks for a top-level JSON object (longest balanced
//! braces match). When that fails, a sentence scan derives summary,
//! recommendation, safety, and evidence sections from marker words.
//! Structured responses score higher than salvaged text.

use serde_json::Value;

use super::ResponseHint;

/// Marker words for the text-salvage passes.
const RECOMMENDATION_MARKERS: &[&str] =
    &["recommend", "should", "advise", "suggest", "consider"];
const SAFETY_MARKERS: &[&str] = &[
    "warning", "caution", "risk", "urgent", "emergency", "seek", "immediately",
    "contraindicated",
];
const EVIDENCE_MARKERS: &[&str] =
    &["study", "studies", "evidence", "trial", "literature", "guideline", "meta-analysis"];

/// Keywords whose coverage drives the text-response confidence score.
const MEDICAL_KEYWORDS: &[&str] = &[
    "diagnosis", "treatment", "symptom", "medication", "dose", "patient",
    "clinical", "therapy", "condition", "prognosis",
];

/// Sections salvaged from unstructured model text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextSections {
    pub summary: String,
    pub recommendations: Vec<String>,
    pub safety: Vec<String>,
    pub evidence: Vec<String>,
}

/// Outcome of parsing one model reply.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    /// Present when a top-level JSON object was found.
    pub structured: Option<Value>,
    /// Always populated; derived from the object when structured,
    /// from sentence scan otherwise.
    pub sections: TextSections,
    pub confidence: f64,
    pub raw: String,
}

/// Parse one model reply against a response hint.
pub fn parse_output(raw: &str, hint: ResponseHint) -> ParsedResponse {
    if let Some(object) = extract_json_object(raw) {
        let confidence = structured_confidence(&object, hint.expected_fields());
        let sections = sections_from_object(&object);
        return ParsedResponse {
            structured: Some(object),
            sections,
            confidence,
            raw: raw.to_string(),
        };
    }

    let sections = extract_sections(raw);
    ParsedResponse {
        structured: None,
        sections,
        confidence: text_confidence(raw),
        raw: raw.to_string(),
    }
}

/// Longest balanced `{…}` span that parses as a JSON object.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut best: Option<&str> = None;

    for start in 0..bytes.len() {
        if bytes[start] != b'{' {
            continue;
        }
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        for (offset, b) in bytes[start..].iter().enumerate() {
            match (*b, in_string, escaped) {
                (_, true, true) => escaped = false,
                (b'\\', true, false) => escaped = true,
                (b'"', _, false) => in_string = !in_string,
                (b'{', false, _) => depth += 1,
                (b'}', false, _) => {
                    depth -= 1;
                    if depth == 0 {
                        let candidate = &text[start..start + offset + 1];
                        if best.map_or(true, |b| candidate.len() > b.len()) {
                            best = Some(candidate);
                        }
                        break;
                    }
                }
                _ => {}
            }
        }
    }

    let candidate = best?;
    match serde_json::from_str::<Value>(candidate) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

/// Structured confidence: base 0.5 + 0.1 per present expected field,
/// capped at 1.0.
pub fn structured_confidence(object: &Value, expected_fields: &[&str]) -> f64 {
    let present = expected_fields
        .iter()
        .filter(|f| object.get(**f).is_some())
        .count();
    (0.5 + 0.1 * present as f64).min(1.0)
}

/// Text confidence: base 0.3 plus medical keyword coverage, capped at
/// 0.8 — a salvaged reply never outranks a structured one.
pub fn text_confidence(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let covered = MEDICAL_KEYWORDS
        .iter()
        .filter(|k| lower.contains(**k))
        .count();
    let coverage = covered as f64 / MEDICAL_KEYWORDS.len() as f64;
    (0.3 + coverage).min(0.8)
}

fn sentences(text: &str) -> Vec<&str> {
    text.split(|c| matches!(c, '.' | '!' | '?' | '\n'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn contains_marker(sentence: &str, markers: &[&str]) -> bool {
    let lower = sentence.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

/// Sentence scan for unstructured model output.
pub fn extract_sections(text: &str) -> TextSections {
    let mut sections = TextSections::default();
    let mut summary_parts: Vec<&str> = Vec::new();

    for sentence in sentences(text) {
        let mut tagged = false;
        if contains_marker(sentence, RECOMMENDATION_MARKERS) {
            sections.recommendations.push(sentence.to_string());
            tagged = true;
        }
        if contains_marker(sentence, SAFETY_MARKERS) {
            sections.safety.push(sentence.to_string());
            tagged = true;
        }
        if contains_marker(sentence, EVIDENCE_MARKERS) {
            sections.evidence.push(sentence.to_string());
            tagged = true;
        }
        if !tagged && summary_parts.len() < 3 {
            summary_parts.push(sentence);
        }
    }

    if summary_parts.is_empty() {
        // Everything was tagged; fall back to the first sentence.
        if let Some(first) = sentences(text).first() {
            summary_parts.push(first);
        }
    }
    sections.summary = summary_parts.join(". ");
    sections
}

/// Project a structured object onto the section shape, so downstream
/// merging treats both parse paths uniformly.
fn sections_from_object(object: &Value) -> TextSections {
    let string_of = |v: &Value| -> Option<String> {
        v.as_str().map(str::to_string).or_else(|| {
            v.is_object().then(|| v.to_string())
        })
    };
    let list_of = |key: &str| -> Vec<String> {
        match object.get(key) {
            Some(Value::Array(items)) => {
                items.iter().filter_map(|i| string_of(i)).collect()
            }
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    };

    TextSections {
        summary: object
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        recommendations: list_of("recommendations"),
        safety: list_of("safety"),
        evidence: list_of("evidence"),
    }
}
