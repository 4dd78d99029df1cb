//! PHI scrubbing for free text and structured payloads.
//!
//! Two rules, applied at request intake, immediately before response
//! emission, and again on every field handed to the audit sink:
//!
//! 1. **Text rule** — regex categories (SSN, NANP phone, email, MRN,
//!    dates, street addresses, ZIP, card-like digit runs, TitleCase
//!    name bigrams) replaced with a redaction token.
//! 2. **Structure rule** — a recursive walk over JSON values replacing
//!    the values of denylisted keys outright, and applying the text
//!    rule to every remaining string leaf.
//!
//! Scrubbing is pure and idempotent: `scrub(scrub(x)) == scrub(x)`.
//! The name-bigram category is best-effort and advisory only.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// Default replacement token.
pub const REDACTED: &str = "[REDACTED]";

/// Field names whose values are always replaced during the structured
/// walk, regardless of content. Compared case-insensitively.
const FIELD_DENYLIST: &[&str] = &[
    "email",
    "phone",
    "ssn",
    "mrn",
    "firstname",
    "lastname",
    "fullname",
    "address",
    "zipcode",
    "patientid",
    "userid",
    "ip",
    "useragent",
];

/// What a scrub pass found. `NameLike` is advisory (see module docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhiCategory {
    Ssn,
    Phone,
    Email,
    Mrn,
    Date,
    Address,
    Zip,
    CardNumber,
    NameLike,
    DenylistedField,
}

/// Result of scrubbing a string.
#[derive(Debug, Clone)]
pub struct Scrubbed {
    pub text: String,
    pub findings: Vec<PhiCategory>,
}

impl Scrubbed {
    pub fn was_modified(&self) -> bool {
        !self.findings.is_empty()
    }
}

// Category regexes. Order matters: longer/more specific digit shapes
// run before the looser ones so a card number is not half-eaten by the
// phone rule first.
static SSN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static CARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{4}\b").unwrap());
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\+?1[-. ]?)?\(?\d{3}\)?[-. ]?\d{3}[-. ]?\d{4}\b").unwrap()
});
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});
static MRN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:mrn|medical record(?: number)?)[:#\s]*\d{6,12}\b").unwrap()
});
static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{1,2}[/-]\d{1,2}[/-]\d{2,4}|\d{4}-\d{2}-\d{2})\b").unwrap()
});
static ADDRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b\d{1,6}\s+[A-Za-z0-9.' ]{2,40}\s(?:street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr|court|ct|place|pl|way)\b\.?",
    )
    .unwrap()
});
static ZIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{5}(?:-\d{4})?\b").unwrap());
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-z]{1,20} [A-Z][a-z]{1,20}\b").unwrap());

/// Zero-width and directional characters stripped before matching so
/// they cannot split an identifier across a pattern boundary.
fn strip_invisible(text: &str) -> String {
    text.chars()
        .filter(|c| {
            !matches!(
                *c,
                '\u{200B}'..='\u{200F}'
                | '\u{202A}'..='\u{202E}'
                | '\u{2060}'..='\u{2064}'
                | '\u{FEFF}'
                | '\u{00AD}'
            ) && (!c.is_control() || *c == '\n' || *c == '\t')
        })
        .collect()
}

/// PHI scrubber with a configurable field denylist and replacement token.
#[derive(Debug, Clone)]
pub struct PhiScrubber {
    denylist: HashSet<String>,
    token: String,
}

impl PhiScrubber {
    /// Scrubber with the built-in denylist and default token.
    pub fn new() -> Self {
        Self::with_aliases(&[])
    }

    /// Scrubber extended with configuration-supplied field aliases.
    pub fn with_aliases(aliases: &[String]) -> Self {
        let mut denylist: HashSet<String> =
            FIELD_DENYLIST.iter().map(|s| s.to_string()).collect();
        denylist.extend(aliases.iter().map(|a| a.to_lowercase()));
        Self {
            denylist,
            token: REDACTED.to_string(),
        }
    }

    /// Use an alternative replacement token.
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = token.to_string();
        self
    }

    /// Apply the text rule to a string.
    pub fn scrub_text(&self, text: &str) -> Scrubbed {
        let mut out = strip_invisible(text);
        let mut findings = Vec::new();

        let passes: [(&Regex, PhiCategory); 9] = [
            (&SSN_RE, PhiCategory::Ssn),
            (&CARD_RE, PhiCategory::CardNumber),
            (&PHONE_RE, PhiCategory::Phone),
            (&EMAIL_RE, PhiCategory::Email),
            (&MRN_RE, PhiCategory::Mrn),
            (&DATE_RE, PhiCategory::Date),
            (&ADDRESS_RE, PhiCategory::Address),
            (&ZIP_RE, PhiCategory::Zip),
            (&NAME_RE, PhiCategory::NameLike),
        ];

        for (re, category) in passes {
            if re.is_match(&out) {
                out = re.replace_all(&out, self.token.as_str()).to_string();
                findings.push(category);
            }
        }

        Scrubbed { text: out, findings }
    }

    /// Apply the structure rule to a JSON value in place.
    ///
    /// Returns every category found anywhere in the tree, including
    /// `DenylistedField` once per replaced field value.
    pub fn scrub_value(&self, value: &mut Value) -> Vec<PhiCategory> {
        let mut findings = Vec::new();
        self.walk(value, &mut findings);
        findings
    }

    /// Convenience: scrub an owned value and return it.
    pub fn scrub_owned(&self, mut value: Value) -> (Value, Vec<PhiCategory>) {
        let findings = self.scrub_value(&mut value);
        (value, findings)
    }

    fn walk(&self, value: &mut Value, findings: &mut Vec<PhiCategory>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map.iter_mut() {
                    if self.denylist.contains(&key.to_lowercase()) {
                        if child.as_str() != Some(self.token.as_str()) {
                            findings.push(PhiCategory::DenylistedField);
                        }
                        *child = Value::String(self.token.clone());
                    } else {
                        self.walk(child, findings);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.walk(item, findings);
                }
            }
            Value::String(s) => {
                let scrubbed = self.scrub_text(s);
                findings.extend(scrubbed.findings.iter().copied());
                *s = scrubbed.text;
            }
            _ => {}
        }
    }
}

impl Default for PhiScrubber {
    fn default() -> Self {
        Self::new()
    }
}
