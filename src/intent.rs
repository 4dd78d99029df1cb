//! Clinical intent classification.
//!
//! A pure, deterministic function from (query text, uploaded-file
//! descriptors, patient context) to an [`IntentAnalysis`]. The intent
//! vocabulary, per-tag keywords, urgencies, specialties, and tool sets
//! live in one static table; configuration may add keyword aliases,
//! code never grows new tags ad hoc.

use serde::Serialize;
use serde_json::Value;

use crate::tools::ToolName;

// ═══════════════════════════════════════════════════════════
// Vocabulary
// ═══════════════════════════════════════════════════════════

/// Urgency levels. Variant order is the comparison order:
/// `critical > high > medium > low`, strictly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// Closed specialty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Specialty {
    Cardiology,
    Neurology,
    Oncology,
    Radiology,
    Dermatology,
    Pathology,
    EmergencyMedicine,
    Pharmacology,
    Research,
    Genetics,
    General,
}

impl Specialty {
    /// Fixed priority for tie-breaking; lower index is more specific.
    /// `General` never wins against a named specialty.
    const PRIORITY: [Specialty; 11] = [
        Specialty::EmergencyMedicine,
        Specialty::Radiology,
        Specialty::Dermatology,
        Specialty::Pathology,
        Specialty::Cardiology,
        Specialty::Neurology,
        Specialty::Oncology,
        Specialty::Genetics,
        Specialty::Pharmacology,
        Specialty::Research,
        Specialty::General,
    ];

    fn priority(self) -> usize {
        Self::PRIORITY.iter().position(|s| *s == self).unwrap_or(usize::MAX)
    }
}

/// Closed intent vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentTag {
    RadiologyAnalysis,
    DermatologyAnalysis,
    PathologyAnalysis,
    MedicalImageAnalysis,
    DifferentialDiagnosis,
    SymptomAnalysis,
    TreatmentOptions,
    DrugInteraction,
    LiteratureSearch,
    ClinicalTrials,
    GuidelinesLookup,
    RareDisease,
    EmergencyAssessment,
    CardiologyAnalysis,
    NeurologyAnalysis,
    OncologyAnalysis,
    GeneralMedicalQuery,
}

// ═══════════════════════════════════════════════════════════
// Classification table
// ═══════════════════════════════════════════════════════════

struct TagSpec {
    tag: IntentTag,
    keywords: &'static [&'static str],
    urgency: Urgency,
    specialty: Specialty,
    tools: &'static [ToolName],
}

const TAG_TABLE: &[TagSpec] = &[
    TagSpec {
        tag: IntentTag::EmergencyAssessment,
        keywords: &[
            "unconscious", "unresponsive", "seizure", "not breathing", "cardiac arrest",
            "anaphylaxis", "stroke", "severe bleeding", "overdose", "critical", "crashing",
        ],
        urgency: Urgency::Critical,
        specialty: Specialty::EmergencyMedicine,
        tools: &[ToolName::KnowledgeBase, ToolName::LiteratureIndex],
    },
    TagSpec {
        tag: IntentTag::CardiologyAnalysis,
        keywords: &[
            "chest pain", "palpitation", "arrhythmia", "cardiac", "angina", "heart failure",
            "hypertension", "blood pressure", "ecg", "ekg", "myocardial", "murmur",
        ],
        urgency: Urgency::High,
        specialty: Specialty::Cardiology,
        tools: &[ToolName::LiteratureIndex, ToolName::KnowledgeBase, ToolName::Citations],
    },
    TagSpec {
        tag: IntentTag::NeurologyAnalysis,
        keywords: &[
            "seizure", "numbness", "tingling", "migraine", "memory loss", "tremor",
            "neuropathy", "aphasia", "hemiparesis",
        ],
        urgency: Urgency::High,
        specialty: Specialty::Neurology,
        tools: &[ToolName::LiteratureIndex, ToolName::KnowledgeBase, ToolName::Citations],
    },
    TagSpec {
        tag: IntentTag::OncologyAnalysis,
        keywords: &[
            "cancer", "tumor", "metastasis", "chemotherapy", "radiation therapy",
            "lymphoma", "leukemia", "malignant", "staging",
        ],
        urgency: Urgency::High,
        specialty: Specialty::Oncology,
        tools: &[
            ToolName::LiteratureIndex,
            ToolName::ClinicalTrials,
            ToolName::Citations,
        ],
    },
    TagSpec {
        tag: IntentTag::SymptomAnalysis,
        keywords: &[
            "pain", "symptom", "ache", "fever", "nausea", "dizzy", "fatigue", "cough",
            "headache", "swelling", "vomiting", "shortness of breath",
        ],
        urgency: Urgency::Medium,
        specialty: Specialty::General,
        tools: &[ToolName::LiteratureIndex, ToolName::KnowledgeBase],
    },
    TagSpec {
        tag: IntentTag::DifferentialDiagnosis,
        keywords: &[
            "differential", "diagnosis", "possible causes", "rule out", "workup",
            "etiology", "what could",
        ],
        urgency: Urgency::Medium,
        specialty: Specialty::General,
        tools: &[
            ToolName::LiteratureIndex,
            ToolName::KnowledgeBase,
            ToolName::Citations,
        ],
    },
    TagSpec {
        tag: IntentTag::TreatmentOptions,
        keywords: &[
            "treatment", "therapy", "management", "intervention", "prognosis",
            "care plan", "first line",
        ],
        urgency: Urgency::Medium,
        specialty: Specialty::General,
        tools: &[
            ToolName::KnowledgeBase,
            ToolName::ClinicalTrials,
            ToolName::LiteratureIndex,
        ],
    },
    TagSpec {
        tag: IntentTag::DrugInteraction,
        keywords: &[
            "drug interaction", "interact", "contraindication", "medication", "dosage",
            "dose", "side effect", "polypharmacy", "prescribed", "taking",
        ],
        urgency: Urgency::Medium,
        specialty: Specialty::Pharmacology,
        tools: &[ToolName::KnowledgeBase],
    },
    TagSpec {
        tag: IntentTag::RareDisease,
        keywords: &[
            "rare disease", "orphan", "genetic disorder", "syndrome", "inherited",
            "mutation", "hereditary",
        ],
        urgency: Urgency::Medium,
        specialty: Specialty::Genetics,
        tools: &[
            ToolName::LiteratureIndex,
            ToolName::Citations,
            ToolName::KnowledgeBase,
        ],
    },
    TagSpec {
        tag: IntentTag::RadiologyAnalysis,
        keywords: &[
            "xray", "x ray", "ct scan", "mri", "radiograph", "ultrasound", "imaging study",
        ],
        urgency: Urgency::High,
        specialty: Specialty::Radiology,
        tools: &[ToolName::Imaging, ToolName::LiteratureIndex],
    },
    TagSpec {
        tag: IntentTag::DermatologyAnalysis,
        keywords: &[
            "skin", "rash", "mole", "dermatitis", "psoriasis", "eczema", "dermoscopy",
            "pruritus",
        ],
        urgency: Urgency::Medium,
        specialty: Specialty::Dermatology,
        tools: &[ToolName::Imaging, ToolName::KnowledgeBase],
    },
    TagSpec {
        tag: IntentTag::PathologyAnalysis,
        keywords: &["biopsy", "pathology", "histology", "specimen", "cytology"],
        urgency: Urgency::High,
        specialty: Specialty::Pathology,
        tools: &[ToolName::Imaging, ToolName::LiteratureIndex],
    },
    TagSpec {
        tag: IntentTag::LiteratureSearch,
        keywords: &[
            "literature", "studies", "research", "published", "evidence", "pubmed",
            "meta analysis", "systematic review",
        ],
        urgency: Urgency::Low,
        specialty: Specialty::Research,
        tools: &[ToolName::LiteratureIndex, ToolName::Citations],
    },
    TagSpec {
        tag: IntentTag::ClinicalTrials,
        keywords: &[
            "clinical trial", "trial", "enrollment", "eligibility", "recruiting", "phase",
        ],
        urgency: Urgency::Low,
        specialty: Specialty::Research,
        tools: &[ToolName::ClinicalTrials],
    },
    TagSpec {
        tag: IntentTag::GuidelinesLookup,
        keywords: &[
            "guideline", "recommendation", "protocol", "standard of care", "consensus",
        ],
        urgency: Urgency::Low,
        specialty: Specialty::General,
        tools: &[ToolName::KnowledgeBase],
    },
    TagSpec {
        tag: IntentTag::MedicalImageAnalysis,
        keywords: &[],
        urgency: Urgency::Medium,
        specialty: Specialty::General,
        tools: &[ToolName::Imaging],
    },
    TagSpec {
        tag: IntentTag::GeneralMedicalQuery,
        keywords: &[],
        urgency: Urgency::Low,
        specialty: Specialty::General,
        tools: &[ToolName::LiteratureIndex, ToolName::KnowledgeBase],
    },
];

fn spec_for(tag: IntentTag) -> &'static TagSpec {
    TAG_TABLE
        .iter()
        .find(|s| s.tag == tag)
        .expect("every tag has a table entry")
}

/// Filename substrings and the specialty/intent they imply.
const FILENAME_HINTS: &[(&str, Specialty, IntentTag)] = &[
    ("xray", Specialty::Radiology, IntentTag::RadiologyAnalysis),
    ("x-ray", Specialty::Radiology, IntentTag::RadiologyAnalysis),
    ("ct", Specialty::Radiology, IntentTag::RadiologyAnalysis),
    ("mri", Specialty::Radiology, IntentTag::RadiologyAnalysis),
    ("ultrasound", Specialty::Radiology, IntentTag::RadiologyAnalysis),
    ("dermoscopy", Specialty::Dermatology, IntentTag::DermatologyAnalysis),
    ("skin", Specialty::Dermatology, IntentTag::DermatologyAnalysis),
    ("mole", Specialty::Dermatology, IntentTag::DermatologyAnalysis),
    ("pathology", Specialty::Pathology, IntentTag::PathologyAnalysis),
    ("biopsy", Specialty::Pathology, IntentTag::PathologyAnalysis),
    ("histology", Specialty::Pathology, IntentTag::PathologyAnalysis),
    ("fundus", Specialty::General, IntentTag::MedicalImageAnalysis),
    ("oct", Specialty::General, IntentTag::MedicalImageAnalysis),
];

const TIME_WORDS: &[&str] = &[
    "since", "yesterday", "ago", "days", "weeks", "months", "hours", "chronic",
    "acute", "sudden", "gradual",
];
const URGENCY_WORDS: &[&str] = &[
    "urgent", "emergency", "immediately", "critical", "severe", "asap", "right now",
];
const IMAGE_REFERENCE_WORDS: &[&str] = &[
    "image", "scan", "xray", "x ray", "photo", "picture", "attached", "upload",
    "mri", "ct",
];

// ═══════════════════════════════════════════════════════════
// Inputs and output
// ═══════════════════════════════════════════════════════════

/// Descriptor of one uploaded file (original name + declared MIME).
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub filename: String,
    pub mime: String,
}

impl FileDescriptor {
    fn is_dicom(&self) -> bool {
        self.filename.to_lowercase().ends_with(".dcm")
            || self.mime.to_lowercase().contains("dicom")
    }
}

/// Flags derived from the raw query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryFlags {
    pub has_image_upload: bool,
    pub has_symptoms: bool,
    pub has_medications: bool,
    pub has_time_reference: bool,
    pub has_urgency_word: bool,
    pub has_image_reference: bool,
}

/// Output of classification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentAnalysis {
    /// Detected tags, image-derived first, then text tags by
    /// descending match score (table order breaks ties).
    pub intents: Vec<IntentTag>,
    pub specialty: Specialty,
    pub urgency: Urgency,
    pub required_tools: Vec<ToolName>,
    pub confidence: f64,
    pub flags: QueryFlags,
}

// ═══════════════════════════════════════════════════════════
// Classification
// ═══════════════════════════════════════════════════════════

/// Lowercase and collapse runs of non-alphanumerics to single spaces.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            for lower in c.to_lowercase() {
                out.push(lower);
            }
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Classify a query. Pure: identical inputs yield identical output.
pub fn classify(
    text: &str,
    files: &[FileDescriptor],
    patient_context: Option<&Value>,
    available_tools: &[ToolName],
) -> IntentAnalysis {
    let normalized = normalize(text);

    // File scan. The DICOM marker short-circuits filename heuristics.
    let mut image_intents: Vec<(IntentTag, Specialty)> = Vec::new();
    if files.iter().any(FileDescriptor::is_dicom) {
        image_intents.push((IntentTag::RadiologyAnalysis, Specialty::Radiology));
    } else {
        for file in files {
            let name = file.filename.to_lowercase();
            if let Some((_, specialty, tag)) =
                FILENAME_HINTS.iter().find(|(hint, _, _)| name.contains(hint))
            {
                image_intents.push((*tag, *specialty));
            }
        }
        // An image with no recognizable hint is still an image intent.
        if image_intents.is_empty() && !files.is_empty() {
            image_intents.push((IntentTag::MedicalImageAnalysis, Specialty::General));
        }
    }

    // Text pass: fraction of each tag's keywords present, kept when
    // positive, sorted by descending score. Table order breaks ties.
    let mut scored: Vec<(IntentTag, f64, usize)> = Vec::new();
    let mut matched_keywords: Vec<&'static str> = Vec::new();
    for (index, spec) in TAG_TABLE.iter().enumerate() {
        if spec.keywords.is_empty() {
            continue;
        }
        let matches: Vec<&&str> = spec
            .keywords
            .iter()
            .filter(|k| normalized.contains(**k))
            .collect();
        if matches.is_empty() {
            continue;
        }
        for keyword in &matches {
            if !matched_keywords.contains(*keyword) {
                matched_keywords.push(**keyword);
            }
        }
        let score = matches.len() as f64 / spec.keywords.len() as f64;
        scored.push((spec.tag, score, index));
    }
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.2.cmp(&b.2))
    });

    // Merge: image intents first, then text intents, deduplicated.
    let mut intents: Vec<IntentTag> = Vec::new();
    for (tag, _) in &image_intents {
        if !intents.contains(tag) {
            intents.push(*tag);
        }
    }
    for (tag, _, _) in &scored {
        if !intents.contains(tag) {
            intents.push(*tag);
        }
    }
    let fallback = intents.is_empty();
    if fallback {
        intents.push(IntentTag::GeneralMedicalQuery);
    }

    // Specialty: most specific contributor wins; the priority list
    // makes ties deterministic.
    let mut specialty = Specialty::General;
    let candidates = image_intents
        .iter()
        .map(|(_, s)| *s)
        .chain(intents.iter().map(|t| spec_for(*t).specialty));
    for candidate in candidates {
        if candidate.priority() < specialty.priority() {
            specialty = candidate;
        }
    }

    // Urgency: maximum across contributing tags.
    let urgency = intents
        .iter()
        .map(|t| spec_for(*t).urgency)
        .max()
        .unwrap_or(Urgency::Low);

    // Required tools: union of contributing tags' tool sets projected
    // onto the configured pool.
    let mut required_tools: Vec<ToolName> = Vec::new();
    for tag in &intents {
        for tool in spec_for(*tag).tools {
            if available_tools.contains(tool) && !required_tools.contains(tool) {
                required_tools.push(*tool);
            }
        }
    }

    let flags = QueryFlags {
        has_image_upload: !files.is_empty(),
        has_symptoms: contains_any(
            &normalized,
            spec_for(IntentTag::SymptomAnalysis).keywords,
        ),
        has_medications: contains_any(
            &normalized,
            spec_for(IntentTag::DrugInteraction).keywords,
        ) || patient_context
            .and_then(|c| c.get("medications"))
            .is_some(),
        has_time_reference: contains_any(&normalized, TIME_WORDS),
        has_urgency_word: contains_any(&normalized, URGENCY_WORDS),
        has_image_reference: contains_any(&normalized, IMAGE_REFERENCE_WORDS),
    };

    // Confidence: bounded sum of terms, clamped to [0, 1].
    let mut confidence: f64 = 0.0;
    if !fallback {
        confidence += 0.4;
    } else {
        confidence += 0.2;
    }
    if !image_intents.is_empty() && flags.has_image_reference {
        confidence += 0.2;
    }
    if intents.len() >= 2 {
        confidence += 0.1;
    }
    let word_count = normalized.split_whitespace().count().max(1);
    let density = matched_keywords.len() as f64 / word_count as f64;
    confidence += (density * 3.0 * 0.3).min(0.3);
    let confidence = confidence.clamp(0.0, 1.0);

    IntentAnalysis {
        intents,
        specialty,
        urgency,
        required_tools,
        confidence,
        flags,
    }
}
