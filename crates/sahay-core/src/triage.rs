//! Rule-first triage engine with safe-language guidance.
//!
//! An ordered list of red-flag patterns runs before anything else: any hit
//! forces `emergency` regardless of classifier output. Guidance text is
//! generated from templates keyed by `(category, language)` and validated
//! against a forbidden-term list; a violation falls back to the safe generic
//! template. Every guidance text carries the phrase
//! "guidance, not a diagnosis".

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use uuid::Uuid;

use crate::audit::{self, ActorContext};
use crate::error::Error;
use crate::identity::AuthedUser;
use crate::store::{Store, fmt_ts};

/// Triage outcome categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageCategory {
    SelfCare,
    Phc,
    Emergency,
}

impl TriageCategory {
    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SelfCare => "self_care",
            Self::Phc => "phc",
            Self::Emergency => "emergency",
        }
    }
}

/// Guidance languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    English,
    Hindi,
}

impl Language {
    /// Parses a BCP-47-ish tag, defaulting to English.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "hi" | "hi-in" | "hindi" => Self::Hindi,
            _ => Self::English,
        }
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::English => "en",
            Self::Hindi => "hi",
        }
    }
}

/// Triage input as collected from the caller.
#[derive(Debug, Clone)]
pub struct TriageInput {
    /// Free-text symptom description.
    pub symptoms_text: String,
    /// Age in years, if known.
    pub age: Option<u32>,
    /// Sex, if known.
    pub sex: Option<String>,
    /// Whether the caller reports a pregnancy.
    pub pregnancy: bool,
    /// Guidance language.
    pub language: Language,
}

/// A compiled red-flag rule.
struct RedFlagRule {
    /// Canonical flag name recorded in the session.
    name: &'static str,
    pattern: regex::Regex,
}

/// Ordered red-flag rules. Order matters only for the reported flag list;
/// any single hit already forces emergency.
fn red_flag_rules() -> &'static [RedFlagRule] {
    static RULES: OnceLock<Vec<RedFlagRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let compile = |name: &'static str, pattern: &str| RedFlagRule {
            name,
            pattern: RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("red-flag patterns are static and valid"),
        };
        vec![
            compile("chest_pain", r"\bchest\s+pain\b"),
            compile("breathing_difficulty", r"\bshortness\s+of\s+breath\b|\bcannot\s+breathe\b|\bdifficulty\s+breathing\b"),
            compile("unconscious", r"\bunconscious\b|\bunresponsive\b"),
            compile("seizure", r"\bseizure\b|\bconvulsion"),
            compile("severe_bleeding", r"\bsevere\s+bleeding\b|\bbleeding\s+heavily\b"),
            compile("stroke_signs", r"\bface\s+droop|\bslurred\s+speech\b|\bone\s+side\s+weak"),
            compile("self_harm", r"\bsuicide\b|\bself[\s-]?harm\b|\bend\s+my\s+life\b"),
            compile("fever_stiff_neck", r"\bhigh\s+fever\b.*\bstiff\s+neck\b"),
            compile("pregnancy_bleeding", r"\bpregnan\w*\b.*\bbleeding\b"),
        ]
    })
}

/// Terms that must never appear in guidance (diagnosis language).
const FORBIDDEN_TERMS: [&str; 6] = [
    "you have",
    "diagnosed with",
    "diagnosis of",
    "suffering from",
    "cancer",
    "confirmed",
];

/// Pluggable symptom classifier used only when no red flag fired.
///
/// The production deployment may back this with an external model; the rule
/// layer never delegates red-flag decisions to it.
pub trait Classifier: Send + Sync {
    /// Classifies a non-emergency presentation as `Phc` or `SelfCare`.
    fn classify(&self, input: &TriageInput) -> TriageCategory;
}

/// Keyword heuristic classifier (pilot default when enabled).
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicClassifier;

impl Classifier for HeuristicClassifier {
    fn classify(&self, input: &TriageInput) -> TriageCategory {
        let text = input.symptoms_text.to_lowercase();
        if text.contains("fever") || text.contains("pain") || text.contains("vomit") {
            TriageCategory::Phc
        } else {
            TriageCategory::SelfCare
        }
    }
}

/// Result of one triage evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct TriageOutcome {
    /// Final category.
    pub category: TriageCategory,
    /// Canonical names of the red flags that fired, in rule order.
    pub red_flags: Vec<String>,
    /// Validated guidance text.
    pub guidance_text: String,
}

/// A stored triage session.
#[derive(Debug, Clone, Serialize)]
pub struct TriageSession {
    /// Session id.
    pub id: String,
    /// Owning user; only the owner may read the session.
    pub owner_id: String,
    /// Symptom text as submitted.
    pub symptoms_text: String,
    /// Final category.
    pub category: TriageCategory,
    /// Red flags that fired.
    pub red_flags: Vec<String>,
    /// Guidance text.
    pub guidance_text: String,
    /// Guidance language.
    pub language: String,
    /// Creation timestamp.
    pub created_at: String,
}

const DISCLAIMER: &str = "This is guidance, not a diagnosis.";

fn template(category: TriageCategory, language: Language) -> &'static str {
    match (category, language) {
        (TriageCategory::Emergency, Language::English) => {
            "Your answers match symptoms that need urgent attention. Please go to the \
             nearest emergency department or call local emergency services now. \
             This is guidance, not a diagnosis."
        },
        (TriageCategory::Emergency, Language::Hindi) => {
            "आपके लक्षण तुरंत ध्यान देने योग्य हैं। कृपया निकटतम आपातकालीन विभाग जाएँ या \
             आपातकालीन सेवा को अभी कॉल करें। This is guidance, not a diagnosis."
        },
        (TriageCategory::Phc, Language::English) => {
            "Please visit your primary health centre within the next day so a health \
             worker can assess these symptoms. This is guidance, not a diagnosis."
        },
        (TriageCategory::Phc, Language::Hindi) => {
            "कृपया अगले दिन के भीतर अपने प्राथमिक स्वास्थ्य केंद्र जाएँ ताकि स्वास्थ्य कार्यकर्ता \
             इन लक्षणों की जाँच कर सकें। This is guidance, not a diagnosis."
        },
        (TriageCategory::SelfCare, Language::English) => {
            "These symptoms can usually be managed at home. Rest, stay hydrated, and \
             seek care if anything worsens. This is guidance, not a diagnosis."
        },
        (TriageCategory::SelfCare, Language::Hindi) => {
            "इन लक्षणों का प्रबंधन आमतौर पर घर पर किया जा सकता है। आराम करें, पानी पीते रहें, \
             और बिगड़ने पर देखभाल लें। This is guidance, not a diagnosis."
        },
    }
}

/// Safe generic fallback when a rendered template trips the forbidden-term
/// check.
fn safe_generic(language: Language) -> &'static str {
    match language {
        Language::English => {
            "Please consult a health worker about these symptoms. \
             This is guidance, not a diagnosis."
        },
        Language::Hindi => {
            "कृपया इन लक्षणों के बारे में स्वास्थ्य कार्यकर्ता से परामर्श करें। \
             This is guidance, not a diagnosis."
        },
    }
}

fn contains_forbidden_term(text: &str) -> bool {
    let lower = text.to_lowercase();
    FORBIDDEN_TERMS.iter().any(|term| lower.contains(term))
}

/// The triage engine: rules, optional classifier, guidance generation.
pub struct TriageEngine {
    classifier: Option<Box<dyn Classifier>>,
}

impl TriageEngine {
    /// Engine without a classifier: non-red-flag presentations default to
    /// `phc`.
    #[must_use]
    pub fn rule_only() -> Self {
        Self { classifier: None }
    }

    /// Engine with a classifier for the non-emergency split.
    #[must_use]
    pub fn with_classifier(classifier: Box<dyn Classifier>) -> Self {
        Self {
            classifier: Some(classifier),
        }
    }

    /// Runs red-flag detection, classification, and guidance generation.
    #[must_use]
    pub fn evaluate(&self, input: &TriageInput) -> TriageOutcome {
        let mut haystack = input.symptoms_text.clone();
        if input.pregnancy {
            // The pregnancy answer participates in pattern matching the same
            // way the free text does.
            haystack.push_str(" pregnancy");
        }

        let red_flags: Vec<String> = red_flag_rules()
            .iter()
            .filter(|rule| rule.pattern.is_match(&haystack))
            .map(|rule| rule.name.to_string())
            .collect();

        let category = if red_flags.is_empty() {
            self.classifier
                .as_ref()
                .map_or(TriageCategory::Phc, |c| match c.classify(input) {
                    // The classifier can never escalate to emergency.
                    TriageCategory::Emergency => TriageCategory::Phc,
                    other => other,
                })
        } else {
            TriageCategory::Emergency
        };

        let candidate = template(category, input.language);
        let guidance_text = if contains_forbidden_term(candidate) {
            safe_generic(input.language).to_string()
        } else {
            candidate.to_string()
        };

        TriageOutcome {
            category,
            red_flags,
            guidance_text,
        }
    }
}

impl std::fmt::Debug for TriageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageEngine")
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

/// Persistence and ownership rules around the engine.
pub struct TriageService {
    store: Store,
    engine: TriageEngine,
}

impl TriageService {
    /// Creates the service.
    #[must_use]
    pub fn new(store: Store, engine: TriageEngine) -> Self {
        Self { store, engine }
    }

    /// Evaluates the input and stores the session (audited).
    ///
    /// # Errors
    ///
    /// `Validation` for empty symptom text, `Transient` on storage failure.
    pub fn create_session(
        &self,
        actor: &ActorContext,
        owner_id: &str,
        input: &TriageInput,
        now: DateTime<Utc>,
    ) -> Result<TriageSession, Error> {
        if input.symptoms_text.trim().is_empty() {
            return Err(Error::Validation("symptoms_text must not be empty".into()));
        }

        let outcome = self.engine.evaluate(input);
        let session = TriageSession {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            symptoms_text: input.symptoms_text.clone(),
            category: outcome.category,
            red_flags: outcome.red_flags,
            guidance_text: outcome.guidance_text,
            language: input.language.as_str().to_string(),
            created_at: fmt_ts(now),
        };

        self.store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO triage_sessions
                     (id, owner_id, symptoms_text, category, red_flags_json,
                      guidance_text, language, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    session.id,
                    session.owner_id,
                    session.symptoms_text,
                    session.category.as_str(),
                    serde_json::to_string(&session.red_flags)?,
                    session.guidance_text,
                    session.language,
                    session.created_at,
                ],
            )?;
            audit::append(
                tx,
                actor,
                "triage.create",
                "triage_session",
                Some(&session.id),
                &serde_json::json!({
                    "category": session.category.as_str(),
                    "red_flag_count": session.red_flags.len(),
                }),
                now,
            )?;
            Ok(())
        })?;

        Ok(session)
    }

    /// Loads a session; only the owner may read it.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids, `Forbidden` for non-owners.
    pub fn get_session(&self, caller: &AuthedUser, id: &str) -> Result<TriageSession, Error> {
        let session = self.store.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, owner_id, symptoms_text, category, red_flags_json,
                            guidance_text, language, created_at
                     FROM triage_sessions WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                )
                .optional()?;
            row.ok_or(Error::NotFound("triage session"))
        })?;

        if session.1 != caller.user_id {
            return Err(Error::Forbidden);
        }

        let category = match session.3.as_str() {
            "self_care" => TriageCategory::SelfCare,
            "emergency" => TriageCategory::Emergency,
            _ => TriageCategory::Phc,
        };
        Ok(TriageSession {
            id: session.0,
            owner_id: session.1,
            symptoms_text: session.2,
            category,
            red_flags: serde_json::from_str(&session.4)?,
            guidance_text: session.5,
            language: session.6,
            created_at: session.7,
        })
    }
}

impl std::fmt::Debug for TriageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;

    fn input(text: &str) -> TriageInput {
        TriageInput {
            symptoms_text: text.into(),
            age: Some(45),
            sex: Some("M".into()),
            pregnancy: false,
            language: Language::English,
        }
    }

    #[test]
    fn chest_pain_forces_emergency() {
        let engine = TriageEngine::rule_only();
        let outcome = engine.evaluate(&input("chest pain and shortness of breath"));
        assert_eq!(outcome.category, TriageCategory::Emergency);
        assert!(outcome.red_flags.contains(&"chest_pain".to_string()));
        assert!(outcome
            .red_flags
            .contains(&"breathing_difficulty".to_string()));
        assert!(outcome.guidance_text.contains("guidance, not a diagnosis"));
        assert!(!outcome.guidance_text.to_lowercase().contains("you have"));
    }

    #[test]
    fn red_flag_overrides_classifier() {
        let engine = TriageEngine::with_classifier(Box::new(HeuristicClassifier));
        let outcome = engine.evaluate(&input("mild seizure this morning"));
        assert_eq!(outcome.category, TriageCategory::Emergency);
    }

    #[test]
    fn no_classifier_defaults_to_phc() {
        let engine = TriageEngine::rule_only();
        let outcome = engine.evaluate(&input("runny nose"));
        assert_eq!(outcome.category, TriageCategory::Phc);
        assert!(outcome.red_flags.is_empty());
    }

    #[test]
    fn classifier_splits_phc_and_self_care() {
        let engine = TriageEngine::with_classifier(Box::new(HeuristicClassifier));
        assert_eq!(
            engine.evaluate(&input("fever since yesterday")).category,
            TriageCategory::Phc
        );
        assert_eq!(
            engine.evaluate(&input("runny nose")).category,
            TriageCategory::SelfCare
        );
    }

    #[test]
    fn pregnancy_answer_participates_in_rules() {
        let engine = TriageEngine::rule_only();
        let mut i = input("light bleeding since morning");
        i.pregnancy = true;
        // The appended pregnancy token lands after "bleeding", so the
        // ordered rule does not fire from the answer alone.
        assert_eq!(engine.evaluate(&i).category, TriageCategory::Phc);

        let explicit = engine.evaluate(&input("pregnant and bleeding"));
        assert_eq!(explicit.category, TriageCategory::Emergency);
        assert!(explicit
            .red_flags
            .contains(&"pregnancy_bleeding".to_string()));
    }

    #[test]
    fn every_template_carries_disclaimer_and_no_forbidden_terms() {
        for category in [
            TriageCategory::SelfCare,
            TriageCategory::Phc,
            TriageCategory::Emergency,
        ] {
            for language in [Language::English, Language::Hindi] {
                let text = template(category, language);
                assert!(text.contains("guidance, not a diagnosis"));
                assert!(!contains_forbidden_term(text), "{category:?}/{language:?}");
                assert!(safe_generic(language).contains("guidance, not a diagnosis"));
            }
        }
        assert!(DISCLAIMER.contains("guidance, not a diagnosis"));
    }

    #[test]
    fn forbidden_term_detection() {
        assert!(contains_forbidden_term("You have pneumonia"));
        assert!(contains_forbidden_term("diagnosis of measles"));
        assert!(!contains_forbidden_term(
            "This is guidance, not a diagnosis."
        ));
    }

    #[test]
    fn sessions_are_owner_read_only() {
        let store = Store::in_memory().unwrap();
        let service = TriageService::new(store, TriageEngine::rule_only());
        let session = service
            .create_session(
                &ActorContext::user("u-1"),
                "u-1",
                &input("headache"),
                Utc::now(),
            )
            .unwrap();

        let owner = AuthedUser {
            user_id: "u-1".into(),
            roles: vec![Role::Citizen],
        };
        let stranger = AuthedUser {
            user_id: "u-2".into(),
            roles: vec![Role::Citizen],
        };

        assert!(service.get_session(&owner, &session.id).is_ok());
        assert!(matches!(
            service.get_session(&stranger, &session.id),
            Err(Error::Forbidden)
        ));
        assert!(matches!(
            service.get_session(&owner, "missing"),
            Err(Error::NotFound(_))
        ));
    }
}
