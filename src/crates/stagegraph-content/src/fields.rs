//! Order workflow fields
//!
//! [`OrderFields`] is the typed record every content stage reads; [`OrderPatch`]
//! mirrors its mutable part with every field optional. Order data (id,
//! description, pages, deadline, attached file contents) is set once from the
//! [`Order`] and never patched.

use serde::{Deserialize, Deserializer, Serialize};
use stagegraph_core::FieldSet;
use std::fmt;

/// What the writer stage does on its next execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriterMode {
    /// First draft from the requirements
    #[default]
    Initial,
    /// Add material to reach the target word count
    Expand,
    /// Cut material down to the word limit
    Shorten,
    /// Cut humanized text while keeping its style
    ShortenHumanized,
    /// Fix quality issues
    Revise,
    /// Fix critical issues in humanized text
    FixHumanized,
}

impl WriterMode {
    /// Snake-case name
    pub fn as_str(self) -> &'static str {
        match self {
            WriterMode::Initial => "initial",
            WriterMode::Expand => "expand",
            WriterMode::Shorten => "shorten",
            WriterMode::ShortenHumanized => "shorten_humanized",
            WriterMode::Revise => "revise",
            WriterMode::FixHumanized => "fix_humanized",
        }
    }
}

impl fmt::Display for WriterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a revision treats citations already in the text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CitationAction {
    /// Leave citations where they are
    #[default]
    Keep,
    /// Move misplaced citations
    Adjust,
    /// Strip and insert citations again
    Reinsert,
}

impl CitationAction {
    /// Parse a checker verdict; anything unknown keeps the citations
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "adjust" => CitationAction::Adjust,
            "reinsert" => CitationAction::Reinsert,
            _ => CitationAction::Keep,
        }
    }
}

/// Humanization strategy chosen from the authenticity score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HumanizationMode {
    #[default]
    None,
    /// Rewrite the flagged sentences
    Sentence,
    /// Rewrite the whole body
    Full,
}

impl fmt::Display for HumanizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HumanizationMode::None => "none",
            HumanizationMode::Sentence => "sentence",
            HumanizationMode::Full => "full",
        })
    }
}

/// Structured requirements extracted from the order description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Requirements {
    pub assignment_type: String,
    #[serde(alias = "main_topic")]
    pub topic: String,
    pub main_question: String,
    pub required_sources: Option<usize>,
    #[serde(deserialize_with = "string_or_list")]
    pub search_keywords: Vec<String>,
    #[serde(alias = "pages_detected")]
    pub pages: Option<u32>,
    pub target_word_count: usize,
    pub citation_style: String,
    pub specific_instructions: String,
    pub key_points: Vec<String>,
    pub is_sufficient: bool,
    pub missing_info: Option<String>,
}

impl Default for Requirements {
    fn default() -> Self {
        Self {
            assignment_type: "essay".to_string(),
            topic: String::new(),
            main_question: String::new(),
            required_sources: None,
            search_keywords: Vec::new(),
            pages: None,
            target_word_count: 0,
            citation_style: "APA".to_string(),
            specific_instructions: String::new(),
            key_points: Vec::new(),
            is_sufficient: true,
            missing_info: None,
        }
    }
}

/// Keywords arrive either as one string or as a list
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Keywords {
        One(String),
        Many(Vec<String>),
        Nothing(Option<()>),
    }

    Ok(match Keywords::deserialize(deserializer)? {
        Keywords::One(s) => s.split_whitespace().map(str::to_string).collect(),
        Keywords::Many(list) => list,
        Keywords::Nothing(_) => Vec::new(),
    })
}

/// An academic source returned by the search collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Source {
    pub title: String,
    /// Already formatted author list ("Smith", "Smith & Lee", "Smith et al.")
    pub authors: String,
    pub year: Option<i32>,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    /// In-text citation, e.g. "(Smith, 2021)"
    pub citation: String,
    pub url: String,
    pub citation_count: u64,
}

/// An incoming order, as stored in an order JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    #[serde(default)]
    pub order_index: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "one_page")]
    pub pages: u32,
    #[serde(default)]
    pub deadline: String,
    /// Contents of attached files, already extracted to text
    #[serde(default)]
    pub files: Vec<String>,
}

fn one_page() -> u32 {
    1
}

/// Fields of one order workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrderFields {
    // order data
    pub order_id: String,
    pub order_index: String,
    pub description: String,
    pub pages_required: u32,
    pub deadline: String,
    pub attached_files: Vec<String>,

    pub requirements: Requirements,

    // writer
    pub writer_mode: WriterMode,
    pub draft_text: String,
    pub text_with_citations: String,
    pub text_before_humanization: String,

    // citations
    pub sources_found: Vec<Source>,
    pub citations_inserted: bool,

    // word count
    pub word_count: usize,
    pub target_word_count: usize,
    pub word_count_ok: bool,

    // quality
    pub quality_ok: bool,
    pub quality_issues: Vec<String>,
    pub quality_suggestions: Vec<String>,
    pub citation_action: CitationAction,

    // authenticity
    pub ai_score: f64,
    pub ai_sentences: Vec<String>,
    pub humanization_mode: HumanizationMode,
    pub post_humanization: bool,

    // output
    pub references: String,
    pub final_text: String,
}

impl OrderFields {
    /// Initial fields for an order; the target is `pages * words_per_page`
    pub fn from_order(order: &Order, words_per_page: usize) -> Self {
        Self {
            order_id: order.order_id.clone(),
            order_index: order.order_index.clone(),
            description: order.description.clone(),
            pages_required: order.pages,
            deadline: order.deadline.clone(),
            attached_files: order.files.clone(),
            target_word_count: order.pages as usize * words_per_page,
            ..Self::default()
        }
    }

    /// Latest text: the cited version once it exists, else the draft
    pub fn current_text(&self) -> &str {
        if self.text_with_citations.is_empty() {
            &self.draft_text
        } else {
            &self.text_with_citations
        }
    }

    /// Pages from the requirements, falling back to the order
    pub fn pages(&self) -> u32 {
        self.requirements
            .pages
            .unwrap_or(self.pages_required)
            .max(1)
    }
}

/// Partial update of [`OrderFields`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrderPatch {
    pub requirements: Option<Requirements>,
    pub writer_mode: Option<WriterMode>,
    pub draft_text: Option<String>,
    pub text_with_citations: Option<String>,
    pub text_before_humanization: Option<String>,
    pub sources_found: Option<Vec<Source>>,
    pub citations_inserted: Option<bool>,
    pub word_count: Option<usize>,
    pub target_word_count: Option<usize>,
    pub word_count_ok: Option<bool>,
    pub quality_ok: Option<bool>,
    pub quality_issues: Option<Vec<String>>,
    pub quality_suggestions: Option<Vec<String>>,
    pub citation_action: Option<CitationAction>,
    pub ai_score: Option<f64>,
    pub ai_sentences: Option<Vec<String>>,
    pub humanization_mode: Option<HumanizationMode>,
    pub post_humanization: Option<bool>,
    pub references: Option<String>,
    pub final_text: Option<String>,
}

macro_rules! overlay {
    ($target:ident, $patch:ident; $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = &$patch.$field {
                $target.$field = value.clone();
            }
        )+
    };
}

impl FieldSet for OrderFields {
    type Patch = OrderPatch;

    const SCHEMA_VERSION: u32 = 1;

    fn apply(&self, patch: &OrderPatch) -> Self {
        let mut next = self.clone();
        overlay!(next, patch;
            requirements,
            writer_mode,
            draft_text,
            text_with_citations,
            text_before_humanization,
            sources_found,
            citations_inserted,
            word_count,
            target_word_count,
            word_count_ok,
            quality_ok,
            quality_issues,
            quality_suggestions,
            citation_action,
            ai_score,
            ai_sentences,
            humanization_mode,
            post_humanization,
            references,
            final_text,
        );
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_touches_only_patched_fields() {
        let fields = OrderFields {
            order_id: "o-1".into(),
            draft_text: "draft".into(),
            quality_issues: vec!["old".into()],
            ..Default::default()
        };
        let patch = OrderPatch {
            text_with_citations: Some("cited".into()),
            quality_issues: Some(vec![]),
            ..Default::default()
        };

        let next = fields.apply(&patch);
        assert_eq!(next.order_id, "o-1");
        assert_eq!(next.draft_text, "draft");
        assert_eq!(next.text_with_citations, "cited");
        assert!(next.quality_issues.is_empty());
        assert_eq!(fields.quality_issues, vec!["old"]);
    }

    #[test]
    fn test_from_order_sets_target() {
        let order: Order = serde_json::from_value(json!({
            "order_id": "42",
            "description": "Essay on tides",
            "pages": 3
        }))
        .unwrap();
        let fields = OrderFields::from_order(&order, 300);
        assert_eq!(fields.target_word_count, 900);
        assert_eq!(fields.pages_required, 3);
        assert_eq!(fields.writer_mode, WriterMode::Initial);
    }

    #[test]
    fn test_requirements_accept_generator_shapes() {
        let req: Requirements = serde_json::from_value(json!({
            "main_topic": "Coastal erosion",
            "pages_detected": 2,
            "search_keywords": "erosion coastline policy",
            "required_sources": 4
        }))
        .unwrap();
        assert_eq!(req.topic, "Coastal erosion");
        assert_eq!(req.pages, Some(2));
        assert_eq!(req.search_keywords, vec!["erosion", "coastline", "policy"]);
        assert!(req.is_sufficient);

        let req: Requirements =
            serde_json::from_value(json!({"search_keywords": ["a b", "c"], "is_sufficient": false}))
                .unwrap();
        assert_eq!(req.search_keywords, vec!["a b", "c"]);
        assert!(!req.is_sufficient);

        let req: Requirements = serde_json::from_value(json!({"search_keywords": null})).unwrap();
        assert!(req.search_keywords.is_empty());
    }

    #[test]
    fn test_current_text_prefers_cited() {
        let mut fields = OrderFields {
            draft_text: "draft".into(),
            ..Default::default()
        };
        assert_eq!(fields.current_text(), "draft");
        fields.text_with_citations = "cited".into();
        assert_eq!(fields.current_text(), "cited");
    }

    #[test]
    fn test_citation_action_parse() {
        assert_eq!(CitationAction::parse("Reinsert"), CitationAction::Reinsert);
        assert_eq!(CitationAction::parse(" adjust "), CitationAction::Adjust);
        assert_eq!(CitationAction::parse("whatever"), CitationAction::Keep);
    }

    #[test]
    fn test_snapshot_round_trip_keeps_modes() {
        let fields = OrderFields {
            writer_mode: WriterMode::ShortenHumanized,
            humanization_mode: HumanizationMode::Full,
            ..Default::default()
        };
        let value = serde_json::to_value(&fields).unwrap();
        assert_eq!(value["writer_mode"], "shorten_humanized");
        assert_eq!(value["humanization_mode"], "full");
        let back: OrderFields = serde_json::from_value(value).unwrap();
        assert_eq!(back, fields);
    }
}
