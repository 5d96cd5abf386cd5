//! Widget type constants and the [`WidgetType`] enum.
//!
//! The type string is stored verbatim in the widget record and is part of
//! the type-index key (`widgets:type:{type}`), so these values are a wire
//! format and must not be renamed.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Type constants
// ---------------------------------------------------------------------------

pub const TYPE_LEAD_FORM: &str = "lead-form";
pub const TYPE_POPUP: &str = "popup";
pub const TYPE_BANNER: &str = "banner";
pub const TYPE_QUIZ: &str = "quiz";
pub const TYPE_SURVEY: &str = "survey";
pub const TYPE_CONTACT_FORM: &str = "contact-form";
pub const TYPE_NEWSLETTER: &str = "newsletter";
pub const TYPE_FEEDBACK: &str = "feedback";
pub const TYPE_COUNTDOWN: &str = "countdown";

/// All valid widget type strings.
pub const VALID_WIDGET_TYPES: &[&str] = &[
    TYPE_LEAD_FORM,
    TYPE_POPUP,
    TYPE_BANNER,
    TYPE_QUIZ,
    TYPE_SURVEY,
    TYPE_CONTACT_FORM,
    TYPE_NEWSLETTER,
    TYPE_FEEDBACK,
    TYPE_COUNTDOWN,
];

// ---------------------------------------------------------------------------
// Enum
// ---------------------------------------------------------------------------

/// The kind of lead-capture widget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WidgetType {
    LeadForm,
    Popup,
    Banner,
    Quiz,
    Survey,
    ContactForm,
    Newsletter,
    Feedback,
    Countdown,
}

impl WidgetType {
    /// Every known type, in declaration order.
    pub const ALL: [WidgetType; 9] = [
        Self::LeadForm,
        Self::Popup,
        Self::Banner,
        Self::Quiz,
        Self::Survey,
        Self::ContactForm,
        Self::Newsletter,
        Self::Feedback,
        Self::Countdown,
    ];

    /// Return the stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadForm => TYPE_LEAD_FORM,
            Self::Popup => TYPE_POPUP,
            Self::Banner => TYPE_BANNER,
            Self::Quiz => TYPE_QUIZ,
            Self::Survey => TYPE_SURVEY,
            Self::ContactForm => TYPE_CONTACT_FORM,
            Self::Newsletter => TYPE_NEWSLETTER,
            Self::Feedback => TYPE_FEEDBACK,
            Self::Countdown => TYPE_COUNTDOWN,
        }
    }

    /// Look up an exact (already normalized) type string.
    pub fn from_known(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Parse from a string, returning an error for unknown types.
    ///
    /// Input is trimmed and lowercased first.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let normalized = s.trim().to_lowercase();
        Self::from_known(&normalized).ok_or_else(|| {
            CoreError::Validation(format!(
                "Unknown widget type: '{s}'. Valid types: {}",
                VALID_WIDGET_TYPES.join(", ")
            ))
        })
    }
}

impl std::fmt::Display for WidgetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
