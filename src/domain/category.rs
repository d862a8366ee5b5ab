//! Message categories and classification results.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageKey, NotificationRequest};

/// The closed set of categories a message can be assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Interested,
    MeetingBooked,
    NotInterested,
    Spam,
    OutOfOffice,
    ActionRequired,
    Social,
    /// Reserved fallback when the oracle answer is unknown or unavailable.
    Unclassified,
}

impl Category {
    /// Categories the oracle may answer with.
    pub const ASSIGNABLE: [Category; 7] = [
        Category::Interested,
        Category::MeetingBooked,
        Category::NotInterested,
        Category::Spam,
        Category::OutOfOffice,
        Category::ActionRequired,
        Category::Social,
    ];

    /// Human-readable label, as used in prompts and the search index.
    pub fn label(&self) -> &'static str {
        match self {
            Category::Interested => "Interested",
            Category::MeetingBooked => "Meeting Booked",
            Category::NotInterested => "Not Interested",
            Category::Spam => "Spam",
            Category::OutOfOffice => "Out of Office",
            Category::ActionRequired => "Action Required",
            Category::Social => "Social",
            Category::Unclassified => "Unclassified",
        }
    }

    /// Whether a message in this category should trigger a notification.
    pub fn is_high_value(&self) -> bool {
        matches!(self, Category::Interested)
    }

    /// Maps free-form oracle output onto the closed set.
    ///
    /// Matching ignores case, surrounding quotes, trailing punctuation and
    /// the separator between words (`out-of-office`, `Out of Office`).
    /// Anything else maps to [`Category::Unclassified`].
    pub fn from_oracle_label(raw: &str) -> Category {
        raw.parse().unwrap_or(Category::Unclassified)
    }
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = squash(s.trim());
        if wanted.is_empty() {
            return Err(UnknownCategory(s.to_string()));
        }

        Category::ASSIGNABLE
            .iter()
            .chain(std::iter::once(&Category::Unclassified))
            .find(|c| squash(c.label()) == wanted)
            .copied()
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Error returned when a label is not part of the category set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown category: {0}")]
pub struct UnknownCategory(pub String);

/// Outcome of classifying one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Message the result belongs to.
    pub message_key: MessageKey,
    /// Assigned category.
    pub category: Category,
    /// Oracle confidence in `0.0..=1.0`, when it reports one.
    pub confidence: Option<f32>,
    /// When the verdict was produced.
    pub produced_at: DateTime<Utc>,
    /// Whether the verdict came from the fingerprint cache.
    #[serde(default)]
    pub cached: bool,
    /// Notification the delivery pipeline should dispatch for this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationRequest>,
}

impl ClassificationResult {
    /// An `Unclassified` result with no notification, used when the oracle
    /// could not be reached.
    pub fn unclassified(message_key: MessageKey) -> Self {
        Self {
            message_key,
            category: Category::Unclassified,
            confidence: None,
            produced_at: Utc::now(),
            cached: false,
            notification: None,
        }
    }
}
