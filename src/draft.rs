// Encounter draft - one immutable value for the whole intake form
// Each field edit produces a new draft; nothing persists until the draft
// is finalized into an EncounterRequest and submitted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Turtle;
use crate::encounter::{ConsoleError, EncounterRequest};
use crate::tags::{TagPosition, TagSet};

/// The matched turtle as carried inside a draft: just enough to label the
/// form and pre-fill the tag fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedTurtle {
    pub id: String,
    pub name: String,
    pub tags: TagSet,
}

impl MatchedTurtle {
    pub fn from_turtle(turtle: &Turtle) -> Self {
        MatchedTurtle {
            id: turtle.id.clone(),
            name: turtle.name.clone(),
            tags: turtle.tags.clone(),
        }
    }
}

/// In-progress encounter form state.
///
/// `previous` mirrors the matched turtle's tag-set (all-empty for a first
/// sighting) and is display-only; `current` holds what the observer
/// enters. Tag input is normalized as it is applied, so the draft always
/// holds canonical upper-case values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncounterDraft {
    pub matched_turtle: Option<MatchedTurtle>,
    pub previous: TagSet,
    pub current: TagSet,
    pub encounter_at: Option<DateTime<Utc>>,
    pub observer_id: Option<String>,
    pub observer_name: String,
    pub comments: String,
}

/// One field edit. The reducer is the only way a draft changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DraftEdit {
    /// Operator confirmed a match: pre-fill previous AND current tags
    /// from the turtle (the observer then edits what differs)
    SelectTurtle(MatchedTurtle),
    /// Back to the new-individual shape
    ClearTurtle,
    /// Raw text for one position; trimmed, upper-cased, empty clears
    SetTag(TagPosition, String),
    SetEncounterAt(DateTime<Utc>),
    SetObserver {
        id: Option<String>,
        name: String,
    },
    SetComments(String),
}

impl EncounterDraft {
    pub fn new() -> Self {
        EncounterDraft::default()
    }

    /// Pure transition: consumes the draft and returns the edited one.
    pub fn apply(self, edit: DraftEdit) -> EncounterDraft {
        let mut next = self;

        match edit {
            DraftEdit::SelectTurtle(turtle) => {
                next.previous = turtle.tags.clone();
                next.current = turtle.tags.clone();
                next.matched_turtle = Some(turtle);
            }
            DraftEdit::ClearTurtle => {
                next.matched_turtle = None;
                next.previous = TagSet::empty();
                next.current = TagSet::empty();
            }
            DraftEdit::SetTag(position, raw) => {
                let trimmed = raw.trim();
                let value = if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_uppercase())
                };
                next.current.set(position, value);
            }
            DraftEdit::SetEncounterAt(at) => {
                next.encounter_at = Some(at);
            }
            DraftEdit::SetObserver { id, name } => {
                next.observer_id = id;
                next.observer_name = name;
            }
            DraftEdit::SetComments(comments) => {
                next.comments = comments;
            }
        }

        next
    }

    /// Validate and convert into the request shape the encounter pipeline
    /// consumes. The draft itself is left usable (e.g. to re-submit after
    /// a persistence failure).
    pub fn finalize(&self, org_id: &str) -> Result<EncounterRequest, ConsoleError> {
        let encounter_at = self.encounter_at.ok_or_else(|| {
            ConsoleError::Validation("encounter date and time is required".to_string())
        })?;

        if self.observer_name.trim().is_empty() {
            return Err(ConsoleError::Validation(
                "observer name is required".to_string(),
            ));
        }

        if self.matched_turtle.is_none() && self.current.is_empty() {
            return Err(ConsoleError::Validation(
                "select an existing turtle or enter at least one tag value".to_string(),
            ));
        }

        Ok(EncounterRequest {
            matched_turtle_id: self.matched_turtle.as_ref().map(|t| t.id.clone()),
            tags: self.current.clone(),
            encounter_at,
            observer_id: self.observer_id.clone(),
            observer_name: self.observer_name.trim().to_string(),
            org_id: org_id.to_string(),
            comments: if self.comments.trim().is_empty() {
                None
            } else {
                Some(self.comments.clone())
            },
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
