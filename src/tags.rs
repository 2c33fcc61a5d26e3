// 🏷️ Tag State Model - Four-position flipper tag sets
// Pure transition rules between a previous and a current tag-set

use serde::{Deserialize, Serialize};

// ============================================================================
// TAG POSITION
// ============================================================================

/// The four fixed anatomical positions a flipper tag can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagPosition {
    /// Left rear flipper
    Lrf,
    /// Right rear flipper
    Rrf,
    /// Right front flipper
    Rff,
    /// Left front flipper
    Lff,
}

impl TagPosition {
    /// All positions, in the order they appear on datasheets and reports
    pub const ALL: [TagPosition; 4] = [
        TagPosition::Lrf,
        TagPosition::Rrf,
        TagPosition::Rff,
        TagPosition::Lff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TagPosition::Lrf => "LRF",
            TagPosition::Rrf => "RRF",
            TagPosition::Rff => "RFF",
            TagPosition::Lff => "LFF",
        }
    }

    /// Long-form label used in CMTTP exports and review screens
    pub fn label(&self) -> &'static str {
        match self {
            TagPosition::Lrf => "LRF (Left Rear)",
            TagPosition::Rrf => "RRF (Right Rear)",
            TagPosition::Rff => "RFF (Right Front)",
            TagPosition::Lff => "LFF (Left Front)",
        }
    }
}

// ============================================================================
// TAG SET
// ============================================================================

/// The four-position tuple of known tag values at a point in time.
///
/// An empty slot means "no tag at this position". Values are expected to be
/// upper-cased before they reach this model; `diff` compares verbatim and
/// never normalizes case itself. Use [`TagSet::from_observed`] to apply the
/// system convention (trim, upper-case, empty string → no tag) to raw form
/// input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet {
    pub lrf: Option<String>,
    pub rrf: Option<String>,
    pub rff: Option<String>,
    pub lff: Option<String>,
}

impl TagSet {
    /// Empty tag-set: the canonical "previous" state of a brand-new turtle
    pub fn empty() -> Self {
        TagSet::default()
    }

    /// Build a tag-set from raw observed values, applying the system
    /// normalization convention: trim whitespace, upper-case, and treat an
    /// empty string the same as an absent value.
    pub fn from_observed(
        lrf: Option<&str>,
        rrf: Option<&str>,
        rff: Option<&str>,
        lff: Option<&str>,
    ) -> Self {
        TagSet {
            lrf: normalize_tag(lrf),
            rrf: normalize_tag(rrf),
            rff: normalize_tag(rff),
            lff: normalize_tag(lff),
        }
    }

    pub fn get(&self, position: TagPosition) -> Option<&str> {
        match position {
            TagPosition::Lrf => self.lrf.as_deref(),
            TagPosition::Rrf => self.rrf.as_deref(),
            TagPosition::Rff => self.rff.as_deref(),
            TagPosition::Lff => self.lff.as_deref(),
        }
    }

    pub fn set(&mut self, position: TagPosition, value: Option<String>) {
        let slot = match position {
            TagPosition::Lrf => &mut self.lrf,
            TagPosition::Rrf => &mut self.rrf,
            TagPosition::Rff => &mut self.rff,
            TagPosition::Lff => &mut self.lff,
        };
        *slot = value.filter(|v| !v.is_empty());
    }

    /// True if no position holds a tag
    pub fn is_empty(&self) -> bool {
        TagPosition::ALL.iter().all(|p| self.get(*p).is_none())
    }
}

fn normalize_tag(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

// ============================================================================
// TRANSITION CLASSIFICATION
// ============================================================================

/// How a single tag position changed between two encounters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagChangeKind {
    /// Tag applied where none was recorded before
    New,
    /// Different tag than previously recorded
    Replaced,
    /// Previously recorded tag confirmed missing
    Lost,
}

impl TagChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagChangeKind::New => "new",
            TagChangeKind::Replaced => "replaced",
            TagChangeKind::Lost => "lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(TagChangeKind::New),
            "replaced" => Some(TagChangeKind::Replaced),
            "lost" => Some(TagChangeKind::Lost),
            _ => None,
        }
    }

    /// Status column value in the CMTTP report
    pub fn cmttp_status(&self) -> &'static str {
        match self {
            TagChangeKind::New => "Active",
            TagChangeKind::Replaced => "Replaced",
            TagChangeKind::Lost => "Lost",
        }
    }

    /// Verb used on intake datasheets and in audit notes
    pub fn form_verb(&self) -> &'static str {
        match self {
            TagChangeKind::New => "new",
            TagChangeKind::Replaced => "replaced",
            TagChangeKind::Lost => "fell_off",
        }
    }
}

/// One position's transition between two tag-sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagTransition {
    pub position: TagPosition,
    pub previous: Option<String>,
    pub current: Option<String>,
    pub kind: TagChangeKind,
}

/// Compute the per-position transitions between two tag-sets.
///
/// Pure and total: empty/absent is the canonical "no tag" value, positions
/// with no change are omitted, and the result is empty when the sets are
/// equal. Comparison is verbatim - callers normalize case beforehand.
pub fn diff(previous: &TagSet, current: &TagSet) -> Vec<TagTransition> {
    let mut transitions = Vec::new();

    for position in TagPosition::ALL {
        let prev = previous.get(position);
        let cur = current.get(position);

        let kind = match (prev, cur) {
            (None, Some(_)) => TagChangeKind::New,
            (Some(p), Some(c)) if p != c => TagChangeKind::Replaced,
            (Some(_), None) => TagChangeKind::Lost,
            // Equal, or both empty
            _ => continue,
        };

        transitions.push(TagTransition {
            position,
            previous: prev.map(|s| s.to_string()),
            current: cur.map(|s| s.to_string()),
            kind,
        });
    }

    transitions
}

// ============================================================================
// TESTS
// ============================================================================
