// 🐢 Encounter Pipeline - Turtle identity resolution + tag history audit
// Decides create-new vs update-existing for a human-confirmed match and
// records the tag-state transition for the audit trail.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::db::{self, UNNAMED_PREFIX};
use crate::tags::{diff, TagSet, TagTransition};

// ============================================================================
// ERRORS
// ============================================================================

/// Error taxonomy for console operations.
///
/// Validation and Conflict abort before any mutation. Persistence during
/// the identity transaction rolls everything back. A failed audit write is
/// NOT an error here: the encounter stands and the failure is reported as
/// a warning on the outcome.
#[derive(Debug)]
pub enum ConsoleError {
    /// Missing required scope or identity (e.g. no organization)
    Validation(String),
    /// Name-uniqueness violation on explicit assignment
    Conflict(String),
    /// The backing store rejected a write
    Persistence(String),
}

impl std::fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsoleError::Validation(msg) => write!(f, "validation failed: {}", msg),
            ConsoleError::Conflict(msg) => write!(f, "conflict: {}", msg),
            ConsoleError::Persistence(msg) => write!(f, "persistence failure: {}", msg),
        }
    }
}

impl std::error::Error for ConsoleError {}

impl From<rusqlite::Error> for ConsoleError {
    fn from(err: rusqlite::Error) -> Self {
        ConsoleError::Persistence(err.to_string())
    }
}

// ============================================================================
// REQUEST / OUTCOME
// ============================================================================

/// What the observation intake collaborator supplies for one encounter.
/// The matched turtle, if any, was confirmed by a human operator through
/// the turtle search screen - no fuzzy matching happens here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncounterRequest {
    pub matched_turtle_id: Option<String>,
    pub tags: TagSet,
    pub encounter_at: DateTime<Utc>,
    pub observer_id: Option<String>,
    pub observer_name: String,
    pub org_id: String,
    pub comments: Option<String>,
}

/// What the intake collaborator gets back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncounterOutcome {
    pub turtle_id: String,
    pub turtle_name: String,
    pub observation_id: String,
    pub is_new_turtle: bool,
    /// Set when the encounter was recorded but the audit-trail write
    /// failed (best-effort policy; see record_tag_history)
    pub audit_warning: Option<String>,
}

// ============================================================================
// ENCOUNTER PIPELINE
// ============================================================================

/// Record one encounter: resolve the turtle identity, persist the
/// observation, then write the tag history audit record.
///
/// The identity steps (previous-tag-set read, turtle create/update,
/// observation insert) run inside a single SQLite transaction, so a
/// failure leaves no partial state and the returned previous tag-set is
/// exactly what the row held before this write. The audit write runs
/// after commit and is best-effort: a failure there is logged and
/// surfaced via `audit_warning`, never rolled back into the encounter.
pub fn submit_encounter(
    conn: &mut Connection,
    request: &EncounterRequest,
) -> Result<EncounterOutcome, ConsoleError> {
    validate_request(request)?;

    let tx = conn.transaction()?;

    let (turtle_id, turtle_name, previous, is_new_turtle) = match &request.matched_turtle_id {
        None => create_turtle(&tx, request)?,
        Some(turtle_id) => update_turtle(&tx, turtle_id, request)?,
    };

    let observation_id = insert_observation(&tx, &turtle_id, &turtle_name, request, is_new_turtle)?;

    tx.commit()?;

    // Best-effort audit trail. The encounter is already committed; losing
    // the audit record is preferable to losing the encounter itself.
    let audit_warning = match record_tag_history(
        conn,
        &turtle_id,
        &observation_id,
        request,
        &previous,
        is_new_turtle,
    ) {
        Ok(_) => None,
        Err(err) => {
            eprintln!(
                "Warning: tag history write failed for turtle {}: {}",
                turtle_id, err
            );
            Some(format!("tag history not recorded: {}", err))
        }
    };

    Ok(EncounterOutcome {
        turtle_id,
        turtle_name,
        observation_id,
        is_new_turtle,
        audit_warning,
    })
}

fn validate_request(request: &EncounterRequest) -> Result<(), ConsoleError> {
    if request.org_id.trim().is_empty() {
        return Err(ConsoleError::Validation(
            "organization scope is required".to_string(),
        ));
    }
    if request.observer_name.trim().is_empty() {
        return Err(ConsoleError::Validation(
            "observer name is required".to_string(),
        ));
    }
    if request.matched_turtle_id.is_none() && request.tags.is_empty() {
        return Err(ConsoleError::Validation(
            "select an existing turtle or enter at least one tag value".to_string(),
        ));
    }
    Ok(())
}

/// New individual: mint a provisional name and insert the turtle.
/// The previous tag-set of a brand-new turtle is all-empty by definition.
fn create_turtle(
    tx: &Connection,
    request: &EncounterRequest,
) -> Result<(String, String, TagSet, bool), ConsoleError> {
    let name = next_unnamed_name(tx, &request.org_id, request.encounter_at)?;
    let id = uuid::Uuid::new_v4().to_string();
    let encounter_iso = request.encounter_at.to_rfc3339();

    tx.execute(
        "INSERT INTO turtles (
            id, org_id, name, lrf, rrf, rff, lff,
            first_encountered_at, last_encountered_at, encounter_count, created_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10)",
        params![
            id,
            request.org_id,
            name,
            request.tags.lrf,
            request.tags.rrf,
            request.tags.rff,
            request.tags.lff,
            encounter_iso,
            encounter_iso,
            request.observer_id,
        ],
    )?;

    Ok((id, name, TagSet::empty(), true))
}

/// Recapture: overwrite the tag values with what was observed (an empty
/// observed value clears the stored tag - the encounter confirmed the tag
/// absent), advance last_encountered_at and bump the encounter counter.
/// Returns the tag-set as it stood before this update.
fn update_turtle(
    tx: &Connection,
    turtle_id: &str,
    request: &EncounterRequest,
) -> Result<(String, String, TagSet, bool), ConsoleError> {
    let turtle = db::get_turtle_by_id(tx, turtle_id)
        .map_err(|e| ConsoleError::Persistence(e.to_string()))?
        .ok_or_else(|| {
            ConsoleError::Validation(format!("matched turtle {} does not exist", turtle_id))
        })?;

    if turtle.org_id != request.org_id {
        return Err(ConsoleError::Validation(format!(
            "matched turtle {} belongs to a different organization",
            turtle_id
        )));
    }

    let previous = turtle.tags.clone();
    let last_encountered = turtle.last_encountered_at.max(request.encounter_at);

    tx.execute(
        "UPDATE turtles SET
            lrf = ?1, rrf = ?2, rff = ?3, lff = ?4,
            last_encountered_at = ?5,
            encounter_count = encounter_count + 1
         WHERE id = ?6",
        params![
            request.tags.lrf,
            request.tags.rrf,
            request.tags.rff,
            request.tags.lff,
            last_encountered.to_rfc3339(),
            turtle_id,
        ],
    )?;

    Ok((turtle.id, turtle.name, previous, false))
}

fn insert_observation(
    tx: &Connection,
    turtle_id: &str,
    turtle_name: &str,
    request: &EncounterRequest,
    is_new_turtle: bool,
) -> Result<String, ConsoleError> {
    let id = uuid::Uuid::new_v4().to_string();

    tx.execute(
        "INSERT INTO observations (
            id, org_id, turtle_id, turtle_name, encounter_date,
            observer_id, observer_name,
            tag_lrf, tag_rrf, tag_rff, tag_lff,
            is_recapture, comments
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            id,
            request.org_id,
            turtle_id,
            turtle_name,
            request.encounter_at.to_rfc3339(),
            request.observer_id,
            request.observer_name,
            request.tags.lrf,
            request.tags.rrf,
            request.tags.rff,
            request.tags.lff,
            !is_new_turtle,
            request.comments,
        ],
    )?;

    Ok(id)
}

/// Provisional name for a first sighting: `UNNAMED-<YYYYMMDD>-<seq>`.
/// The sequence disambiguates within one day and organization; it is
/// derived from existing rows inside the caller's transaction.
fn next_unnamed_name(
    tx: &Connection,
    org_id: &str,
    encounter_at: DateTime<Utc>,
) -> Result<String, ConsoleError> {
    let day = encounter_at.format("%Y%m%d").to_string();
    let existing = db::count_unnamed_for_day(tx, org_id, &day)
        .map_err(|e| ConsoleError::Persistence(e.to_string()))?;

    Ok(format!("{}{}-{:03}", UNNAMED_PREFIX, day, existing + 1))
}

// ============================================================================
// TAG HISTORY RECORDER
// ============================================================================

/// Persist the audit record for one encounter's tag transition.
///
/// A record is warranted when the diff between previous and observed
/// tag-sets is non-empty, or when the turtle is brand new (its previous
/// values are all empty by definition). Returns the new record id, or
/// None when nothing changed and no record is needed.
pub fn record_tag_history(
    conn: &Connection,
    turtle_id: &str,
    observation_id: &str,
    request: &EncounterRequest,
    previous: &TagSet,
    is_new_turtle: bool,
) -> Result<Option<String>, ConsoleError> {
    let transitions = diff(previous, &request.tags);

    if transitions.is_empty() && !is_new_turtle {
        return Ok(None);
    }

    let id = uuid::Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO tag_history (
            id, org_id, turtle_id, observation_id, encounter_date,
            observer_id, observer_name,
            lrf, rrf, rff, lff,
            previous_lrf, previous_rrf, previous_rff, previous_lff,
            notes
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            id,
            request.org_id,
            turtle_id,
            observation_id,
            request.encounter_at.to_rfc3339(),
            request.observer_id,
            request.observer_name,
            request.tags.lrf,
            request.tags.rrf,
            request.tags.rff,
            request.tags.lff,
            previous.lrf,
            previous.rrf,
            previous.rff,
            previous.lff,
            tag_notes(&transitions),
        ],
    )?;

    Ok(Some(id))
}

/// Human-readable change summary in the intake-form vocabulary,
/// e.g. "Tags updated: LRF new, RRF fell_off"
fn tag_notes(transitions: &[TagTransition]) -> Option<String> {
    if transitions.is_empty() {
        return None;
    }

    let parts: Vec<String> = transitions
        .iter()
        .map(|t| format!("{} {}", t.position.as_str(), t.kind.form_verb()))
        .collect();

    Some(format!("Tags updated: {}", parts.join(", ")))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_observations, count_tag_history, get_tag_history_for_turtle};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn create_test_request(
        matched: Option<&str>,
        tags: TagSet,
        when: &str,
    ) -> EncounterRequest {
        EncounterRequest {
            matched_turtle_id: matched.map(String::from),
            tags,
            encounter_at: ts(when),
            observer_id: Some("vol-7".to_string()),
            observer_name: "Ana Reyes".to_string(),
            org_id: "org-1".to_string(),
            comments: None,
        }
    }

    #[test]
    fn test_new_encounter_creates_unnamed_turtle() {
        // Scenario: first sighting with one rear tag, raw lower-case input
        let mut conn = test_conn();
        let request = create_test_request(
            None,
            TagSet::from_observed(Some("ab12"), None, None, None),
            "2025-06-15T22:30:00Z",
        );

        let outcome = submit_encounter(&mut conn, &request).unwrap();

        assert!(outcome.is_new_turtle);
        assert_eq!(outcome.turtle_name, "UNNAMED-20250615-001");
        assert!(outcome.audit_warning.is_none());

        let turtle = db::get_turtle_by_id(&conn, &outcome.turtle_id)
            .unwrap()
            .unwrap();
        assert_eq!(turtle.encounter_count, 1);
        assert_eq!(turtle.tags.lrf, Some("AB12".to_string()));
        assert_eq!(turtle.first_encountered_at, turtle.last_encountered_at);

        // One audit record, previous values all empty
        let history = get_tag_history_for_turtle(&conn, &outcome.turtle_id).unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].previous.is_empty());
        assert_eq!(history[0].current.lrf, Some("AB12".to_string()));
        assert_eq!(
            history[0].notes.as_deref(),
            Some("Tags updated: LRF new")
        );
    }

    #[test]
    fn test_unnamed_sequence_increments_within_day() {
        let mut conn = test_conn();
        let first = submit_encounter(
            &mut conn,
            &create_test_request(
                None,
                TagSet::from_observed(Some("AB12"), None, None, None),
                "2025-06-15T21:00:00Z",
            ),
        )
        .unwrap();
        let second = submit_encounter(
            &mut conn,
            &create_test_request(
                None,
                TagSet::from_observed(Some("CD34"), None, None, None),
                "2025-06-15T23:00:00Z",
            ),
        )
        .unwrap();
        let next_day = submit_encounter(
            &mut conn,
            &create_test_request(
                None,
                TagSet::from_observed(Some("EF56"), None, None, None),
                "2025-06-16T01:00:00Z",
            ),
        )
        .unwrap();

        assert_eq!(first.turtle_name, "UNNAMED-20250615-001");
        assert_eq!(second.turtle_name, "UNNAMED-20250615-002");
        assert_eq!(next_day.turtle_name, "UNNAMED-20250616-001");
    }

    #[test]
    fn test_recapture_with_identical_tags_writes_no_history() {
        let mut conn = test_conn();
        let tags = TagSet::from_observed(Some("AB12"), Some("CD34"), None, None);
        let first = submit_encounter(
            &mut conn,
            &create_test_request(None, tags.clone(), "2025-06-15T22:00:00Z"),
        )
        .unwrap();
        assert_eq!(count_tag_history(&conn, "org-1").unwrap(), 1);

        let outcome = submit_encounter(
            &mut conn,
            &create_test_request(Some(&first.turtle_id), tags, "2025-07-01T22:00:00Z"),
        )
        .unwrap();

        assert!(!outcome.is_new_turtle);
        let turtle = db::get_turtle_by_id(&conn, &first.turtle_id).unwrap().unwrap();
        assert_eq!(turtle.encounter_count, 2);
        assert_eq!(turtle.last_encountered_at, ts("2025-07-01T22:00:00Z"));
        // No change, no audit record
        assert_eq!(count_tag_history(&conn, "org-1").unwrap(), 1);
    }

    #[test]
    fn test_recapture_with_cleared_tag_records_loss() {
        // Scenario: RRF tag confirmed missing at re-encounter
        let mut conn = test_conn();
        let first = submit_encounter(
            &mut conn,
            &create_test_request(
                None,
                TagSet::from_observed(Some("AB12"), Some("CD34"), None, None),
                "2025-06-15T22:00:00Z",
            ),
        )
        .unwrap();

        let outcome = submit_encounter(
            &mut conn,
            &create_test_request(
                Some(&first.turtle_id),
                TagSet::from_observed(Some("AB12"), Some(""), None, None),
                "2025-07-01T22:00:00Z",
            ),
        )
        .unwrap();

        let turtle = db::get_turtle_by_id(&conn, &outcome.turtle_id).unwrap().unwrap();
        assert_eq!(turtle.encounter_count, 2);
        // Empty observed value clears the stored tag
        assert_eq!(turtle.tags.rrf, None);
        assert_eq!(turtle.tags.lrf, Some("AB12".to_string()));

        let history = get_tag_history_for_turtle(&conn, &outcome.turtle_id).unwrap();
        assert_eq!(history.len(), 2);
        // Newest first; the loss record keeps the old value searchable
        assert_eq!(history[0].previous.rrf, Some("CD34".to_string()));
        assert_eq!(history[0].current.rrf, None);
        assert_eq!(
            history[0].notes.as_deref(),
            Some("Tags updated: RRF fell_off")
        );
    }

    #[test]
    fn test_last_encountered_never_regresses() {
        let mut conn = test_conn();
        let first = submit_encounter(
            &mut conn,
            &create_test_request(
                None,
                TagSet::from_observed(Some("AB12"), None, None, None),
                "2025-07-01T22:00:00Z",
            ),
        )
        .unwrap();

        // Backfilled encounter that predates the last one
        submit_encounter(
            &mut conn,
            &create_test_request(
                Some(&first.turtle_id),
                TagSet::from_observed(Some("AB12"), None, None, None),
                "2025-06-01T22:00:00Z",
            ),
        )
        .unwrap();

        let turtle = db::get_turtle_by_id(&conn, &first.turtle_id).unwrap().unwrap();
        assert_eq!(turtle.encounter_count, 2);
        assert_eq!(turtle.last_encountered_at, ts("2025-07-01T22:00:00Z"));
    }

    #[test]
    fn test_missing_org_aborts_before_mutation() {
        let mut conn = test_conn();
        let mut request = create_test_request(
            None,
            TagSet::from_observed(Some("AB12"), None, None, None),
            "2025-06-15T22:00:00Z",
        );
        request.org_id = String::new();

        let err = submit_encounter(&mut conn, &request).unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));
        assert_eq!(db::count_turtles(&conn, "").unwrap(), 0);
        assert_eq!(count_observations(&conn, "").unwrap(), 0);
    }

    #[test]
    fn test_no_match_and_no_tags_is_refused() {
        let mut conn = test_conn();
        let request = create_test_request(None, TagSet::empty(), "2025-06-15T22:00:00Z");

        let err = submit_encounter(&mut conn, &request).unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));
    }

    #[test]
    fn test_unknown_match_leaves_no_partial_state() {
        let mut conn = test_conn();
        let request = create_test_request(
            Some("no-such-turtle"),
            TagSet::from_observed(Some("AB12"), None, None, None),
            "2025-06-15T22:00:00Z",
        );

        let err = submit_encounter(&mut conn, &request).unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));
        assert_eq!(count_observations(&conn, "org-1").unwrap(), 0);
        assert_eq!(count_tag_history(&conn, "org-1").unwrap(), 0);
    }

    #[test]
    fn test_cross_org_match_is_refused() {
        let mut conn = test_conn();
        let first = submit_encounter(
            &mut conn,
            &create_test_request(
                None,
                TagSet::from_observed(Some("AB12"), None, None, None),
                "2025-06-15T22:00:00Z",
            ),
        )
        .unwrap();

        let mut request = create_test_request(
            Some(&first.turtle_id),
            TagSet::from_observed(Some("AB12"), None, None, None),
            "2025-07-01T22:00:00Z",
        );
        request.org_id = "org-2".to_string();

        let err = submit_encounter(&mut conn, &request).unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));

        let turtle = db::get_turtle_by_id(&conn, &first.turtle_id).unwrap().unwrap();
        assert_eq!(turtle.encounter_count, 1);
    }

    #[test]
    fn test_tag_notes_vocabulary() {
        let previous = TagSet::from_observed(Some("AB12"), Some("CD34"), None, None);
        let current = TagSet::from_observed(Some("XY99"), None, Some("EF56"), None);
        let transitions = diff(&previous, &current);

        let notes = tag_notes(&transitions).unwrap();
        assert_eq!(
            notes,
            "Tags updated: LRF replaced, RRF fell_off, RFF new"
        );
        assert_eq!(tag_notes(&[]), None);
    }
}
