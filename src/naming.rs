// Naming workflow - suggestions, approvals and custom names
// Every path that writes a permanent name re-checks uniqueness first.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::db::{self, Turtle};
use crate::encounter::ConsoleError;

/// Record a volunteer's name suggestion on a still-unnamed turtle.
/// Refused once the turtle carries a permanent name - the suggestion
/// state and a permanent name are mutually exclusive.
pub fn suggest_name(
    conn: &Connection,
    turtle_id: &str,
    name: &str,
    suggested_by: Option<&str>,
    suggested_by_name: &str,
) -> Result<Turtle, ConsoleError> {
    let turtle = load_turtle(conn, turtle_id)?;
    if !turtle.is_unnamed() {
        return Err(ConsoleError::Validation(format!(
            "{} already has a permanent name",
            turtle.name
        )));
    }

    let name = clean_name(name)?;

    conn.execute(
        "UPDATE turtles SET
            suggested_name = ?1,
            suggested_by = ?2,
            suggested_by_name = ?3,
            suggested_at = ?4
         WHERE id = ?5",
        params![
            name,
            suggested_by,
            suggested_by_name,
            Utc::now().to_rfc3339(),
            turtle_id,
        ],
    )?;

    load_turtle(conn, turtle_id)
}

/// Approve the pending suggestion: the suggested name becomes the
/// permanent name and all suggestion fields clear in the same UPDATE.
pub fn approve_suggested_name(conn: &Connection, turtle_id: &str) -> Result<Turtle, ConsoleError> {
    let turtle = load_turtle(conn, turtle_id)?;
    let name = turtle.suggested_name.clone().ok_or_else(|| {
        ConsoleError::Validation(format!("{} has no pending name suggestion", turtle.name))
    })?;

    commit_name(conn, &turtle, &name)
}

/// Discard the pending suggestion, leaving the provisional name in place.
pub fn reject_suggestion(conn: &Connection, turtle_id: &str) -> Result<Turtle, ConsoleError> {
    let turtle = load_turtle(conn, turtle_id)?;

    conn.execute(
        "UPDATE turtles SET
            suggested_name = NULL,
            suggested_by = NULL,
            suggested_by_name = NULL,
            suggested_at = NULL
         WHERE id = ?1",
        params![turtle.id],
    )?;

    load_turtle(conn, turtle_id)
}

/// Assign a coordinator-chosen name directly, replacing the provisional
/// name. Upper-cases the input, as names are stored upper-case.
pub fn assign_name(conn: &Connection, turtle_id: &str, name: &str) -> Result<Turtle, ConsoleError> {
    let turtle = load_turtle(conn, turtle_id)?;
    let name = clean_name(name)?;

    commit_name(conn, &turtle, &name)
}

/// Uniqueness precondition + the actual name write. Fails with Conflict
/// before touching anything when another turtle already holds the name.
fn commit_name(conn: &Connection, turtle: &Turtle, name: &str) -> Result<Turtle, ConsoleError> {
    let existing = db::find_turtle_by_name(conn, &turtle.org_id, name)
        .map_err(|e| ConsoleError::Persistence(e.to_string()))?;

    if let Some(other) = existing {
        if other.id != turtle.id {
            return Err(ConsoleError::Conflict(format!(
                "a turtle named \"{}\" already exists",
                name
            )));
        }
    }

    conn.execute(
        "UPDATE turtles SET
            name = ?1,
            suggested_name = NULL,
            suggested_by = NULL,
            suggested_by_name = NULL,
            suggested_at = NULL
         WHERE id = ?2",
        params![name, turtle.id],
    )?;

    load_turtle(conn, &turtle.id)
}

fn clean_name(name: &str) -> Result<String, ConsoleError> {
    let cleaned = name.trim().to_uppercase();
    if cleaned.is_empty() {
        return Err(ConsoleError::Validation("name must not be empty".to_string()));
    }
    Ok(cleaned)
}

fn load_turtle(conn: &Connection, turtle_id: &str) -> Result<Turtle, ConsoleError> {
    db::get_turtle_by_id(conn, turtle_id)
        .map_err(|e| ConsoleError::Persistence(e.to_string()))?
        .ok_or_else(|| ConsoleError::Validation(format!("turtle {} does not exist", turtle_id)))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;
    use crate::encounter::{submit_encounter, EncounterRequest};
    use crate::tags::TagSet;
    use chrono::DateTime;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn create_test_turtle(conn: &mut Connection, lrf: &str, when: &str) -> String {
        let request = EncounterRequest {
            matched_turtle_id: None,
            tags: TagSet::from_observed(Some(lrf), None, None, None),
            encounter_at: DateTime::parse_from_rfc3339(when)
                .unwrap()
                .with_timezone(&Utc),
            observer_id: None,
            observer_name: "Ana Reyes".to_string(),
            org_id: "org-1".to_string(),
            comments: None,
        };
        submit_encounter(conn, &request).unwrap().turtle_id
    }

    #[test]
    fn test_assign_name_replaces_provisional_name() {
        let mut conn = test_conn();
        let id = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");

        let turtle = assign_name(&conn, &id, "sandy").unwrap();

        assert_eq!(turtle.name, "SANDY");
        assert!(!turtle.is_unnamed());
    }

    #[test]
    fn test_assign_name_refuses_duplicate() {
        // Scenario: renaming an UNNAMED turtle to a name another turtle
        // already holds must refuse without mutating anything
        let mut conn = test_conn();
        let first = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");
        let second = create_test_turtle(&mut conn, "CD34", "2025-06-15T23:00:00Z");
        assign_name(&conn, &first, "SANDY").unwrap();

        let err = assign_name(&conn, &second, "SANDY").unwrap_err();
        assert!(matches!(err, ConsoleError::Conflict(_)));
        assert!(err.to_string().contains("SANDY"));

        // Original provisional name unchanged
        let turtle = db::get_turtle_by_id(&conn, &second).unwrap().unwrap();
        assert_eq!(turtle.name, "UNNAMED-20250615-002");
    }

    #[test]
    fn test_uniqueness_check_is_case_insensitive() {
        let mut conn = test_conn();
        let first = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");
        let second = create_test_turtle(&mut conn, "CD34", "2025-06-15T23:00:00Z");
        assign_name(&conn, &first, "Sandy").unwrap();

        let err = assign_name(&conn, &second, "sAnDy").unwrap_err();
        assert!(matches!(err, ConsoleError::Conflict(_)));
    }

    #[test]
    fn test_renaming_to_own_name_is_allowed() {
        let mut conn = test_conn();
        let id = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");
        assign_name(&conn, &id, "SANDY").unwrap();

        // Not a conflict with itself
        let turtle = assign_name(&conn, &id, "sandy").unwrap();
        assert_eq!(turtle.name, "SANDY");
    }

    #[test]
    fn test_suggestion_approval_clears_suggestion_atomically() {
        let mut conn = test_conn();
        let id = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");

        let suggested = suggest_name(&conn, &id, "shelly", Some("vol-7"), "Ana Reyes").unwrap();
        assert_eq!(suggested.suggested_name, Some("SHELLY".to_string()));
        assert_eq!(suggested.suggested_by_name, Some("Ana Reyes".to_string()));
        assert!(suggested.suggested_at.is_some());

        let approved = approve_suggested_name(&conn, &id).unwrap();
        assert_eq!(approved.name, "SHELLY");
        assert_eq!(approved.suggested_name, None);
        assert_eq!(approved.suggested_by, None);
        assert_eq!(approved.suggested_by_name, None);
        assert_eq!(approved.suggested_at, None);
    }

    #[test]
    fn test_approval_refuses_duplicate_name() {
        let mut conn = test_conn();
        let first = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");
        let second = create_test_turtle(&mut conn, "CD34", "2025-06-15T23:00:00Z");
        assign_name(&conn, &first, "SHELLY").unwrap();
        suggest_name(&conn, &second, "SHELLY", None, "Ana Reyes").unwrap();

        let err = approve_suggested_name(&conn, &second).unwrap_err();
        assert!(matches!(err, ConsoleError::Conflict(_)));

        // Suggestion survives the refusal for the coordinator to resolve
        let turtle = db::get_turtle_by_id(&conn, &second).unwrap().unwrap();
        assert!(turtle.is_unnamed());
        assert_eq!(turtle.suggested_name, Some("SHELLY".to_string()));
    }

    #[test]
    fn test_reject_suggestion_keeps_provisional_name() {
        let mut conn = test_conn();
        let id = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");
        suggest_name(&conn, &id, "SHELLY", None, "Ana Reyes").unwrap();

        let turtle = reject_suggestion(&conn, &id).unwrap();

        assert!(turtle.is_unnamed());
        assert_eq!(turtle.suggested_name, None);
        assert_eq!(turtle.suggested_at, None);
    }

    #[test]
    fn test_suggesting_on_named_turtle_is_refused() {
        let mut conn = test_conn();
        let id = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");
        assign_name(&conn, &id, "SANDY").unwrap();

        let err = suggest_name(&conn, &id, "SHELLY", None, "Ana Reyes").unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));
    }

    #[test]
    fn test_approve_without_suggestion_is_refused() {
        let mut conn = test_conn();
        let id = create_test_turtle(&mut conn, "AB12", "2025-06-15T22:00:00Z");

        let err = approve_suggested_name(&conn, &id).unwrap_err();
        assert!(matches!(err, ConsoleError::Validation(_)));
    }
}
