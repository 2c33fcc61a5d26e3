// Research-flag workflow - flag a turtle for identity verification,
// resolve the flag, or reopen it. Resolution is the only way a record is
// logically retired; nothing here hard-deletes.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::db::{self, Turtle};
use crate::encounter::ConsoleError;

/// Flag a turtle for research. Re-flagging clears any earlier resolution.
pub fn flag_for_research(
    conn: &Connection,
    turtle_id: &str,
    flagged_by: Option<&str>,
    flagged_by_name: &str,
    notes: Option<&str>,
) -> Result<Turtle, ConsoleError> {
    load_turtle(conn, turtle_id)?;

    conn.execute(
        "UPDATE turtles SET
            needs_research = 1,
            research_flagged_by = ?1,
            research_flagged_by_name = ?2,
            research_flagged_at = ?3,
            research_notes = ?4,
            research_resolved_at = NULL,
            research_resolved_by = NULL
         WHERE id = ?5",
        params![
            flagged_by,
            flagged_by_name,
            Utc::now().to_rfc3339(),
            notes,
            turtle_id,
        ],
    )?;

    load_turtle(conn, turtle_id)
}

/// Mark the research flag resolved. The flag history stays on the record;
/// review screens distinguish active from resolved by the resolution
/// timestamp.
pub fn resolve_research(
    conn: &Connection,
    turtle_id: &str,
    resolved_by: &str,
) -> Result<Turtle, ConsoleError> {
    let turtle = load_turtle(conn, turtle_id)?;
    if !turtle.needs_research {
        return Err(ConsoleError::Validation(format!(
            "{} is not flagged for research",
            turtle.name
        )));
    }

    conn.execute(
        "UPDATE turtles SET
            research_resolved_at = ?1,
            research_resolved_by = ?2
         WHERE id = ?3",
        params![Utc::now().to_rfc3339(), resolved_by, turtle_id],
    )?;

    load_turtle(conn, turtle_id)
}

/// Reopen a previously resolved flag.
pub fn reopen_research(conn: &Connection, turtle_id: &str) -> Result<Turtle, ConsoleError> {
    load_turtle(conn, turtle_id)?;

    conn.execute(
        "UPDATE turtles SET
            research_resolved_at = NULL,
            research_resolved_by = NULL
         WHERE id = ?1",
        params![turtle_id],
    )?;

    load_turtle(conn, turtle_id)
}

/// Update the free-text research notes without touching the flag state.
pub fn set_research_notes(
    conn: &Connection,
    turtle_id: &str,
    notes: &str,
) -> Result<Turtle, ConsoleError> {
    load_turtle(conn, turtle_id)?;

    conn.execute(
        "UPDATE turtles SET research_notes = ?1 WHERE id = ?2",
        params![notes, turtle_id],
    )?;

    load_turtle(conn, turtle_id)
}

fn load_turtle(conn: &Connection, turtle_id: &str) -> Result<Turtle, ConsoleError> {
    db::get_turtle_by_id(conn, turtle_id)
        .map_err(|e| ConsoleError::Persistence(e.to_string()))?
        .ok_or_else(|| ConsoleError::Validation(format!("turtle {} does not exist", turtle_id)))
}

// ============================================================================
// TESTS
// ============================================================================
