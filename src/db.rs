use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::tags::TagSet;

/// Prefix of the provisional names given to turtles that have not been
/// named by a coordinator yet (`UNNAMED-<YYYYMMDD>-<seq>`).
pub const UNNAMED_PREFIX: &str = "UNNAMED-";

// ============================================================================
// RECORDS
// ============================================================================

/// A conservation-tracked individual animal.
///
/// Identity is the UUID; the display name, tag values and research state
/// are values that change across encounters. Tag values are stored
/// upper-cased.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turtle {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub species: Option<String>,
    pub tags: TagSet,

    // Name-suggestion state (mutually exclusive with a permanent name)
    pub suggested_name: Option<String>,
    pub suggested_by: Option<String>,
    pub suggested_by_name: Option<String>,
    pub suggested_at: Option<DateTime<Utc>>,

    // Research-flag state
    pub needs_research: bool,
    pub research_flagged_by: Option<String>,
    pub research_flagged_by_name: Option<String>,
    pub research_flagged_at: Option<DateTime<Utc>>,
    pub research_notes: Option<String>,
    pub research_resolved_at: Option<DateTime<Utc>>,
    pub research_resolved_by: Option<String>,

    // Encounter bookkeeping
    pub first_encountered_at: DateTime<Utc>,
    pub last_encountered_at: DateTime<Utc>,
    pub encounter_count: i64,

    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Turtle {
    /// True while the turtle still carries a provisional `UNNAMED-` name
    pub fn is_unnamed(&self) -> bool {
        self.name.starts_with(UNNAMED_PREFIX)
    }
}

/// One submitted encounter. The intake form and photo plumbing live
/// outside this crate; the row is persisted here because the tag history
/// audit trail references it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: String,
    pub org_id: String,
    pub turtle_id: String,
    pub turtle_name: Option<String>,
    pub encounter_date: DateTime<Utc>,
    pub observer_id: Option<String>,
    pub observer_name: String,
    pub tags: TagSet,
    pub is_recapture: bool,
    pub comments: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Immutable audit entry for the tag-state transition observed at one
/// encounter. Written once, never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagHistoryRecord {
    pub id: String,
    pub org_id: String,
    pub turtle_id: String,
    /// Display name of the owning turtle (joined at read time)
    pub turtle_name: String,
    pub observation_id: String,
    pub encounter_date: DateTime<Utc>,
    pub observer_id: Option<String>,
    pub observer_name: String,
    /// Tag values as held before this encounter
    pub previous: TagSet,
    /// Tag values as observed at this encounter
    pub current: TagSet,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// FILTERS
// ============================================================================

/// Filters for the turtle roster screens.
#[derive(Debug, Clone, Default)]
pub struct TurtleFilters {
    /// Substring match across name and all four tag values
    pub search: Option<String>,
    /// Some(true) = named only, Some(false) = UNNAMED- only
    pub has_name: Option<bool>,
    pub needs_research: Option<bool>,
}

/// Pre-filters for tag history reads. Applied in SQL before any
/// classification: a record matches the tag search if ANY of its eight
/// stored values (four previous + four current) contains the substring.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilters {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub tag_search: Option<String>,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS turtles (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            name TEXT NOT NULL,
            species TEXT,
            lrf TEXT,
            rrf TEXT,
            rff TEXT,
            lff TEXT,
            suggested_name TEXT,
            suggested_by TEXT,
            suggested_by_name TEXT,
            suggested_at TEXT,
            needs_research INTEGER NOT NULL DEFAULT 0,
            research_flagged_by TEXT,
            research_flagged_by_name TEXT,
            research_flagged_at TEXT,
            research_notes TEXT,
            research_resolved_at TEXT,
            research_resolved_by TEXT,
            first_encountered_at TEXT NOT NULL,
            last_encountered_at TEXT NOT NULL,
            encounter_count INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS observations (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            turtle_id TEXT NOT NULL,
            turtle_name TEXT,
            encounter_date TEXT NOT NULL,
            observer_id TEXT,
            observer_name TEXT NOT NULL,
            tag_lrf TEXT,
            tag_rrf TEXT,
            tag_rff TEXT,
            tag_lff TEXT,
            is_recapture INTEGER NOT NULL DEFAULT 0,
            comments TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Audit trail: previous values are stored alongside current ones so
    // the tag search can match a number that has since been replaced.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tag_history (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            turtle_id TEXT NOT NULL,
            observation_id TEXT NOT NULL,
            encounter_date TEXT NOT NULL,
            observer_id TEXT,
            observer_name TEXT NOT NULL,
            lrf TEXT,
            rrf TEXT,
            rff TEXT,
            lff TEXT,
            previous_lrf TEXT,
            previous_rrf TEXT,
            previous_rff TEXT,
            previous_lff TEXT,
            notes TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_turtles_org_name ON turtles(org_id, name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_observations_turtle ON observations(turtle_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tag_history_turtle ON tag_history(turtle_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tag_history_date ON tag_history(encounter_date)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// ROW MAPPING
// ============================================================================

fn parse_ts(value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

fn opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

const TURTLE_COLUMNS: &str = "id, org_id, name, species, lrf, rrf, rff, lff,
        suggested_name, suggested_by, suggested_by_name, suggested_at,
        needs_research, research_flagged_by, research_flagged_by_name,
        research_flagged_at, research_notes, research_resolved_at,
        research_resolved_by, first_encountered_at, last_encountered_at,
        encounter_count, created_by, created_at";

fn turtle_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turtle> {
    Ok(Turtle {
        id: row.get(0)?,
        org_id: row.get(1)?,
        name: row.get(2)?,
        species: row.get(3)?,
        tags: TagSet {
            lrf: row.get(4)?,
            rrf: row.get(5)?,
            rff: row.get(6)?,
            lff: row.get(7)?,
        },
        suggested_name: row.get(8)?,
        suggested_by: row.get(9)?,
        suggested_by_name: row.get(10)?,
        suggested_at: opt_ts(row.get(11)?),
        needs_research: row.get::<_, i64>(12)? != 0,
        research_flagged_by: row.get(13)?,
        research_flagged_by_name: row.get(14)?,
        research_flagged_at: opt_ts(row.get(15)?),
        research_notes: row.get(16)?,
        research_resolved_at: opt_ts(row.get(17)?),
        research_resolved_by: row.get(18)?,
        first_encountered_at: parse_ts(row.get(19)?)?,
        last_encountered_at: parse_ts(row.get(20)?)?,
        encounter_count: row.get(21)?,
        created_by: row.get(22)?,
        created_at: opt_ts(row.get(23)?).unwrap_or_else(Utc::now),
    })
}

fn history_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagHistoryRecord> {
    Ok(TagHistoryRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        turtle_id: row.get(2)?,
        observation_id: row.get(3)?,
        encounter_date: parse_ts(row.get(4)?)?,
        observer_id: row.get(5)?,
        observer_name: row.get(6)?,
        current: TagSet {
            lrf: row.get(7)?,
            rrf: row.get(8)?,
            rff: row.get(9)?,
            lff: row.get(10)?,
        },
        previous: TagSet {
            lrf: row.get(11)?,
            rrf: row.get(12)?,
            rff: row.get(13)?,
            lff: row.get(14)?,
        },
        notes: row.get(15)?,
        created_at: opt_ts(row.get(16)?).unwrap_or_else(Utc::now),
        turtle_name: row.get(17)?,
    })
}

// ============================================================================
// TURTLE READS
// ============================================================================

pub fn get_turtle_by_id(conn: &Connection, id: &str) -> Result<Option<Turtle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURTLE_COLUMNS} FROM turtles WHERE id = ?1"
    ))?;

    let mut rows = stmt.query_map(params![id], turtle_from_row)?;
    match rows.next() {
        Some(turtle) => Ok(Some(turtle?)),
        None => Ok(None),
    }
}

/// Look up a turtle by display name, case-insensitively. This is the
/// uniqueness precondition check behind every name-assignment path.
pub fn find_turtle_by_name(
    conn: &Connection,
    org_id: &str,
    name: &str,
) -> Result<Option<Turtle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURTLE_COLUMNS} FROM turtles
         WHERE org_id = ?1 AND name = ?2 COLLATE NOCASE"
    ))?;

    let mut rows = stmt.query_map(params![org_id, name], turtle_from_row)?;
    match rows.next() {
        Some(turtle) => Ok(Some(turtle?)),
        None => Ok(None),
    }
}

/// Get all turtles in an organization, with optional roster filters.
pub fn get_turtles(
    conn: &Connection,
    org_id: &str,
    filters: &TurtleFilters,
) -> Result<Vec<Turtle>> {
    let mut sql = format!("SELECT {TURTLE_COLUMNS} FROM turtles WHERE org_id = ?1");
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(org_id.to_string())];

    if let Some(search) = &filters.search {
        let pattern = format!("%{}%", search);
        sql.push_str(
            " AND (name LIKE ?2 OR lrf LIKE ?2 OR rrf LIKE ?2
                   OR rff LIKE ?2 OR lff LIKE ?2)",
        );
        args.push(Box::new(pattern));
    }

    match filters.has_name {
        Some(true) => sql.push_str(" AND name NOT LIKE 'UNNAMED-%'"),
        Some(false) => sql.push_str(" AND name LIKE 'UNNAMED-%'"),
        None => {}
    }

    if let Some(needs) = filters.needs_research {
        sql.push_str(if needs {
            " AND needs_research = 1"
        } else {
            " AND needs_research = 0"
        });
    }

    sql.push_str(" ORDER BY name ASC");

    let mut stmt = conn.prepare(&sql)?;
    let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let turtles = stmt
        .query_map(params_ref.as_slice(), turtle_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(turtles)
}

/// Turtles still carrying a provisional UNNAMED- name, newest first
pub fn get_unnamed_turtles(conn: &Connection, org_id: &str) -> Result<Vec<Turtle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURTLE_COLUMNS} FROM turtles
         WHERE org_id = ?1 AND name LIKE 'UNNAMED-%'
         ORDER BY first_encountered_at DESC"
    ))?;

    let turtles = stmt
        .query_map(params![org_id], turtle_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(turtles)
}

pub fn get_turtles_needing_research(conn: &Connection, org_id: &str) -> Result<Vec<Turtle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TURTLE_COLUMNS} FROM turtles
         WHERE org_id = ?1 AND needs_research = 1
         ORDER BY research_flagged_at DESC"
    ))?;

    let turtles = stmt
        .query_map(params![org_id], turtle_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(turtles)
}

/// Number of turtles created on the given day with a provisional name.
/// Drives the per-day sequence suffix of new UNNAMED- names.
pub fn count_unnamed_for_day(conn: &Connection, org_id: &str, yyyymmdd: &str) -> Result<i64> {
    let pattern = format!("{}{}-%", UNNAMED_PREFIX, yyyymmdd);
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM turtles WHERE org_id = ?1 AND name LIKE ?2",
        params![org_id, pattern],
        |row| row.get(0),
    )?;

    Ok(count)
}

// ============================================================================
// OBSERVATIONS
// ============================================================================

fn observation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Observation> {
    Ok(Observation {
        id: row.get(0)?,
        org_id: row.get(1)?,
        turtle_id: row.get(2)?,
        turtle_name: row.get(3)?,
        encounter_date: parse_ts(row.get(4)?)?,
        observer_id: row.get(5)?,
        observer_name: row.get(6)?,
        tags: TagSet {
            lrf: row.get(7)?,
            rrf: row.get(8)?,
            rff: row.get(9)?,
            lff: row.get(10)?,
        },
        is_recapture: row.get::<_, i64>(11)? != 0,
        comments: row.get(12)?,
        created_at: opt_ts(row.get(13)?).unwrap_or_else(Utc::now),
    })
}

/// All encounters recorded for one turtle, newest first.
pub fn get_observations_for_turtle(
    conn: &Connection,
    turtle_id: &str,
) -> Result<Vec<Observation>> {
    let mut stmt = conn.prepare(
        "SELECT id, org_id, turtle_id, turtle_name, encounter_date,
                observer_id, observer_name,
                tag_lrf, tag_rrf, tag_rff, tag_lff,
                is_recapture, comments, created_at
         FROM observations
         WHERE turtle_id = ?1
         ORDER BY encounter_date DESC",
    )?;

    let observations = stmt
        .query_map(params![turtle_id], observation_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(observations)
}

// ============================================================================
// TAG HISTORY
// ============================================================================

/// Read tag history records with the report pre-filters applied in SQL.
/// The tag search matches any of the eight stored values, including
/// positions that did not change. Sorted encounter date descending (the
/// report default).
pub fn get_tag_history(
    conn: &Connection,
    org_id: &str,
    filters: &HistoryFilters,
) -> Result<Vec<TagHistoryRecord>> {
    let mut sql = String::from(
        "SELECT h.id, h.org_id, h.turtle_id, h.observation_id, h.encounter_date,
                h.observer_id, h.observer_name,
                h.lrf, h.rrf, h.rff, h.lff,
                h.previous_lrf, h.previous_rrf, h.previous_rff, h.previous_lff,
                h.notes, h.created_at, t.name
         FROM tag_history h
         JOIN turtles t ON t.id = h.turtle_id
         WHERE h.org_id = ?1",
    );
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(org_id.to_string())];

    if let Some(from) = &filters.date_from {
        args.push(Box::new(from.to_rfc3339()));
        sql.push_str(&format!(" AND h.encounter_date >= ?{}", args.len()));
    }
    if let Some(to) = &filters.date_to {
        args.push(Box::new(to.to_rfc3339()));
        sql.push_str(&format!(" AND h.encounter_date <= ?{}", args.len()));
    }
    if let Some(search) = &filters.tag_search {
        args.push(Box::new(format!("%{}%", search)));
        let idx = args.len();
        sql.push_str(&format!(
            " AND (h.lrf LIKE ?{idx} OR h.rrf LIKE ?{idx}
                   OR h.rff LIKE ?{idx} OR h.lff LIKE ?{idx}
                   OR h.previous_lrf LIKE ?{idx} OR h.previous_rrf LIKE ?{idx}
                   OR h.previous_rff LIKE ?{idx} OR h.previous_lff LIKE ?{idx})"
        ));
    }

    sql.push_str(" ORDER BY h.encounter_date DESC");

    let mut stmt = conn.prepare(&sql)?;
    let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
    let records = stmt
        .query_map(params_ref.as_slice(), history_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

pub fn get_tag_history_for_turtle(
    conn: &Connection,
    turtle_id: &str,
) -> Result<Vec<TagHistoryRecord>> {
    let mut stmt = conn.prepare(
        "SELECT h.id, h.org_id, h.turtle_id, h.observation_id, h.encounter_date,
                h.observer_id, h.observer_name,
                h.lrf, h.rrf, h.rff, h.lff,
                h.previous_lrf, h.previous_rrf, h.previous_rff, h.previous_lff,
                h.notes, h.created_at, t.name
         FROM tag_history h
         JOIN turtles t ON t.id = h.turtle_id
         WHERE h.turtle_id = ?1
         ORDER BY h.encounter_date DESC",
    )?;

    let records = stmt
        .query_map(params![turtle_id], history_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

// ============================================================================
// COUNTS
// ============================================================================

pub fn count_turtles(conn: &Connection, org_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM turtles WHERE org_id = ?1",
        params![org_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_observations(conn: &Connection, org_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM observations WHERE org_id = ?1",
        params![org_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_tag_history(conn: &Connection, org_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tag_history WHERE org_id = ?1",
        params![org_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Open the database at the given path and ensure the schema exists
pub fn open_database(path: &std::path::Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database at {:?}", path))?;
    setup_database(&conn)?;
    Ok(conn)
}

// ============================================================================
// TESTS
// ============================================================================
