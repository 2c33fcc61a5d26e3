// 📊 Export / Reporting Transform - CMTTP tag report
// Flattens tag history records into per-position change rows and renders
// the fixed-column CMTTP report plus a generic turtle roster CSV.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

use crate::db::{TagHistoryRecord, Turtle};
use crate::tags::{diff, TagChangeKind, TagPosition};

/// Rendering of an empty tag slot in reports
const NO_TAG: &str = "(none)";

// ============================================================================
// TAG CHANGE ROWS
// ============================================================================

/// One classified change at one position of one encounter. Derived from
/// the audit trail at report time, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagChange {
    pub turtle_name: String,
    pub encounter_date: DateTime<Utc>,
    pub observer_name: String,
    pub position: TagPosition,
    pub old_tag: Option<String>,
    pub new_tag: Option<String>,
    pub kind: TagChangeKind,
}

impl TagChange {
    /// The physical tag the row is about: the current value when present,
    /// otherwise the old one - so a `lost` row still identifies which tag
    /// was lost.
    pub fn tag_number(&self) -> &str {
        self.new_tag
            .as_deref()
            .or(self.old_tag.as_deref())
            .unwrap_or(NO_TAG)
    }

    pub fn old_tag_display(&self) -> &str {
        self.old_tag.as_deref().unwrap_or(NO_TAG)
    }

    pub fn new_tag_display(&self) -> &str {
        self.new_tag.as_deref().unwrap_or(NO_TAG)
    }

    /// Capitalized change type for the CMTTP "Tag Change Type" column
    pub fn change_type_label(&self) -> &'static str {
        match self.kind {
            TagChangeKind::New => "New",
            TagChangeKind::Replaced => "Replaced",
            TagChangeKind::Lost => "Lost",
        }
    }
}

/// Counts shown on the report header cards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStats {
    pub total_records: usize,
    pub new_tags: usize,
    pub replaced_tags: usize,
    pub lost_tags: usize,
}

// ============================================================================
// REPORT BUILDING
// ============================================================================

/// Flatten history records into per-position change rows.
///
/// Date-range and tag-search filtering happen BEFORE this step, in the
/// store read (`db::get_tag_history`) - so a record selected because an
/// unchanged position matched the search still classifies normally here.
/// The optional kind filter is applied to the classified rows. Unchanged
/// positions emit nothing; empty input yields an empty report.
pub fn build_report(
    records: &[TagHistoryRecord],
    kind_filter: Option<TagChangeKind>,
) -> Vec<TagChange> {
    let mut changes = Vec::new();

    for record in records {
        for transition in diff(&record.previous, &record.current) {
            if let Some(kind) = kind_filter {
                if transition.kind != kind {
                    continue;
                }
            }

            changes.push(TagChange {
                turtle_name: record.turtle_name.clone(),
                encounter_date: record.encounter_date,
                observer_name: record.observer_name.clone(),
                position: transition.position,
                old_tag: transition.previous,
                new_tag: transition.current,
                kind: transition.kind,
            });
        }
    }

    changes
}

/// Per-kind change counts over a full (unfiltered) report.
pub fn report_stats(records: &[TagHistoryRecord]) -> ReportStats {
    let changes = build_report(records, None);

    ReportStats {
        total_records: records.len(),
        new_tags: changes.iter().filter(|c| c.kind == TagChangeKind::New).count(),
        replaced_tags: changes
            .iter()
            .filter(|c| c.kind == TagChangeKind::Replaced)
            .count(),
        lost_tags: changes.iter().filter(|c| c.kind == TagChangeKind::Lost).count(),
    }
}

// ============================================================================
// CMTTP CSV
// ============================================================================

/// CMTTP column set. The format is a fixed external target; column order
/// matters to the receiving program.
const CMTTP_HEADERS: [&str; 9] = [
    "Turtle Name",
    "Tag Number",
    "Tag Position",
    "Tag Applied Date",
    "Tag Applied By",
    "Tag Status",
    "Previous Tag",
    "Tag Change Type",
    "Notes",
];

/// Write the CMTTP report for the given change rows.
pub fn write_cmttp_csv<W: Write>(changes: &[TagChange], writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer.write_record(CMTTP_HEADERS)?;

    for change in changes {
        let applied_date = change.encounter_date.format("%Y-%m-%d").to_string();
        csv_writer.write_record([
            change.turtle_name.as_str(),
            change.tag_number(),
            change.position.label(),
            applied_date.as_str(),
            change.observer_name.as_str(),
            change.kind.cmttp_status(),
            change.old_tag_display(),
            change.change_type_label(),
            "",
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

/// CMTTP report as an in-memory string (API responses, tests)
pub fn cmttp_to_string(changes: &[TagChange]) -> Result<String> {
    let mut buffer = Vec::new();
    write_cmttp_csv(changes, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// ============================================================================
// TURTLE ROSTER CSV
// ============================================================================

/// Generic roster export for the turtle list screens.
pub fn write_turtle_roster_csv<W: Write>(turtles: &[Turtle], writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);

    csv_writer.write_record([
        "ID",
        "Name",
        "Species",
        "LRF",
        "RRF",
        "RFF",
        "LFF",
        "First Encountered",
        "Last Encountered",
        "Encounter Count",
        "Needs Research",
        "Suggested Name",
    ])?;

    for turtle in turtles {
        let first_seen = turtle.first_encountered_at.format("%Y-%m-%d").to_string();
        let last_seen = turtle.last_encountered_at.format("%Y-%m-%d").to_string();
        let encounters = turtle.encounter_count.to_string();
        csv_writer.write_record([
            turtle.id.as_str(),
            turtle.name.as_str(),
            turtle.species.as_deref().unwrap_or(""),
            turtle.tags.lrf.as_deref().unwrap_or(""),
            turtle.tags.rrf.as_deref().unwrap_or(""),
            turtle.tags.rff.as_deref().unwrap_or(""),
            turtle.tags.lff.as_deref().unwrap_or(""),
            first_seen.as_str(),
            last_seen.as_str(),
            encounters.as_str(),
            if turtle.needs_research { "Yes" } else { "No" },
            turtle.suggested_name.as_deref().unwrap_or(""),
        ])?;
    }

    csv_writer.flush()?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagSet;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn create_test_record(
        turtle_name: &str,
        previous: TagSet,
        current: TagSet,
        when: &str,
    ) -> TagHistoryRecord {
        TagHistoryRecord {
            id: uuid::Uuid::new_v4().to_string(),
            org_id: "org-1".to_string(),
            turtle_id: "turtle-1".to_string(),
            turtle_name: turtle_name.to_string(),
            observation_id: "obs-1".to_string(),
            encounter_date: ts(when),
            observer_id: None,
            observer_name: "Ana Reyes".to_string(),
            previous,
            current,
            notes: None,
            created_at: ts(when),
        }
    }

    fn tags(
        lrf: Option<&str>,
        rrf: Option<&str>,
        rff: Option<&str>,
        lff: Option<&str>,
    ) -> TagSet {
        TagSet {
            lrf: lrf.map(String::from),
            rrf: rrf.map(String::from),
            rff: rff.map(String::from),
            lff: lff.map(String::from),
        }
    }

    #[test]
    fn test_empty_input_yields_empty_report() {
        assert!(build_report(&[], None).is_empty());

        let stats = report_stats(&[]);
        assert_eq!(stats.total_records, 0);
        assert_eq!(stats.new_tags, 0);
    }

    #[test]
    fn test_row_count_equals_changed_positions() {
        let records = vec![
            // Two changes: LRF new, RRF new
            create_test_record(
                "SHELLY",
                TagSet::empty(),
                tags(Some("AB12"), Some("CD34"), None, None),
                "2025-06-15T22:00:00Z",
            ),
            // One change: RRF replaced (LRF unchanged)
            create_test_record(
                "SHELLY",
                tags(Some("AB12"), Some("CD34"), None, None),
                tags(Some("AB12"), Some("ZZ99"), None, None),
                "2025-07-01T22:00:00Z",
            ),
            // No change at all
            create_test_record(
                "SANDY",
                tags(Some("QQ11"), None, None, None),
                tags(Some("QQ11"), None, None, None),
                "2025-07-02T22:00:00Z",
            ),
        ];

        let changes = build_report(&records, None);
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_lost_row_identifies_the_lost_tag() {
        // Re-encounter where RRF "CD34" was confirmed missing
        let record = create_test_record(
            "SHELLY",
            tags(Some("AB12"), Some("CD34"), None, None),
            tags(Some("AB12"), None, None, None),
            "2025-07-01T22:00:00Z",
        );

        let changes = build_report(&[record], None);

        assert_eq!(changes.len(), 1);
        let change = &changes[0];
        assert_eq!(change.position, TagPosition::Rrf);
        assert_eq!(change.kind, TagChangeKind::Lost);
        assert_eq!(change.old_tag, Some("CD34".to_string()));
        assert_eq!(change.new_tag, None);
        assert_eq!(change.new_tag_display(), "(none)");
        // The "tag number" of a lost row is the tag that was lost
        assert_eq!(change.tag_number(), "CD34");
        assert_eq!(change.kind.cmttp_status(), "Lost");
    }

    #[test]
    fn test_kind_filter() {
        let records = vec![create_test_record(
            "SHELLY",
            tags(Some("AB12"), Some("CD34"), None, None),
            tags(Some("XY99"), None, Some("NEW1"), None),
            "2025-07-01T22:00:00Z",
        )];

        let lost_only = build_report(&records, Some(TagChangeKind::Lost));
        assert_eq!(lost_only.len(), 1);
        assert_eq!(lost_only[0].position, TagPosition::Rrf);

        let new_only = build_report(&records, Some(TagChangeKind::New));
        assert_eq!(new_only.len(), 1);
        assert_eq!(new_only[0].position, TagPosition::Rff);
    }

    #[test]
    fn test_report_stats() {
        let records = vec![
            create_test_record(
                "SHELLY",
                TagSet::empty(),
                tags(Some("AB12"), Some("CD34"), None, None),
                "2025-06-15T22:00:00Z",
            ),
            create_test_record(
                "SHELLY",
                tags(Some("AB12"), Some("CD34"), None, None),
                tags(Some("XY99"), None, None, None),
                "2025-07-01T22:00:00Z",
            ),
        ];

        let stats = report_stats(&records);
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.new_tags, 2);
        assert_eq!(stats.replaced_tags, 1);
        assert_eq!(stats.lost_tags, 1);
    }

    #[test]
    fn test_cmttp_csv_layout() {
        let record = create_test_record(
            "SHELLY",
            tags(Some("AB12"), Some("CD34"), None, None),
            tags(Some("AB12"), None, None, None),
            "2025-07-01T22:00:00Z",
        );

        let changes = build_report(&[record], None);
        let csv_text = cmttp_to_string(&changes).unwrap();
        let lines: Vec<&str> = csv_text.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            "Turtle Name,Tag Number,Tag Position,Tag Applied Date,Tag Applied By,\
             Tag Status,Previous Tag,Tag Change Type,Notes"
        );
        assert_eq!(
            lines[1],
            "SHELLY,CD34,RRF (Right Rear),2025-07-01,Ana Reyes,Lost,CD34,Lost,"
        );
    }

    #[test]
    fn test_turtle_roster_csv() {
        use crate::db::{setup_database, get_turtles, TurtleFilters};
        use crate::encounter::{submit_encounter, EncounterRequest};
        use rusqlite::Connection;

        let mut conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        submit_encounter(
            &mut conn,
            &EncounterRequest {
                matched_turtle_id: None,
                tags: TagSet::from_observed(Some("AB12"), None, None, None),
                encounter_at: ts("2025-06-15T22:00:00Z"),
                observer_id: None,
                observer_name: "Ana Reyes".to_string(),
                org_id: "org-1".to_string(),
                comments: None,
            },
        )
        .unwrap();

        let turtles = get_turtles(&conn, "org-1", &TurtleFilters::default()).unwrap();
        let mut buffer = Vec::new();
        write_turtle_roster_csv(&turtles, &mut buffer).unwrap();
        let csv_text = String::from_utf8(buffer).unwrap();

        let lines: Vec<&str> = csv_text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ID,Name,Species,LRF"));
        assert!(lines[1].contains("UNNAMED-20250615-001"));
        assert!(lines[1].contains("AB12"));
        assert!(lines[1].ends_with(",No,"));
    }
}
