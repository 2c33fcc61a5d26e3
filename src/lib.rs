// TurtleOps Console - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod db;
pub mod tags;       // Tag State Model - four-position tag sets + diff
pub mod encounter;  // Identity Resolver + Tag History Recorder
pub mod export;     // CMTTP Export / Reporting Transform
pub mod naming;     // Naming workflow - suggestions, approvals, custom names
pub mod research;   // Research-flag workflow
pub mod draft;      // Encounter draft value + pure reducer

// Re-export commonly used types
pub use db::{
    Turtle, Observation, TagHistoryRecord,
    TurtleFilters, HistoryFilters,
    setup_database, open_database,
    get_turtle_by_id, find_turtle_by_name, get_turtles,
    get_unnamed_turtles, get_turtles_needing_research,
    get_tag_history, get_tag_history_for_turtle, get_observations_for_turtle,
    count_turtles, count_observations, count_tag_history,
    UNNAMED_PREFIX,
};
pub use tags::{
    TagPosition, TagSet, TagChangeKind, TagTransition, diff,
};
pub use encounter::{
    ConsoleError, EncounterRequest, EncounterOutcome,
    submit_encounter, record_tag_history,
};
pub use export::{
    TagChange, ReportStats,
    build_report, report_stats, write_cmttp_csv, cmttp_to_string,
    write_turtle_roster_csv,
};
pub use naming::{
    suggest_name, approve_suggested_name, reject_suggestion, assign_name,
};
pub use research::{
    flag_for_research, resolve_research, reopen_research, set_research_notes,
};
pub use draft::{EncounterDraft, DraftEdit, MatchedTurtle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
