use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::env;
use std::fs::File;
use std::path::PathBuf;

use turtleops_console::{
    build_report, count_observations, count_tag_history, count_turtles,
    get_tag_history, get_turtles, open_database, report_stats, write_cmttp_csv,
    write_turtle_roster_csv, HistoryFilters, TurtleFilters,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => run_init(),
        Some("export") => run_export(&args[2..]),
        Some("roster") => run_roster(&args[2..]),
        Some("stats") => run_stats(&args[2..]),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("TurtleOps Console v{}", turtleops_console::VERSION);
    println!();
    println!("Usage:");
    println!("  turtleops-console init");
    println!("      Create the database schema (WAL mode)");
    println!("  turtleops-console export <org-id> <out.csv> [from] [to]");
    println!("      Write the CMTTP tag report (dates as RFC 3339)");
    println!("  turtleops-console roster <org-id> <out.csv>");
    println!("      Write the turtle roster CSV");
    println!("  turtleops-console stats <org-id>");
    println!("      Print record counts and tag-change totals");
    println!();
    println!("Database path comes from TURTLEOPS_DB (default: turtleops.db)");
}

fn database_path() -> PathBuf {
    env::var("TURTLEOPS_DB")
        .unwrap_or_else(|_| "turtleops.db".to_string())
        .into()
}

fn run_init() -> Result<()> {
    let path = database_path();
    let _conn = open_database(&path)?;
    println!("✓ Database initialized at {:?} (WAL mode)", path);
    Ok(())
}

fn run_export(args: &[String]) -> Result<()> {
    let (org_id, out_path) = match (args.first(), args.get(1)) {
        (Some(org), Some(path)) => (org.as_str(), path.as_str()),
        _ => bail!("usage: turtleops-console export <org-id> <out.csv> [from] [to]"),
    };

    let filters = HistoryFilters {
        date_from: args.get(2).map(|s| parse_date(s)).transpose()?,
        date_to: args.get(3).map(|s| parse_date(s)).transpose()?,
        tag_search: None,
    };

    let conn = open_database(&database_path())?;
    let records = get_tag_history(&conn, org_id, &filters)?;
    let changes = build_report(&records, None);

    let file = File::create(out_path)?;
    write_cmttp_csv(&changes, file)?;

    println!("✓ Exported {} tag changes from {} history records", changes.len(), records.len());
    println!("✓ CMTTP report written to {}", out_path);
    Ok(())
}

fn run_roster(args: &[String]) -> Result<()> {
    let (org_id, out_path) = match (args.first(), args.get(1)) {
        (Some(org), Some(path)) => (org.as_str(), path.as_str()),
        _ => bail!("usage: turtleops-console roster <org-id> <out.csv>"),
    };

    let conn = open_database(&database_path())?;
    let turtles = get_turtles(&conn, org_id, &TurtleFilters::default())?;

    let file = File::create(out_path)?;
    write_turtle_roster_csv(&turtles, file)?;

    println!("✓ Roster written to {} ({} turtles)", out_path, turtles.len());
    Ok(())
}

fn run_stats(args: &[String]) -> Result<()> {
    let org_id = match args.first() {
        Some(org) => org.as_str(),
        None => bail!("usage: turtleops-console stats <org-id>"),
    };

    let conn = open_database(&database_path())?;
    let records = get_tag_history(&conn, org_id, &HistoryFilters::default())?;
    let stats = report_stats(&records);

    println!("Turtles:          {}", count_turtles(&conn, org_id)?);
    println!("Observations:     {}", count_observations(&conn, org_id)?);
    println!("History records:  {}", count_tag_history(&conn, org_id)?);
    println!("New tags:         {}", stats.new_tags);
    println!("Replaced tags:    {}", stats.replaced_tags);
    println!("Lost tags:        {}", stats.lost_tags);
    Ok(())
}

fn parse_date(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("invalid date {:?}: {}", value, e))
}
