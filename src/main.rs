use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};

use classroom_scores::{
    build_relation, chart, get_upload_events, import_upload, init_tracing, open_database,
    per_student_stats, per_subject_stats, render_subject_mean_chart, setup_database,
    subject_extremes, top_performer, AppConfig,
};

#[derive(Parser)]
#[command(name = "classroom-scores", version, about = "Import score sheets and inspect statistics")]
struct Cli {
    /// Database connection string (overrides DATABASE_URL)
    #[arg(long, global = true)]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a CSV or Excel score sheet
    Import { file: PathBuf },
    /// Per-subject statistics
    Subjects,
    /// Per-student statistics
    Students,
    /// Student with the highest average
    Top,
    /// Subjects with the highest and lowest mean
    Extremes,
    /// Write the subject-mean bar chart as PNG
    Chart {
        #[arg(short, long, default_value = "subjects-mean.png")]
        output: PathBuf,
    },
    /// Upload history, newest first
    Uploads,
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(database) = cli.database {
        config.database_url = database;
    }

    let mut conn = open_database(&config.database_url)?;
    setup_database(&conn)?;

    match cli.command {
        Command::Import { file } => run_import(&mut conn, &file)?,
        Command::Subjects => print_json(&per_subject_stats(&build_relation(&conn)?))?,
        Command::Students => print_json(&per_student_stats(&build_relation(&conn)?))?,
        Command::Top => match top_performer(&build_relation(&conn)?) {
            Some(top) => print_json(&top)?,
            None => no_data(),
        },
        Command::Extremes => match subject_extremes(&build_relation(&conn)?) {
            Some(ext) => print_json(&ext)?,
            None => no_data(),
        },
        Command::Chart { output } => {
            chart::init_chart_font(config.chart_font.as_deref());
            run_chart(&conn, &output)?
        }
        Command::Uploads => print_json(&get_upload_events(&conn)?)?,
    }

    Ok(())
}

fn run_import(conn: &mut rusqlite::Connection, file: &Path) -> Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    let report = import_upload(conn, filename, &bytes)?;
    print_json(&report)
}

fn run_chart(conn: &rusqlite::Connection, output: &Path) -> Result<()> {
    let relation = build_relation(conn)?;
    if relation.is_empty() {
        no_data();
        return Ok(());
    }

    let png = render_subject_mean_chart(&relation)?;
    std::fs::write(output, png)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("✓ Chart written to {}", output.display());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn no_data() {
    eprintln!("No data: import a score sheet first");
}
