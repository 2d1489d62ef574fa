use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

// ============================================================================
// ENTITIES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: i64,
    pub name: String,
}

/// One score per (student, subject) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub id: i64,
    pub student_id: i64,
    pub subject_id: i64,
    pub score: f64,
}

/// Flat join row: a Score with its Student and Subject names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub student_name: String,
    pub subject_name: String,
    pub score: f64,
}

/// Audit trail entry, one per committed upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadEvent {
    pub upload_id: String,
    pub filename: String,
    pub content_hash: String,
    pub layout: String,
    pub rows_imported: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subjects_detected: Option<usize>,
    pub imported_at: DateTime<Utc>,
}

impl UploadEvent {
    pub fn new(
        filename: &str,
        content_hash: &str,
        layout: &str,
        rows_imported: usize,
        subjects_detected: Option<usize>,
    ) -> Self {
        Self {
            upload_id: uuid::Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            content_hash: content_hash.to_string(),
            layout: layout.to_string(),
            rows_imported,
            subjects_detected,
            imported_at: Utc::now(),
        }
    }
}

// ============================================================================
// CONNECTION & SCHEMA
// ============================================================================

/// Open the store named by a connection string.
///
/// Accepts `sqlite://<path>`, `sqlite:<path>`, `sqlite::memory:`, `:memory:`
/// or a bare filesystem path.
pub fn open_database(url: &str) -> Result<Connection> {
    let target = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);

    if target.is_empty() || target == ":memory:" {
        return Connection::open_in_memory().context("Failed to open in-memory database");
    }

    Connection::open(target).with_context(|| format!("Failed to open database at {}", target))
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases report "memory" and that's fine
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "foreign_keys", true)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL REFERENCES students(id),
            subject_id INTEGER NOT NULL REFERENCES subjects(id),
            score REAL NOT NULL,
            UNIQUE (student_id, subject_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            upload_id TEXT UNIQUE NOT NULL,
            filename TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            layout TEXT NOT NULL,
            rows_imported INTEGER NOT NULL,
            subjects_detected INTEGER,
            imported_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_student ON scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_subject ON scores(subject_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// CREATE-OR-FETCH / UPSERT
// ============================================================================

/// Insert-on-conflict then select: never races a concurrent writer into a
/// duplicate, and the new row is visible to the next lookup in the same
/// transaction.
fn find_or_create_named(conn: &Connection, table: &str, name: &str) -> Result<(i64, String)> {
    conn.execute(
        &format!("INSERT INTO {table} (name) VALUES (?1) ON CONFLICT(name) DO NOTHING"),
        [name],
    )
    .with_context(|| format!("Failed to insert into {table}: {name}"))?;

    let row = conn
        .query_row(
            &format!("SELECT id, name FROM {table} WHERE name = ?1"),
            [name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .with_context(|| format!("Failed to look up {table}: {name}"))?;

    Ok(row)
}

pub fn find_or_create_student(conn: &Connection, name: &str) -> Result<Student> {
    let (id, name) = find_or_create_named(conn, "students", name)?;
    Ok(Student { id, name })
}

pub fn find_or_create_subject(conn: &Connection, name: &str) -> Result<Subject> {
    let (id, name) = find_or_create_named(conn, "subjects", name)?;
    Ok(Subject { id, name })
}

/// Create the score for the pair, or overwrite its value if it exists
pub fn upsert_score(conn: &Connection, student_id: i64, subject_id: i64, value: f64) -> Result<Score> {
    let score = conn
        .query_row(
            "INSERT INTO scores (student_id, subject_id, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(student_id, subject_id) DO UPDATE SET score = excluded.score
             RETURNING id, student_id, subject_id, score",
            params![student_id, subject_id, value],
            |row| {
                Ok(Score {
                    id: row.get(0)?,
                    student_id: row.get(1)?,
                    subject_id: row.get(2)?,
                    score: row.get(3)?,
                })
            },
        )
        .with_context(|| {
            format!("Failed to upsert score for student {student_id}, subject {subject_id}")
        })?;

    Ok(score)
}

// ============================================================================
// READS
// ============================================================================

/// Every score joined with its student and subject names
pub fn load_relation(conn: &Connection) -> Result<Vec<ScoreRecord>> {
    let mut stmt = conn.prepare(
        "SELECT st.name, su.name, sc.score
         FROM scores sc
         JOIN students st ON st.id = sc.student_id
         JOIN subjects su ON su.id = sc.subject_id
         ORDER BY sc.id",
    )?;

    let records = stmt
        .query_map([], |row| {
            Ok(ScoreRecord {
                student_name: row.get(0)?,
                subject_name: row.get(1)?,
                score: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

pub fn count_scores(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM scores", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_students(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_subjects(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM subjects", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// UPLOAD AUDIT TRAIL
// ============================================================================

pub fn insert_upload_event(conn: &Connection, event: &UploadEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO upload_events (
            upload_id, filename, content_hash, layout,
            rows_imported, subjects_detected, imported_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.upload_id,
            event.filename,
            event.content_hash,
            event.layout,
            event.rows_imported as i64,
            event.subjects_detected.map(|n| n as i64),
            event.imported_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

/// Upload history, newest first
pub fn get_upload_events(conn: &Connection) -> Result<Vec<UploadEvent>> {
    let mut stmt = conn.prepare(
        "SELECT upload_id, filename, content_hash, layout,
                rows_imported, subjects_detected, imported_at
         FROM upload_events
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map([], |row| {
            let imported_at_str: String = row.get(6)?;
            let imported_at = DateTime::parse_from_rfc3339(&imported_at_str)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        6,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?
                .with_timezone(&Utc);
            let rows_imported: i64 = row.get(4)?;
            let subjects_detected: Option<i64> = row.get(5)?;

            Ok(UploadEvent {
                upload_id: row.get(0)?,
                filename: row.get(1)?,
                content_hash: row.get(2)?,
                layout: row.get(3)?,
                rows_imported: rows_imported as usize,
                subjects_detected: subjects_detected.map(|n| n as usize),
                imported_at,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_setup_is_idempotent() {
        let conn = test_db();
        setup_database(&conn).unwrap();
        assert_eq!(count_scores(&conn).unwrap(), 0);
    }

    #[test]
    fn test_find_or_create_student_no_duplicates() {
        let conn = test_db();

        let first = find_or_create_student(&conn, "Alice").unwrap();
        let second = find_or_create_student(&conn, "Alice").unwrap();
        let other = find_or_create_student(&conn, "Bob").unwrap();

        assert_eq!(first, second);
        assert_ne!(first.id, other.id);
        assert_eq!(count_students(&conn).unwrap(), 2);
    }

    #[test]
    fn test_find_or_create_visible_inside_transaction() {
        let mut conn = test_db();
        let tx = conn.transaction().unwrap();

        let created = find_or_create_subject(&tx, "Math").unwrap();
        let fetched = find_or_create_subject(&tx, "Math").unwrap();
        assert_eq!(created.id, fetched.id);

        tx.commit().unwrap();
        assert_eq!(count_subjects(&conn).unwrap(), 1);
    }

    #[test]
    fn test_upsert_score_overwrites_in_place() {
        let conn = test_db();
        let alice = find_or_create_student(&conn, "Alice").unwrap();
        let math = find_or_create_subject(&conn, "Math").unwrap();

        let created = upsert_score(&conn, alice.id, math.id, 80.0).unwrap();
        let updated = upsert_score(&conn, alice.id, math.id, 95.0).unwrap();

        assert_eq!(created.id, updated.id);
        assert_eq!(updated.score, 95.0);
        assert_eq!(count_scores(&conn).unwrap(), 1);

        let stored = load_relation(&conn).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].score, 95.0);
    }

    #[test]
    fn test_upsert_score_rejects_unknown_student() {
        let conn = test_db();
        let math = find_or_create_subject(&conn, "Math").unwrap();

        assert!(upsert_score(&conn, 999, math.id, 50.0).is_err());
    }

    #[test]
    fn test_rollback_discards_creates() {
        let mut conn = test_db();
        {
            let tx = conn.transaction().unwrap();
            let alice = find_or_create_student(&tx, "Alice").unwrap();
            let math = find_or_create_subject(&tx, "Math").unwrap();
            upsert_score(&tx, alice.id, math.id, 70.0).unwrap();
            // dropped without commit
        }

        assert_eq!(count_students(&conn).unwrap(), 0);
        assert_eq!(count_scores(&conn).unwrap(), 0);
    }

    #[test]
    fn test_load_relation_joins_names() {
        let conn = test_db();
        assert!(load_relation(&conn).unwrap().is_empty());

        let alice = find_or_create_student(&conn, "Alice").unwrap();
        let bob = find_or_create_student(&conn, "Bob").unwrap();
        let math = find_or_create_subject(&conn, "Math").unwrap();
        upsert_score(&conn, alice.id, math.id, 80.0).unwrap();
        upsert_score(&conn, bob.id, math.id, 60.0).unwrap();

        let relation = load_relation(&conn).unwrap();
        assert_eq!(
            relation,
            vec![
                ScoreRecord {
                    student_name: "Alice".to_string(),
                    subject_name: "Math".to_string(),
                    score: 80.0,
                },
                ScoreRecord {
                    student_name: "Bob".to_string(),
                    subject_name: "Math".to_string(),
                    score: 60.0,
                },
            ]
        );
    }

    #[test]
    fn test_upload_event_log() {
        let conn = test_db();

        let first = UploadEvent::new("a.csv", "hash-a", "long", 3, None);
        let second = UploadEvent::new("b.xlsx", "hash-b", "wide", 2, Some(4));
        insert_upload_event(&conn, &first).unwrap();
        insert_upload_event(&conn, &second).unwrap();

        let events = get_upload_events(&conn).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].upload_id, second.upload_id);
        assert_eq!(events[0].subjects_detected, Some(4));
        assert_eq!(events[1].filename, "a.csv");
        assert_eq!(events[1].subjects_detected, None);
    }

    #[test]
    fn test_open_database_variants() {
        let conn = open_database("sqlite::memory:").unwrap();
        setup_database(&conn).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scores.db");
        let url = format!("sqlite://{}", path.display());
        {
            let conn = open_database(&url).unwrap();
            setup_database(&conn).unwrap();
            find_or_create_student(&conn, "Alice").unwrap();
        }

        let reopened = open_database(path.to_str().unwrap()).unwrap();
        assert_eq!(count_students(&reopened).unwrap(), 1);
    }
}
