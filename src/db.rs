use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "feedback.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS departments(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department ON students(department_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_department_sort ON students(department_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS forms(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            title TEXT NOT NULL,
            deadline TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id)
        )",
        [],
    )?;
    ensure_forms_deadline(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_forms_department ON forms(department_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS form_questions(
            id TEXT PRIMARY KEY,
            form_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            text TEXT NOT NULL,
            FOREIGN KEY(form_id) REFERENCES forms(id),
            UNIQUE(form_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_form_questions_form ON form_questions(form_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS responses(
            id TEXT PRIMARY KEY,
            form_id TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            FOREIGN KEY(form_id) REFERENCES forms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_responses_form ON responses(form_id)",
        [],
    )?;

    // response_raw holds the submitted value verbatim as JSON text (number,
    // string, or null). Rating coercion happens at aggregation time, never
    // at ingest.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS response_answers(
            id TEXT PRIMARY KEY,
            response_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            question_id TEXT NOT NULL,
            question_text TEXT NOT NULL DEFAULT '',
            response_raw TEXT NOT NULL,
            comments TEXT,
            FOREIGN KEY(response_id) REFERENCES responses(id),
            UNIQUE(response_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_response_answers_response ON response_answers(response_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_response_answers_question ON response_answers(question_id)",
        [],
    )?;

    // One taken-attendance event per department per day.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            department_id TEXT NOT NULL,
            date TEXT NOT NULL,
            FOREIGN KEY(department_id) REFERENCES departments(id),
            UNIQUE(department_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_department ON attendance_records(department_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_date ON attendance_records(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_entries(
            record_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            status TEXT NOT NULL,
            remark TEXT,
            PRIMARY KEY(record_id, student_id),
            FOREIGN KEY(record_id) REFERENCES attendance_records(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    ensure_attendance_entries_remark(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_record ON attendance_entries(record_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_entries_student ON attendance_entries(student_id)",
        [],
    )?;

    Ok(conn)
}

// Early workspaces predate the optional deadline on forms.
fn ensure_forms_deadline(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "forms", "deadline")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE forms ADD COLUMN deadline TEXT", [])?;
    Ok(())
}

// Per-student remarks were added after the first attendance release.
fn ensure_attendance_entries_remark(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "attendance_entries", "remark")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance_entries ADD COLUMN remark TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
