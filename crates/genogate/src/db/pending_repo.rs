//! Snapshot of non-terminal jobs, written at shutdown and read back at start-up.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use super::{Database, DatabaseError};
use crate::jobs::{JobId, JobRecord, JobState, PipelineKind};

struct PendingRow {
    job_id: String,
    owner: String,
    job_name: String,
    kind: String,
    submit_time: String,
    seq: i64,
    priority: String,
    state: String,
    map_progress: f64,
    reduce_progress: f64,
}

impl PendingRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            owner: row.get("owner")?,
            job_name: row.get("job_name")?,
            kind: row.get("kind")?,
            submit_time: row.get("submit_time")?,
            seq: row.get("seq")?,
            priority: row.get("priority")?,
            state: row.get("state")?,
            map_progress: row.get("map_progress")?,
            reduce_progress: row.get("reduce_progress")?,
        })
    }

    fn into_record(self) -> Result<JobRecord, DatabaseError> {
        let corrupt = |reason: String| DatabaseError::CorruptRow {
            job_id: self.job_id.clone(),
            reason,
        };

        let kind = PipelineKind::parse(&self.kind)
            .ok_or_else(|| corrupt(format!("unknown pipeline kind '{}'", self.kind)))?;
        let submit_time = DateTime::parse_from_rfc3339(&self.submit_time)
            .map_err(|e| corrupt(format!("bad submit time: {}", e)))?
            .with_timezone(&Utc);

        Ok(JobRecord {
            job_id: JobId::new(self.job_id.clone()),
            owner: self.owner,
            job_name: self.job_name,
            kind,
            submit_time,
            seq: self.seq.max(0) as u64,
            priority: self.priority,
            state: parse_state(&self.state),
            map_progress: self.map_progress as f32,
            reduce_progress: self.reduce_progress as f32,
            failure_info: None,
            finished_at: None,
        })
    }
}

fn parse_state(s: &str) -> JobState {
    match JobState::parse(s) {
        Some(state) if !state.is_terminal() => state,
        _ => {
            log::warn!("Unexpected pending job state '{}', treating as Submitted", s);
            JobState::Submitted
        }
    }
}

/// Replaces the stored snapshot with `records`. Terminal records are skipped.
pub fn replace_all(db: &Database, records: &[JobRecord]) -> Result<usize, DatabaseError> {
    let saved_at = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM pending_jobs", [])?;

        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO pending_jobs (job_id, owner, job_name, kind, submit_time, seq,
                 priority, state, map_progress, reduce_progress, saved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for record in records.iter().filter(|r| !r.state.is_terminal()) {
                stmt.execute(params![
                    record.job_id.as_str(),
                    record.owner,
                    record.job_name,
                    record.kind.as_str(),
                    record.submit_time.to_rfc3339(),
                    record.seq as i64,
                    record.priority,
                    record.state.as_str(),
                    record.map_progress as f64,
                    record.reduce_progress as f64,
                    saved_at,
                ])?;
                written += 1;
            }
        }

        tx.commit()?;
        Ok(written)
    })
}

/// Loads the stored snapshot in registration order. Rows that cannot be decoded are skipped.
pub fn load_all(db: &Database) -> Result<Vec<JobRecord>, DatabaseError> {
    let rows = db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM pending_jobs ORDER BY submit_time, seq")?;
        let rows = stmt
            .query_map([], PendingRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        match row.into_record() {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Skipping stored job: {}", e),
        }
    }
    Ok(records)
}

pub fn clear(db: &Database) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| Ok(conn.execute("DELETE FROM pending_jobs", [])?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, seq: u64, state: JobState) -> JobRecord {
        JobRecord {
            job_id: JobId::new(id),
            owner: "alice".to_string(),
            job_name: format!("alice-bowtie2-{}", id),
            kind: PipelineKind::AlignBowtie,
            submit_time: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            seq,
            priority: "NORMAL".to_string(),
            state,
            map_progress: 0.25,
            reduce_progress: 0.0,
            failure_info: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_replace_all_skips_terminal_jobs() {
        let db = Database::open_in_memory().unwrap();
        let written = replace_all(
            &db,
            &[
                record("job_1", 1, JobState::Running),
                record("job_2", 2, JobState::Completed),
                record("job_3", 3, JobState::Submitted),
            ],
        )
        .unwrap();
        assert_eq!(written, 2);

        let loaded = load_all(&db).unwrap();
        let ids: Vec<&str> = loaded.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec!["job_1", "job_3"]);
        assert_eq!(loaded[0].state, JobState::Running);
        assert_eq!(loaded[0].map_progress, 0.25);
        assert_eq!(loaded[0].submit_time.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_replace_all_overwrites_previous_snapshot() {
        let db = Database::open_in_memory().unwrap();
        replace_all(&db, &[record("job_1", 1, JobState::Running)]).unwrap();
        replace_all(&db, &[record("job_9", 9, JobState::Submitted)]).unwrap();

        let loaded = load_all(&db).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].job_id.as_str(), "job_9");
    }

    #[test]
    fn test_corrupt_rows_are_skipped() {
        let db = Database::open_in_memory().unwrap();
        replace_all(&db, &[record("job_1", 1, JobState::Running)]).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pending_jobs (job_id, owner, job_name, kind, submit_time, seq,
                 priority, state, saved_at)
                 VALUES ('job_x', 'bob', 'n', 'teleport', '2026-01-01T00:00:00Z', 2,
                 'NORMAL', 'Running', '2026-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let loaded = load_all(&db).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].owner, "alice");
    }

    #[test]
    fn test_clear() {
        let db = Database::open_in_memory().unwrap();
        replace_all(&db, &[record("job_1", 1, JobState::Running)]).unwrap();
        assert_eq!(clear(&db).unwrap(), 1);
        assert!(load_all(&db).unwrap().is_empty());
    }
}
