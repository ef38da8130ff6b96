//! Durable, crash-safe event queue persisted in the Store database.
//!
//! Producers (the Watcher) append rows under their own transaction; a single
//! consumer (the Ingest worker) leases one coalesced action per path at a
//! time. Coalescing runs at lease time, never at enqueue time, so the raw
//! log always reflects exactly what was observed on disk.

use chrono::Utc;
use markdownkeeper_core::error::{CoreError, CoreResult};
use markdownkeeper_core::models::EventKind;
use sqlx::{Row, SqlitePool};

const MAX_ATTEMPTS: i32 = 5;
const BACKOFF_BASE_MS: i64 = 500;
const BACKOFF_CAP_MS: i64 = 30_000;
const RETENTION_SECONDS: i64 = 24 * 3600;

pub struct EventQueue {
    pool: SqlitePool,
    debounce_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeasedEvent {
    pub id: i64,
    pub path: String,
    pub kind: EventKind,
    pub new_path: Option<String>,
    pub attempt_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
struct EventRow {
    id: i64,
    kind: EventKind,
    new_path: Option<String>,
}

fn kind_from_str(s: &str) -> EventKind {
    match s {
        "create" => EventKind::Create,
        "modify" => EventKind::Modify,
        "move" => EventKind::Move,
        "delete" => EventKind::Delete,
        other => unreachable!("unknown event kind in storage: {other}"),
    }
}

impl EventQueue {
    pub fn new(pool: SqlitePool, debounce_ms: u64) -> Self {
        Self { pool, debounce_ms: debounce_ms as i64 }
    }

    pub async fn enqueue(
        &self,
        path: &str,
        kind: EventKind,
        new_path: Option<&str>,
    ) -> CoreResult<i64> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            "INSERT INTO event_log (path, kind, new_path, enqueued_at, status) VALUES (?, ?, ?, ?, 'queued')",
        )
        .bind(path)
        .bind(kind.as_str())
        .bind(new_path)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Retry(e.to_string()))?;

        Ok(result.last_insert_rowid())
    }

    /// Leases the next coalesced action ready for processing, marking any
    /// superseded records `done` in the same pass. Returns `None` if no path
    /// is both debounce-eligible and free of an existing `in_flight` record.
    pub async fn lease_next(&self) -> CoreResult<Option<LeasedEvent>> {
        let now = Utc::now().timestamp_millis();

        let candidate_path: Option<String> = sqlx::query_scalar(
            r#"
            SELECT path
            FROM event_log q
            WHERE q.status = 'queued'
              AND ? - (SELECT MAX(enqueued_at) FROM event_log WHERE path = q.path AND status = 'queued') >= ?
              AND NOT EXISTS (SELECT 1 FROM event_log f WHERE f.path = q.path AND f.status = 'in_flight')
            ORDER BY q.enqueued_at ASC
            LIMIT 1
            "#,
        )
        .bind(now)
        .bind(self.debounce_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CoreError::Retry(e.to_string()))?;

        let Some(path) = candidate_path else { return Ok(None) };

        let rows = sqlx::query(
            "SELECT id, kind, new_path FROM event_log WHERE path = ? AND status = 'queued' ORDER BY id ASC",
        )
        .bind(&path)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CoreError::Retry(e.to_string()))?;

        let events: Vec<EventRow> = rows
            .into_iter()
            .map(|row| EventRow {
                id: row.get("id"),
                kind: kind_from_str(row.get::<String, _>("kind").as_str()),
                new_path: row.get("new_path"),
            })
            .collect();

        let coalesced = coalesce(events);

        for id in &coalesced.superseded_ids {
            sqlx::query("UPDATE event_log SET status = 'done', processed_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Retry(e.to_string()))?;
        }

        let Some(lead) = coalesced.lead else { return Ok(None) };

        sqlx::query("UPDATE event_log SET status = 'in_flight' WHERE id = ?")
            .bind(lead.id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Retry(e.to_string()))?;

        let attempt_count: i32 = sqlx::query_scalar("SELECT attempt_count FROM event_log WHERE id = ?")
            .bind(lead.id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CoreError::Retry(e.to_string()))?;

        Ok(Some(LeasedEvent {
            id: lead.id,
            path,
            kind: lead.kind,
            new_path: lead.new_path,
            attempt_count,
        }))
    }

    pub async fn mark_done(&self, id: i64) -> CoreResult<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query("UPDATE event_log SET status = 'done', processed_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Retry(e.to_string()))?;
        Ok(())
    }

    /// Requeues after a transient failure, applying `min(30s, 0.5s * 2^attempt)`
    /// backoff. Once `attempt_count` reaches [`MAX_ATTEMPTS`], marks `failed`
    /// instead.
    pub async fn mark_retry(&self, id: i64, error: &str) -> CoreResult<()> {
        let attempt_count: i32 = sqlx::query_scalar("SELECT attempt_count FROM event_log WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| CoreError::Retry(e.to_string()))?;
        let next_attempt = attempt_count + 1;

        if next_attempt >= MAX_ATTEMPTS {
            let now = Utc::now().timestamp_millis();
            sqlx::query(
                "UPDATE event_log SET status = 'failed', attempt_count = ?, last_error = ?, processed_at = ? WHERE id = ?",
            )
            .bind(next_attempt)
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Retry(e.to_string()))?;
            return Ok(());
        }

        let backoff_ms = backoff_millis(next_attempt);
        let eligible_at = Utc::now().timestamp_millis() + backoff_ms;
        sqlx::query(
            "UPDATE event_log SET status = 'queued', attempt_count = ?, last_error = ?, enqueued_at = ? WHERE id = ?",
        )
        .bind(next_attempt)
        .bind(error)
        .bind(eligible_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Retry(e.to_string()))?;
        Ok(())
    }

    /// At startup: any `in_flight` record is orphaned by a crash. Reset to
    /// `queued`, preserving `attempt_count`. Returns the number reset.
    pub async fn replay_orphaned(&self) -> CoreResult<u64> {
        let result = sqlx::query("UPDATE event_log SET status = 'queued' WHERE status = 'in_flight'")
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Retry(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Prunes `done` records older than the retention window (default 24h).
    pub async fn prune_done(&self) -> CoreResult<u64> {
        let cutoff = Utc::now().timestamp_millis() - RETENTION_SECONDS * 1000;
        let result = sqlx::query("DELETE FROM event_log WHERE status = 'done' AND processed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Retry(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

fn backoff_millis(attempt: i32) -> i64 {
    let scaled = (BACKOFF_BASE_MS as f64) * 2f64.powi(attempt);
    scaled.min(BACKOFF_CAP_MS as f64) as i64
}

struct Coalesced {
    lead: Option<EventRow>,
    superseded_ids: Vec<i64>,
}

/// Applies the §4.D coalescing rules to one path's ordered queued records.
fn coalesce(events: Vec<EventRow>) -> Coalesced {
    if events.is_empty() {
        return Coalesced { lead: None, superseded_ids: Vec::new() };
    }

    let started_with_create = events[0].kind == EventKind::Create;

    let last_delete_pos = events.iter().rposition(|e| e.kind == EventKind::Delete);
    let (dropped, working): (Vec<EventRow>, Vec<EventRow>) = match last_delete_pos {
        Some(pos) if pos > 0 => {
            let mut iter = events.into_iter();
            let dropped: Vec<EventRow> = (&mut iter).take(pos).collect();
            (dropped, iter.collect())
        }
        _ => (Vec::new(), events),
    };

    let mut superseded: Vec<i64> = dropped.iter().map(|e| e.id).collect();
    let mut acc: Option<EventRow> = None;

    for ev in working {
        acc = match acc {
            None => Some(ev),
            Some(prev) => match (prev.kind, ev.kind) {
                (EventKind::Create, EventKind::Delete) => {
                    superseded.push(prev.id);
                    superseded.push(ev.id);
                    None
                }
                (EventKind::Create, EventKind::Modify) => {
                    superseded.push(prev.id);
                    Some(EventRow { id: ev.id, kind: EventKind::Modify, new_path: ev.new_path })
                }
                _ => {
                    superseded.push(prev.id);
                    Some(ev)
                }
            },
        };
    }

    // A delete that survived the fold on its own (nothing recreated the path
    // afterward) only needs processing if the path existed before this
    // burst. If the burst's very first record was a Create, the document
    // never persisted: create-then-delete within one window is a true
    // no-op, not a lease to remove a document that was never stored.
    if started_with_create {
        if let Some(lead) = &acc {
            if lead.kind == EventKind::Delete {
                superseded.push(lead.id);
                acc = None;
            }
        }
    }

    Coalesced { lead: acc, superseded_ids: superseded }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, kind: EventKind) -> EventRow {
        EventRow { id, kind, new_path: None }
    }

    #[test]
    fn burst_of_modifies_coalesces_to_one() {
        let events = vec![row(1, EventKind::Create), row(2, EventKind::Modify), row(3, EventKind::Modify)];
        let result = coalesce(events);
        assert_eq!(result.lead.unwrap().id, 3);
        assert_eq!(result.superseded_ids, vec![1, 2]);
    }

    #[test]
    fn create_then_delete_is_a_no_op() {
        let events = vec![row(1, EventKind::Create), row(2, EventKind::Delete)];
        let result = coalesce(events);
        assert!(result.lead.is_none());
        assert_eq!(result.superseded_ids, vec![1, 2]);
    }

    #[test]
    fn modify_then_delete_of_a_pre_existing_path_still_leases_the_delete() {
        let events = vec![row(1, EventKind::Modify), row(2, EventKind::Delete)];
        let result = coalesce(events);
        assert_eq!(
            result.lead.unwrap().id,
            2,
            "unlike create+delete, a pre-existing document must actually be removed"
        );
        assert_eq!(result.superseded_ids, vec![1]);
    }

    #[test]
    fn events_before_a_delete_are_dropped() {
        let events = vec![
            row(1, EventKind::Modify),
            row(2, EventKind::Modify),
            row(3, EventKind::Delete),
            row(4, EventKind::Create),
        ];
        let result = coalesce(events);
        assert_eq!(result.lead.unwrap().id, 4);
        assert!(result.superseded_ids.contains(&1));
        assert!(result.superseded_ids.contains(&2));
        assert!(result.superseded_ids.contains(&3));
    }

    #[test]
    fn single_create_is_its_own_lead() {
        let events = vec![row(1, EventKind::Create)];
        let result = coalesce(events);
        assert_eq!(result.lead.unwrap().id, 1);
        assert!(result.superseded_ids.is_empty());
    }

    #[test]
    fn backoff_doubles_and_caps_at_thirty_seconds() {
        assert_eq!(backoff_millis(1), 1000);
        assert_eq!(backoff_millis(2), 2000);
        assert_eq!(backoff_millis(3), 4000);
        assert_eq!(backoff_millis(10), BACKOFF_CAP_MS);
    }
}
