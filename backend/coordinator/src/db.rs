//! Database layer: migrations, the event journal, and the protocol snapshot.

use std::str::FromStr;

use ecotask_protocol::{RecordedEvent, Store};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::errors::{CoordinatorError, Result};
use crate::events::{EventRecord, JournalEntry};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every connection to `:memory:` opens its own database, so keep exactly
    // one alive for the lifetime of the pool.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Writes
// ─────────────────────────────────────────────────────────

/// Journal `events` and overwrite the snapshot with `store` in a single
/// transaction. Returns the number of journal rows written.
///
/// Events already journaled under the same `seq` are silently ignored.
pub async fn persist(
    pool: &SqlitePool,
    store: &Store,
    next_seq: u64,
    events: &[RecordedEvent],
) -> Result<usize> {
    let entries = events
        .iter()
        .map(JournalEntry::from_recorded)
        .collect::<Result<Vec<_>>>()?;
    let state = serde_json::to_string(store)?;

    let mut tx = pool.begin().await?;
    let mut count = 0usize;
    for entry in &entries {
        let rows_affected = sqlx::query(
            r#"
            INSERT OR IGNORE INTO events
                (seq, event_type, task_id, actor, amount, timestamp, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(entry.seq)
        .bind(&entry.event_type)
        .bind(entry.task_id)
        .bind(&entry.actor)
        .bind(&entry.amount)
        .bind(entry.timestamp)
        .bind(&entry.payload)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        count += rows_affected as usize;
    }

    sqlx::query(
        r#"
        INSERT INTO protocol_snapshot (id, state, next_seq, updated_at)
        VALUES (1, ?1, ?2, strftime('%s', 'now'))
        ON CONFLICT (id) DO UPDATE SET
            state      = excluded.state,
            next_seq   = excluded.next_seq,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&state)
    .bind(next_seq as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    debug!(journaled = count, next_seq, "protocol state persisted");
    Ok(count)
}

// ─────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────

/// Read back the persisted store and the sequence number its next event
/// should carry. Returns `None` on a fresh database.
pub async fn load_snapshot(pool: &SqlitePool) -> Result<Option<(Store, u64)>> {
    let row: Option<(String, i64)> =
        sqlx::query_as("SELECT state, next_seq FROM protocol_snapshot WHERE id = 1")
            .fetch_optional(pool)
            .await?;

    match row {
        Some((state, next_seq)) => {
            let store: Store = serde_json::from_str(&state)?;
            let next_seq = u64::try_from(next_seq).map_err(|_| {
                CoordinatorError::Snapshot(format!("negative next_seq {next_seq}"))
            })?;
            Ok(Some((store, next_seq)))
        }
        None => Ok(None),
    }
}

// ─────────────────────────────────────────────────────────
// Event reads
// ─────────────────────────────────────────────────────────

/// Fetch journaled events with `seq > after`, oldest first.
pub async fn get_all_events(
    pool: &SqlitePool,
    after: Option<i64>,
    limit: i64,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT seq, event_type, task_id, actor, amount, timestamp, payload, created_at
        FROM   events
        WHERE  seq > ?1
        ORDER  BY seq ASC
        LIMIT  ?2
        "#,
    )
    .bind(after.unwrap_or(-1))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch events that moved value (payouts, penalties, fees, slashes) with
/// `seq > after`, optionally restricted to one task, oldest first.
pub async fn get_value_events(
    pool: &SqlitePool,
    task_id: Option<i64>,
    after: Option<i64>,
    limit: i64,
) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT seq, event_type, task_id, actor, amount, timestamp, payload, created_at
        FROM   events
        WHERE  seq > ?1
          AND  (?2 IS NULL OR task_id = ?2)
          AND  event_type IN ('funding_withdrawn', 'payment_released', 'refund_claimed',
                              'stake_slashed', 'stake_withdrawn')
        ORDER  BY seq ASC
        LIMIT  ?3
        "#,
    )
    .bind(after.unwrap_or(-1))
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch all events for a given task, oldest first.
pub async fn get_events_for_task(pool: &SqlitePool, task_id: i64) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT seq, event_type, task_id, actor, amount, timestamp, payload, created_at
        FROM   events
        WHERE  task_id = ?1
        ORDER  BY seq ASC
        "#,
    )
    .bind(task_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Fetch all events naming `actor` (funder, operator, validator, ...).
pub async fn get_events_for_actor(pool: &SqlitePool, actor: &str) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRecord>(
        r#"
        SELECT seq, event_type, task_id, actor, amount, timestamp, payload, created_at
        FROM   events
        WHERE  actor = ?1
        ORDER  BY seq ASC
        "#,
    )
    .bind(actor)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
