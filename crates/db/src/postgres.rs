// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Postgres adapter for the logical database contract.
//!
//! Queue-change notifications ride on LISTEN/NOTIFY; the channel names
//! are the [`Notification`] channel strings.

use crate::database::{Database, DbError};
use crate::types::{BuildRow, Notification, StepRowUpdate};
use async_trait::async_trait;
use kiln_core::{BuildId, BuildStatus, JobsetName, StorePath};
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

impl From<sqlx::Error> for DbError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DbError::Connection(e.to_string())
            }
            other => DbError::Query(other.to_string()),
        }
    }
}

/// [`Database`] backed by Postgres via a bounded connection pool.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    listener: Arc<tokio::sync::Mutex<PgListener>>,
}

impl PgDatabase {
    /// Connect the pool and subscribe the notification listener to all
    /// queue-change channels.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(url).await?;
        let mut listener = PgListener::connect(url).await?;
        let channels: Vec<&str> = Notification::ALL.iter().map(|n| n.channel()).collect();
        listener.listen_all(channels).await?;
        Ok(Self { pool, listener: Arc::new(tokio::sync::Mutex::new(listener)) })
    }

    async fn notify(&self, channel: &str, payload: &str) -> Result<(), DbError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_build(row: &sqlx::postgres::PgRow) -> Result<BuildRow, DbError> {
    Ok(BuildRow {
        id: BuildId(row.try_get::<i64, _>("id")? as u64),
        drv_path: StorePath::new(row.try_get::<String, _>("drv_path")?),
        project: row.try_get("project")?,
        jobset: row.try_get("jobset")?,
        job: row.try_get("job")?,
        timestamp: row.try_get("timestamp")?,
        max_silent_time: row.try_get("max_silent_time")?,
        build_timeout: row.try_get("build_timeout")?,
        local_priority: row.try_get("local_priority")?,
        global_priority: row.try_get("global_priority")?,
    })
}

#[async_trait]
impl Database for PgDatabase {
    async fn queued_builds(&self) -> Result<Vec<BuildRow>, DbError> {
        let rows = sqlx::query(
            "SELECT id, drv_path, project, jobset, job, timestamp, \
                    max_silent_time, build_timeout, local_priority, global_priority \
             FROM builds WHERE status = 'pending' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_build).collect()
    }

    async fn queued_build_priorities(&self) -> Result<Vec<(BuildId, i32)>, DbError> {
        let rows =
            sqlx::query("SELECT id, global_priority FROM builds WHERE status = 'pending'")
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    BuildId(row.try_get::<i64, _>("id")? as u64),
                    row.try_get::<i32, _>("global_priority")?,
                ))
            })
            .collect()
    }

    async fn jobset_shares(&self, name: &JobsetName) -> Result<Option<u32>, DbError> {
        let row = sqlx::query(
            "SELECT scheduling_shares FROM jobsets WHERE project = $1 AND name = $2",
        )
        .bind(&name.project)
        .bind(&name.jobset)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get::<i32, _>("scheduling_shares")?.max(0) as u32),
            None => None,
        })
    }

    async fn check_cached_failure(&self, drv_path: &StorePath) -> Result<bool, DbError> {
        let row = sqlx::query("SELECT 1 AS one FROM failed_paths WHERE path = $1")
            .bind(drv_path.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn cache_failure(&self, drv_path: &StorePath) -> Result<(), DbError> {
        sqlx::query("INSERT INTO failed_paths (path) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(drv_path.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_build_step(
        &self,
        build_id: BuildId,
        drv_path: &StorePath,
        status: BuildStatus,
        machine: &str,
        start_time: i64,
        propagated_from: Option<&StorePath>,
    ) -> Result<i32, DbError> {
        let row = sqlx::query(
            "INSERT INTO build_steps \
                 (build_id, step_nr, drv_path, status, machine, start_time, propagated_from) \
             SELECT $1, COALESCE(MAX(step_nr), 0) + 1, $2, $3, $4, $5, $6 \
             FROM build_steps WHERE build_id = $1 \
             RETURNING step_nr",
        )
        .bind(build_id.0 as i64)
        .bind(drv_path.as_str())
        .bind(status.db_code())
        .bind(machine)
        .bind(start_time)
        .bind(propagated_from.map(StorePath::as_str))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("step_nr")?)
    }

    async fn finish_build_step(&self, update: StepRowUpdate) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE build_steps \
             SET status = $3, start_time = $4, stop_time = $5, machine = $6, \
                 error_msg = $7, log_file = $8 \
             WHERE build_id = $1 AND step_nr = $2",
        )
        .bind(update.build_id.0 as i64)
        .bind(update.step_nr)
        .bind(update.status.db_code())
        .bind(update.start_time)
        .bind(update.stop_time)
        .bind(&update.machine)
        .bind(update.error_msg.as_deref())
        .bind(update.log_file.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_build_finished(
        &self,
        build_id: BuildId,
        status: BuildStatus,
        start_time: i64,
        stop_time: i64,
    ) -> Result<(), DbError> {
        sqlx::query(
            "UPDATE builds \
             SET status = 'finished', build_status = $2, start_time = $3, stop_time = $4 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(build_id.0 as i64)
        .bind(status.db_code())
        .bind(start_time)
        .bind(stop_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_build_succeeded(
        &self,
        build_id: BuildId,
        outputs: &BTreeMap<String, StorePath>,
        start_time: i64,
        stop_time: i64,
        cached: bool,
    ) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE builds \
             SET status = 'finished', build_status = $2, start_time = $3, stop_time = $4, \
                 is_cached_build = $5 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(build_id.0 as i64)
        .bind(BuildStatus::Success.db_code())
        .bind(start_time)
        .bind(stop_time)
        .bind(cached)
        .execute(&mut *tx)
        .await?;
        for (name, path) in outputs {
            sqlx::query(
                "INSERT INTO build_outputs (build_id, name, path) VALUES ($1, $2, $3) \
                 ON CONFLICT (build_id, name) DO UPDATE SET path = $3",
            )
            .bind(build_id.0 as i64)
            .bind(name)
            .bind(path.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn notify_build_started(&self, build_id: BuildId) -> Result<(), DbError> {
        self.notify("build_started", &build_id.to_string()).await
    }

    async fn notify_build_finished(
        &self,
        build_id: BuildId,
        dependents: &[BuildId],
    ) -> Result<(), DbError> {
        let mut payload = build_id.to_string();
        for dependent in dependents {
            payload.push('\t');
            payload.push_str(&dependent.to_string());
        }
        self.notify("build_finished", &payload).await
    }

    async fn notify_step_finished(
        &self,
        build_id: BuildId,
        step_nr: i32,
        log_file: &str,
    ) -> Result<(), DbError> {
        self.notify("step_finished", &format!("{}\t{}\t{}", build_id, step_nr, log_file)).await
    }

    async fn notify_dump_status(&self) -> Result<(), DbError> {
        self.notify(Notification::DumpStatus.channel(), "").await
    }

    async fn next_notification(
        &self,
        timeout: Duration,
    ) -> Result<Option<Notification>, DbError> {
        let mut listener = self.listener.lock().await;
        let wait = async {
            loop {
                let raw = listener.recv().await?;
                if let Some(notification) = Notification::from_channel(raw.channel()) {
                    return Ok::<_, sqlx::Error>(notification);
                }
                tracing::debug!(channel = raw.channel(), "ignoring unknown notification");
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(notification)) => Ok(Some(notification)),
            Ok(Err(e)) => Err(DbError::Listen(e.to_string())),
            Err(_) => Ok(None),
        }
    }
}
