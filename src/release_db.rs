use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, params};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use crate::models::deployment::{
    DeploymentRecord, Environment, EnvironmentState, HistoryEntry, HistoryFilter, HistoryStatus,
};
use crate::models::health::ServiceHealth;
use crate::ports::{EnvironmentRepository, HealthRepository, HistoryRepository};

/// Timestamps are stored as fixed-width RFC 3339 text so that equality on
/// `started_at` identifies a deployment group.
pub fn to_db_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct ReleaseDb {
    conn: Mutex<Connection>,
}

impl ReleaseDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("release db connection mutex poisoned"))
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS deployments (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                environment  TEXT NOT NULL CHECK(environment IN ('prod','preprod')),
                service_name TEXT NOT NULL,
                version      TEXT NOT NULL,
                commit_sha   TEXT NOT NULL,
                deployed_at  TEXT NOT NULL,
                deployed_by  TEXT NOT NULL,
                UNIQUE(environment, service_name)
            );
            CREATE INDEX IF NOT EXISTS idx_deployments_env ON deployments(environment);
            CREATE INDEX IF NOT EXISTS idx_deployments_service ON deployments(service_name);

            CREATE TABLE IF NOT EXISTS deployment_history (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                environment      TEXT NOT NULL CHECK(environment IN ('prod','preprod')),
                service_name     TEXT NOT NULL,
                version          TEXT NOT NULL,
                commit_sha       TEXT NOT NULL,
                status           TEXT NOT NULL CHECK(status IN ('pending','in_progress','success','failed','rolled_back')),
                deployed_by      TEXT NOT NULL,
                error_message    TEXT,
                started_at       TEXT NOT NULL,
                completed_at     TEXT,
                duration_seconds REAL
            );
            CREATE INDEX IF NOT EXISTS idx_history_env ON deployment_history(environment);
            CREATE INDEX IF NOT EXISTS idx_history_service ON deployment_history(service_name);
            CREATE INDEX IF NOT EXISTS idx_history_status ON deployment_history(status);
            CREATE INDEX IF NOT EXISTS idx_history_started ON deployment_history(environment, started_at);

            CREATE TABLE IF NOT EXISTS service_health (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                environment      TEXT NOT NULL CHECK(environment IN ('prod','preprod')),
                service_name     TEXT NOT NULL,
                status           TEXT NOT NULL CHECK(status IN ('healthy','unhealthy','unknown')),
                replicas_running INTEGER,
                replicas_desired INTEGER,
                last_checked     TEXT NOT NULL,
                error_message    TEXT,
                UNIQUE(environment, service_name)
            );
            CREATE INDEX IF NOT EXISTS idx_health_env ON service_health(environment);
            ",
        )?;
        Ok(())
    }

    // ── Deployment operations ──

    pub fn upsert_deployment(
        &self,
        environment: Environment,
        service_name: &str,
        version: &str,
        commit_sha: &str,
        deployed_at: DateTime<Utc>,
        deployed_by: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO deployments (environment, service_name, version, commit_sha, deployed_at, deployed_by) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(environment, service_name) DO UPDATE SET \
             version = excluded.version, commit_sha = excluded.commit_sha, \
             deployed_at = excluded.deployed_at, deployed_by = excluded.deployed_by",
            params![
                environment.as_str(),
                service_name,
                version,
                commit_sha,
                to_db_timestamp(deployed_at),
                deployed_by
            ],
        )?;
        Ok(())
    }

    pub fn list_deployments(
        &self,
        environment: Option<Environment>,
    ) -> anyhow::Result<Vec<DeploymentRecord>> {
        let conn = self.conn()?;
        let mut sql = "SELECT id, environment, service_name, version, commit_sha, deployed_at, deployed_by \
                       FROM deployments"
            .to_string();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(env) = environment {
            sql.push_str(" WHERE environment = ?1");
            param_values.push(Box::new(env.as_str()));
        }
        sql.push_str(" ORDER BY service_name ASC");

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok(DeploymentRecord {
                    id: row.get(0)?,
                    environment: parsed(row, 1)?,
                    service_name: row.get(2)?,
                    version: row.get(3)?,
                    commit_sha: row.get(4)?,
                    deployed_at: timestamp(row, 5)?,
                    deployed_by: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_environment_state(
        &self,
        environment: Environment,
    ) -> anyhow::Result<Option<EnvironmentState>> {
        let deployments = self.list_deployments(Some(environment))?;
        let Some(latest) = deployments.iter().max_by_key(|d| d.deployed_at) else {
            return Ok(None);
        };
        let services = deployments
            .iter()
            .map(|d| (d.service_name.clone(), d.version.clone()))
            .collect();
        Ok(Some(EnvironmentState {
            commit_sha: latest.commit_sha.clone(),
            deployed_at: latest.deployed_at,
            services,
        }))
    }

    pub fn get_all_environment_states(
        &self,
    ) -> anyhow::Result<BTreeMap<Environment, EnvironmentState>> {
        let mut states = BTreeMap::new();
        for env in Environment::ALL {
            if let Some(state) = self.get_environment_state(env)? {
                states.insert(env, state);
            }
        }
        Ok(states)
    }

    // ── History operations ──

    pub fn create_history_record(
        &self,
        environment: Environment,
        service_name: &str,
        version: &str,
        commit_sha: &str,
        deployed_by: &str,
        status: HistoryStatus,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO deployment_history (environment, service_name, version, commit_sha, status, \
             deployed_by, started_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                environment.as_str(),
                service_name,
                version,
                commit_sha,
                status.as_str(),
                deployed_by,
                to_db_timestamp(started_at)
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finalize_history_record(
        &self,
        history_id: i64,
        status: HistoryStatus,
        completed_at: DateTime<Utc>,
        duration_seconds: Option<f64>,
        error_message: Option<&str>,
    ) -> anyhow::Result<bool> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE deployment_history SET status = ?2, error_message = ?3, duration_seconds = ?4, \
             completed_at = ?5 WHERE id = ?1",
            params![
                history_id,
                status.as_str(),
                error_message,
                duration_seconds,
                to_db_timestamp(completed_at)
            ],
        )?;
        Ok(count > 0)
    }

    pub fn fetch_history_record(&self, history_id: i64) -> anyhow::Result<Option<HistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM deployment_history WHERE id = ?1"
        ))?;
        let mut rows = stmt.query_map(params![history_id], history_from_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_history_for_started_at(
        &self,
        environment: Environment,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<HistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {HISTORY_COLUMNS} FROM deployment_history \
             WHERE environment = ?1 AND started_at = ?2 ORDER BY service_name ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(
                params![environment.as_str(), to_db_timestamp(started_at)],
                history_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_history(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<HistoryEntry>, i64)> {
        let conn = self.conn()?;
        let mut where_clause = " WHERE 1=1".to_string();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(env) = filter.environment {
            where_clause.push_str(&format!(" AND environment = ?{}", param_values.len() + 1));
            param_values.push(Box::new(env.as_str()));
        }
        if let Some(svc) = filter.service.as_deref().filter(|s| !s.is_empty() && *s != "all") {
            where_clause.push_str(&format!(" AND service_name = ?{}", param_values.len() + 1));
            param_values.push(Box::new(svc.to_string()));
        }

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM deployment_history{where_clause}"),
            params_ref.as_slice(),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM deployment_history{where_clause} \
             ORDER BY started_at DESC, service_name ASC LIMIT ?{} OFFSET ?{}",
            param_values.len() + 1,
            param_values.len() + 2
        );
        let mut paged = params_ref;
        paged.push(&limit);
        paged.push(&offset);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(paged.as_slice(), history_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok((rows, total))
    }

    // ── Service health operations ──

    pub fn update_service_health(&self, health: &ServiceHealth) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO service_health (environment, service_name, status, replicas_running, \
             replicas_desired, last_checked, error_message) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(environment, service_name) DO UPDATE SET \
             status = excluded.status, replicas_running = excluded.replicas_running, \
             replicas_desired = excluded.replicas_desired, last_checked = excluded.last_checked, \
             error_message = excluded.error_message",
            params![
                health.environment.as_str(),
                health.service_name,
                health.status.as_str(),
                health.replicas_running,
                health.replicas_desired,
                to_db_timestamp(health.last_checked),
                health.error_message
            ],
        )?;
        Ok(())
    }

    pub fn list_service_health(
        &self,
        environment: Option<Environment>,
    ) -> anyhow::Result<Vec<ServiceHealth>> {
        let conn = self.conn()?;
        let mut sql = "SELECT environment, service_name, status, replicas_running, replicas_desired, \
                       last_checked, error_message FROM service_health"
            .to_string();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(env) = environment {
            sql.push_str(" WHERE environment = ?1");
            param_values.push(Box::new(env.as_str()));
        }
        sql.push_str(" ORDER BY environment ASC, service_name ASC");

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok(ServiceHealth {
                    environment: parsed(row, 0)?,
                    service_name: row.get(1)?,
                    status: parsed(row, 2)?,
                    replicas_running: row.get(3)?,
                    replicas_desired: row.get(4)?,
                    last_checked: timestamp(row, 5)?,
                    error_message: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

const HISTORY_COLUMNS: &str = "id, environment, service_name, version, commit_sha, status, deployed_by, \
                               error_message, started_at, completed_at, duration_seconds";

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        id: row.get(0)?,
        environment: parsed(row, 1)?,
        service_name: row.get(2)?,
        version: row.get(3)?,
        commit_sha: row.get(4)?,
        status: parsed(row, 5)?,
        deployed_by: row.get(6)?,
        error_message: row.get(7)?,
        started_at: timestamp(row, 8)?,
        completed_at: optional_timestamp(row, 9)?,
        duration_seconds: row.get(10)?,
    })
}

fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

// ── Repository ports ──

impl EnvironmentRepository for ReleaseDb {
    fn get_environment(&self, environment: Environment) -> anyhow::Result<Option<EnvironmentState>> {
        self.get_environment_state(environment)
    }

    fn get_all_environments(&self) -> anyhow::Result<BTreeMap<Environment, EnvironmentState>> {
        self.get_all_environment_states()
    }

    fn record_deployment(
        &self,
        environment: Environment,
        service_name: &str,
        version: &str,
        commit_sha: &str,
        deployed_at: DateTime<Utc>,
        deployed_by: &str,
    ) -> anyhow::Result<()> {
        self.upsert_deployment(environment, service_name, version, commit_sha, deployed_at, deployed_by)
    }
}

impl HistoryRepository for ReleaseDb {
    fn start_history(
        &self,
        environment: Environment,
        service_name: &str,
        version: &str,
        commit_sha: &str,
        deployed_by: &str,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        self.create_history_record(
            environment,
            service_name,
            version,
            commit_sha,
            deployed_by,
            HistoryStatus::InProgress,
            started_at,
        )
    }

    fn complete_history(
        &self,
        history_id: i64,
        status: HistoryStatus,
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        if !self.finalize_history_record(
            history_id,
            status,
            completed_at,
            Some(duration_seconds),
            error_message,
        )? {
            anyhow::bail!("history record {history_id} does not exist");
        }
        Ok(())
    }

    fn fetch_history(&self, history_id: i64) -> anyhow::Result<Option<HistoryEntry>> {
        self.fetch_history_record(history_id)
    }

    fn list_history_for_started_at(
        &self,
        environment: Environment,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<Vec<HistoryEntry>> {
        ReleaseDb::list_history_for_started_at(self, environment, started_at)
    }

    fn list_history(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<(Vec<HistoryEntry>, i64)> {
        ReleaseDb::list_history(self, filter, limit, offset)
    }
}

impl HealthRepository for ReleaseDb {
    fn store(&self, health: &ServiceHealth) -> anyhow::Result<()> {
        self.update_service_health(health)
    }

    fn list(&self, environment: Option<Environment>) -> anyhow::Result<Vec<ServiceHealth>> {
        self.list_service_health(environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::health::HealthStatus;
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 4, 9, hour, minute, 0).unwrap()
    }

    fn db() -> ReleaseDb {
        ReleaseDb::open(":memory:").unwrap()
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = db();
        db.run_migrations().unwrap();
        assert!(db.get_all_environment_states().unwrap().is_empty());
    }

    #[test]
    fn test_upsert_overwrites_per_environment_and_service() {
        let db = db();
        db.upsert_deployment(Environment::Prod, "jellyfin", "2025040803", "abc123", ts(8, 0), "system")
            .unwrap();
        db.upsert_deployment(Environment::Prod, "jellyfin", "2025040900", "def456", ts(9, 0), "manual")
            .unwrap();
        db.upsert_deployment(Environment::Preprod, "jellyfin", "2025041000", "fff000", ts(10, 0), "system")
            .unwrap();

        let prod = db.list_deployments(Some(Environment::Prod)).unwrap();
        assert_eq!(prod.len(), 1);
        assert_eq!(prod[0].version, "2025040900");
        assert_eq!(prod[0].deployed_by, "manual");
        assert_eq!(db.list_deployments(None).unwrap().len(), 2);
    }

    #[test]
    fn test_environment_state_uses_most_recent_commit() {
        let db = db();
        db.upsert_deployment(Environment::Preprod, "api", "1.0.0", "old", ts(8, 0), "system")
            .unwrap();
        db.upsert_deployment(Environment::Preprod, "worker", "2.0.0", "new", ts(9, 30), "system")
            .unwrap();

        let state = db.get_environment_state(Environment::Preprod).unwrap().unwrap();
        assert_eq!(state.commit_sha, "new");
        assert_eq!(state.deployed_at, ts(9, 30));
        assert_eq!(state.services.get("api").map(String::as_str), Some("1.0.0"));
        assert_eq!(state.services.get("worker").map(String::as_str), Some("2.0.0"));
        assert!(db.get_environment_state(Environment::Prod).unwrap().is_none());
    }

    #[test]
    fn test_history_lifecycle_and_grouping() {
        let db = db();
        let started = ts(12, 0);
        let b = db
            .start_history(Environment::Prod, "b", "2", "sha", "manual", started)
            .unwrap();
        let a = db
            .start_history(Environment::Prod, "a", "1", "sha", "manual", started)
            .unwrap();
        db.start_history(Environment::Preprod, "a", "1", "sha", "system", started)
            .unwrap();

        let entry = db.fetch_history(a).unwrap().unwrap();
        assert_eq!(entry.status, HistoryStatus::InProgress);
        assert!(entry.completed_at.is_none());

        db.complete_history(a, HistoryStatus::Failed, ts(12, 1), 60.0, Some("boom"))
            .unwrap();
        let entry = db.fetch_history(a).unwrap().unwrap();
        assert_eq!(entry.status, HistoryStatus::Failed);
        assert_eq!(entry.error_message.as_deref(), Some("boom"));
        assert_eq!(entry.completed_at, Some(ts(12, 1)));
        assert_eq!(entry.duration_seconds, Some(60.0));

        let group = ReleaseDb::list_history_for_started_at(&db, Environment::Prod, started).unwrap();
        let ids: Vec<i64> = group.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_complete_unknown_history_is_an_error() {
        let db = db();
        assert!(db
            .complete_history(999, HistoryStatus::Success, ts(1, 0), 0.0, None)
            .is_err());
        assert!(db.fetch_history(999).unwrap().is_none());
    }

    #[test]
    fn test_list_history_filters_and_paginates() {
        let db = db();
        for (i, svc) in ["api", "web", "api"].iter().enumerate() {
            db.start_history(Environment::Prod, svc, "1", "sha", "manual", ts(i as u32, 0))
                .unwrap();
        }
        db.start_history(Environment::Preprod, "api", "1", "sha", "system", ts(5, 0))
            .unwrap();

        let all = HistoryFilter::default();
        let (page, total) = ReleaseDb::list_history(&db, &all, 2, 0).unwrap();
        assert_eq!(total, 4);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].started_at, ts(5, 0));

        let filter = HistoryFilter {
            environment: Some(Environment::Prod),
            service: Some("api".to_string()),
        };
        let (page, total) = ReleaseDb::list_history(&db, &filter, 10, 1).unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].started_at, ts(0, 0));

        let everything = HistoryFilter {
            environment: None,
            service: Some("all".to_string()),
        };
        assert_eq!(ReleaseDb::list_history(&db, &everything, 10, 0).unwrap().1, 4);
    }

    #[test]
    fn test_service_health_upserts() {
        let db = db();
        let mut health = ServiceHealth {
            environment: Environment::Prod,
            service_name: "jellyfin".to_string(),
            status: HealthStatus::Unhealthy,
            replicas_running: Some(0),
            replicas_desired: Some(1),
            last_checked: ts(1, 0),
            error_message: None,
        };
        db.store(&health).unwrap();
        health.status = HealthStatus::Healthy;
        health.replicas_running = Some(1);
        health.last_checked = ts(1, 5);
        db.store(&health).unwrap();

        let rows = db.list(Some(Environment::Prod)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, HealthStatus::Healthy);
        assert_eq!(rows[0].replicas_running, Some(1));
        assert_eq!(rows[0].last_checked, ts(1, 5));
        assert!(db.list(Some(Environment::Preprod)).unwrap().is_empty());
    }
}
