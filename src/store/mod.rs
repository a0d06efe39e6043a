//! Persisted VM records.
//!
//! Each record mirrors a VM on the hypervisor through its `vm_id` and `node`.
//! Nothing here talks to the hypervisor; the two can drift apart until
//! [`crate::manager::VmManager::sync_status`] reconciles them.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::error::{Error, Result};

pub mod migrations;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    Running,
    #[default]
    Stopped,
    Paused,
    Error,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Paused => "paused",
            VmStatus::Error => "error",
        }
    }

    /// Derives the record status from what the hypervisor reports in
    /// `status/current`. A paused guest still reports `status: running`,
    /// so `qmpstatus` takes precedence.
    pub fn from_hypervisor(status: &str, qmpstatus: Option<&str>) -> Self {
        match (status, qmpstatus) {
            (_, Some("paused")) => VmStatus::Paused,
            ("running", _) => VmStatus::Running,
            ("stopped", _) => VmStatus::Stopped,
            _ => VmStatus::Error,
        }
    }
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(VmStatus::Running),
            "stopped" => Ok(VmStatus::Stopped),
            "paused" => Ok(VmStatus::Paused),
            "error" => Ok(VmStatus::Error),
            other => Err(format!("unknown VM status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub vm_id: u32,
    pub name: String,
    pub owner_id: String,
    pub owner_username: String,
    pub cpu: u32,

    /// MiB, as sent to the hypervisor.
    pub ram: u64,

    /// GiB.
    pub disk: u32,

    pub ip_address: Option<String>,
    pub ssh_username: String,

    /// Stored as given, in plaintext.
    pub ssh_password: String,

    pub status: VmStatus,
    pub created_at: DateTime<Utc>,
    pub last_started: Option<DateTime<Utc>>,
    pub node: String,
}

/// Fields a caller supplies when creating a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVmRecord {
    pub vm_id: u32,
    pub name: String,
    pub owner_id: String,
    pub owner_username: String,
    pub cpu: u32,
    pub ram: u64,
    pub disk: u32,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub ssh_username: String,
    pub ssh_password: String,
    pub node: String,
}

impl NewVmRecord {
    fn check_required(&self) -> Result<()> {
        let required = [
            ("name", &self.name),
            ("ownerId", &self.owner_id),
            ("ownerUsername", &self.owner_username),
            ("sshUsername", &self.ssh_username),
            ("sshPassword", &self.ssh_password),
            ("node", &self.node),
        ];
        match required.iter().find(|(_, value)| value.is_empty()) {
            Some((field, _)) => Err(Error::MissingField { field: *field }),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct VmStore {
    pool: SqlitePool,
}

impl VmStore {
    /// Opens (creating if needed) the database at `url` and runs migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Opening VM store at {url}");
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database. One connection is kept alive for the
    /// lifetime of the pool, since every SQLite connection to `:memory:`
    /// is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn insert(&self, new: NewVmRecord) -> Result<VmRecord> {
        new.check_required()?;
        let ram = i64::try_from(new.ram).map_err(|_| Error::InvalidRequest {
            reason: format!("ram of {} MiB is out of range", new.ram),
        })?;

        let record = VmRecord {
            vm_id: new.vm_id,
            name: new.name,
            owner_id: new.owner_id,
            owner_username: new.owner_username,
            cpu: new.cpu,
            ram: new.ram,
            disk: new.disk,
            ip_address: new.ip_address,
            ssh_username: new.ssh_username,
            ssh_password: new.ssh_password,
            status: VmStatus::default(),
            created_at: Utc::now(),
            last_started: None,
            node: new.node,
        };

        sqlx::query(
            r#"
            INSERT INTO vms (vm_id, name, owner_id, owner_username, cpu, ram, disk, ip_address,
                             ssh_username, ssh_password, status, created_at, last_started, node)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(i64::from(record.vm_id))
        .bind(&record.name)
        .bind(&record.owner_id)
        .bind(&record.owner_username)
        .bind(i64::from(record.cpu))
        .bind(ram)
        .bind(i64::from(record.disk))
        .bind(&record.ip_address)
        .bind(&record.ssh_username)
        .bind(&record.ssh_password)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.last_started)
        .bind(&record.node)
        .execute(&self.pool)
        .await
        .map_err(|e| constraint_error(e, &record))?;

        tracing::info!("Stored VM record {} ({})", record.vm_id, record.name);
        Ok(record)
    }

    pub async fn get(&self, vm_id: u32) -> Result<VmRecord> {
        sqlx::query("SELECT * FROM vms WHERE vm_id = ?")
            .bind(i64::from(vm_id))
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_record)
            .transpose()?
            .ok_or(Error::NotFound { vm_id })
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<VmRecord>> {
        sqlx::query("SELECT * FROM vms WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(row_to_record)
            .transpose()
    }

    pub async fn list(&self) -> Result<Vec<VmRecord>> {
        let rows = sqlx::query("SELECT * FROM vms ORDER BY vm_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<VmRecord>> {
        let rows = sqlx::query("SELECT * FROM vms WHERE owner_id = ? ORDER BY vm_id")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    pub async fn vm_id_exists(&self, vm_id: u32) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM vms WHERE vm_id = ?")
            .bind(i64::from(vm_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn update_ip_address(&self, vm_id: u32, ip_address: Option<String>) -> Result<()> {
        let res = sqlx::query("UPDATE vms SET ip_address = ? WHERE vm_id = ?")
            .bind(ip_address)
            .bind(i64::from(vm_id))
            .execute(&self.pool)
            .await?;
        ensure_found(res.rows_affected(), vm_id)
    }

    /// Writes a status observed on the hypervisor. `last_started` is only
    /// replaced when given.
    pub(crate) async fn record_status(
        &self,
        vm_id: u32,
        status: VmStatus,
        last_started: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let res = sqlx::query(
            "UPDATE vms SET status = ?, last_started = COALESCE(?, last_started) WHERE vm_id = ?",
        )
        .bind(status.as_str())
        .bind(last_started)
        .bind(i64::from(vm_id))
        .execute(&self.pool)
        .await?;
        ensure_found(res.rows_affected(), vm_id)
    }

    pub async fn delete(&self, vm_id: u32) -> Result<()> {
        let res = sqlx::query("DELETE FROM vms WHERE vm_id = ?")
            .bind(i64::from(vm_id))
            .execute(&self.pool)
            .await?;
        ensure_found(res.rows_affected(), vm_id)?;
        tracing::info!("Removed VM record {vm_id}");
        Ok(())
    }
}

fn ensure_found(rows_affected: u64, vm_id: u32) -> Result<()> {
    if rows_affected == 0 {
        Err(Error::NotFound { vm_id })
    } else {
        Ok(())
    }
}

/// Turns SQLite constraint failures into the matching record-store errors.
/// SQLite names the column in the message, e.g. `UNIQUE constraint failed: vms.name`.
fn constraint_error(e: sqlx::Error, record: &VmRecord) -> Error {
    let sqlx::Error::Database(db) = &e else {
        return Error::Database(e);
    };

    let column = db
        .message()
        .rsplit("vms.")
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    match db.kind() {
        ErrorKind::UniqueViolation if column == "vm_id" => Error::Duplicate {
            field: "vmId",
            value: record.vm_id.to_string(),
        },
        ErrorKind::UniqueViolation if column == "name" => Error::Duplicate {
            field: "name",
            value: record.name.clone(),
        },
        ErrorKind::NotNullViolation => Error::MissingField {
            field: column_field(&column),
        },
        _ => Error::Database(e),
    }
}

fn column_field(column: &str) -> &'static str {
    match column {
        "vm_id" => "vmId",
        "name" => "name",
        "owner_id" => "ownerId",
        "owner_username" => "ownerUsername",
        "ssh_username" => "sshUsername",
        "ssh_password" => "sshPassword",
        "node" => "node",
        _ => "unknown",
    }
}

fn row_to_record(row: SqliteRow) -> Result<VmRecord> {
    let status: String = row.try_get("status")?;
    let status = status.parse().unwrap_or_else(|e| {
        tracing::warn!("{e}, treating as error");
        VmStatus::Error
    });

    Ok(VmRecord {
        vm_id: to_u32(row.try_get("vm_id")?, "vm_id")?,
        name: row.try_get("name")?,
        owner_id: row.try_get("owner_id")?,
        owner_username: row.try_get("owner_username")?,
        cpu: to_u32(row.try_get("cpu")?, "cpu")?,
        ram: u64::try_from(row.try_get::<i64, _>("ram")?).map_err(|e| decode_error("ram", e))?,
        disk: to_u32(row.try_get("disk")?, "disk")?,
        ip_address: row.try_get("ip_address")?,
        ssh_username: row.try_get("ssh_username")?,
        ssh_password: row.try_get("ssh_password")?,
        status,
        created_at: row.try_get("created_at")?,
        last_started: row.try_get("last_started")?,
        node: row.try_get("node")?,
    })
}

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|e| decode_error(column, e))
}

fn decode_error(column: &str, e: std::num::TryFromIntError) -> Error {
    Error::Database(sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}
