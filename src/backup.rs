//! Encrypted backup and restore
//!
//! `BackupManager` snapshots tenant data into a single archive per backup,
//! encrypting per-table payloads through the tenant cipher, and restores
//! them table by table with best-effort semantics. Archive integrity is
//! pinned by a SHA-256 checksum over the final archive bytes — any
//! mismatch marks the backup corrupted.

use crate::audit::AuditLog;
use crate::cipher::{EncryptedRecord, TenantCipher};
use crate::error::{Result, SecurityError};
use crate::store::SecurityStore;
use crate::types::AuditEvent;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Backup strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
    Differential,
}

/// Backup lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    InProgress,
    Completed,
    Failed,
    Corrupted,
}

/// Persisted metadata describing one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    /// Unique backup identifier (bak-<uuid>)
    pub id: String,

    /// Tenant scope; `None` for platform-wide backups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Strategy used
    pub backup_type: BackupType,

    /// When the backup started
    pub created_at: DateTime<Utc>,

    /// Archive size in bytes
    pub size: u64,

    /// SHA-256 of the archive bytes, hex-encoded
    pub checksum: String,

    /// Tables included in the archive
    #[serde(default)]
    pub tables: Vec<String>,

    /// Whether table payloads are encrypted
    pub encrypted: bool,

    /// Current status
    pub status: BackupStatus,

    /// Failure detail when status is failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Options controlling a restore
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Backup to restore
    pub backup_id: String,

    /// Verify checksum and size before extracting
    pub validate_checksum: bool,

    /// Restore into a different tenant, rewriting tenant-id literals
    pub target_tenant_id: Option<String>,

    /// Simulate without mutating storage
    pub dry_run: bool,
}

impl RestoreOptions {
    /// Restore a backup with validation on and no tenant rewrite
    pub fn new(backup_id: impl Into<String>) -> Self {
        Self {
            backup_id: backup_id.into(),
            validate_checksum: true,
            target_tenant_id: None,
            dry_run: false,
        }
    }

    /// Restore into a different tenant
    pub fn into_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.target_tenant_id = Some(tenant_id.into());
        self
    }

    /// Simulate the restore without writing
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Skip the pre-extraction integrity validation
    pub fn skip_validation(mut self) -> Self {
        self.validate_checksum = false;
        self
    }
}

/// Outcome of one restore call
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResult {
    /// True only when no table failed
    pub success: bool,

    /// Tables restored (or that would be, for dry runs)
    pub restored_tables: Vec<String>,

    /// Tables that failed and were skipped
    pub skipped_tables: Vec<String>,

    /// One message per failed table
    pub errors: Vec<String>,

    /// Total rows written (or counted, for dry runs)
    pub records_restored: u64,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl RestoreResult {
    /// Convert a partial restore into an error, keeping full success as-is
    pub fn ok_or_partial(self) -> Result<RestoreResult> {
        if self.success {
            Ok(self)
        } else {
            Err(SecurityError::PartialFailure {
                completed: self.restored_tables.len(),
                failed: self.skipped_tables.len(),
            })
        }
    }
}

/// A single row as seen by the backup engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRow {
    /// Primary key
    pub key: String,

    /// Owning tenant
    pub tenant_id: String,

    /// Last modification time, drives incremental delta detection
    pub updated_at: DateTime<Utc>,

    /// Row contents
    pub data: serde_json::Value,
}

/// How a table payload applies on restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PayloadMode {
    /// Replace the table's rows for the tenant scope
    Replace,
    /// Insert-or-update by primary key
    Upsert,
}

/// Serialized content of one table inside the archive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TablePayload {
    mode: PayloadMode,
    rows: Vec<TableRow>,
}

/// One backup archive: all table payloads bundled as named files
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Archive {
    id: String,
    created_at: DateTime<Utc>,
    files: BTreeMap<String, String>,
}

/// Row-level access to the data being backed up
#[async_trait]
pub trait TableSource: Send + Sync {
    /// All table names available for backup
    async fn table_names(&self) -> Result<Vec<String>>;

    /// Read a table's rows, optionally restricted to one tenant
    async fn read_rows(&self, table: &str, tenant_id: Option<&str>) -> Result<Vec<TableRow>>;

    /// Rows modified at or after `since`
    async fn rows_modified_since(
        &self,
        table: &str,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<TableRow>>;

    /// Insert-or-update rows by primary key, returning rows written
    async fn upsert_rows(&self, table: &str, rows: &[TableRow]) -> Result<u64>;

    /// Replace the tenant scope's rows wholesale, returning rows written
    async fn replace_rows(
        &self,
        table: &str,
        tenant_id: Option<&str>,
        rows: &[TableRow],
    ) -> Result<u64>;
}

/// Opaque archive storage, one blob per backup id
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, backup_id: &str, bytes: Bytes) -> Result<()>;
    async fn get(&self, backup_id: &str) -> Result<Bytes>;
    async fn delete(&self, backup_id: &str) -> Result<()>;
}

/// In-memory blob store for testing
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite stored bytes directly (test hook for corruption scenarios)
    pub async fn tamper(&self, backup_id: &str, bytes: Bytes) {
        self.blobs.write().await.insert(backup_id.to_string(), bytes);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, backup_id: &str, bytes: Bytes) -> Result<()> {
        self.blobs.write().await.insert(backup_id.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, backup_id: &str) -> Result<Bytes> {
        self.blobs
            .read()
            .await
            .get(backup_id)
            .cloned()
            .ok_or_else(|| SecurityError::NotFound(format!("archive {}", backup_id)))
    }

    async fn delete(&self, backup_id: &str) -> Result<()> {
        self.blobs.write().await.remove(backup_id);
        Ok(())
    }
}

/// Filesystem blob store
///
/// One file per backup id under the configured directory. Writes go
/// through a temp file + rename so a crashed backup never leaves a
/// half-written archive in place.
pub struct FileBlobStore {
    dir: PathBuf,
}

impl FileBlobStore {
    /// Create a store rooted at the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn archive_path(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.archive.json", backup_id))
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    async fn put(&self, backup_id: &str, bytes: Bytes) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.archive_path(backup_id);
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "Archive written");
        Ok(())
    }

    async fn get(&self, backup_id: &str) -> Result<Bytes> {
        let path = self.archive_path(backup_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SecurityError::NotFound(format!("archive {}", backup_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, backup_id: &str) -> Result<()> {
        let path = self.archive_path(backup_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory table source for testing and single-process use
#[derive(Default)]
pub struct MemoryTableSource {
    tables: RwLock<HashMap<String, Vec<TableRow>>>,
    failing_tables: RwLock<HashSet<String>>,
}

impl MemoryTableSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table (idempotent)
    pub async fn create_table(&self, table: &str) {
        self.tables
            .write()
            .await
            .entry(table.to_string())
            .or_default();
    }

    /// Insert or update one row
    pub async fn put_row(&self, table: &str, row: TableRow) {
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.to_string()).or_default();
        match rows.iter_mut().find(|r| r.key == row.key) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    /// Make subsequent writes to a table fail (test hook)
    pub async fn fail_writes_to(&self, table: &str) {
        self.failing_tables.write().await.insert(table.to_string());
    }

    /// Current row count for a table
    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(|r| r.len())
            .unwrap_or(0)
    }

    async fn check_writable(&self, table: &str) -> Result<()> {
        if self.failing_tables.read().await.contains(table) {
            return Err(SecurityError::Transient(format!(
                "write rejected for table {}",
                table
            )));
        }
        Ok(())
    }
}

fn tenant_matches(row: &TableRow, tenant_id: Option<&str>) -> bool {
    match tenant_id {
        Some(t) => row.tenant_id == t,
        None => true,
    }
}

#[async_trait]
impl TableSource for MemoryTableSource {
    async fn table_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn read_rows(&self, table: &str, tenant_id: Option<&str>) -> Result<Vec<TableRow>> {
        let tables = self.tables.read().await;
        let rows = tables
            .get(table)
            .ok_or_else(|| SecurityError::NotFound(format!("table {}", table)))?;
        Ok(rows
            .iter()
            .filter(|r| tenant_matches(r, tenant_id))
            .cloned()
            .collect())
    }

    async fn rows_modified_since(
        &self,
        table: &str,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<TableRow>> {
        let rows = self.read_rows(table, tenant_id).await?;
        Ok(rows.into_iter().filter(|r| r.updated_at >= since).collect())
    }

    async fn upsert_rows(&self, table: &str, rows: &[TableRow]) -> Result<u64> {
        self.check_writable(table).await?;
        for row in rows {
            self.put_row(table, row.clone()).await;
        }
        Ok(rows.len() as u64)
    }

    async fn replace_rows(
        &self,
        table: &str,
        tenant_id: Option<&str>,
        rows: &[TableRow],
    ) -> Result<u64> {
        self.check_writable(table).await?;
        let mut tables = self.tables.write().await;
        let existing = tables.entry(table.to_string()).or_default();
        existing.retain(|r| !tenant_matches(r, tenant_id));
        existing.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }
}

/// Backup engine configuration
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Cron-style schedule consumed by the background scheduler
    pub schedule: Option<String>,

    /// Completed backups older than this are removed by cleanup
    pub retention_days: i64,

    /// Recorded in metadata; compression itself is a blob-store concern
    pub compression_enabled: bool,

    /// Encrypt per-table payloads for tenant-scoped backups
    pub encryption_enabled: bool,

    /// Only these tables, when non-empty
    pub include_tables: Vec<String>,

    /// Always skipped
    pub exclude_tables: Vec<String>,

    /// Directory for the file blob store (used by the constructor helper)
    pub backup_path: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            schedule: None,
            retention_days: 30,
            compression_enabled: false,
            encryption_enabled: true,
            include_tables: Vec::new(),
            exclude_tables: Vec::new(),
            backup_path: PathBuf::from("backups"),
        }
    }
}

/// Snapshot/restore engine over the cipher, audit log, and stores
pub struct BackupManager {
    store: Arc<dyn SecurityStore>,
    source: Arc<dyn TableSource>,
    blobs: Arc<dyn BlobStore>,
    cipher: Arc<TenantCipher>,
    audit: Arc<AuditLog>,
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(
        store: Arc<dyn SecurityStore>,
        source: Arc<dyn TableSource>,
        blobs: Arc<dyn BlobStore>,
        cipher: Arc<TenantCipher>,
        audit: Arc<AuditLog>,
        config: BackupConfig,
    ) -> Self {
        Self {
            store,
            source,
            blobs,
            cipher,
            audit,
            config,
        }
    }

    /// Tables eligible for backup after include/exclude filters
    async fn filtered_tables(&self) -> Result<Vec<String>> {
        let all = self.source.table_names().await?;
        Ok(all
            .into_iter()
            .filter(|t| {
                (self.config.include_tables.is_empty() || self.config.include_tables.contains(t))
                    && !self.config.exclude_tables.contains(t)
            })
            .collect())
    }

    fn checksum(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    async fn encode_payload(
        &self,
        payload: &TablePayload,
        tenant_id: Option<&str>,
    ) -> Result<(String, bool)> {
        let text = serde_json::to_string(payload)?;
        match tenant_id {
            Some(tenant) if self.config.encryption_enabled => {
                let envelope = self.cipher.encrypt(text.as_bytes(), tenant).await?;
                Ok((serde_json::to_string(&envelope)?, true))
            }
            _ => Ok((text, false)),
        }
    }

    async fn decode_payload(&self, content: &str, tenant_id: Option<&str>) -> Result<TablePayload> {
        let value: serde_json::Value = serde_json::from_str(content)?;
        if EncryptedRecord::is_encrypted(&value) {
            let tenant = tenant_id.ok_or_else(|| {
                SecurityError::Validation("encrypted payload in tenant-less backup".into())
            })?;
            let envelope: EncryptedRecord = serde_json::from_value(value)?;
            let plaintext = self.cipher.decrypt(&envelope, tenant).await?;
            Ok(serde_json::from_slice(&plaintext)?)
        } else {
            Ok(serde_json::from_value(value)?)
        }
    }

    async fn finalize(
        &self,
        mut meta: BackupMetadata,
        outcome: Result<(Vec<String>, Bytes)>,
    ) -> Result<BackupMetadata> {
        let (tables, bytes) = match outcome {
            Ok(built) => built,
            Err(e) => return self.record_failure(meta, e).await,
        };

        meta.tables = tables;
        meta.size = bytes.len() as u64;
        meta.checksum = Self::checksum(&bytes);
        if let Err(e) = self.blobs.put(&meta.id, bytes).await {
            return self.record_failure(meta, e).await;
        }
        meta.status = BackupStatus::Completed;
        self.store.upsert_backup(&meta).await?;

        tracing::info!(
            backup_id = %meta.id,
            tenant = ?meta.tenant_id,
            tables = meta.tables.len(),
            size = meta.size,
            "Backup completed"
        );
        let tenant = meta.tenant_id.clone().unwrap_or_else(|| "system".to_string());
        self.audit
            .log_event(
                AuditEvent::new(&tenant, "system", "backup", "backup")
                    .with_resource_id(&meta.id)
                    .with_context("scheduler"),
            )
            .await;
        Ok(meta)
    }

    async fn record_failure(
        &self,
        mut meta: BackupMetadata,
        error: SecurityError,
    ) -> Result<BackupMetadata> {
        meta.status = BackupStatus::Failed;
        meta.error_message = Some(error.to_string());
        self.store.upsert_backup(&meta).await?;

        tracing::error!(backup_id = %meta.id, error = %error, "Backup failed");
        let tenant = meta.tenant_id.clone().unwrap_or_else(|| "system".to_string());
        self.audit
            .log_event(
                AuditEvent::new(&tenant, "system", "backup", "backup")
                    .with_resource_id(&meta.id)
                    .with_context("scheduler")
                    .failed("BACKUP_FAILED"),
            )
            .await;
        Err(error)
    }

    /// Snapshot all eligible tables into one archive
    pub async fn create_full_backup(&self, tenant_id: Option<&str>) -> Result<BackupMetadata> {
        let meta = BackupMetadata {
            id: format!("bak-{}", uuid::Uuid::new_v4()),
            tenant_id: tenant_id.map(String::from),
            backup_type: BackupType::Full,
            created_at: Utc::now(),
            size: 0,
            checksum: String::new(),
            tables: Vec::new(),
            encrypted: tenant_id.is_some() && self.config.encryption_enabled,
            status: BackupStatus::InProgress,
            error_message: None,
        };
        self.store.upsert_backup(&meta).await?;

        let outcome = self.build_full_archive(&meta, tenant_id).await;
        self.finalize(meta, outcome).await
    }

    async fn build_full_archive(
        &self,
        meta: &BackupMetadata,
        tenant_id: Option<&str>,
    ) -> Result<(Vec<String>, Bytes)> {
        let tables = self.filtered_tables().await?;
        let mut files = BTreeMap::new();

        for table in &tables {
            let rows = self.source.read_rows(table, tenant_id).await?;
            let payload = TablePayload {
                mode: PayloadMode::Replace,
                rows,
            };
            let (content, _) = self.encode_payload(&payload, tenant_id).await?;
            files.insert(format!("{}.json", table), content);
        }

        let archive = Archive {
            id: meta.id.clone(),
            created_at: meta.created_at,
            files,
        };
        let bytes = Bytes::from(serde_json::to_vec(&archive)?);
        Ok((tables, bytes))
    }

    /// Snapshot only tables changed since the last completed backup
    ///
    /// Delegates to a full backup when the tenant scope has no completed
    /// backup yet. An explicit `since` overrides the reference point.
    pub async fn create_incremental_backup(
        &self,
        tenant_id: Option<&str>,
        since: Option<DateTime<Utc>>,
    ) -> Result<BackupMetadata> {
        let previous = self
            .store
            .list_backups(tenant_id)
            .await?
            .into_iter()
            .find(|b| b.status == BackupStatus::Completed);

        let reference = match (since, &previous) {
            (Some(explicit), _) => explicit,
            (None, Some(prev)) => prev.created_at,
            (None, None) => {
                tracing::info!(tenant = ?tenant_id, "No completed backup; falling back to full");
                return self.create_full_backup(tenant_id).await;
            }
        };

        let meta = BackupMetadata {
            id: format!("bak-{}", uuid::Uuid::new_v4()),
            tenant_id: tenant_id.map(String::from),
            backup_type: BackupType::Incremental,
            created_at: Utc::now(),
            size: 0,
            checksum: String::new(),
            tables: Vec::new(),
            encrypted: tenant_id.is_some() && self.config.encryption_enabled,
            status: BackupStatus::InProgress,
            error_message: None,
        };
        self.store.upsert_backup(&meta).await?;

        let outcome = self
            .build_incremental_archive(&meta, tenant_id, reference)
            .await;
        self.finalize(meta, outcome).await
    }

    async fn build_incremental_archive(
        &self,
        meta: &BackupMetadata,
        tenant_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<(Vec<String>, Bytes)> {
        let mut included = Vec::new();
        let mut files = BTreeMap::new();

        for table in self.filtered_tables().await? {
            let changed = self
                .source
                .rows_modified_since(&table, tenant_id, since)
                .await?;
            if changed.is_empty() {
                continue;
            }
            let payload = TablePayload {
                mode: PayloadMode::Upsert,
                rows: changed,
            };
            let (content, _) = self.encode_payload(&payload, tenant_id).await?;
            files.insert(format!("{}.json", table), content);
            included.push(table);
        }

        let archive = Archive {
            id: meta.id.clone(),
            created_at: meta.created_at,
            files,
        };
        let bytes = Bytes::from(serde_json::to_vec(&archive)?);
        Ok((included, bytes))
    }

    /// Restore a backup table by table, best effort
    ///
    /// A failed table is recorded in `errors`/`skipped_tables` without
    /// aborting the remaining tables. `success` is true only when every
    /// table restored cleanly.
    pub async fn restore_backup(&self, options: RestoreOptions) -> Result<RestoreResult> {
        let started = Instant::now();
        let meta = self
            .store
            .get_backup(&options.backup_id)
            .await?
            .ok_or_else(|| SecurityError::NotFound(format!("backup {}", options.backup_id)))?;

        let bytes = self.blobs.get(&meta.id).await?;

        if options.validate_checksum {
            let checksum = Self::checksum(&bytes);
            if checksum != meta.checksum || bytes.len() as u64 != meta.size {
                self.mark_corrupted(&meta).await?;
                return Err(SecurityError::Integrity(format!(
                    "archive for backup {} failed validation",
                    meta.id
                )));
            }
        }

        let archive: Archive = serde_json::from_slice(&bytes)?;
        let source_tenant = meta.tenant_id.as_deref();
        if options.target_tenant_id.is_some() && source_tenant.is_none() {
            // A platform-wide archive spans tenants; collapsing it into one
            // target would silently merge other tenants' rows
            return Err(SecurityError::Validation(
                "target tenant requires a tenant-scoped backup".into(),
            ));
        }
        let rewrite = options
            .target_tenant_id
            .as_deref()
            .zip(source_tenant)
            .filter(|(target, source)| target != source);

        let mut result = RestoreResult {
            success: true,
            restored_tables: Vec::new(),
            skipped_tables: Vec::new(),
            errors: Vec::new(),
            records_restored: 0,
            duration_ms: 0,
        };

        for (file_name, content) in &archive.files {
            let table = file_name.trim_end_matches(".json").to_string();
            match self
                .restore_table(&table, content, source_tenant, rewrite, &options)
                .await
            {
                Ok(written) => {
                    result.records_restored += written;
                    result.restored_tables.push(table);
                }
                Err(e) => {
                    tracing::error!(
                        backup_id = %meta.id,
                        table = %table,
                        error = %e,
                        "Table restore failed; continuing"
                    );
                    result.errors.push(format!("{}: {}", table, e));
                    result.skipped_tables.push(table);
                    result.success = false;
                }
            }
        }

        result.duration_ms = started.elapsed().as_millis() as u64;

        let audit_tenant = options
            .target_tenant_id
            .clone()
            .or_else(|| meta.tenant_id.clone())
            .unwrap_or_else(|| "system".to_string());
        let mut event = AuditEvent::new(&audit_tenant, "system", "restore", "backup")
            .with_resource_id(&meta.id)
            .with_context("admin")
            .with_metadata("dryRun", options.dry_run.to_string())
            .with_metadata("recordsRestored", result.records_restored.to_string());
        if !result.success {
            event = event.failed("RESTORE_PARTIAL_FAILURE");
        }
        self.audit.log_event(event).await;

        tracing::info!(
            backup_id = %meta.id,
            restored = result.restored_tables.len(),
            skipped = result.skipped_tables.len(),
            records = result.records_restored,
            dry_run = options.dry_run,
            "Restore finished"
        );
        Ok(result)
    }

    async fn restore_table(
        &self,
        table: &str,
        content: &str,
        source_tenant: Option<&str>,
        rewrite: Option<(&str, &str)>,
        options: &RestoreOptions,
    ) -> Result<u64> {
        let mut payload = self.decode_payload(content, source_tenant).await?;

        if let Some((target, source)) = rewrite {
            for row in &mut payload.rows {
                row.tenant_id = target.to_string();
                rewrite_tenant_literals(&mut row.data, source, target);
            }
        }

        if options.dry_run {
            return Ok(payload.rows.len() as u64);
        }

        let scope_tenant = rewrite
            .map(|(target, _)| target)
            .or(source_tenant);
        match payload.mode {
            PayloadMode::Replace => {
                self.source
                    .replace_rows(table, scope_tenant, &payload.rows)
                    .await
            }
            PayloadMode::Upsert => self.source.upsert_rows(table, &payload.rows).await,
        }
    }

    async fn mark_corrupted(&self, meta: &BackupMetadata) -> Result<()> {
        let mut corrupted = meta.clone();
        corrupted.status = BackupStatus::Corrupted;
        self.store.upsert_backup(&corrupted).await?;
        tracing::error!(backup_id = %meta.id, "Backup marked corrupted");
        Ok(())
    }

    /// Recompute checksum and size for a stored archive
    ///
    /// A mismatch flips the persisted status to corrupted and returns false.
    pub async fn validate_backup_integrity(&self, meta: &BackupMetadata) -> Result<bool> {
        let bytes = self.blobs.get(&meta.id).await?;
        let valid =
            Self::checksum(&bytes) == meta.checksum && bytes.len() as u64 == meta.size;
        if !valid {
            self.mark_corrupted(meta).await?;
        }
        Ok(valid)
    }

    /// Delete completed backups older than the retention cutoff
    ///
    /// Returns the number of backups removed (blob and metadata).
    pub async fn cleanup_old_backups(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        let mut removed = 0;

        for meta in self.store.list_backups(None).await? {
            if meta.status == BackupStatus::Completed && meta.created_at < cutoff {
                self.blobs.delete(&meta.id).await?;
                self.store.delete_backup(&meta.id).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Backup retention cleanup completed");
        }
        Ok(removed)
    }
}

/// Replace every string equal to the source tenant id inside a row value
fn rewrite_tenant_literals(value: &mut serde_json::Value, from: &str, to: &str) {
    match value {
        serde_json::Value::String(s) if s == from => *s = to.to_string(),
        serde_json::Value::Array(items) => {
            for item in items {
                rewrite_tenant_literals(item, from, to);
            }
        }
        serde_json::Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                rewrite_tenant_literals(item, from, to);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyvault::KeyVault;
    use crate::store::MemoryStore;

    struct Fixture {
        manager: BackupManager,
        store: Arc<MemoryStore>,
        source: Arc<MemoryTableSource>,
        blobs: Arc<MemoryBlobStore>,
    }

    fn fixture() -> Fixture {
        fixture_with_config(BackupConfig::default())
    }

    fn fixture_with_config(config: BackupConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemoryTableSource::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let cipher = Arc::new(TenantCipher::new(Arc::new(KeyVault::new())));
        let audit = Arc::new(AuditLog::new(store.clone()));

        let manager = BackupManager::new(
            store.clone(),
            source.clone(),
            blobs.clone(),
            cipher,
            audit,
            config,
        );
        Fixture {
            manager,
            store,
            source,
            blobs,
        }
    }

    fn row(key: &str, tenant: &str) -> TableRow {
        TableRow {
            key: key.to_string(),
            tenant_id: tenant.to_string(),
            updated_at: Utc::now(),
            data: serde_json::json!({"key": key, "tenantId": tenant, "title": "hello"}),
        }
    }

    async fn seed(source: &MemoryTableSource) {
        for table in ["cases", "documents", "invoices"] {
            source.create_table(table).await;
        }
        source.put_row("cases", row("c1", "t1")).await;
        source.put_row("cases", row("c2", "t1")).await;
        source.put_row("documents", row("d1", "t1")).await;
        source.put_row("invoices", row("i1", "t2")).await;
    }

    #[tokio::test]
    async fn test_full_backup_completes() {
        let f = fixture();
        seed(&f.source).await;

        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();

        assert_eq!(meta.status, BackupStatus::Completed);
        assert_eq!(meta.backup_type, BackupType::Full);
        assert!(meta.encrypted);
        assert_eq!(meta.tables, vec!["cases", "documents", "invoices"]);
        assert!(meta.size > 0);
        assert_eq!(meta.checksum.len(), 64);
        assert!(f.blobs.get(&meta.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_full_backup_encrypts_table_payloads() {
        let f = fixture();
        seed(&f.source).await;

        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();
        let bytes = f.blobs.get(&meta.id).await.unwrap();
        let archive: Archive = serde_json::from_slice(&bytes).unwrap();

        // Row contents must not appear in plaintext anywhere in the archive
        let raw = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!raw.contains("hello"));

        for content in archive.files.values() {
            let value: serde_json::Value = serde_json::from_str(content).unwrap();
            assert!(EncryptedRecord::is_encrypted(&value));
        }
    }

    #[tokio::test]
    async fn test_platform_backup_is_plaintext() {
        let f = fixture();
        seed(&f.source).await;

        let meta = f.manager.create_full_backup(None).await.unwrap();
        assert!(!meta.encrypted);

        let bytes = f.blobs.get(&meta.id).await.unwrap();
        let raw = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(raw.contains("hello"));
    }

    #[tokio::test]
    async fn test_include_exclude_filters() {
        let f = fixture_with_config(BackupConfig {
            exclude_tables: vec!["invoices".to_string()],
            ..Default::default()
        });
        seed(&f.source).await;

        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();
        assert_eq!(meta.tables, vec!["cases", "documents"]);

        let f2 = fixture_with_config(BackupConfig {
            include_tables: vec!["cases".to_string()],
            ..Default::default()
        });
        seed(&f2.source).await;
        let meta2 = f2.manager.create_full_backup(Some("t1")).await.unwrap();
        assert_eq!(meta2.tables, vec!["cases"]);
    }

    #[tokio::test]
    async fn test_full_then_restore_roundtrip() {
        let f = fixture();
        seed(&f.source).await;

        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();

        // Wipe the tenant's rows, then restore
        f.source.replace_rows("cases", Some("t1"), &[]).await.unwrap();
        assert_eq!(f.source.row_count("cases").await, 0);

        let result = f
            .manager
            .restore_backup(RestoreOptions::new(&meta.id))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.restored_tables.len(), 3);
        assert!(result.skipped_tables.is_empty());
        assert_eq!(f.source.row_count("cases").await, 2);
    }

    #[tokio::test]
    async fn test_restore_dry_run_mutates_nothing() {
        let f = fixture();
        seed(&f.source).await;
        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();

        f.source.replace_rows("cases", Some("t1"), &[]).await.unwrap();
        let result = f
            .manager
            .restore_backup(RestoreOptions::new(&meta.id).dry_run())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.records_restored > 0);
        assert_eq!(f.source.row_count("cases").await, 0);
    }

    #[tokio::test]
    async fn test_restore_into_target_tenant_rewrites_ids() {
        let f = fixture();
        seed(&f.source).await;
        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();

        let result = f
            .manager
            .restore_backup(RestoreOptions::new(&meta.id).into_tenant("t9"))
            .await
            .unwrap();
        assert!(result.success);

        let restored = f.source.read_rows("cases", Some("t9")).await.unwrap();
        assert_eq!(restored.len(), 2);
        for row in &restored {
            assert_eq!(row.tenant_id, "t9");
            assert_eq!(row.data["tenantId"], "t9");
        }
        // Original tenant rows untouched
        assert_eq!(f.source.read_rows("cases", Some("t1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_platform_backup_rejects_target_tenant() {
        let f = fixture();
        seed(&f.source).await;

        let meta = f.manager.create_full_backup(None).await.unwrap();
        let result = f
            .manager
            .restore_backup(RestoreOptions::new(&meta.id).into_tenant("t9"))
            .await;

        assert!(matches!(result, Err(SecurityError::Validation(_))));
        // Nothing was written for the requested target
        assert!(f.source.read_rows("cases", Some("t9")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_partial_failure() {
        let f = fixture();
        seed(&f.source).await;
        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();

        f.source.fail_writes_to("documents").await;
        let result = f
            .manager
            .restore_backup(RestoreOptions::new(&meta.id))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.restored_tables, vec!["cases", "invoices"]);
        assert_eq!(result.skipped_tables, vec!["documents"]);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("documents:"));

        assert!(matches!(
            result.ok_or_partial(),
            Err(SecurityError::PartialFailure {
                completed: 2,
                failed: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_restore_validates_checksum() {
        let f = fixture();
        seed(&f.source).await;
        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();

        // Flip one byte of the stored archive
        let mut bytes = f.blobs.get(&meta.id).await.unwrap().to_vec();
        bytes[10] ^= 0x01;
        f.blobs.tamper(&meta.id, Bytes::from(bytes)).await;

        let result = f.manager.restore_backup(RestoreOptions::new(&meta.id)).await;
        assert!(matches!(result, Err(SecurityError::Integrity(_))));

        let stored = f.store.get_backup(&meta.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Corrupted);
    }

    #[tokio::test]
    async fn test_validate_backup_integrity() {
        let f = fixture();
        seed(&f.source).await;
        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();

        assert!(f.manager.validate_backup_integrity(&meta).await.unwrap());

        let mut bytes = f.blobs.get(&meta.id).await.unwrap().to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        f.blobs.tamper(&meta.id, Bytes::from(bytes)).await;

        assert!(!f.manager.validate_backup_integrity(&meta).await.unwrap());
        let stored = f.store.get_backup(&meta.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BackupStatus::Corrupted);
    }

    #[tokio::test]
    async fn test_incremental_without_prior_delegates_to_full() {
        let f = fixture();
        seed(&f.source).await;

        let meta = f
            .manager
            .create_incremental_backup(Some("t1"), None)
            .await
            .unwrap();
        assert_eq!(meta.backup_type, BackupType::Full);
    }

    #[tokio::test]
    async fn test_incremental_no_op_after_full() {
        let f = fixture();
        seed(&f.source).await;

        let full = f.manager.create_full_backup(Some("t1")).await.unwrap();
        let incremental = f
            .manager
            .create_incremental_backup(Some("t1"), None)
            .await
            .unwrap();

        assert_eq!(incremental.backup_type, BackupType::Incremental);
        assert_eq!(incremental.status, BackupStatus::Completed);
        assert!(incremental.tables.is_empty());
        // No duplicated full copy: the empty archive is a fraction of the full one
        assert!(incremental.size < full.size);
    }

    #[tokio::test]
    async fn test_incremental_captures_changed_tables_only() {
        let f = fixture();
        seed(&f.source).await;
        f.manager.create_full_backup(Some("t1")).await.unwrap();

        // Touch one table after the full backup
        f.source
            .put_row("cases", row("c3", "t1"))
            .await;

        let incremental = f
            .manager
            .create_incremental_backup(Some("t1"), None)
            .await
            .unwrap();
        assert_eq!(incremental.tables, vec!["cases"]);
    }

    #[tokio::test]
    async fn test_incremental_restore_upserts() {
        let f = fixture();
        seed(&f.source).await;
        f.manager.create_full_backup(Some("t1")).await.unwrap();

        f.source.put_row("cases", row("c3", "t1")).await;
        let incremental = f
            .manager
            .create_incremental_backup(Some("t1"), None)
            .await
            .unwrap();

        // Re-applying the incremental must not duplicate c3
        let result = f
            .manager
            .restore_backup(RestoreOptions::new(&incremental.id))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(f.source.row_count("cases").await, 3);
    }

    struct FailingBlobStore;

    #[async_trait]
    impl BlobStore for FailingBlobStore {
        async fn put(&self, _backup_id: &str, _bytes: Bytes) -> Result<()> {
            Err(SecurityError::Transient("blob storage unavailable".into()))
        }

        async fn get(&self, backup_id: &str) -> Result<Bytes> {
            Err(SecurityError::NotFound(format!("archive {}", backup_id)))
        }

        async fn delete(&self, _backup_id: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_backup_failure_records_status() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(MemoryTableSource::new());
        let cipher = Arc::new(TenantCipher::new(Arc::new(KeyVault::new())));
        let audit = Arc::new(AuditLog::new(store.clone()));
        let manager = BackupManager::new(
            store.clone(),
            source.clone(),
            Arc::new(FailingBlobStore),
            cipher,
            audit,
            BackupConfig::default(),
        );
        seed(&source).await;

        let result = manager.create_full_backup(Some("t1")).await;
        assert!(matches!(result, Err(SecurityError::Transient(_))));

        let backups = store.list_backups(Some("t1")).await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].status, BackupStatus::Failed);
        assert!(backups[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_old_backups() {
        let f = fixture();
        seed(&f.source).await;

        let meta = f.manager.create_full_backup(Some("t1")).await.unwrap();

        // Age the backup past retention
        let mut aged = meta.clone();
        aged.created_at = Utc::now() - Duration::days(90);
        f.store.upsert_backup(&aged).await.unwrap();

        let removed = f.manager.cleanup_old_backups().await.unwrap();
        assert_eq!(removed, 1);
        assert!(f.store.get_backup(&meta.id).await.unwrap().is_none());
        assert!(f.blobs.get(&meta.id).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_backups() {
        let f = fixture();
        seed(&f.source).await;
        f.manager.create_full_backup(Some("t1")).await.unwrap();

        assert_eq!(f.manager.cleanup_old_backups().await.unwrap(), 0);
        assert_eq!(f.store.list_backups(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_blob_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("aegis-backup-{}", uuid::Uuid::new_v4()));
        let store = FileBlobStore::new(&dir);

        store.put("bak-1", Bytes::from_static(b"archive")).await.unwrap();
        assert_eq!(store.get("bak-1").await.unwrap(), Bytes::from_static(b"archive"));

        // Temp file must not linger after the atomic rename
        let leftover: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftover.is_empty());

        store.delete("bak-1").await.unwrap();
        assert!(store.get("bak-1").await.is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_rewrite_tenant_literals_nested() {
        let mut value = serde_json::json!({
            "tenantId": "t1",
            "owner": {"tenant": "t1", "name": "t1-admin"},
            "tags": ["t1", "billing"]
        });
        rewrite_tenant_literals(&mut value, "t1", "t9");

        assert_eq!(value["tenantId"], "t9");
        assert_eq!(value["owner"]["tenant"], "t9");
        // Only exact literals are rewritten
        assert_eq!(value["owner"]["name"], "t1-admin");
        assert_eq!(value["tags"][0], "t9");
    }

    #[test]
    fn test_metadata_serialization() {
        let meta = BackupMetadata {
            id: "bak-1".into(),
            tenant_id: Some("t1".into()),
            backup_type: BackupType::Incremental,
            created_at: Utc::now(),
            size: 42,
            checksum: "abc".into(),
            tables: vec!["cases".into()],
            encrypted: true,
            status: BackupStatus::Completed,
            error_message: None,
        };

        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"backupType\":\"incremental\""));
        assert!(json.contains("\"status\":\"completed\""));
        assert!(!json.contains("errorMessage"));
    }
}
