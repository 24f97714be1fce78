//! Migration record serialization, deserialization and persistence.
//!
//! The record store is the durable source of truth for which migrations
//! exist and what state they are in. A write that returned `Ok` is the point
//! at which a transition is allowed to affect gating decisions.

use anyhow::{bail, ensure, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Read;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::*;
use utils::crashsafe::{self, durable_rename};
use utils::id::MigrationId;

use crate::metrics::PERSIST_RECORD_SECONDS;
use crate::state::{MigrationRecord, PartitionKey};

pub const MIGRATION_MAGIC: u32 = 0x6d69_6772;
pub const MIGRATION_FORMAT_VERSION: u32 = 1;

pub const RECORD_FILE_SUFFIX: &str = "migration";
// needed to atomically update a record using `rename`
const RECORD_FILE_PARTIAL_SUFFIX: &str = "migration.partial";
pub const CHECKSUM_SIZE: usize = std::mem::size_of::<u32>();

/// Durable table of migration records, keyed by migration id.
///
/// Implementations keep every persisted record in memory, so reads never
/// touch the disk.
pub trait MigrationStore: Send + Sync {
    /// All records that are currently persisted.
    fn records(&self) -> &BTreeMap<MigrationId, MigrationRecord>;

    /// Durably insert or replace a record.
    fn persist(&mut self, record: &MigrationRecord) -> impl Future<Output = Result<()>> + Send;

    /// Durably delete a record. Deleting a missing record is not an error.
    fn remove(&mut self, migration_id: &MigrationId) -> impl Future<Output = Result<()>> + Send;

    fn get(&self, migration_id: &MigrationId) -> Option<&MigrationRecord> {
        self.records().get(migration_id)
    }

    /// Secondary lookup by partition key, restricted to records that have
    /// not been forgotten yet. At most one such record exists per key.
    fn find_unforgotten(&self, partition_key: &PartitionKey) -> Option<&MigrationRecord> {
        self.records()
            .values()
            .find(|r| &r.partition_key == partition_key && !r.is_forgotten())
    }
}

/// Keeps records only in memory. Used by tests and by callers that embed the
/// donor on top of a storage engine that replicates the records itself.
#[derive(Debug, Default)]
pub struct MemoryMigrationStore {
    records: BTreeMap<MigrationId, MigrationRecord>,
}

impl MemoryMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MigrationStore for MemoryMigrationStore {
    fn records(&self) -> &BTreeMap<MigrationId, MigrationRecord> {
        &self.records
    }

    async fn persist(&mut self, record: &MigrationRecord) -> Result<()> {
        self.records.insert(record.migration_id, record.clone());
        Ok(())
    }

    async fn remove(&mut self, migration_id: &MigrationId) -> Result<()> {
        self.records.remove(migration_id);
        Ok(())
    }
}

/// One checksummed file per migration under a single directory.
#[derive(Debug)]
pub struct FileMigrationStore {
    dir: Utf8PathBuf,
    no_sync: bool,

    /// Last state persisted to disk.
    records: BTreeMap<MigrationId, MigrationRecord>,
}

impl FileMigrationStore {
    /// Open the store in `dir`, creating the directory if needed and loading
    /// every record found in it.
    pub fn open(dir: &Utf8Path, no_sync: bool) -> Result<FileMigrationStore> {
        if no_sync {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create migrations directory {dir}"))?;
        } else {
            crashsafe::create_dir_all(dir)
                .with_context(|| format!("failed to create migrations directory {dir}"))?;
        }

        let mut records = BTreeMap::new();
        for entry in
            std::fs::read_dir(dir).with_context(|| format!("failed to list directory {dir}"))?
        {
            let entry = entry.context("failed to read directory entry")?;
            let path = Utf8PathBuf::try_from(entry.path())
                .context("non utf-8 path in migrations directory")?;
            let Some(file_name) = path.file_name() else {
                continue;
            };

            if file_name.ends_with(RECORD_FILE_PARTIAL_SUFFIX) {
                // A crash in the middle of a persist; the previous version is intact.
                info!("removing leftover partial record file {path}");
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove partial record file {path}"))?;
                continue;
            }

            let Some(id_str) = file_name
                .strip_suffix(RECORD_FILE_SUFFIX)
                .and_then(|s| s.strip_suffix('.'))
            else {
                warn!("ignoring unexpected file {path} in migrations directory");
                continue;
            };
            let migration_id: MigrationId = id_str
                .parse()
                .with_context(|| format!("invalid migration id in file name {path}"))?;

            let record = Self::load_record_file(&path)?;
            ensure!(
                record.migration_id == migration_id,
                "record file {path} holds migration {} instead of {migration_id}",
                record.migration_id
            );
            records.insert(migration_id, record);
        }

        info!("loaded {} migration records from {dir}", records.len());
        Ok(FileMigrationStore {
            dir: dir.to_path_buf(),
            no_sync,
            records,
        })
    }

    fn record_path(&self, migration_id: &MigrationId) -> Utf8PathBuf {
        self.dir
            .join(format!("{migration_id}.{RECORD_FILE_SUFFIX}"))
    }

    fn partial_record_path(&self, migration_id: &MigrationId) -> Utf8PathBuf {
        self.dir
            .join(format!("{migration_id}.{RECORD_FILE_PARTIAL_SUFFIX}"))
    }

    /// Check the magic/version in the on-disk data and deserialize it.
    fn deser_record(buf: &mut &[u8]) -> Result<MigrationRecord> {
        let magic = ReadBytesExt::read_u32::<LittleEndian>(buf)?;
        if magic != MIGRATION_MAGIC {
            bail!(
                "bad migration record magic: {:X}, expected {:X}",
                magic,
                MIGRATION_MAGIC
            );
        }
        let version = ReadBytesExt::read_u32::<LittleEndian>(buf)?;
        if version != MIGRATION_FORMAT_VERSION {
            bail!(
                "unsupported migration record format version {version}, expected {MIGRATION_FORMAT_VERSION}"
            );
        }
        let record = serde_json::from_slice(buf).context("failed to parse migration record")?;
        Ok(record)
    }

    /// Read in a single record file.
    pub fn load_record_file(path: &Utf8Path) -> Result<MigrationRecord> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("failed to open record file at {path}"))?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .context("failed to read record file")?;
        ensure!(
            buf.len() > CHECKSUM_SIZE,
            "record file {path} is too short: {} bytes",
            buf.len()
        );

        let calculated_checksum = crc32c::crc32c(&buf[..buf.len() - CHECKSUM_SIZE]);

        let expected_checksum_bytes: &[u8; CHECKSUM_SIZE] =
            buf[buf.len() - CHECKSUM_SIZE..].try_into()?;
        let expected_checksum = u32::from_le_bytes(*expected_checksum_bytes);

        ensure!(
            calculated_checksum == expected_checksum,
            format!(
                "migration record checksum mismatch: expected {} got {}",
                expected_checksum, calculated_checksum
            )
        );

        Self::deser_record(&mut &buf[..buf.len() - CHECKSUM_SIZE])
            .with_context(|| format!("while reading record file {path}"))
    }
}

pub(crate) fn write_record_to_buf(record: &MigrationRecord) -> Result<Vec<u8>> {
    let mut buf: Vec<u8> = Vec::new();
    WriteBytesExt::write_u32::<LittleEndian>(&mut buf, MIGRATION_MAGIC)?;
    WriteBytesExt::write_u32::<LittleEndian>(&mut buf, MIGRATION_FORMAT_VERSION)?;
    serde_json::to_writer(&mut buf, record)?;

    let checksum = crc32c::crc32c(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    Ok(buf)
}

impl MigrationStore for FileMigrationStore {
    fn records(&self) -> &BTreeMap<MigrationId, MigrationRecord> {
        &self.records
    }

    async fn persist(&mut self, record: &MigrationRecord) -> Result<()> {
        let _timer = PERSIST_RECORD_SECONDS.start_timer();

        let partial_path = self.partial_record_path(&record.migration_id);
        let mut partial = File::create(&partial_path)
            .await
            .with_context(|| format!("failed to create partial record file at {partial_path}"))?;

        let buf = write_record_to_buf(record)?;
        partial
            .write_all(&buf)
            .await
            .with_context(|| format!("failed to write migration record to {partial_path}"))?;
        partial
            .flush()
            .await
            .with_context(|| format!("failed to flush migration record to {partial_path}"))?;

        let path = self.record_path(&record.migration_id);
        durable_rename(&partial_path, &path, !self.no_sync)
            .await
            .with_context(|| format!("failed to rename {partial_path} to {path}"))?;

        self.records.insert(record.migration_id, record.clone());
        Ok(())
    }

    async fn remove(&mut self, migration_id: &MigrationId) -> Result<()> {
        let path = self.record_path(migration_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove record file {path}"))
            }
        }
        if !self.no_sync {
            crashsafe::fsync_async(&self.dir)
                .await
                .with_context(|| format!("failed to fsync {}", self.dir))?;
        }
        self.records.remove(migration_id);
        Ok(())
    }
}
