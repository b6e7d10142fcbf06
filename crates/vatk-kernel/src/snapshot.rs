//! Worker heap snapshots: blobs in the content-addressed store, per-vat
//! metadata in kernel storage.

use std::ops::Deref;

use serde::{Deserialize, Serialize};
use vatk_cbor::Hash;

use crate::{KernelError, KernelResult, KernelStorage};

/// Persisted as `snapshot.<vatID>.<snapPos>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    #[serde(rename = "vatID")]
    pub vat_id: String,
    pub snap_pos: u64,
    pub hash: Hash,
    pub in_use: bool,
}

/// The snapshot a vat's current span was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub snap_pos: u64,
    pub hash: Hash,
}

fn record_key(vat_id: &str, snap_pos: u64) -> String {
    format!("snapshot.{vat_id}.{snap_pos}")
}

fn current_key(vat_id: &str) -> String {
    format!("snapshot.{vat_id}.current")
}

/// Loaded heap bytes. Released when dropped.
#[derive(Debug)]
pub struct SnapshotBlob {
    hash: Hash,
    bytes: Vec<u8>,
}

impl SnapshotBlob {
    pub fn hash(&self) -> Hash {
        self.hash
    }
}

impl Deref for SnapshotBlob {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for SnapshotBlob {
    fn drop(&mut self) {
        log::trace!("released snapshot {} ({} bytes)", self.hash, self.bytes.len());
    }
}

#[derive(Debug, Clone)]
pub struct SnapStore {
    storage: KernelStorage,
}

impl SnapStore {
    pub fn new(storage: KernelStorage) -> Self {
        Self { storage }
    }

    /// Store heap bytes, returning their hash. Identical heaps share one blob.
    pub fn save(&self, heap: &[u8]) -> KernelResult<Hash> {
        self.storage.put_blob(heap)
    }

    /// Fetch a snapshot and verify its bytes still match `hash`.
    pub fn open(&self, hash: Hash) -> KernelResult<SnapshotBlob> {
        let bytes = self
            .storage
            .blobs()
            .get_blob(hash)
            .map_err(|err| KernelError::SnapshotUnavailable(format!("{hash}: {err}")))?;
        Ok(SnapshotBlob { hash, bytes })
    }

    /// Expose a snapshot to `consumer` for the duration of the call.
    pub fn load<R>(&self, hash: Hash, consumer: impl FnOnce(&[u8]) -> R) -> KernelResult<R> {
        let blob = self.open(hash)?;
        Ok(consumer(&blob))
    }

    /// Record `heap` as the vat's snapshot at `snap_pos`, retiring the previous one.
    pub fn save_snapshot(
        &self,
        vat_id: &str,
        snap_pos: u64,
        heap: &[u8],
    ) -> KernelResult<SnapshotInfo> {
        let hash = self.save(heap)?;
        let previous = self.retire_current(vat_id)?;
        let record = SnapshotRecord {
            vat_id: vat_id.to_string(),
            snap_pos,
            hash,
            in_use: true,
        };
        let key = record_key(vat_id, snap_pos);
        self.storage.set_json(&key, &record)?;
        self.storage.set(&current_key(vat_id), &key)?;
        if let Some(previous) = previous {
            self.prune_record(&previous)?;
        }
        log::debug!("saved snapshot of {vat_id} at {snap_pos}: {hash}");
        Ok(SnapshotInfo { snap_pos, hash })
    }

    pub fn get_snapshot_info(&self, vat_id: &str) -> KernelResult<Option<SnapshotInfo>> {
        Ok(self.current_record(vat_id)?.map(|record| SnapshotInfo {
            snap_pos: record.snap_pos,
            hash: record.hash,
        }))
    }

    /// Forget the vat's current snapshot. A new incarnation cannot reuse it.
    pub fn stop_using_last_snapshot(&self, vat_id: &str) -> KernelResult<()> {
        if let Some(previous) = self.retire_current(vat_id)? {
            self.prune_record(&previous)?;
        }
        Ok(())
    }

    /// Remove every snapshot record of the vat and any blob no longer in use.
    pub fn delete_vat_snapshots(&self, vat_id: &str) -> KernelResult<()> {
        let records = self.vat_records(vat_id)?;
        self.storage.delete(&current_key(vat_id))?;
        for record in &records {
            self.storage
                .delete(&record_key(&record.vat_id, record.snap_pos))?;
        }
        for record in &records {
            self.delete_blob_if_unused(record.hash)?;
        }
        Ok(())
    }

    /// Remove every record no longer in use, and its blob if nothing else uses it.
    pub fn delete_all_unused_snapshots(&self) -> KernelResult<usize> {
        let unused: Vec<SnapshotRecord> = self
            .all_records()?
            .into_iter()
            .filter(|record| !record.in_use)
            .collect();
        for record in &unused {
            self.storage
                .delete(&record_key(&record.vat_id, record.snap_pos))?;
        }
        for record in &unused {
            self.delete_blob_if_unused(record.hash)?;
        }
        Ok(unused.len())
    }

    pub fn vat_records(&self, vat_id: &str) -> KernelResult<Vec<SnapshotRecord>> {
        let mut records = self.records_under(&format!("snapshot.{vat_id}."))?;
        // `v1.` is also a prefix of `v1.x.`
        records.retain(|record| record.vat_id == vat_id);
        Ok(records)
    }

    pub fn all_records(&self) -> KernelResult<Vec<SnapshotRecord>> {
        self.records_under("snapshot.")
    }

    pub fn has_hash(&self, hash: Hash) -> KernelResult<bool> {
        Ok(self.storage.blobs().has_blob(hash)?)
    }

    fn records_under(&self, prefix: &str) -> KernelResult<Vec<SnapshotRecord>> {
        let mut records = Vec::new();
        for key in self.storage.keys_with_prefix(prefix)? {
            if key.ends_with(".current") {
                continue;
            }
            if let Some(record) = self.storage.get_json::<SnapshotRecord>(&key)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| (&a.vat_id, a.snap_pos).cmp(&(&b.vat_id, b.snap_pos)));
        Ok(records)
    }

    fn current_record(&self, vat_id: &str) -> KernelResult<Option<SnapshotRecord>> {
        match self.storage.get(&current_key(vat_id))? {
            Some(key) => self.storage.get_json(&key),
            None => Ok(None),
        }
    }

    /// Mark the current record unused and clear the current pointer.
    fn retire_current(&self, vat_id: &str) -> KernelResult<Option<SnapshotRecord>> {
        let Some(mut record) = self.current_record(vat_id)? else {
            return Ok(None);
        };
        record.in_use = false;
        self.storage
            .set_json(&record_key(vat_id, record.snap_pos), &record)?;
        self.storage.delete(&current_key(vat_id))?;
        Ok(Some(record))
    }

    fn prune_record(&self, record: &SnapshotRecord) -> KernelResult<()> {
        if self.storage.options().keep_snapshots {
            return Ok(());
        }
        self.storage
            .delete(&record_key(&record.vat_id, record.snap_pos))?;
        self.delete_blob_if_unused(record.hash)
    }

    /// The blob goes when the crank commits, so an aborted crank still finds
    /// the snapshot its committed records point at.
    fn delete_blob_if_unused(&self, hash: Hash) -> KernelResult<()> {
        let referenced = self.all_records()?.iter().any(|r| r.hash == hash);
        if !referenced {
            log::debug!("snapshot blob {hash} unused, deleting on commit");
            self.storage.delete_blob_on_commit(hash);
        }
        Ok(())
    }
}
