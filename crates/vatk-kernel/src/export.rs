//! Whole-kernel state export and import.
//!
//! An export carries every committed key-value entry plus the blobs that
//! in-use snapshots and installed bundles refer to, encoded as canonical CBOR.
//! Importing verifies blob hashes and transcript span hashes before any entry
//! reaches the destination store.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use vatk_cbor::{Hash, to_canonical_cbor};
use vatk_store::{DynStore, KvStore, MemKv};

use crate::{KernelError, KernelResult, KernelStorage, StorageOptions};

pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelExport {
    pub version: u32,
    pub kv: BTreeMap<String, String>,
    pub blobs: BTreeMap<Hash, ByteBuf>,
}

impl KernelExport {
    pub fn to_cbor(&self) -> KernelResult<Vec<u8>> {
        Ok(to_canonical_cbor(self)?)
    }

    pub fn from_cbor(bytes: &[u8]) -> KernelResult<Self> {
        Ok(serde_cbor::from_slice(bytes)?)
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> KernelResult<()> {
        std::fs::write(path, self.to_cbor()?)?;
        Ok(())
    }

    pub fn read_from_file(path: impl AsRef<Path>) -> KernelResult<Self> {
        let file = BufReader::new(File::open(path)?);
        Ok(serde_cbor::from_reader(file)?)
    }
}

/// Capture committed kernel state. Fails while the crank has pending writes.
pub fn export_storage(storage: &KernelStorage) -> KernelResult<KernelExport> {
    if storage.has_pending() {
        return Err(KernelError::Export(
            "cannot export with uncommitted writes".into(),
        ));
    }
    let kv = storage.committed_entries()?;

    let mut hashes = Vec::new();
    for record in storage.snapshots().all_records()? {
        if record.in_use {
            hashes.push(record.hash);
        }
    }
    let bundles = storage.bundles();
    for bundle_id in bundles.bundle_ids()? {
        hashes.push(bundles.blob_hash(&bundle_id)?);
    }

    let mut blobs = BTreeMap::new();
    for hash in hashes {
        if blobs.contains_key(&hash) {
            continue;
        }
        let bytes = storage.blobs().get_blob(hash)?;
        blobs.insert(hash, ByteBuf::from(bytes));
    }
    log::info!("exported {} entries and {} blobs", kv.len(), blobs.len());
    Ok(KernelExport {
        version: EXPORT_VERSION,
        kv,
        blobs,
    })
}

/// Rebuild kernel storage from an export on top of `backing` and `blobs`.
///
/// Blobs are checked against their hashes and every vat's spans are
/// re-hashed against a staging copy first, so a corrupt export leaves
/// `backing` untouched.
pub fn import_storage(
    export: &KernelExport,
    mut backing: Box<dyn KvStore>,
    blobs: DynStore,
    options: StorageOptions,
) -> KernelResult<KernelStorage> {
    if export.version != EXPORT_VERSION {
        return Err(KernelError::Export(format!(
            "unsupported export version {}",
            export.version
        )));
    }
    for (hash, bytes) in &export.blobs {
        let computed = Hash::of_bytes(bytes);
        if computed != *hash {
            return Err(KernelError::Export(format!(
                "blob {hash} has contents hashing to {computed}"
            )));
        }
        blobs.put_blob(bytes)?;
    }

    let staging = KernelStorage::new(
        Box::new(MemKv::from_entries(export.kv.clone())),
        blobs.clone(),
        options,
    )?;
    verify(&staging)?;

    let batch = export
        .kv
        .iter()
        .map(|(key, value)| (key.clone(), Some(value.clone())))
        .collect();
    backing.apply_batch(batch)?;
    log::info!(
        "imported {} entries and {} blobs",
        export.kv.len(),
        export.blobs.len()
    );
    KernelStorage::new(backing, blobs, options)
}

fn verify(storage: &KernelStorage) -> KernelResult<()> {
    let transcripts = storage.transcripts();
    for vat_id in transcripts.vat_ids()? {
        transcripts.verify_spans(&vat_id)?;
    }
    let snapshots = storage.snapshots();
    for record in snapshots.all_records()? {
        if record.in_use && !snapshots.has_hash(record.hash)? {
            return Err(KernelError::Export(format!(
                "snapshot {} of {} is missing",
                record.hash, record.vat_id
            )));
        }
    }
    let bundles = storage.bundles();
    for bundle_id in bundles.bundle_ids()? {
        bundles.get_bundle(&bundle_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Bundle;
    use std::sync::Arc;
    use vatk_store::MemStore;

    fn populated() -> KernelStorage {
        let storage = KernelStorage::in_memory().unwrap();
        storage
            .bundles()
            .add_bundle(&Bundle::from_source("nestedEvaluate", "{}"), None)
            .unwrap();
        let transcripts = storage.transcripts();
        transcripts.init_transcript("v1").unwrap();
        transcripts.add_item("v1", "one").unwrap();
        storage.snapshots().save_snapshot("v1", 1, b"heap").unwrap();
        storage.set("v1.vs.count", "3").unwrap();
        storage.commit().unwrap();
        storage
    }

    #[test]
    fn export_requires_a_committed_crank() {
        let storage = populated();
        storage.set("pending", "1").unwrap();
        assert!(matches!(
            export_storage(&storage),
            Err(KernelError::Export(_))
        ));
    }

    #[test]
    fn import_reproduces_state() {
        let storage = populated();
        let export = export_storage(&storage).unwrap();
        assert_eq!(export.blobs.len(), 2);

        let bytes = export.to_cbor().unwrap();
        let decoded = KernelExport::from_cbor(&bytes).unwrap();
        assert_eq!(decoded, export);

        let backing = MemKv::new();
        let imported = import_storage(
            &decoded,
            Box::new(backing.clone()),
            Arc::new(MemStore::new()),
            StorageOptions::default(),
        )
        .unwrap();
        assert_eq!(backing.entries(), storage.committed_entries().unwrap());
        assert_eq!(imported.get("v1.vs.count").unwrap().as_deref(), Some("3"));
        assert!(imported.snapshots().get_snapshot_info("v1").unwrap().is_some());
    }

    #[test]
    fn tampered_span_is_rejected_before_writing() {
        let storage = populated();
        let mut export = export_storage(&storage).unwrap();
        let item = export
            .kv
            .keys()
            .find(|key| key.starts_with("transcript.item.v1."))
            .cloned()
            .unwrap();
        export.kv.insert(item, "forged".into());

        let backing = MemKv::new();
        let err = import_storage(
            &export,
            Box::new(backing.clone()),
            Arc::new(MemStore::new()),
            StorageOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::Transcript(_)));
        assert!(backing.is_empty());
    }

    #[test]
    fn blob_hashes_are_checked() {
        let mut export = export_storage(&populated()).unwrap();
        let hash = *export.blobs.keys().next().unwrap();
        export.blobs.insert(hash, ByteBuf::from(b"other".to_vec()));
        let err = import_storage(
            &export,
            Box::new(MemKv::new()),
            Arc::new(MemStore::new()),
            StorageOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::Export(_)));
    }
}
