//! Per-vat append-only transcripts, organised into spans.
//!
//! Layout in kernel storage:
//!
//! * `transcript.item.<vatID>.<pos>` one entry, position zero-padded to 20 digits
//! * `transcript.<vatID>.current` the open span
//! * `transcript.<vatID>.<startPos>` a sealed span
//!
//! Span hashes chain every item of the span onto the hash of the empty
//! string, so equal hashes mean equal span contents.

use serde::{Deserialize, Serialize};
use vatk_abi::{DeliveryResult, SyscallResult, VatDelivery, VatSyscall};
use vatk_cbor::Hash;

use crate::{KernelError, KernelResult, KernelStorage};

const ITEM_PREFIX: &str = "transcript.item.";

/// One syscall made during a delivery, with the answer the vat received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedSyscall {
    #[serde(rename = "s")]
    pub syscall: VatSyscall,
    #[serde(rename = "r")]
    pub result: SyscallResult,
}

/// A delivery, the syscalls it made, and its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    #[serde(rename = "d")]
    pub delivery: VatDelivery,
    #[serde(rename = "sc", default)]
    pub syscalls: Vec<RecordedSyscall>,
    #[serde(rename = "r")]
    pub result: DeliveryResult,
}

impl TranscriptEntry {
    /// Entry for a lifecycle step the kernel carried out without the engine.
    pub fn pseudo(delivery: VatDelivery) -> Self {
        Self {
            delivery,
            syscalls: Vec::new(),
            result: DeliveryResult::ok(),
        }
    }
}

/// Span metadata as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanRecord {
    #[serde(rename = "vatID")]
    pub vat_id: String,
    pub start_pos: u64,
    pub end_pos: u64,
    pub hash: Hash,
    pub is_current: bool,
    pub incarnation: u64,
}

impl SpanRecord {
    pub fn len(&self) -> u64 {
        self.end_pos - self.start_pos
    }

    pub fn is_empty(&self) -> bool {
        self.start_pos == self.end_pos
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanBounds {
    pub start_pos: u64,
    pub end_pos: u64,
    pub incarnation: u64,
}

fn initial_hash() -> Hash {
    Hash::of_bytes(b"")
}

fn current_key(vat_id: &str) -> String {
    format!("transcript.{vat_id}.current")
}

fn sealed_key(vat_id: &str, start_pos: u64) -> String {
    format!("transcript.{vat_id}.{start_pos}")
}

fn item_key(vat_id: &str, pos: u64) -> String {
    format!("{ITEM_PREFIX}{vat_id}.{pos:020}")
}

#[derive(Debug, Clone)]
pub struct TranscriptStore {
    storage: KernelStorage,
}

impl TranscriptStore {
    pub fn new(storage: KernelStorage) -> Self {
        Self { storage }
    }

    /// Open the first span of a new vat.
    pub fn init_transcript(&self, vat_id: &str) -> KernelResult<()> {
        if self.storage.has(&current_key(vat_id))?
            || !self.sealed_spans(vat_id)?.is_empty()
        {
            return Err(KernelError::Transcript(format!(
                "transcript for {vat_id} already exists"
            )));
        }
        self.write_current(&SpanRecord {
            vat_id: vat_id.to_string(),
            start_pos: 0,
            end_pos: 0,
            hash: initial_hash(),
            is_current: true,
            incarnation: 0,
        })
    }

    pub fn current_span(&self, vat_id: &str) -> KernelResult<SpanRecord> {
        self.storage
            .get_json(&current_key(vat_id))?
            .ok_or_else(|| KernelError::SpanNotOpen(vat_id.to_string()))
    }

    pub fn get_current_span_bounds(&self, vat_id: &str) -> KernelResult<SpanBounds> {
        let span = self.current_span(vat_id)?;
        Ok(SpanBounds {
            start_pos: span.start_pos,
            end_pos: span.end_pos,
            incarnation: span.incarnation,
        })
    }

    /// Append a raw item to the open span, returning its position.
    pub fn add_item(&self, vat_id: &str, item: &str) -> KernelResult<u64> {
        let mut span = self.current_span(vat_id)?;
        let pos = span.end_pos;
        self.storage.set(&item_key(vat_id, pos), item)?;
        span.end_pos += 1;
        span.hash = Hash::chain(&span.hash, item.as_bytes());
        self.write_current(&span)?;
        Ok(pos)
    }

    pub fn add_entry(&self, vat_id: &str, entry: &TranscriptEntry) -> KernelResult<u64> {
        self.add_item(vat_id, &serde_json::to_string(entry)?)
    }

    /// Seal the open span and open an empty one at its end, same incarnation.
    /// Returns the start position of the new span.
    pub fn rollover_span(&self, vat_id: &str) -> KernelResult<u64> {
        let sealed = self.seal_current(vat_id)?;
        self.open_after(&sealed, sealed.incarnation)
    }

    /// Like [`rollover_span`](Self::rollover_span) but the new span belongs to
    /// the next incarnation. Returns the new incarnation number.
    pub fn rollover_incarnation(&self, vat_id: &str) -> KernelResult<u64> {
        let sealed = self.seal_current(vat_id)?;
        let incarnation = sealed.incarnation + 1;
        self.open_after(&sealed, incarnation)?;
        Ok(incarnation)
    }

    /// Seal the open span without opening another. Used when a vat is terminated.
    pub fn stop_using_transcript(&self, vat_id: &str) -> KernelResult<()> {
        if self.storage.has(&current_key(vat_id))? {
            self.seal_current(vat_id)?;
        }
        Ok(())
    }

    /// Remove all items and span records of a vat.
    pub fn delete_vat_transcripts(&self, vat_id: &str) -> KernelResult<()> {
        for key in self.storage.keys_with_prefix(&format!("{ITEM_PREFIX}{vat_id}."))? {
            self.storage.delete(&key)?;
        }
        for span in self.sealed_spans(vat_id)? {
            self.storage.delete(&sealed_key(vat_id, span.start_pos))?;
        }
        self.storage.delete(&current_key(vat_id))?;
        Ok(())
    }

    /// Number of items stored for the vat.
    pub fn transcript_size(&self, vat_id: &str) -> KernelResult<usize> {
        Ok(self
            .storage
            .keys_with_prefix(&format!("{ITEM_PREFIX}{vat_id}."))?
            .len())
    }

    /// Entries of the open span, or of the sealed span starting at `start_pos`.
    ///
    /// The reader fetches entries one at a time and can be created again to
    /// restart from the beginning.
    pub fn read_span(&self, vat_id: &str, start_pos: Option<u64>) -> KernelResult<SpanReader> {
        let span = match start_pos {
            None => self.current_span(vat_id)?,
            Some(start) => self.span_at(vat_id, start)?,
        };
        Ok(SpanReader {
            storage: self.storage.clone(),
            vat_id: vat_id.to_string(),
            next: span.start_pos,
            end: span.end_pos,
        })
    }

    /// Every entry of the vat in position order, across all spans.
    pub fn read_full_vat_transcript(
        &self,
        vat_id: &str,
    ) -> KernelResult<impl Iterator<Item = KernelResult<(u64, TranscriptEntry)>> + use<>> {
        let mut readers = Vec::new();
        for span in self.spans(vat_id)? {
            readers.push(SpanReader {
                storage: self.storage.clone(),
                vat_id: vat_id.to_string(),
                next: span.start_pos,
                end: span.end_pos,
            });
        }
        Ok(readers.into_iter().flatten())
    }

    /// Sealed spans in position order, then the open span if there is one.
    pub fn spans(&self, vat_id: &str) -> KernelResult<Vec<SpanRecord>> {
        let mut spans = self.sealed_spans(vat_id)?;
        if let Some(current) = self.storage.get_json::<SpanRecord>(&current_key(vat_id))? {
            spans.push(current);
        }
        Ok(spans)
    }

    /// Vats that have any span record.
    pub fn vat_ids(&self) -> KernelResult<Vec<String>> {
        let mut ids = Vec::new();
        for key in self.storage.keys_with_prefix("transcript.")? {
            if key.starts_with(ITEM_PREFIX) {
                continue;
            }
            if let Some(vat_id) = key
                .strip_prefix("transcript.")
                .and_then(|rest| rest.rsplit_once('.'))
                .map(|(vat_id, _)| vat_id.to_string())
            {
                if !ids.contains(&vat_id) {
                    ids.push(vat_id);
                }
            }
        }
        Ok(ids)
    }

    /// Recompute the hash of every span whose items are still stored.
    pub fn verify_spans(&self, vat_id: &str) -> KernelResult<()> {
        for span in self.spans(vat_id)? {
            if !self.storage.has(&item_key(vat_id, span.start_pos))? && !span.is_empty() {
                // items of sealed spans may have been pruned
                continue;
            }
            let mut hash = initial_hash();
            for pos in span.start_pos..span.end_pos {
                let item = self.storage.get(&item_key(vat_id, pos))?.ok_or_else(|| {
                    KernelError::Transcript(format!("{vat_id} is missing item {pos}"))
                })?;
                hash = Hash::chain(&hash, item.as_bytes());
            }
            if hash != span.hash {
                return Err(KernelError::Transcript(format!(
                    "span {vat_id}@{} hash mismatch: recorded {}, computed {hash}",
                    span.start_pos, span.hash
                )));
            }
        }
        Ok(())
    }

    /// Human-readable listing of every span and its raw items.
    pub fn dump(&self, vat_id: &str) -> KernelResult<Vec<(SpanRecord, Vec<String>)>> {
        let mut out = Vec::new();
        for span in self.spans(vat_id)? {
            let mut items = Vec::new();
            for pos in span.start_pos..span.end_pos {
                if let Some(item) = self.storage.get(&item_key(vat_id, pos))? {
                    items.push(item);
                }
            }
            out.push((span, items));
        }
        Ok(out)
    }

    fn sealed_spans(&self, vat_id: &str) -> KernelResult<Vec<SpanRecord>> {
        let mut spans = Vec::new();
        let prefix = format!("transcript.{vat_id}.");
        for key in self.storage.keys_with_prefix(&prefix)? {
            let suffix = &key[prefix.len()..];
            if suffix.parse::<u64>().is_err() {
                continue;
            }
            if let Some(span) = self.storage.get_json::<SpanRecord>(&key)? {
                spans.push(span);
            }
        }
        spans.sort_by_key(|span| span.start_pos);
        Ok(spans)
    }

    fn span_at(&self, vat_id: &str, start_pos: u64) -> KernelResult<SpanRecord> {
        let current = self.storage.get_json::<SpanRecord>(&current_key(vat_id))?;
        if let Some(span) = current.filter(|span| span.start_pos == start_pos) {
            return Ok(span);
        }
        self.storage
            .get_json(&sealed_key(vat_id, start_pos))?
            .ok_or_else(|| {
                KernelError::Transcript(format!("{vat_id} has no span starting at {start_pos}"))
            })
    }

    fn write_current(&self, span: &SpanRecord) -> KernelResult<()> {
        self.storage.set_json(&current_key(&span.vat_id), span)
    }

    fn seal_current(&self, vat_id: &str) -> KernelResult<SpanRecord> {
        let mut span = self.current_span(vat_id)?;
        span.is_current = false;
        self.storage
            .set_json(&sealed_key(vat_id, span.start_pos), &span)?;
        self.storage.delete(&current_key(vat_id))?;
        if !self.storage.options().keep_transcripts {
            for pos in span.start_pos..span.end_pos {
                self.storage.delete(&item_key(vat_id, pos))?;
            }
        }
        log::debug!(
            "sealed span {vat_id}[{}, {}) incarnation {}",
            span.start_pos,
            span.end_pos,
            span.incarnation
        );
        Ok(span)
    }

    fn open_after(&self, sealed: &SpanRecord, incarnation: u64) -> KernelResult<u64> {
        self.write_current(&SpanRecord {
            vat_id: sealed.vat_id.clone(),
            start_pos: sealed.end_pos,
            end_pos: sealed.end_pos,
            hash: initial_hash(),
            is_current: true,
            incarnation,
        })?;
        Ok(sealed.end_pos)
    }
}

/// Lazy reader over one span.
#[derive(Debug)]
pub struct SpanReader {
    storage: KernelStorage,
    vat_id: String,
    next: u64,
    end: u64,
}

impl Iterator for SpanReader {
    type Item = KernelResult<(u64, TranscriptEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let pos = self.next;
        self.next += 1;
        let item = match self.storage.get(&item_key(&self.vat_id, pos)) {
            Ok(Some(item)) => item,
            Ok(None) => {
                return Some(Err(KernelError::Transcript(format!(
                    "{} item {pos} is not stored",
                    self.vat_id
                ))));
            }
            Err(err) => return Some(Err(err)),
        };
        Some(
            serde_json::from_str(&item)
                .map(|entry| (pos, entry))
                .map_err(KernelError::from),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageOptions;
    use serde_json::json;
    use std::sync::Arc;
    use vatk_store::{MemKv, MemStore};

    fn store() -> TranscriptStore {
        KernelStorage::in_memory().unwrap().transcripts()
    }

    fn msg(n: u64) -> TranscriptEntry {
        TranscriptEntry {
            delivery: VatDelivery::message("o+0", "increment", json!([n])),
            syscalls: vec![],
            result: DeliveryResult::ok_metered(n),
        }
    }

    #[test]
    fn spans_are_contiguous() {
        let ts = store();
        ts.init_transcript("v1").unwrap();
        for n in 0..3 {
            assert_eq!(ts.add_entry("v1", &msg(n)).unwrap(), n);
        }
        assert_eq!(ts.rollover_span("v1").unwrap(), 3);
        ts.add_entry("v1", &msg(3)).unwrap();
        assert_eq!(ts.rollover_incarnation("v1").unwrap(), 1);
        ts.add_entry("v1", &msg(4)).unwrap();
        ts.add_entry("v1", &msg(5)).unwrap();

        let spans = ts.spans("v1").unwrap();
        let bounds: Vec<_> = spans.iter().map(|s| (s.start_pos, s.end_pos)).collect();
        assert_eq!(bounds, vec![(0, 3), (3, 4), (4, 6)]);
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end_pos, pair[1].start_pos);
        }
        assert_eq!(spans.iter().filter(|s| s.is_current).count(), 1);

        let positions: Vec<u64> = ts
            .read_full_vat_transcript("v1")
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        assert_eq!(positions, (0..6).collect::<Vec<_>>());

        let bounds = ts.get_current_span_bounds("v1").unwrap();
        assert_eq!(
            bounds,
            SpanBounds {
                start_pos: 4,
                end_pos: 6,
                incarnation: 1
            }
        );
    }

    #[test]
    fn read_span_is_restartable_and_reads_old_spans() {
        let ts = store();
        ts.init_transcript("v1").unwrap();
        ts.add_entry("v1", &msg(0)).unwrap();
        ts.add_entry("v1", &msg(1)).unwrap();
        ts.rollover_span("v1").unwrap();
        ts.add_entry("v1", &msg(2)).unwrap();

        let old: Vec<_> = ts
            .read_span("v1", Some(0))
            .unwrap()
            .map(|r| r.unwrap().1)
            .collect();
        assert_eq!(old, vec![msg(0), msg(1)]);

        let first: Vec<_> = ts.read_span("v1", None).unwrap().collect();
        let second: Vec<_> = ts.read_span("v1", None).unwrap().collect();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref().unwrap(), second[0].as_ref().unwrap());
        assert!(ts.read_span("v1", Some(1)).is_err());
    }

    #[test]
    fn append_without_open_span_fails() {
        let ts = store();
        assert!(matches!(
            ts.add_entry("v9", &msg(0)),
            Err(KernelError::SpanNotOpen(_))
        ));
        ts.init_transcript("v9").unwrap();
        ts.stop_using_transcript("v9").unwrap();
        assert!(matches!(
            ts.add_entry("v9", &msg(0)),
            Err(KernelError::SpanNotOpen(_))
        ));
        assert!(ts.init_transcript("v9").is_err());
    }

    #[test]
    fn equal_contents_hash_equal() {
        let a = store();
        let b = store();
        for ts in [&a, &b] {
            ts.init_transcript("v1").unwrap();
            ts.add_entry("v1", &msg(7)).unwrap();
        }
        assert_eq!(
            a.current_span("v1").unwrap().hash,
            b.current_span("v1").unwrap().hash
        );
        b.add_entry("v1", &msg(8)).unwrap();
        assert_ne!(
            a.current_span("v1").unwrap().hash,
            b.current_span("v1").unwrap().hash
        );
        a.verify_spans("v1").unwrap();
        b.verify_spans("v1").unwrap();
    }

    #[test]
    fn tampered_item_fails_verification() {
        let storage = KernelStorage::in_memory().unwrap();
        let ts = storage.transcripts();
        ts.init_transcript("v1").unwrap();
        ts.add_entry("v1", &msg(0)).unwrap();
        storage
            .set(&item_key("v1", 0), &serde_json::to_string(&msg(1)).unwrap())
            .unwrap();
        assert!(ts.verify_spans("v1").is_err());
    }

    #[test]
    fn pruning_drops_sealed_items_only() {
        let storage = KernelStorage::new(
            Box::new(MemKv::new()),
            Arc::new(MemStore::new()),
            StorageOptions {
                keep_transcripts: false,
                keep_snapshots: false,
            },
        )
        .unwrap();
        let ts = storage.transcripts();
        ts.init_transcript("v1").unwrap();
        ts.add_entry("v1", &msg(0)).unwrap();
        ts.add_entry("v1", &msg(1)).unwrap();
        ts.rollover_span("v1").unwrap();
        ts.add_entry("v1", &msg(2)).unwrap();
        assert_eq!(ts.transcript_size("v1").unwrap(), 1);
        assert_eq!(ts.spans("v1").unwrap().len(), 2);
        assert!(ts.read_span("v1", Some(0)).unwrap().next().unwrap().is_err());
        ts.verify_spans("v1").unwrap();
    }

    #[test]
    fn delete_removes_everything() {
        let ts = store();
        ts.init_transcript("v1").unwrap();
        ts.init_transcript("v10").unwrap();
        ts.add_entry("v1", &msg(0)).unwrap();
        ts.add_entry("v10", &msg(0)).unwrap();
        ts.rollover_span("v1").unwrap();
        assert_eq!(ts.vat_ids().unwrap(), vec!["v1", "v10"]);
        ts.delete_vat_transcripts("v1").unwrap();
        assert!(ts.spans("v1").unwrap().is_empty());
        assert_eq!(ts.transcript_size("v1").unwrap(), 0);
        assert_eq!(ts.transcript_size("v10").unwrap(), 1);
        assert_eq!(ts.dump("v10").unwrap()[0].1.len(), 1);
    }
}
