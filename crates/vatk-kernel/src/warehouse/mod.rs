//! The vat warehouse keeps a bounded set of vat workers online.
//!
//! A vat whose worker is offline is brought back by replaying its current
//! transcript span: the span begins with either the `initialize-worker` entry
//! of the incarnation or a `load-snapshot` entry, and every later entry is
//! re-delivered with syscalls answered from the transcript. Snapshots bound
//! the replay length: once a span grows past the policy threshold the worker
//! heap is saved and a fresh span starts from it.

mod lru;
mod replay;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vatk_abi::{
    DeliveryResult, InitializeWorkerOptions, SyscallResult, VatDelivery, WorkerOptions,
};
use vatk_worker::{WorkerError, WorkerHandle};

use crate::report;
use crate::{
    BundleHandler, KernelError, KernelResult, KernelStorage, KvSyscallHandler, RecordedSyscall,
    SnapStore, SnapshotInfo, SyscallHandler, TranscriptEntry, TranscriptStore, WarehousePolicy,
};

pub use lru::Lru;

const SNAPSHOT_INITIAL_KEY: &str = "kernel.snapshotInitial";
const SNAPSHOT_INTERVAL_KEY: &str = "kernel.snapshotInterval";
const VAT_PREFIX: &str = "vat.";

fn vat_key(vat_id: &str) -> String {
    format!("{VAT_PREFIX}{vat_id}")
}

/// What the warehouse needs to start a worker for a vat, persisted as
/// `vat.<vatID>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatOptions {
    #[serde(rename = "bundleID")]
    pub bundle_id: String,
    pub worker_options: WorkerOptions,
    #[serde(default)]
    pub vat_parameters: Value,
}

pub struct VatWarehouse {
    storage: KernelStorage,
    transcripts: TranscriptStore,
    snapshots: SnapStore,
    bundles: Arc<dyn BundleHandler>,
    syscalls: Box<dyn SyscallHandler>,
    policy: WarehousePolicy,
    online: HashMap<String, WorkerHandle>,
    lru: Lru,
    since_reap: HashMap<String, u64>,
}

impl std::fmt::Debug for VatWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VatWarehouse")
            .field("policy", &self.policy)
            .field("online", &self.lru)
            .finish_non_exhaustive()
    }
}

impl VatWarehouse {
    /// Snapshot thresholds already persisted in `storage` take precedence over
    /// the ones in `policy`; otherwise the policy's values are persisted.
    pub fn new(
        storage: KernelStorage,
        bundles: Arc<dyn BundleHandler>,
        syscalls: Box<dyn SyscallHandler>,
        mut policy: WarehousePolicy,
    ) -> KernelResult<Self> {
        match storage.get_u64(SNAPSHOT_INITIAL_KEY)? {
            Some(n) => policy.snapshot_initial = n,
            None => storage.set(SNAPSHOT_INITIAL_KEY, &policy.snapshot_initial.to_string())?,
        }
        match storage.get_u64(SNAPSHOT_INTERVAL_KEY)? {
            Some(n) => policy.snapshot_interval = n,
            None => storage.set(SNAPSHOT_INTERVAL_KEY, &policy.snapshot_interval.to_string())?,
        }
        Ok(Self {
            transcripts: storage.transcripts(),
            snapshots: storage.snapshots(),
            storage,
            bundles,
            syscalls,
            lru: Lru::new(policy.max_vats_online),
            policy,
            online: HashMap::new(),
            since_reap: HashMap::new(),
        })
    }

    /// Bundles come from `storage`, syscalls go to a [`KvSyscallHandler`] on it.
    pub fn with_storage(storage: KernelStorage, policy: WarehousePolicy) -> KernelResult<Self> {
        let bundles = Arc::new(storage.bundles());
        let syscalls = Box::new(KvSyscallHandler::new(storage.clone()));
        Self::new(storage, bundles, syscalls, policy)
    }

    pub fn storage(&self) -> &KernelStorage {
        &self.storage
    }

    pub fn policy(&self) -> &WarehousePolicy {
        &self.policy
    }

    pub fn transcripts(&self) -> &TranscriptStore {
        &self.transcripts
    }

    pub fn snapshots(&self) -> &SnapStore {
        &self.snapshots
    }

    /// Change the snapshot interval for all vats, persisting it.
    pub fn set_snapshot_interval(&mut self, interval: u64) -> KernelResult<()> {
        self.storage
            .set(SNAPSHOT_INTERVAL_KEY, &interval.to_string())?;
        self.policy.snapshot_interval = interval;
        Ok(())
    }

    pub fn vat_options(&self, vat_id: &str) -> KernelResult<VatOptions> {
        self.storage
            .get_json(&vat_key(vat_id))?
            .ok_or_else(|| KernelError::VatNotFound(vat_id.to_string()))
    }

    /// Every created vat, in id order.
    pub fn vat_ids(&self) -> KernelResult<Vec<String>> {
        Ok(self
            .storage
            .keys_with_prefix(VAT_PREFIX)?
            .into_iter()
            .filter_map(|key| key.strip_prefix(VAT_PREFIX).map(str::to_string))
            .collect())
    }

    /// Vats with a worker online, most recently used first.
    pub fn active_vats(&self) -> Vec<String> {
        self.lru.iter().map(str::to_string).collect()
    }

    pub fn is_online(&self, vat_id: &str) -> bool {
        self.online.contains_key(vat_id)
    }

    pub fn incarnation(&self, vat_id: &str) -> KernelResult<u64> {
        Ok(self.transcripts.get_current_span_bounds(vat_id)?.incarnation)
    }

    /// Bring the first vats online ahead of their first delivery.
    pub async fn start(&mut self) -> KernelResult<()> {
        let preload = self.policy.preload_count();
        for vat_id in self.vat_ids()?.into_iter().take(preload) {
            self.ensure_online(&vat_id).await?;
        }
        log::info!("warehouse started with {} vats online", self.online.len());
        Ok(())
    }

    /// Stop every online worker. Transcripts are untouched.
    pub async fn shutdown(&mut self) {
        let vat_ids: Vec<String> = self.lru.iter().map(str::to_string).collect();
        for vat_id in vat_ids {
            self.stop_worker(&vat_id).await;
        }
    }

    /// Create a vat: open its transcript, start a worker on `bundle_id` and
    /// deliver `startVat`.
    pub async fn create_vat(
        &mut self,
        vat_id: &str,
        bundle_id: &str,
        worker_options: WorkerOptions,
        vat_parameters: Value,
    ) -> KernelResult<DeliveryResult> {
        if self.storage.has(&vat_key(vat_id))? {
            return Err(KernelError::VatExists(vat_id.to_string()));
        }
        let options = VatOptions {
            bundle_id: bundle_id.to_string(),
            worker_options,
            vat_parameters: vat_parameters.clone(),
        };
        self.storage.set_json(&vat_key(vat_id), &options)?;
        self.transcripts.init_transcript(vat_id)?;
        self.start_incarnation(vat_id, &options).await?;
        log::info!("created vat {vat_id} on bundle {bundle_id}");
        self.deliver(vat_id, VatDelivery::StartVat { vat_parameters })
            .await
    }

    /// Deliver to a vat, bringing its worker online first if needed. The
    /// delivery, its syscalls and its result are appended to the transcript.
    pub async fn deliver(
        &mut self,
        vat_id: &str,
        delivery: VatDelivery,
    ) -> KernelResult<DeliveryResult> {
        if delivery.is_pseudo() {
            return Err(KernelError::InvalidDelivery(delivery.kind().to_string()));
        }
        self.ensure_online(vat_id).await?;
        let result = self.deliver_recorded(vat_id, &delivery).await?;
        if !matches!(delivery, VatDelivery::BringOutYourDead) {
            self.maybe_reap(vat_id).await?;
        }
        self.maybe_save_snapshot(vat_id).await?;
        Ok(result)
    }

    pub async fn bring_out_your_dead(&mut self, vat_id: &str) -> KernelResult<DeliveryResult> {
        self.deliver(vat_id, VatDelivery::BringOutYourDead).await
    }

    /// Save a snapshot if the vat's current span has reached the threshold:
    /// `snapshot_initial` entries when the incarnation has no snapshot yet,
    /// `snapshot_interval` entries otherwise.
    pub async fn maybe_save_snapshot(&mut self, vat_id: &str) -> KernelResult<bool> {
        let span = self.transcripts.current_span(vat_id)?;
        let count = span.len();
        let has_snapshot = self.snapshots.get_snapshot_info(vat_id)?.is_some();
        let due = (!has_snapshot && count >= self.policy.snapshot_initial)
            || count >= self.policy.snapshot_interval;
        if due {
            self.save_snapshot(vat_id).await?;
        }
        Ok(due)
    }

    /// Snapshot the vat now: `bringOutYourDead`, save the heap, then seal the
    /// span and start the next one from the saved heap.
    pub async fn save_snapshot(&mut self, vat_id: &str) -> KernelResult<SnapshotInfo> {
        self.ensure_online(vat_id).await?;
        self.deliver_recorded(vat_id, &VatDelivery::BringOutYourDead)
            .await?;
        let outcome = self.worker(vat_id)?.snapshot().await;
        let heap = match outcome {
            Ok(heap) => heap,
            Err(err) => return Err(self.worker_failed(vat_id, err).await),
        };
        let snap_pos = self.transcripts.current_span(vat_id)?.end_pos;
        let info = self.snapshots.save_snapshot(vat_id, snap_pos, &heap)?;
        self.transcripts
            .add_entry(vat_id, &TranscriptEntry::pseudo(VatDelivery::SaveSnapshot))?;
        self.transcripts.rollover_span(vat_id)?;
        self.transcripts.add_entry(
            vat_id,
            &TranscriptEntry::pseudo(VatDelivery::LoadSnapshot {
                snapshot_id: info.hash.to_hex(),
                snap_pos,
            }),
        )?;
        log::info!("snapshot of {vat_id} at {snap_pos}: {}", info.hash);
        if self.policy.restart_worker_on_snapshot {
            self.stop_worker(vat_id).await;
            self.ensure_online(vat_id).await?;
        }
        Ok(info)
    }

    /// Replace the vat's code. The old worker gets a final `bringOutYourDead`,
    /// the transcript rolls to a new incarnation and the new bundle receives
    /// `startVat`. Vatstore contents carry over.
    pub async fn upgrade_vat(
        &mut self,
        vat_id: &str,
        bundle_id: &str,
        vat_parameters: Value,
    ) -> KernelResult<DeliveryResult> {
        let mut options = self.vat_options(vat_id)?;
        // fail before touching the old incarnation
        self.bundles.worker_code(bundle_id)?;

        self.ensure_online(vat_id).await?;
        self.deliver_recorded(vat_id, &VatDelivery::BringOutYourDead)
            .await?;
        self.stop_worker(vat_id).await;
        self.transcripts
            .add_entry(vat_id, &TranscriptEntry::pseudo(VatDelivery::ShutdownWorker))?;
        self.snapshots.stop_using_last_snapshot(vat_id)?;
        let incarnation = self.transcripts.rollover_incarnation(vat_id)?;

        options.bundle_id = bundle_id.to_string();
        options.vat_parameters = vat_parameters.clone();
        self.storage.set_json(&vat_key(vat_id), &options)?;
        self.start_incarnation(vat_id, &options).await?;
        log::info!("upgraded vat {vat_id} to {bundle_id}, incarnation {incarnation}");
        self.deliver(vat_id, VatDelivery::StartVat { vat_parameters })
            .await
    }

    /// Remove the vat for good: worker, snapshots, vatstore and options.
    /// Transcript spans are sealed and kept for audit.
    pub async fn terminate_vat(&mut self, vat_id: &str) -> KernelResult<()> {
        self.vat_options(vat_id)?;
        self.stop_worker(vat_id).await;
        self.transcripts.stop_using_transcript(vat_id)?;
        self.snapshots.delete_vat_snapshots(vat_id)?;
        for key in self.storage.keys_with_prefix(&format!("{vat_id}.vs."))? {
            self.storage.delete(&key)?;
        }
        self.storage.delete(&vat_key(vat_id))?;
        self.since_reap.remove(vat_id);
        log::info!("terminated vat {vat_id}");
        Ok(())
    }

    /// Take the vat's worker offline. Its next delivery replays it.
    pub async fn evict(&mut self, vat_id: &str) -> bool {
        let evicted = self.stop_worker(vat_id).await;
        if evicted {
            log::debug!("evicted vat {vat_id}");
        }
        evicted
    }

    /// Shut down the vat's worker if it has one. Returns whether it did.
    pub async fn stop_worker(&mut self, vat_id: &str) -> bool {
        self.lru.remove(vat_id);
        match self.online.remove(vat_id) {
            Some(worker) => {
                worker.shutdown(self.policy.shutdown_timeout).await;
                true
            }
            None => false,
        }
    }

    async fn ensure_online(&mut self, vat_id: &str) -> KernelResult<()> {
        if self.online.contains_key(vat_id) {
            self.lru.add(vat_id);
            return Ok(());
        }
        let worker = match self.replay_to_hot(vat_id).await {
            Ok(worker) => worker,
            Err(err) => {
                if !matches!(err, KernelError::VatNotFound(_)) {
                    report::report(Some(vat_id), &err);
                }
                return Err(err);
            }
        };
        self.register_online(vat_id, worker).await;
        Ok(())
    }

    async fn register_online(&mut self, vat_id: &str, worker: WorkerHandle) {
        self.online.insert(vat_id.to_string(), worker);
        if let Some(evicted) = self.lru.add(vat_id) {
            self.evict(&evicted).await;
        }
    }

    /// Start a worker on the incarnation's bundle and record `initialize-worker`.
    async fn start_incarnation(&mut self, vat_id: &str, options: &VatOptions) -> KernelResult<()> {
        let worker = self
            .spawn_worker(vat_id, &options.worker_options, &options.bundle_id)
            .await?;
        let init = InitializeWorkerOptions {
            bundle_id: options.bundle_id.clone(),
            worker_options: options.worker_options.clone(),
        };
        self.transcripts.add_entry(
            vat_id,
            &TranscriptEntry::pseudo(VatDelivery::InitializeWorker(init)),
        )?;
        self.register_online(vat_id, worker).await;
        Ok(())
    }

    async fn spawn_worker(
        &self,
        vat_id: &str,
        worker_options: &WorkerOptions,
        bundle_id: &str,
    ) -> KernelResult<WorkerHandle> {
        let code = self.bundles.worker_code(bundle_id)?;
        let mut worker = WorkerHandle::spawn(worker_options)
            .await
            .map_err(|err| worker_error(vat_id, err))?;
        if let Err(err) = worker.evaluate(code).await {
            worker.shutdown(self.policy.shutdown_timeout).await;
            return Err(worker_error(vat_id, err));
        }
        Ok(worker)
    }

    fn worker(&mut self, vat_id: &str) -> KernelResult<&mut WorkerHandle> {
        self.online
            .get_mut(vat_id)
            .ok_or_else(|| KernelError::VatNotFound(vat_id.to_string()))
    }

    /// Deliver to an online worker and append the entry to the transcript.
    async fn deliver_recorded(
        &mut self,
        vat_id: &str,
        delivery: &VatDelivery,
    ) -> KernelResult<DeliveryResult> {
        let worker = self
            .online
            .get_mut(vat_id)
            .ok_or_else(|| KernelError::VatNotFound(vat_id.to_string()))?;
        let handler = &mut self.syscalls;
        let mut recorded = Vec::new();
        let mut fatal = None;
        let outcome = worker
            .deliver(delivery, |syscall| {
                if fatal.is_some() {
                    return SyscallResult::Error("kernel failure".into());
                }
                match handler.handle(vat_id, syscall) {
                    Ok(result) => {
                        recorded.push(RecordedSyscall {
                            syscall: syscall.clone(),
                            result: result.clone(),
                        });
                        result
                    }
                    Err(err) => {
                        fatal = Some(err);
                        SyscallResult::Error("kernel failure".into())
                    }
                }
            })
            .await;
        if let Some(err) = fatal {
            // The worker saw an answer the transcript will never hold.
            log::error!("syscall from {vat_id} failed in the kernel: {err}");
            self.since_reap.remove(vat_id);
            self.stop_worker(vat_id).await;
            return Err(err);
        }
        let result = match outcome {
            Ok(result) => result,
            Err(err) => return Err(self.worker_failed(vat_id, err).await),
        };
        self.transcripts.add_entry(
            vat_id,
            &TranscriptEntry {
                delivery: delivery.clone(),
                syscalls: recorded,
                result: result.clone(),
            },
        )?;
        if matches!(delivery, VatDelivery::BringOutYourDead) {
            self.since_reap.remove(vat_id);
        }
        Ok(result)
    }

    async fn maybe_reap(&mut self, vat_id: &str) -> KernelResult<()> {
        let Some(interval) = self.policy.reap_interval else {
            return Ok(());
        };
        let count = self.since_reap.entry(vat_id.to_string()).or_default();
        *count += 1;
        if *count >= interval {
            log::debug!("reaping {vat_id} after {count} deliveries");
            self.deliver_recorded(vat_id, &VatDelivery::BringOutYourDead)
                .await?;
        }
        Ok(())
    }

    /// A worker failed mid-request. Crashed workers are dropped and reported.
    async fn worker_failed(&mut self, vat_id: &str, err: WorkerError) -> KernelError {
        let err = worker_error(vat_id, err);
        if matches!(err, KernelError::WorkerCrashed { .. }) {
            self.lru.remove(vat_id);
            self.since_reap.remove(vat_id);
            if let Some(worker) = self.online.remove(vat_id) {
                worker.shutdown(self.policy.shutdown_timeout).await;
            }
            report::report(Some(vat_id), &err);
        }
        err
    }
}

fn worker_error(vat_id: &str, err: WorkerError) -> KernelError {
    if err.is_crash() {
        KernelError::WorkerCrashed {
            vat_id: vat_id.to_string(),
            reason: err.to_string(),
        }
    } else {
        KernelError::Worker {
            vat_id: vat_id.to_string(),
            source: err,
        }
    }
}
