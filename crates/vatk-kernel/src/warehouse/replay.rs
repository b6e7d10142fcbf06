use vatk_abi::VatDelivery;
use vatk_cbor::Hash;
use vatk_worker::WorkerHandle;

use super::{VatWarehouse, worker_error};
use crate::{KernelError, KernelResult, SyscallSimulator};

impl VatWarehouse {
    /// Start a worker for the vat and bring it to the state at the end of its
    /// current span.
    pub(super) async fn replay_to_hot(&mut self, vat_id: &str) -> KernelResult<WorkerHandle> {
        let options = self.vat_options(vat_id)?;
        let mut entries = self.transcripts.read_span(vat_id, None)?;
        let (first_pos, first) = entries.next().transpose()?.ok_or_else(|| {
            KernelError::Transcript(format!("current span of {vat_id} is empty"))
        })?;

        let mut worker = match &first.delivery {
            VatDelivery::InitializeWorker(init) => {
                self.spawn_worker(vat_id, &init.worker_options, &init.bundle_id)
                    .await?
            }
            VatDelivery::LoadSnapshot {
                snapshot_id,
                snap_pos,
            } => {
                let hash = Hash::from_hex_str(snapshot_id).map_err(|err| {
                    KernelError::Transcript(format!("bad snapshot id at {vat_id}@{first_pos}: {err}"))
                })?;
                let info = self.snapshots.get_snapshot_info(vat_id)?;
                if info.map(|info| (info.hash, info.snap_pos)) != Some((hash, *snap_pos)) {
                    return Err(KernelError::SnapshotUnavailable(format!(
                        "{vat_id} starts from snapshot {hash} at {snap_pos}, which is not its current snapshot"
                    )));
                }
                let blob = self.snapshots.open(hash)?;
                let mut worker = self
                    .spawn_worker(vat_id, &options.worker_options, &options.bundle_id)
                    .await?;
                if let Err(err) = worker.restore(&blob).await {
                    worker.shutdown(self.policy.shutdown_timeout).await;
                    return Err(worker_error(vat_id, err));
                }
                worker
            }
            other => {
                return Err(KernelError::Transcript(format!(
                    "span of {vat_id} starts with '{}' at {first_pos}",
                    other.kind()
                )));
            }
        };

        let mut replayed = 0usize;
        for item in entries {
            let (pos, entry) = item?;
            if entry.delivery.is_pseudo() {
                worker.shutdown(self.policy.shutdown_timeout).await;
                return Err(KernelError::Transcript(format!(
                    "unexpected '{}' inside span of {vat_id} at {pos}",
                    entry.delivery.kind()
                )));
            }
            let mut sim = SyscallSimulator::new(vat_id, pos, entry.syscalls);
            let result = worker
                .deliver(&entry.delivery, |syscall| sim.handle(syscall))
                .await
                .map_err(|err| worker_error(vat_id, err))?;
            let checked = sim.finish().and_then(|()| {
                if result == entry.result {
                    Ok(())
                } else {
                    Err(KernelError::ReplayMismatch {
                        vat_id: vat_id.to_string(),
                        pos,
                        detail: format!("recorded {:?}, replayed {:?}", entry.result, result),
                    })
                }
            });
            if let Err(err) = checked {
                worker.shutdown(self.policy.shutdown_timeout).await;
                return Err(err);
            }
            replayed += 1;
        }
        log::debug!("replayed {replayed} deliveries of {vat_id}");
        Ok(worker)
    }
}
