//! Kernel side of worker syscalls: the live handler, and the simulator that
//! answers from the transcript during replay.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use vatk_abi::{SyscallResult, VatSyscall};

use crate::{KernelError, KernelResult, KernelStorage, RecordedSyscall};

/// Answers syscalls made during live deliveries.
///
/// An `Err` is a kernel failure, not an answer: the delivery is abandoned
/// and the error goes to the warehouse's caller instead of the vat.
pub trait SyscallHandler: Send {
    fn handle(&mut self, vat_id: &str, syscall: &VatSyscall) -> KernelResult<SyscallResult>;
}

/// A `send` a vat made, waiting for the router to pick it up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedSend {
    pub from_vat: String,
    pub target: String,
    pub method: String,
    pub args: Value,
}

/// A vat asking to be terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitRequest {
    pub vat_id: String,
    pub failure: bool,
    pub info: Value,
}

#[derive(Debug, Default)]
struct Queues {
    sends: Vec<QueuedSend>,
    exits: Vec<ExitRequest>,
}

pub fn vatstore_key(vat_id: &str, key: &str) -> String {
    format!("{vat_id}.vs.{key}")
}

/// Vatstore syscalls against kernel storage; sends and exits are queued.
/// Clones share the queues.
#[derive(Debug, Clone)]
pub struct KvSyscallHandler {
    storage: KernelStorage,
    queues: Arc<Mutex<Queues>>,
}

impl KvSyscallHandler {
    pub fn new(storage: KernelStorage) -> Self {
        Self {
            storage,
            queues: Arc::default(),
        }
    }

    pub fn take_sends(&self) -> Vec<QueuedSend> {
        std::mem::take(&mut self.queues.lock().unwrap().sends)
    }

    pub fn take_exits(&self) -> Vec<ExitRequest> {
        std::mem::take(&mut self.queues.lock().unwrap().exits)
    }

    fn vatstore(&self, vat_id: &str, syscall: &VatSyscall) -> KernelResult<Option<String>> {
        match syscall {
            VatSyscall::VatstoreGet { key } => self.storage.get(&vatstore_key(vat_id, key)),
            VatSyscall::VatstoreSet { key, value } => {
                self.storage.set(&vatstore_key(vat_id, key), value)?;
                Ok(None)
            }
            VatSyscall::VatstoreDelete { key } => {
                self.storage.delete(&vatstore_key(vat_id, key))?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

impl SyscallHandler for KvSyscallHandler {
    fn handle(&mut self, vat_id: &str, syscall: &VatSyscall) -> KernelResult<SyscallResult> {
        let result = match syscall {
            VatSyscall::Send {
                target,
                method,
                args,
            } => {
                self.queues.lock().unwrap().sends.push(QueuedSend {
                    from_vat: vat_id.to_string(),
                    target: target.clone(),
                    method: method.clone(),
                    args: args.clone(),
                });
                SyscallResult::ok()
            }
            VatSyscall::Exit { failure, info } => {
                self.queues.lock().unwrap().exits.push(ExitRequest {
                    vat_id: vat_id.to_string(),
                    failure: *failure,
                    info: info.clone(),
                });
                SyscallResult::ok()
            }
            _ => SyscallResult::Ok(self.vatstore(vat_id, syscall)?),
        };
        Ok(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimStatus {
    Ok,
    Wrong,
    Extra,
    Missing,
}

/// Replays recorded syscall results and notes any divergence.
#[derive(Debug)]
pub struct SyscallSimulator {
    vat_id: String,
    pos: u64,
    expected: Vec<RecordedSyscall>,
    next: usize,
    log: Vec<(SimStatus, String)>,
}

impl SyscallSimulator {
    pub fn new(vat_id: &str, pos: u64, expected: Vec<RecordedSyscall>) -> Self {
        Self {
            vat_id: vat_id.to_string(),
            pos,
            expected,
            next: 0,
            log: Vec::new(),
        }
    }

    pub fn handle(&mut self, syscall: &VatSyscall) -> SyscallResult {
        let describe = serde_json::to_string(syscall).unwrap_or_default();
        let Some(recorded) = self.expected.get(self.next) else {
            self.log.push((SimStatus::Extra, describe));
            return SyscallResult::Error("anachrophobia".into());
        };
        self.next += 1;
        if &recorded.syscall != syscall {
            let expected = serde_json::to_string(&recorded.syscall).unwrap_or_default();
            self.log
                .push((SimStatus::Wrong, format!("{describe} (expected {expected})")));
            return SyscallResult::Error("anachrophobia".into());
        }
        self.log.push((SimStatus::Ok, describe));
        recorded.result.clone()
    }

    /// Fails with `ReplayMismatch` if any syscall was extra, different or missing.
    pub fn finish(mut self) -> KernelResult<()> {
        for missing in &self.expected[self.next..] {
            let describe = serde_json::to_string(&missing.syscall).unwrap_or_default();
            self.log.push((SimStatus::Missing, describe));
        }
        if self.log.iter().all(|(status, _)| *status == SimStatus::Ok) {
            return Ok(());
        }
        log::error!(
            "anachrophobia in {} at {}: syscalls diverged from transcript",
            self.vat_id,
            self.pos
        );
        for (status, describe) in &self.log {
            log::error!("  {status:?}: {describe}");
        }
        let bad = self
            .log
            .iter()
            .filter(|(status, _)| *status != SimStatus::Ok)
            .map(|(status, describe)| format!("{status:?} {describe}"))
            .collect::<Vec<_>>()
            .join("; ");
        Err(KernelError::ReplayMismatch {
            vat_id: self.vat_id,
            pos: self.pos,
            detail: format!("syscalls diverged: {bad}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(value: &str) -> VatSyscall {
        VatSyscall::VatstoreSet {
            key: "count".into(),
            value: value.into(),
        }
    }

    fn recorded(syscall: VatSyscall) -> RecordedSyscall {
        RecordedSyscall {
            syscall,
            result: SyscallResult::ok(),
        }
    }

    #[test]
    fn vatstore_is_scoped_per_vat() {
        let storage = KernelStorage::in_memory().unwrap();
        let mut handler = KvSyscallHandler::new(storage.clone());
        handler.handle("v1", &set("4")).unwrap();
        assert_eq!(storage.get("v1.vs.count").unwrap().as_deref(), Some("4"));
        let got = handler
            .handle(
                "v2",
                &VatSyscall::VatstoreGet {
                    key: "count".into(),
                },
            )
            .unwrap();
        assert_eq!(got, SyscallResult::Ok(None));
        handler
            .handle(
                "v1",
                &VatSyscall::VatstoreDelete {
                    key: "count".into(),
                },
            )
            .unwrap();
        assert!(!storage.has("v1.vs.count").unwrap());
    }

    #[test]
    fn sends_and_exits_are_queued() {
        let mut handler = KvSyscallHandler::new(KernelStorage::in_memory().unwrap());
        let observer = handler.clone();
        handler
            .handle(
                "v1",
                &VatSyscall::Send {
                    target: "ko5".into(),
                    method: "ping".into(),
                    args: json!([]),
                },
            )
            .unwrap();
        handler
            .handle(
                "v1",
                &VatSyscall::Exit {
                    failure: true,
                    info: json!("bye"),
                },
            )
            .unwrap();
        let sends = observer.take_sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].target, "ko5");
        assert!(observer.take_sends().is_empty());
        assert!(observer.take_exits()[0].failure);
    }

    #[test]
    fn simulator_replays_recorded_results() {
        let mut sim = SyscallSimulator::new(
            "v1",
            3,
            vec![RecordedSyscall {
                syscall: VatSyscall::VatstoreGet { key: "k".into() },
                result: SyscallResult::Ok(Some("v".into())),
            }],
        );
        let res = sim.handle(&VatSyscall::VatstoreGet { key: "k".into() });
        assert_eq!(res, SyscallResult::Ok(Some("v".into())));
        sim.finish().unwrap();
    }

    #[test]
    fn simulator_flags_wrong_extra_and_missing() {
        let mut wrong = SyscallSimulator::new("v1", 3, vec![recorded(set("1"))]);
        wrong.handle(&set("2"));
        assert!(matches!(
            wrong.finish(),
            Err(KernelError::ReplayMismatch { pos: 3, .. })
        ));

        let mut extra = SyscallSimulator::new("v1", 4, vec![]);
        assert!(matches!(extra.handle(&set("1")), SyscallResult::Error(_)));
        assert!(extra.finish().is_err());

        let missing = SyscallSimulator::new("v1", 5, vec![recorded(set("1"))]);
        let err = missing.finish().unwrap_err();
        assert!(err.to_string().contains("Missing"));
    }
}
