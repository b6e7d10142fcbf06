//! Deterministic reference engine: a vat holding one counter.
//!
//! Every ordinary `message` adds `step` to the counter and writes it to the
//! vatstore under `count`. A few method names have special behavior:
//! `get` only reads, `fail` reports a failed delivery, `die` kills the worker,
//! and `send` forwards an `increment` to the target named in `args[0]`.

use std::collections::BTreeSet;

use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::Engine as _;
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use vatk_abi::{DeliveryResult, SyscallResult, VatDelivery, VatSyscall, WorkerCode};

use crate::{Engine, Syscaller};

const BASE_COMPUTRONS: u64 = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CounterHeap {
    bundle_id: Option<String>,
    step: u64,
    started: bool,
    count: u64,
    notified: u64,
    dropped: BTreeSet<String>,
    collections: u64,
}

/// Configuration carried in the bundle source.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct CounterConfig {
    step: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self { step: 1 }
    }
}

#[derive(Debug, Default)]
pub struct CounterEngine {
    heap: CounterHeap,
}

impl CounterEngine {
    pub const NAME: &'static str = "counter";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.heap.count
    }

    async fn store_count(&self, syscalls: &mut dyn Syscaller) -> anyhow::Result<Option<String>> {
        let res = syscalls
            .syscall(VatSyscall::VatstoreSet {
                key: "count".into(),
                value: self.heap.count.to_string(),
            })
            .await?;
        Ok(match res {
            SyscallResult::Ok(_) => None,
            SyscallResult::Error(problem) => Some(problem),
        })
    }

    async fn message(
        &mut self,
        method: &str,
        args: &Value,
        syscalls: &mut dyn Syscaller,
    ) -> anyhow::Result<Result<(), String>> {
        match method {
            "die" => bail!("vat requested worker death"),
            "fail" => return Ok(Err(format!("method '{method}' failed"))),
            "get" => {
                syscalls
                    .syscall(VatSyscall::VatstoreGet {
                        key: "count".into(),
                    })
                    .await?;
                return Ok(Ok(()));
            }
            "send" => {
                let Some(target) = args.get(0).and_then(Value::as_str) else {
                    return Ok(Err("send requires a target".into()));
                };
                let res = syscalls
                    .syscall(VatSyscall::Send {
                        target: target.to_string(),
                        method: "increment".into(),
                        args: json!([]),
                    })
                    .await?;
                if let SyscallResult::Error(problem) = res {
                    return Ok(Err(problem));
                }
            }
            _ => {}
        }
        self.heap.count += self.heap.step;
        Ok(match self.store_count(syscalls).await? {
            Some(problem) => Err(problem),
            None => Ok(()),
        })
    }
}

fn computrons(delivery: &VatDelivery) -> u64 {
    let size = serde_json::to_vec(delivery).map(|v| v.len()).unwrap_or(0) as u64;
    BASE_COMPUTRONS + size * 10
}

#[async_trait]
impl Engine for CounterEngine {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn evaluate(&mut self, code: &WorkerCode) -> anyhow::Result<()> {
        let text = match code.module_format.as_str() {
            "endoZipBase64" => {
                let bytes = BASE64_STANDARD
                    .decode(&code.source)
                    .context("decode bundle contents")?;
                String::from_utf8(bytes).context("bundle contents are not utf-8")?
            }
            "" => bail!("bundle {} has no module format", code.bundle_id),
            _ => code.source.clone(),
        };
        let config: CounterConfig = if text.trim().is_empty() {
            CounterConfig::default()
        } else {
            serde_json::from_str(&text).context("parse counter configuration")?
        };
        self.heap.bundle_id = Some(code.bundle_id.clone());
        self.heap.step = config.step;
        Ok(())
    }

    async fn deliver(
        &mut self,
        delivery: &VatDelivery,
        syscalls: &mut dyn Syscaller,
    ) -> anyhow::Result<DeliveryResult> {
        if self.heap.bundle_id.is_none() {
            bail!("delivery before any code was evaluated");
        }
        let outcome = match delivery {
            VatDelivery::StartVat { vat_parameters } => {
                if self.heap.started {
                    Err("vat already started".to_string())
                } else {
                    self.heap.started = true;
                    // a previous incarnation's count survives an upgrade
                    let stored = syscalls
                        .syscall(VatSyscall::VatstoreGet {
                            key: "count".into(),
                        })
                        .await?;
                    self.heap.count = match stored {
                        SyscallResult::Ok(Some(raw)) => raw.parse().unwrap_or(0),
                        _ => vat_parameters
                            .get("initial")
                            .and_then(Value::as_u64)
                            .unwrap_or(0),
                    };
                    match self.store_count(syscalls).await? {
                        Some(problem) => Err(problem),
                        None => Ok(()),
                    }
                }
            }
            VatDelivery::Message { method, args, .. } => {
                if !self.heap.started {
                    Err("vat not started".to_string())
                } else {
                    self.message(method, args, syscalls).await?
                }
            }
            VatDelivery::Notify { resolutions } => {
                self.heap.notified += resolutions.len() as u64;
                Ok(())
            }
            VatDelivery::DropExports { vrefs } => {
                self.heap.dropped.extend(vrefs.iter().cloned());
                Ok(())
            }
            VatDelivery::RetireExports { vrefs } => {
                for vref in vrefs {
                    self.heap.dropped.remove(vref);
                }
                Ok(())
            }
            VatDelivery::BringOutYourDead => {
                self.heap.collections += 1;
                self.heap.dropped.clear();
                return Ok(DeliveryResult::ok());
            }
            other => bail!("'{}' is handled by the kernel, not the engine", other.kind()),
        };
        Ok(match outcome {
            Ok(()) => DeliveryResult::ok_metered(computrons(delivery)),
            Err(problem) => DeliveryResult::error(problem),
        })
    }

    async fn snapshot(&mut self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.heap)?)
    }

    async fn restore(&mut self, heap: &[u8]) -> anyhow::Result<()> {
        self.heap = serde_json::from_slice(heap).context("decode counter heap")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorded(Vec<VatSyscall>);

    #[async_trait]
    impl Syscaller for Recorded {
        async fn syscall(&mut self, syscall: VatSyscall) -> anyhow::Result<SyscallResult> {
            self.0.push(syscall);
            Ok(SyscallResult::ok())
        }
    }

    fn code(source: &str) -> WorkerCode {
        WorkerCode {
            bundle_id: "b0-test".into(),
            module_format: "nestedEvaluate".into(),
            source: source.into(),
        }
    }

    async fn started(source: &str) -> (CounterEngine, Recorded) {
        let mut engine = CounterEngine::new();
        let mut sys = Recorded::default();
        engine.evaluate(&code(source)).await.unwrap();
        let res = engine
            .deliver(
                &VatDelivery::StartVat {
                    vat_parameters: json!({"initial": 10}),
                },
                &mut sys,
            )
            .await
            .unwrap();
        assert!(res.is_ok());
        (engine, sys)
    }

    #[tokio::test]
    async fn messages_bump_counter_and_vatstore() {
        let (mut engine, mut sys) = started(r#"{"step": 5}"#).await;
        let msg = VatDelivery::message("o+0", "increment", json!([]));
        let res = engine.deliver(&msg, &mut sys).await.unwrap();
        assert_eq!(engine.count(), 15);
        assert_eq!(res.metering.unwrap().computrons, computrons(&msg));
        assert_eq!(
            sys.0.last(),
            Some(&VatSyscall::VatstoreSet {
                key: "count".into(),
                value: "15".into()
            })
        );
    }

    #[tokio::test]
    async fn fail_and_die_behave_differently() {
        let (mut engine, mut sys) = started("").await;
        let res = engine
            .deliver(&VatDelivery::message("o+0", "fail", json!([])), &mut sys)
            .await
            .unwrap();
        assert!(!res.is_ok());
        assert_eq!(engine.count(), 10);
        assert!(
            engine
                .deliver(&VatDelivery::message("o+0", "die", json!([])), &mut sys)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn boyd_is_unmetered() {
        let (mut engine, mut sys) = started("").await;
        let res = engine
            .deliver(&VatDelivery::BringOutYourDead, &mut sys)
            .await
            .unwrap();
        assert_eq!(res, DeliveryResult::ok());
    }

    #[tokio::test]
    async fn snapshot_restores_identical_heap() {
        let (mut engine, mut sys) = started("").await;
        engine
            .deliver(&VatDelivery::message("o+0", "increment", json!([])), &mut sys)
            .await
            .unwrap();
        let heap = engine.snapshot().await.unwrap();

        let mut other = CounterEngine::new();
        other.restore(&heap).await.unwrap();
        assert_eq!(other.count(), 11);
        assert_eq!(other.snapshot().await.unwrap(), heap);
    }

    #[tokio::test]
    async fn zip_bundles_carry_base64_configuration() {
        let mut engine = CounterEngine::new();
        engine
            .evaluate(&WorkerCode {
                bundle_id: "b1-x".into(),
                module_format: "endoZipBase64".into(),
                source: BASE64_STANDARD.encode(r#"{"step": 3}"#),
            })
            .await
            .unwrap();
        assert_eq!(engine.heap.step, 3);
    }

    #[tokio::test]
    async fn start_resumes_stored_count() {
        struct Stored;

        #[async_trait]
        impl Syscaller for Stored {
            async fn syscall(&mut self, syscall: VatSyscall) -> anyhow::Result<SyscallResult> {
                Ok(match syscall {
                    VatSyscall::VatstoreGet { .. } => SyscallResult::Ok(Some("42".into())),
                    _ => SyscallResult::ok(),
                })
            }
        }

        let mut engine = CounterEngine::new();
        engine.evaluate(&code("")).await.unwrap();
        engine
            .deliver(
                &VatDelivery::StartVat {
                    vat_parameters: json!({"initial": 10}),
                },
                &mut Stored,
            )
            .await
            .unwrap();
        assert_eq!(engine.count(), 42);
    }

    #[tokio::test]
    async fn lifecycle_entries_are_rejected() {
        let (mut engine, mut sys) = started("").await;
        assert!(
            engine
                .deliver(&VatDelivery::SaveSnapshot, &mut sys)
                .await
                .is_err()
        );
    }
}
