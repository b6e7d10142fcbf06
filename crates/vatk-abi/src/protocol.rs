//! IPC envelopes. Each message is a JSON array whose first element is the
//! message tag, framed as one netstring on the wire.

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{AbiError, DeliveryResult, SyscallResult, VatDelivery, VatSyscall, encode_netstring};

/// Worker-loadable code handed to a fresh worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCode {
    #[serde(rename = "bundleID")]
    pub bundle_id: String,
    pub module_format: String,
    pub source: String,
}

/// Kernel → worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelToWorker {
    Evaluate(WorkerCode),
    Deliver(VatDelivery),
    SyscallResult(SyscallResult),
    SaveSnapshot,
    LoadSnapshot(Vec<u8>),
    Shutdown,
}

/// Worker → kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerToKernel {
    Evaluated { error: Option<String> },
    DeliverDone(DeliveryResult),
    Syscall(VatSyscall),
    SnapshotSaved(Vec<u8>),
    SnapshotLoaded { error: Option<String> },
    ShutdownDone,
}

impl KernelToWorker {
    pub fn tag(&self) -> &'static str {
        match self {
            KernelToWorker::Evaluate(_) => "evaluate",
            KernelToWorker::Deliver(_) => "deliver",
            KernelToWorker::SyscallResult(_) => "syscallResult",
            KernelToWorker::SaveSnapshot => "saveSnapshot",
            KernelToWorker::LoadSnapshot(_) => "loadSnapshot",
            KernelToWorker::Shutdown => "shutdown",
        }
    }

    pub fn to_json(&self) -> Result<Value, AbiError> {
        let tag = self.tag();
        Ok(match self {
            KernelToWorker::Evaluate(code) => json!([tag, serde_json::to_value(code)?]),
            KernelToWorker::Deliver(vd) => json!([tag, serde_json::to_value(vd)?]),
            KernelToWorker::SyscallResult(res) => json!([tag, serde_json::to_value(res)?]),
            KernelToWorker::LoadSnapshot(bytes) => json!([tag, BASE64_STANDARD.encode(bytes)]),
            KernelToWorker::SaveSnapshot | KernelToWorker::Shutdown => json!([tag]),
        })
    }

    pub fn from_json(value: Value) -> Result<Self, AbiError> {
        let (tag, arg) = split_tagged(value)?;
        Ok(match tag.as_str() {
            "evaluate" => KernelToWorker::Evaluate(serde_json::from_value(required(arg, &tag)?)?),
            "deliver" => KernelToWorker::Deliver(serde_json::from_value(required(arg, &tag)?)?),
            "syscallResult" => {
                KernelToWorker::SyscallResult(serde_json::from_value(required(arg, &tag)?)?)
            }
            "saveSnapshot" => KernelToWorker::SaveSnapshot,
            "loadSnapshot" => KernelToWorker::LoadSnapshot(decode_b64(required(arg, &tag)?)?),
            "shutdown" => KernelToWorker::Shutdown,
            other => return Err(AbiError::Message(format!("unknown kernel message '{other}'"))),
        })
    }

    /// JSON-encode and frame as a netstring.
    pub fn to_frame(&self) -> Result<Vec<u8>, AbiError> {
        Ok(encode_netstring(&serde_json::to_vec(&self.to_json()?)?))
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, AbiError> {
        Self::from_json(serde_json::from_slice(frame)?)
    }
}

impl WorkerToKernel {
    pub fn tag(&self) -> &'static str {
        match self {
            WorkerToKernel::Evaluated { .. } => "evaluated",
            WorkerToKernel::DeliverDone(_) => "deliverDone",
            WorkerToKernel::Syscall(_) => "syscall",
            WorkerToKernel::SnapshotSaved(_) => "snapshotSaved",
            WorkerToKernel::SnapshotLoaded { .. } => "snapshotLoaded",
            WorkerToKernel::ShutdownDone => "shutdownDone",
        }
    }

    pub fn to_json(&self) -> Result<Value, AbiError> {
        let tag = self.tag();
        Ok(match self {
            WorkerToKernel::Evaluated { error } | WorkerToKernel::SnapshotLoaded { error } => {
                match error {
                    Some(problem) => json!([tag, problem]),
                    None => json!([tag]),
                }
            }
            WorkerToKernel::DeliverDone(res) => json!([tag, serde_json::to_value(res)?]),
            WorkerToKernel::Syscall(sc) => json!([tag, serde_json::to_value(sc)?]),
            WorkerToKernel::SnapshotSaved(bytes) => json!([tag, BASE64_STANDARD.encode(bytes)]),
            WorkerToKernel::ShutdownDone => json!([tag]),
        })
    }

    pub fn from_json(value: Value) -> Result<Self, AbiError> {
        let (tag, arg) = split_tagged(value)?;
        let problem = |arg: Option<Value>| -> Result<Option<String>, AbiError> {
            match arg {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) => Ok(Some(s)),
                Some(other) => Ok(Some(other.to_string())),
            }
        };
        Ok(match tag.as_str() {
            "evaluated" => WorkerToKernel::Evaluated {
                error: problem(arg)?,
            },
            "deliverDone" => {
                WorkerToKernel::DeliverDone(serde_json::from_value(required(arg, &tag)?)?)
            }
            "syscall" => WorkerToKernel::Syscall(serde_json::from_value(required(arg, &tag)?)?),
            "snapshotSaved" => WorkerToKernel::SnapshotSaved(decode_b64(required(arg, &tag)?)?),
            "snapshotLoaded" => WorkerToKernel::SnapshotLoaded {
                error: problem(arg)?,
            },
            "shutdownDone" => WorkerToKernel::ShutdownDone,
            other => return Err(AbiError::Message(format!("unknown worker message '{other}'"))),
        })
    }

    pub fn to_frame(&self) -> Result<Vec<u8>, AbiError> {
        Ok(encode_netstring(&serde_json::to_vec(&self.to_json()?)?))
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, AbiError> {
        Self::from_json(serde_json::from_slice(frame)?)
    }
}

fn split_tagged(value: Value) -> Result<(String, Option<Value>), AbiError> {
    let Value::Array(mut items) = value else {
        return Err(AbiError::Message("message must be a JSON array".into()));
    };
    if items.is_empty() || items.len() > 2 {
        return Err(AbiError::Message(format!(
            "message must have 1 or 2 elements, got {}",
            items.len()
        )));
    }
    let arg = if items.len() == 2 { items.pop() } else { None };
    match items.pop() {
        Some(Value::String(tag)) => Ok((tag, arg)),
        _ => Err(AbiError::Message("message tag must be a string".into())),
    }
}

fn required(arg: Option<Value>, tag: &str) -> Result<Value, AbiError> {
    arg.ok_or_else(|| AbiError::Message(format!("'{tag}' requires an argument")))
}

fn decode_b64(value: Value) -> Result<Vec<u8>, AbiError> {
    match value {
        Value::String(s) => Ok(BASE64_STANDARD.decode(s)?),
        _ => Err(AbiError::Message("expected base64 string".into())),
    }
}
