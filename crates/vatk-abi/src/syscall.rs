use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request a worker makes back to the kernel while a delivery is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatSyscall {
    Send {
        target: String,
        method: String,
        #[serde(default)]
        args: Value,
    },
    VatstoreGet {
        key: String,
    },
    VatstoreSet {
        key: String,
        value: String,
    },
    VatstoreDelete {
        key: String,
    },
    Exit {
        failure: bool,
        #[serde(default)]
        info: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "lowercase")]
pub enum SyscallResult {
    Ok(Option<String>),
    Error(String),
}

impl SyscallResult {
    pub fn ok() -> Self {
        SyscallResult::Ok(None)
    }
}
