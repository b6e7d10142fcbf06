use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a vat's worker is hosted. Chosen when the vat is created and recorded
/// in its `initialize-worker` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerOptions {
    /// Worker runs on a task inside the kernel process.
    Local { engine: String },
    /// Worker runs as a child process speaking the protocol over stdin/stdout.
    Subprocess {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Worker is reached over a Unix domain socket.
    Remote { socket: String },
}

impl WorkerOptions {
    pub fn local(engine: impl Into<String>) -> Self {
        WorkerOptions::Local {
            engine: engine.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeWorkerOptions {
    /// Only the bundle id is recorded, never the bundle itself.
    #[serde(rename = "bundleID")]
    pub bundle_id: String,
    pub worker_options: WorkerOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub promise: String,
    pub rejected: bool,
    pub data: Value,
}

/// One unit of work sent into a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VatDelivery {
    #[serde(rename = "initialize-worker")]
    InitializeWorker(InitializeWorkerOptions),
    #[serde(rename = "startVat", rename_all = "camelCase")]
    StartVat { vat_parameters: Value },
    #[serde(rename = "message")]
    Message {
        target: String,
        method: String,
        #[serde(default)]
        args: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
    #[serde(rename = "notify")]
    Notify { resolutions: Vec<Resolution> },
    #[serde(rename = "dropExports")]
    DropExports { vrefs: Vec<String> },
    #[serde(rename = "retireExports")]
    RetireExports { vrefs: Vec<String> },
    #[serde(rename = "bringOutYourDead")]
    BringOutYourDead,
    #[serde(rename = "save-snapshot")]
    SaveSnapshot,
    #[serde(rename = "load-snapshot", rename_all = "camelCase")]
    LoadSnapshot {
        #[serde(rename = "snapshotID")]
        snapshot_id: String,
        snap_pos: u64,
    },
    #[serde(rename = "shutdown-worker")]
    ShutdownWorker,
}

impl VatDelivery {
    pub fn message(target: impl Into<String>, method: impl Into<String>, args: Value) -> Self {
        VatDelivery::Message {
            target: target.into(),
            method: method.into(),
            args,
            result: None,
        }
    }

    /// Wire tag of this delivery.
    pub fn kind(&self) -> &'static str {
        match self {
            VatDelivery::InitializeWorker(_) => "initialize-worker",
            VatDelivery::StartVat { .. } => "startVat",
            VatDelivery::Message { .. } => "message",
            VatDelivery::Notify { .. } => "notify",
            VatDelivery::DropExports { .. } => "dropExports",
            VatDelivery::RetireExports { .. } => "retireExports",
            VatDelivery::BringOutYourDead => "bringOutYourDead",
            VatDelivery::SaveSnapshot => "save-snapshot",
            VatDelivery::LoadSnapshot { .. } => "load-snapshot",
            VatDelivery::ShutdownWorker => "shutdown-worker",
        }
    }

    /// Worker-lifecycle entries that are recorded but never replayed as deliveries.
    pub fn is_pseudo(&self) -> bool {
        matches!(
            self,
            VatDelivery::InitializeWorker(_)
                | VatDelivery::SaveSnapshot
                | VatDelivery::LoadSnapshot { .. }
                | VatDelivery::ShutdownWorker
        )
    }

    /// Whether the worker reports computron usage for this delivery.
    pub fn is_metered(&self) -> bool {
        !self.is_pseudo() && !matches!(self, VatDelivery::BringOutYourDead)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metering {
    pub computrons: u64,
}

/// Outcome of one delivery as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metering: Option<Metering>,
}

impl DeliveryResult {
    pub fn ok() -> Self {
        Self {
            status: DeliveryStatus::Ok,
            problem: None,
            metering: None,
        }
    }

    pub fn ok_metered(computrons: u64) -> Self {
        Self {
            status: DeliveryStatus::Ok,
            problem: None,
            metering: Some(Metering { computrons }),
        }
    }

    pub fn error(problem: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Error,
            problem: Some(problem.into()),
            metering: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == DeliveryStatus::Ok
    }
}
