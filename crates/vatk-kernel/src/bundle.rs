//! Content-addressed code bundles.
//!
//! A bundle is a flat record of string fields. `endoZipBase64` bundles are
//! identified by `b1-` plus the SHA-512 of their decoded archive; bundles in
//! source formats by `b0-` plus the SHA-512 of their canonical JSON.

use std::collections::BTreeMap;

use base64::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha512};
use vatk_abi::WorkerCode;
use vatk_cbor::Hash;

use crate::{KernelError, KernelResult, KernelStorage};

pub const ZIP_FORMAT: &str = "endoZipBase64";

const ZIP_FIELD: &str = "endoZipBase64";
const ZIP_DIGEST_FIELD: &str = "endoZipBase64Sha512";
const FORMAT_FIELD: &str = "moduleFormat";
const SOURCE_FIELD: &str = "source";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bundle {
    fields: BTreeMap<String, String>,
}

impl Bundle {
    /// Accept a JSON object whose fields are all strings.
    pub fn from_json(value: &Value) -> KernelResult<Self> {
        let Value::Object(map) = value else {
            return Err(KernelError::MalformedBundle("bundle must be an object".into()));
        };
        let mut fields = BTreeMap::new();
        for (name, field) in map {
            let Value::String(s) = field else {
                return Err(KernelError::MalformedBundle(format!(
                    "field '{name}' must be a string"
                )));
            };
            fields.insert(name.clone(), s.clone());
        }
        Ok(Self { fields })
    }

    /// Zip-format bundle around raw archive bytes.
    pub fn endo_zip(contents: &[u8]) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(FORMAT_FIELD.to_string(), ZIP_FORMAT.to_string());
        fields.insert(ZIP_FIELD.to_string(), BASE64_STANDARD.encode(contents));
        fields.insert(
            ZIP_DIGEST_FIELD.to_string(),
            hex::encode(Sha512::digest(contents)),
        );
        Self { fields }
    }

    /// Source-format bundle such as `nestedEvaluate` or `getExport`.
    pub fn from_source(module_format: &str, source: &str) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(FORMAT_FIELD.to_string(), module_format.to_string());
        fields.insert(SOURCE_FIELD.to_string(), source.to_string());
        Self { fields }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn module_format(&self) -> KernelResult<&str> {
        self.get(FORMAT_FIELD)
            .ok_or_else(|| KernelError::MalformedBundle("missing moduleFormat".into()))
    }

    pub fn compute_id(&self) -> KernelResult<String> {
        if self.module_format()? == ZIP_FORMAT {
            let encoded = self.get(ZIP_FIELD).ok_or_else(|| {
                KernelError::MalformedBundle(format!("missing {ZIP_FIELD}"))
            })?;
            let contents = BASE64_STANDARD
                .decode(encoded)
                .map_err(|e| KernelError::MalformedBundle(format!("bad {ZIP_FIELD}: {e}")))?;
            let digest = hex::encode(Sha512::digest(&contents));
            if let Some(declared) = self.get(ZIP_DIGEST_FIELD) {
                if declared != digest {
                    return Err(KernelError::MalformedBundle(format!(
                        "{ZIP_DIGEST_FIELD} does not match contents"
                    )));
                }
            }
            Ok(format!("b1-{digest}"))
        } else {
            if self.get(SOURCE_FIELD).is_none() {
                return Err(KernelError::MalformedBundle(format!(
                    "missing {SOURCE_FIELD}"
                )));
            }
            Ok(format!("b0-{}", hex::encode(Sha512::digest(self.canonical_bytes()?))))
        }
    }

    pub fn to_worker_code(&self, bundle_id: &str) -> KernelResult<WorkerCode> {
        let module_format = self.module_format()?.to_string();
        let field = if module_format == ZIP_FORMAT {
            ZIP_FIELD
        } else {
            SOURCE_FIELD
        };
        let source = self
            .get(field)
            .ok_or_else(|| KernelError::MalformedBundle(format!("missing {field}")))?
            .to_string();
        Ok(WorkerCode {
            bundle_id: bundle_id.to_string(),
            module_format,
            source,
        })
    }

    fn canonical_bytes(&self) -> KernelResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.fields)?)
    }
}

/// Resolves a bundle id to code a fresh worker can evaluate.
pub trait BundleHandler: Send + Sync {
    fn worker_code(&self, bundle_id: &str) -> KernelResult<WorkerCode>;
}

fn bundle_key(bundle_id: &str) -> String {
    format!("bundle.{bundle_id}")
}

/// Installed bundles: `bundle.<id>` maps to the hash of the bundle blob.
#[derive(Debug, Clone)]
pub struct BundleStore {
    storage: KernelStorage,
}

impl BundleStore {
    pub fn new(storage: KernelStorage) -> Self {
        Self { storage }
    }

    /// Install a bundle, returning its id. Installing the same content twice
    /// is a no-op. An `alleged_id` that differs from the computed id is rejected.
    pub fn add_bundle(&self, bundle: &Bundle, alleged_id: Option<&str>) -> KernelResult<String> {
        let bundle_id = bundle.compute_id()?;
        if let Some(alleged) = alleged_id {
            if alleged != bundle_id {
                return Err(KernelError::BundleIdMismatch {
                    alleged: alleged.to_string(),
                    computed: bundle_id,
                });
            }
        }
        if self.has_bundle(&bundle_id)? {
            return Ok(bundle_id);
        }
        let hash = self.storage.put_blob(&bundle.canonical_bytes()?)?;
        self.storage.set(&bundle_key(&bundle_id), &hash.to_hex())?;
        log::debug!("installed bundle {bundle_id}");
        Ok(bundle_id)
    }

    pub fn has_bundle(&self, bundle_id: &str) -> KernelResult<bool> {
        self.storage.has(&bundle_key(bundle_id))
    }

    pub fn get_bundle(&self, bundle_id: &str) -> KernelResult<Bundle> {
        let hash = self.blob_hash(bundle_id)?;
        let bytes = self.storage.blobs().get_blob(hash)?;
        let bundle: Bundle = serde_json::from_slice(&bytes)?;
        let computed = bundle.compute_id()?;
        if computed != bundle_id {
            return Err(KernelError::BundleIdMismatch {
                alleged: bundle_id.to_string(),
                computed,
            });
        }
        Ok(bundle)
    }

    pub fn delete_bundle(&self, bundle_id: &str) -> KernelResult<()> {
        let hash = self.blob_hash(bundle_id)?;
        self.storage.delete(&bundle_key(bundle_id))?;
        self.storage.delete_blob_on_commit(hash);
        Ok(())
    }

    pub fn bundle_ids(&self) -> KernelResult<Vec<String>> {
        Ok(self
            .storage
            .keys_with_prefix("bundle.")?
            .into_iter()
            .filter_map(|key| key.strip_prefix("bundle.").map(str::to_string))
            .collect())
    }

    pub fn blob_hash(&self, bundle_id: &str) -> KernelResult<Hash> {
        let raw = self
            .storage
            .get(&bundle_key(bundle_id))?
            .ok_or_else(|| KernelError::BundleNotFound(bundle_id.to_string()))?;
        Hash::from_hex_str(&raw)
            .map_err(|e| KernelError::MalformedBundle(format!("bad blob hash for {bundle_id}: {e}")))
    }
}

impl BundleHandler for BundleStore {
    fn worker_code(&self, bundle_id: &str) -> KernelResult<WorkerCode> {
        self.get_bundle(bundle_id)?.to_worker_code(bundle_id)
    }
}
