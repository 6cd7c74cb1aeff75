//! The receiver's local TSDB writer.
//!
//! One in-memory head per tenant, owned behind a readiness gate. Writes
//! fail fast while the gate is closed (startup, hashring reload). Flushing
//! seals every head into a level-1 block under `<dir>/<tenant>/<ulid>/`
//! with the tenant recorded in the block's external labels.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Error;

use crate::labels::{Label, Labels};
use crate::tsdb::Head;

/// Label carrying the tenant in block metadata.
pub const TENANT_LABEL: &str = "tenant_id";

pub struct TsdbWriter {
    dir: PathBuf,
    external_labels: Labels,
    ready: AtomicBool,
    heads: tokio::sync::RwLock<HashMap<String, Head>>,
}

impl TsdbWriter {
    pub fn new(dir: PathBuf, external_labels: Labels) -> Self {
        Self {
            dir,
            external_labels,
            ready: AtomicBool::new(false),
            heads: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append samples of one series. The TSDB rejects out-of-order and
    /// conflicting-duplicate samples; those surface as conflicts upstream.
    pub async fn append(
        &self,
        tenant: &str,
        labels: &Labels,
        samples: &[(i64, f64)],
    ) -> Result<(), Error> {
        if !self.ready() {
            anyhow::bail!("writer is not ready");
        }
        let mut heads = self.heads.write().await;
        let head = heads.entry(tenant.to_string()).or_insert_with(Head::new);
        for &(t, v) in samples {
            head.append(labels.clone(), t, v)?;
        }
        Ok(())
    }

    /// Seal every non-empty head into a block directory. Returns the sealed
    /// block directories. Heads restart empty.
    pub async fn flush(&self, wall_clock_ms: u64) -> Result<Vec<PathBuf>, Error> {
        let mut heads = self.heads.write().await;
        let mut sealed = Vec::new();
        for (tenant, head) in heads.iter_mut() {
            let mut ext = self.external_labels.clone();
            ext = ext.merge(&Labels::new(vec![Label::new(TENANT_LABEL, tenant.clone())])?);
            let tenant_dir = self.dir.join(tenant);
            if let Some((dir, meta)) = head.seal(&tenant_dir, ext, wall_clock_ms)? {
                log::info!("tenant {}: sealed block {}", tenant, meta.ulid);
                sealed.push(dir);
            }
        }
        Ok(sealed)
    }

    /// Tenant directories holding sealed blocks, for the shipper.
    pub fn tenant_dirs(&self) -> Result<Vec<PathBuf>, Error> {
        let mut out = Vec::new();
        if !self.dir.exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }
}
