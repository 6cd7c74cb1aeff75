//! Consistent hashring routing for the remote-write receiver.
//!
//! The hashring file holds an ordered list of entries, each with an
//! optional tenant list and its endpoints. A write is routed by the first
//! entry matching the tenant (entries without tenants are the catch-all).
//! The destination set for a series is chosen by hashing
//! `tenant + canonical labelset + replica index` and walking the endpoint
//! list until enough distinct endpoints are collected.

use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, format_err, Error};
use serde::Deserialize;
use siphasher::sip::SipHasher13;

use crate::labels::Labels;

/// Fallback poll period when file watching sees no change.
pub const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, Deserialize)]
pub struct HashringEntry {
    #[serde(default)]
    pub hashring: Option<String>,
    #[serde(default)]
    pub tenants: Vec<String>,
    pub endpoints: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct Hashring {
    entries: Vec<HashringEntry>,
}

impl Hashring {
    pub fn new(entries: Vec<HashringEntry>) -> Result<Self, Error> {
        if entries.is_empty() {
            bail!("hashring config holds no entries");
        }
        for entry in &entries {
            if entry.endpoints.is_empty() {
                bail!(
                    "hashring '{}' has no endpoints",
                    entry.hashring.as_deref().unwrap_or("<unnamed>")
                );
            }
        }
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read(path)
            .map_err(|err| format_err!("unable to read hashring file {:?} - {}", path, err))?;
        let entries: Vec<HashringEntry> = serde_json::from_slice(&data)
            .map_err(|err| format_err!("malformed hashring file {:?} - {}", path, err))?;
        Self::new(entries)
    }

    /// The entry responsible for a tenant: first explicit match, then the
    /// first catch-all.
    fn entry_for(&self, tenant: &str) -> Result<&HashringEntry, Error> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.tenants.iter().any(|t| t == tenant))
        {
            return Ok(entry);
        }
        self.entries
            .iter()
            .find(|e| e.tenants.is_empty())
            .ok_or_else(|| format_err!("no hashring matches tenant '{}'", tenant))
    }

    fn hash(tenant: &str, labels: &Labels, replica: u64) -> u64 {
        let mut hasher = SipHasher13::new();
        hasher.write(tenant.as_bytes());
        hasher.write(&labels.canonical_bytes());
        hasher.write(&replica.to_le_bytes());
        hasher.finish()
    }

    /// The `replication_factor` distinct endpoints responsible for a
    /// series, replica index order. Deterministic for fixed inputs.
    pub fn endpoints_for(
        &self,
        tenant: &str,
        labels: &Labels,
        replication_factor: usize,
    ) -> Result<Vec<String>, Error> {
        let entry = self.entry_for(tenant)?;
        let n = entry.endpoints.len();
        if replication_factor > n {
            bail!(
                "replication factor {} exceeds {} endpoints in hashring",
                replication_factor,
                n
            );
        }

        let mut chosen: Vec<String> = Vec::with_capacity(replication_factor);
        for replica in 0..replication_factor as u64 {
            let mut idx = (Self::hash(tenant, labels, replica) % n as u64) as usize;
            // probe forward past endpoints already chosen for lower replicas
            while chosen.contains(&entry.endpoints[idx]) {
                idx = (idx + 1) % n;
            }
            chosen.push(entry.endpoints[idx].clone());
        }
        Ok(chosen)
    }

    pub fn all_endpoints(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .entries
            .iter()
            .flat_map(|e| e.endpoints.iter().cloned())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Mtime-polling watcher over the hashring file. Checks frequently and
/// falls back to a forced reload every `FALLBACK_POLL_INTERVAL` even
/// without an observed change.
pub struct HashringWatcher {
    path: PathBuf,
    poll_interval: Duration,
    last_mtime: Option<SystemTime>,
    last_forced: std::time::Instant,
}

impl HashringWatcher {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
            last_mtime: None,
            last_forced: std::time::Instant::now(),
        }
    }

    /// Wait until the file changes (or the fallback interval expires) and
    /// return the freshly loaded hashring.
    pub async fn next_change(&mut self) -> Result<Hashring, Error> {
        loop {
            tokio::time::sleep(self.poll_interval).await;
            match self.check_once() {
                Ok(Some(ring)) => return Ok(ring),
                Ok(None) => continue,
                Err(err) => {
                    // a malformed or missing file never takes down the
                    // receiver; the previous ring stays active
                    log::warn!("hashring watch: {}", err);
                }
            }
        }
    }

    fn check_once(&mut self) -> Result<Option<Hashring>, Error> {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map_err(|err| format_err!("unable to stat {:?} - {}", self.path, err))?;

        let forced = self.last_forced.elapsed() >= FALLBACK_POLL_INTERVAL;
        let changed = self.last_mtime.map(|last| last != mtime).unwrap_or(true);
        if !changed && !forced {
            return Ok(None);
        }

        let ring = Hashring::load(&self.path)?;
        self.last_mtime = Some(mtime);
        self.last_forced = std::time::Instant::now();
        Ok(Some(ring))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(job: &str) -> Labels {
        Labels::from_pairs(vec![("__name__", "up"), ("job", job)]).unwrap()
    }

    fn ring3() -> Hashring {
        Hashring::new(vec![HashringEntry {
            hashring: Some("default".into()),
            tenants: Vec::new(),
            endpoints: vec![
                "http://n0:19291".into(),
                "http://n1:19291".into(),
                "http://n2:19291".into(),
            ],
        }])
        .unwrap()
    }

    #[test]
    fn test_deterministic_distinct_endpoints() {
        let ring = ring3();
        let a = ring.endpoints_for("t1", &labels("api"), 2).unwrap();
        let b = ring.endpoints_for("t1", &labels("api"), 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_ne!(a[0], a[1]);

        // different series may land elsewhere; full factor covers all
        let all = ring.endpoints_for("t1", &labels("api"), 3).unwrap();
        assert_eq!(all.len(), 3);
        let mut sorted = all.clone();
        sorted.sort();
        assert_eq!(sorted, ring.all_endpoints());
    }

    #[test]
    fn test_tenant_and_labels_affect_placement() {
        let ring = ring3();
        let placements: std::collections::HashSet<String> = (0..50)
            .map(|i| {
                ring.endpoints_for("t1", &labels(&format!("job-{}", i)), 1).unwrap()[0].clone()
            })
            .collect();
        // fifty series spread over more than one endpoint
        assert!(placements.len() > 1);

        let a = ring.endpoints_for("tenant-a", &labels("api"), 1).unwrap();
        let b = ring.endpoints_for("tenant-b", &labels("api"), 1).unwrap();
        // not necessarily different, but computed from tenant too; verify
        // the hash input matters by checking stability
        assert_eq!(a, ring.endpoints_for("tenant-a", &labels("api"), 1).unwrap());
        let _ = b;
    }

    #[test]
    fn test_tenant_routing() {
        let ring = Hashring::new(vec![
            HashringEntry {
                hashring: Some("special".into()),
                tenants: vec!["vip".into()],
                endpoints: vec!["http://vip0".into()],
            },
            HashringEntry {
                hashring: None,
                tenants: Vec::new(),
                endpoints: vec!["http://gen0".into(), "http://gen1".into()],
            },
        ])
        .unwrap();

        assert_eq!(
            ring.endpoints_for("vip", &labels("x"), 1).unwrap(),
            vec!["http://vip0"]
        );
        let general = ring.endpoints_for("other", &labels("x"), 1).unwrap();
        assert!(general[0].starts_with("http://gen"));
    }

    #[test]
    fn test_replication_factor_bounds() {
        let ring = ring3();
        assert!(ring.endpoints_for("t", &labels("x"), 4).is_err());

        assert!(Hashring::new(Vec::new()).is_err());
        assert!(Hashring::new(vec![HashringEntry {
            hashring: None,
            tenants: Vec::new(),
            endpoints: Vec::new(),
        }])
        .is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hashrings.json");
        std::fs::write(
            &path,
            r#"[{"hashring": "default", "endpoints": ["http://a", "http://b"]}]"#,
        )
        .unwrap();

        let ring = Hashring::load(&path).unwrap();
        assert_eq!(ring.all_endpoints().len(), 2);

        std::fs::write(&path, "oops").unwrap();
        assert!(Hashring::load(&path).is_err());
    }
}
