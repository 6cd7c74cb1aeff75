//! Remote-write request handling: routing, replication, quorum.
//!
//! A request with replica index 0 is a fresh client write: the receiving
//! node fans every series out to its `replication_factor` destinations,
//! appending locally where it is itself a destination and forwarding
//! otherwise with the destination's replica index (1-based) attached.
//! A request with a non-zero replica index is an internal forward and is
//! only appended locally. The write succeeds when every series reached a
//! quorum of `(rf + 1) / 2` destinations; a shortfall is retryable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{format_err, Error};
use futures::stream::{self, StreamExt};
use prost::Message;

use super::hashring::Hashring;
use super::writer::TsdbWriter;
use crate::labels::Labels;
use crate::store::proto::{self, WriteRequest};

pub const TENANT_HEADER: &str = "CAIRN-TENANT";
pub const REPLICA_HEADER: &str = "CAIRN-REPLICA";

pub const DEFAULT_FORWARD_CONCURRENCY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    /// receiver is starting or reloading its hashring; retry after a pause
    #[error("receiver is not ready")]
    NotReady,
    #[error("invalid write request: {0}")]
    Validation(String),
    /// out-of-order or conflicting duplicate samples
    #[error("conflicting write: {0}")]
    Conflict(String),
    /// too few replicas acknowledged; the client retries
    #[error("write quorum not reached: needed {needed}, got {got}")]
    QuorumFailed { needed: usize, got: usize },
    #[error(transparent)]
    Internal(#[from] Error),
}

/// Forwards a batch to a peer receiver. Implemented over HTTP; tests mock.
pub trait WriteForwarder: Send + Sync {
    fn forward<'a>(
        &'a self,
        endpoint: &'a str,
        tenant: &'a str,
        replica: i64,
        request: &'a WriteRequest,
    ) -> futures::future::BoxFuture<'a, Result<(), Error>>;
}

/// HTTP forwarder posting protobuf bodies to peer `/api/v1/receive`.
pub struct HttpForwarder {
    client: hyper::Client<hyper::client::HttpConnector>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        Self { client: hyper::Client::new(), timeout }
    }
}

impl WriteForwarder for HttpForwarder {
    fn forward<'a>(
        &'a self,
        endpoint: &'a str,
        tenant: &'a str,
        replica: i64,
        request: &'a WriteRequest,
    ) -> futures::future::BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            let uri = format!("{}/api/v1/receive", endpoint.trim_end_matches('/'));
            let body = request.encode_to_vec();
            let http_request = hyper::Request::builder()
                .method("POST")
                .uri(&uri)
                .header(hyper::header::CONTENT_TYPE, "application/x-protobuf")
                .header(TENANT_HEADER, tenant)
                .header(REPLICA_HEADER, replica.to_string())
                .body(hyper::Body::from(body))?;

            let response = tokio::time::timeout(self.timeout, self.client.request(http_request))
                .await
                .map_err(|_| format_err!("forward to {} timed out", endpoint))??;
            let status = response.status();
            if !status.is_success() {
                anyhow::bail!("forward to {} failed with status {}", endpoint, status);
            }
            Ok(())
        })
    }
}

pub struct ReceiverConfig {
    /// this node's endpoint as listed in the hashring
    pub local_endpoint: String,
    pub default_tenant: String,
    pub replication_factor: usize,
    pub forward_concurrency: usize,
}

impl ReceiverConfig {
    pub fn new(local_endpoint: String) -> Self {
        Self {
            local_endpoint,
            default_tenant: "default-tenant".to_string(),
            replication_factor: 1,
            forward_concurrency: DEFAULT_FORWARD_CONCURRENCY,
        }
    }
}

pub struct Receiver {
    config: ReceiverConfig,
    writer: Arc<TsdbWriter>,
    forwarder: Arc<dyn WriteForwarder>,
    hashring: std::sync::RwLock<Arc<Hashring>>,
}

impl Receiver {
    pub fn new(
        config: ReceiverConfig,
        writer: Arc<TsdbWriter>,
        forwarder: Arc<dyn WriteForwarder>,
        hashring: Hashring,
    ) -> Self {
        Self {
            config,
            writer,
            forwarder,
            hashring: std::sync::RwLock::new(Arc::new(hashring)),
        }
    }

    pub fn writer(&self) -> &Arc<TsdbWriter> {
        &self.writer
    }

    pub fn tenant_or_default<'a>(&'a self, tenant: Option<&'a str>) -> &'a str {
        match tenant {
            Some(t) if !t.is_empty() => t,
            _ => &self.config.default_tenant,
        }
    }

    fn ring(&self) -> Arc<Hashring> {
        Arc::clone(&self.hashring.read().unwrap())
    }

    /// Handle one write. `replica` comes from the replica header, 0 for
    /// fresh client writes.
    pub async fn receive(
        &self,
        tenant: &str,
        replica: i64,
        request: &WriteRequest,
    ) -> Result<(), WriteError> {
        if !self.writer.ready() {
            return Err(WriteError::NotReady);
        }
        if replica < 0 || replica as usize > self.config.replication_factor {
            return Err(WriteError::Validation(format!(
                "replica index {} outside replication factor {}",
                replica, self.config.replication_factor
            )));
        }
        if request.timeseries.is_empty() {
            return Ok(());
        }

        if replica > 0 {
            // already-replicated internal forward: append locally only
            return self.append_all(tenant, &request.timeseries).await;
        }
        self.replicate(tenant, request).await
    }

    async fn append_all(
        &self,
        tenant: &str,
        timeseries: &[proto::TimeSeries],
    ) -> Result<(), WriteError> {
        for ts in timeseries {
            let labels = parse_series_labels(ts)?;
            let samples: Vec<(i64, f64)> =
                ts.samples.iter().map(|s| (s.timestamp, s.value)).collect();
            self.writer
                .append(tenant, &labels, &samples)
                .await
                .map_err(|err| WriteError::Conflict(err.to_string()))?;
        }
        Ok(())
    }

    /// Fan a fresh write out across the hashring and enforce quorum.
    async fn replicate(&self, tenant: &str, request: &WriteRequest) -> Result<(), WriteError> {
        let ring = self.ring();
        let rf = self.config.replication_factor;
        let quorum = rf / 2 + 1;

        // batch per (endpoint, replica index); series order is preserved
        // within a batch
        let mut batches: HashMap<(String, i64), Vec<usize>> = HashMap::new();
        for (series_idx, ts) in request.timeseries.iter().enumerate() {
            let labels = parse_series_labels(ts)?;
            let endpoints = ring
                .endpoints_for(tenant, &labels, rf)
                .map_err(|err| WriteError::Validation(err.to_string()))?;
            for (replica_idx, endpoint) in endpoints.into_iter().enumerate() {
                batches
                    .entry((endpoint, replica_idx as i64 + 1))
                    .or_default()
                    .push(series_idx);
            }
        }

        // per-series success counters filled by local and remote batches
        let mut successes = vec![0usize; request.timeseries.len()];

        let mut remote = Vec::new();
        for ((endpoint, replica), series_idxs) in batches {
            if endpoint == self.config.local_endpoint {
                let local_series: Vec<proto::TimeSeries> = series_idxs
                    .iter()
                    .map(|&i| request.timeseries[i].clone())
                    .collect();
                match self.append_all(tenant, &local_series).await {
                    Ok(()) => {
                        for &i in &series_idxs {
                            successes[i] += 1;
                        }
                    }
                    Err(err) => log::warn!("local append failed: {}", err),
                }
            } else {
                remote.push((endpoint, replica, series_idxs));
            }
        }

        let forwarder = Arc::clone(&self.forwarder);
        let results: Vec<(Vec<usize>, Result<(), Error>)> =
            stream::iter(remote.into_iter().map(|(endpoint, replica, series_idxs)| {
                let forwarder = Arc::clone(&forwarder);
                let sub_request = WriteRequest {
                    timeseries: series_idxs
                        .iter()
                        .map(|&i| request.timeseries[i].clone())
                        .collect(),
                    tenant: tenant.to_string(),
                    replica,
                };
                async move {
                    let result = forwarder
                        .forward(&endpoint, tenant, replica, &sub_request)
                        .await;
                    if let Err(err) = &result {
                        log::warn!("forward to {} failed: {}", endpoint, err);
                    }
                    (series_idxs, result)
                }
            }))
            .buffer_unordered(self.config.forward_concurrency.max(1))
            .collect()
            .await;

        for (series_idxs, result) in results {
            if result.is_ok() {
                for i in series_idxs {
                    successes[i] += 1;
                }
            }
        }

        let worst = successes.iter().copied().min().unwrap_or(0);
        if worst < quorum {
            return Err(WriteError::QuorumFailed { needed: quorum, got: worst });
        }
        Ok(())
    }

    /// Hashring reload: close the gate, flush and hand blocks to the
    /// shipper, swap the ring, reopen. Writes during the swap fail fast
    /// with a retry hint.
    pub async fn reload_hashring<F, Fut>(
        &self,
        new_ring: Hashring,
        wall_clock_ms: u64,
        ship: F,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), Error>>,
    {
        self.writer.set_ready(false);
        let result = async {
            let sealed = self.writer.flush(wall_clock_ms).await?;
            log::info!("hashring reload: sealed {} blocks", sealed.len());
            ship().await?;
            *self.hashring.write().unwrap() = Arc::new(new_ring);
            Ok(())
        }
        .await;
        // reopen regardless; a failed ship retries on the shipper tick
        self.writer.set_ready(true);
        result
    }
}

fn parse_series_labels(ts: &proto::TimeSeries) -> Result<Labels, WriteError> {
    let labels = proto::labels_from_proto(&ts.labels)
        .map_err(|err| WriteError::Validation(err.to_string()))?;
    if labels.is_empty() {
        return Err(WriteError::Validation("series without labels".to_string()));
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receive::hashring::HashringEntry;
    use crate::store::proto::{LabelPair, Sample, TimeSeries};
    use std::sync::Mutex;

    /// Records forwards; endpoints listed in `down` fail.
    struct MockForwarder {
        forwards: Mutex<Vec<(String, i64, usize)>>,
        down: Vec<String>,
    }

    impl MockForwarder {
        fn new(down: Vec<String>) -> Arc<Self> {
            Arc::new(Self { forwards: Mutex::new(Vec::new()), down })
        }
    }

    impl WriteForwarder for MockForwarder {
        fn forward<'a>(
            &'a self,
            endpoint: &'a str,
            _tenant: &'a str,
            replica: i64,
            request: &'a WriteRequest,
        ) -> futures::future::BoxFuture<'a, Result<(), Error>> {
            Box::pin(async move {
                if self.down.iter().any(|d| d == endpoint) {
                    anyhow::bail!("endpoint {} is down", endpoint);
                }
                self.forwards.lock().unwrap().push((
                    endpoint.to_string(),
                    replica,
                    request.timeseries.len(),
                ));
                Ok(())
            })
        }
    }

    fn ring(endpoints: &[&str]) -> Hashring {
        Hashring::new(vec![HashringEntry {
            hashring: None,
            tenants: Vec::new(),
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        }])
        .unwrap()
    }

    fn write_request(series: &[(&str, &[(i64, f64)])]) -> WriteRequest {
        WriteRequest {
            timeseries: series
                .iter()
                .map(|(job, samples)| TimeSeries {
                    labels: vec![
                        LabelPair { name: "__name__".into(), value: "up".into() },
                        LabelPair { name: "job".into(), value: job.to_string() },
                    ],
                    samples: samples
                        .iter()
                        .map(|&(t, v)| Sample { value: v, timestamp: t })
                        .collect(),
                })
                .collect(),
            tenant: String::new(),
            replica: 0,
        }
    }

    fn receiver(
        local: &str,
        endpoints: &[&str],
        rf: usize,
        forwarder: Arc<MockForwarder>,
    ) -> (Receiver, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let writer = Arc::new(TsdbWriter::new(tmp.path().to_owned(), Labels::empty()));
        writer.set_ready(true);
        let mut config = ReceiverConfig::new(local.to_string());
        config.replication_factor = rf;
        (
            Receiver::new(config, writer, forwarder, ring(endpoints)),
            tmp,
        )
    }

    #[tokio::test]
    async fn test_not_ready_fails_fast() {
        let forwarder = MockForwarder::new(Vec::new());
        let (receiver, _tmp) = receiver("http://n0", &["http://n0"], 1, forwarder);
        receiver.writer.set_ready(false);

        match receiver.receive("t", 0, &write_request(&[("a", &[(0, 1.0)])])).await {
            Err(WriteError::NotReady) => {}
            other => panic!("expected not-ready, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_single_node_local_write() {
        let forwarder = MockForwarder::new(Vec::new());
        let (receiver, _tmp) = receiver("http://n0", &["http://n0"], 1, forwarder.clone());

        receiver
            .receive("t", 0, &write_request(&[("a", &[(0, 1.0), (1000, 2.0)])]))
            .await
            .unwrap();

        assert!(forwarder.forwards.lock().unwrap().is_empty());
        let sealed = receiver.writer.flush(5_000).await.unwrap();
        assert_eq!(sealed.len(), 1);
    }

    #[tokio::test]
    async fn test_replication_forwards_with_replica_index() {
        let forwarder = MockForwarder::new(Vec::new());
        let (receiver, _tmp) = receiver(
            "http://n0",
            &["http://n0", "http://n1", "http://n2"],
            3,
            forwarder.clone(),
        );

        receiver
            .receive("t", 0, &write_request(&[("a", &[(0, 1.0)])]))
            .await
            .unwrap();

        let forwards = forwarder.forwards.lock().unwrap();
        // two of three destinations are remote
        assert_eq!(forwards.len(), 2);
        for (endpoint, replica, _) in forwards.iter() {
            assert_ne!(endpoint, "http://n0");
            assert!(*replica >= 1 && *replica <= 3);
        }
    }

    #[tokio::test]
    async fn test_forwarded_write_stays_local() {
        let forwarder = MockForwarder::new(Vec::new());
        let (receiver, _tmp) = receiver(
            "http://n0",
            &["http://n0", "http://n1", "http://n2"],
            3,
            forwarder.clone(),
        );

        receiver
            .receive("t", 2, &write_request(&[("a", &[(0, 1.0)])]))
            .await
            .unwrap();
        assert!(forwarder.forwards.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quorum_tolerates_one_down_of_three() {
        // rf=3, quorum=2: one dead endpoint is survivable
        let forwarder = MockForwarder::new(vec!["http://n1".to_string()]);
        let (receiver, _tmp) = receiver(
            "http://n0",
            &["http://n0", "http://n1", "http://n2"],
            3,
            forwarder,
        );

        receiver
            .receive("t", 0, &write_request(&[("a", &[(0, 1.0)])]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_quorum_shortfall_is_reported() {
        // rf=3, quorum=2: two dead endpoints fail the write whenever the
        // series lands on this node plus the two dead ones
        let forwarder =
            MockForwarder::new(vec!["http://n1".to_string(), "http://n2".to_string()]);
        let (receiver, _tmp) = receiver(
            "http://n0",
            &["http://n0", "http://n1", "http://n2"],
            3,
            forwarder,
        );

        match receiver.receive("t", 0, &write_request(&[("a", &[(0, 1.0)])])).await {
            Err(WriteError::QuorumFailed { needed, got }) => {
                assert_eq!(needed, 2);
                assert_eq!(got, 1);
            }
            other => panic!("expected quorum failure, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_replica_index_validation() {
        let forwarder = MockForwarder::new(Vec::new());
        let (receiver, _tmp) = receiver("http://n0", &["http://n0"], 1, forwarder);

        match receiver.receive("t", 5, &write_request(&[("a", &[(0, 1.0)])])).await {
            Err(WriteError::Validation(_)) => {}
            other => panic!("expected validation error, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_reload_sequence_gates_writes() {
        let forwarder = MockForwarder::new(Vec::new());
        let (receiver, _tmp) = receiver("http://n0", &["http://n0"], 1, forwarder);

        receiver
            .receive("t", 0, &write_request(&[("a", &[(0, 1.0)])]))
            .await
            .unwrap();

        let shipped = Arc::new(Mutex::new(false));
        let shipped2 = Arc::clone(&shipped);
        receiver
            .reload_hashring(ring(&["http://n0", "http://n9"]), 9_000, move || async move {
                *shipped2.lock().unwrap() = true;
                Ok(())
            })
            .await
            .unwrap();

        assert!(*shipped.lock().unwrap());
        assert!(receiver.writer.ready());
        // the new ring is active
        assert_eq!(receiver.ring().all_endpoints().len(), 2);
    }
}
