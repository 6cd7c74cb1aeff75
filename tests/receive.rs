//! Receiver cluster end to end: HTTP ingest, hashring replication over
//! real sockets, shipping, federated query with replica dedup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cairn::block::fetcher::MetaFetcher;
use cairn::block::index_cache::CacheIndexCache;
use cairn::labels::{Labels, Matcher, MatcherType};
use cairn::objstore::{BucketConfig, ObjectBucket};
use cairn::query::{HttpStoreClient, QueryFederator, SelectOptions, StoreClient};
use cairn::receive::{Hashring, HashringEntry, HttpForwarder, Receiver, ReceiverConfig, TsdbWriter};
use cairn::server::{self, ReceiverServer};
use cairn::shipper::Shipper;
use cairn::store::proto::{LabelPair, Sample, TimeSeries, WriteRequest};
use cairn::store::{BucketStore, BucketStoreConfig};
use prost::Message;
use tokio_util::sync::CancellationToken;

/// Reserve loopback ports for a deterministic hashring.
fn reserve_ports(n: usize) -> Vec<SocketAddr> {
    let listeners: Vec<std::net::TcpListener> = (0..n)
        .map(|_| std::net::TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners.iter().map(|l| l.local_addr().unwrap()).collect()
}

struct Node {
    receiver: Arc<Receiver>,
    shipper: Arc<Shipper>,
    endpoint: String,
    _tsdb_dir: tempfile::TempDir,
}

fn spawn_receiver(
    addr: SocketAddr,
    endpoints: &[String],
    replication_factor: usize,
    replica_name: &str,
    bucket: Arc<dyn ObjectBucket>,
    hashring_file: &std::path::Path,
    shutdown: CancellationToken,
) -> Node {
    let tsdb_dir = tempfile::tempdir().unwrap();
    let external =
        Labels::from_pairs(vec![("receive_replica".to_string(), replica_name.to_string())])
            .unwrap();
    let writer = Arc::new(TsdbWriter::new(tsdb_dir.path().to_owned(), external));
    writer.set_ready(true);

    let endpoint = format!("http://{}", addr);
    let mut config = ReceiverConfig::new(endpoint.clone());
    config.replication_factor = replication_factor;

    let ring = Hashring::new(vec![HashringEntry {
        hashring: None,
        tenants: Vec::new(),
        endpoints: endpoints.to_vec(),
    }])
    .unwrap();

    let receiver = Arc::new(Receiver::new(
        config,
        writer,
        Arc::new(HttpForwarder::new(Duration::from_secs(5))),
        ring,
    ));
    let shipper = Arc::new(Shipper::new(bucket, tsdb_dir.path().to_owned()).unwrap());

    let state = Arc::new(ReceiverServer {
        receiver: Arc::clone(&receiver),
        shipper: Arc::clone(&shipper),
        hashring_path: hashring_file.to_owned(),
    });
    server::spawn_server(addr, server::receive_handler(state), shutdown).unwrap();

    Node { receiver, shipper, endpoint, _tsdb_dir: tsdb_dir }
}

fn write_request(job: &str, samples: &[(i64, f64)]) -> WriteRequest {
    WriteRequest {
        timeseries: vec![TimeSeries {
            labels: vec![
                LabelPair { name: "__name__".into(), value: "up".into() },
                LabelPair { name: "job".into(), value: job.to_string() },
            ],
            samples: samples.iter().map(|&(t, v)| Sample { value: v, timestamp: t }).collect(),
        }],
        tenant: String::new(),
        replica: 0,
    }
}

async fn post_write(endpoint: &str, tenant: &str, request: &WriteRequest) -> hyper::StatusCode {
    let client = hyper::Client::new();
    let http_request = hyper::Request::builder()
        .method("POST")
        .uri(format!("{}/api/v1/receive", endpoint))
        .header("CAIRN-TENANT", tenant)
        .body(hyper::Body::from(request.encode_to_vec()))
        .unwrap();
    client.request(http_request).await.unwrap().status()
}

#[tokio::test(flavor = "multi_thread")]
async fn replicated_write_roundtrip() {
    let bucket_dir = tempfile::tempdir().unwrap();
    let bucket = cairn::objstore::create_bucket(&BucketConfig::Filesystem {
        directory: bucket_dir.path().join("bucket"),
    })
    .unwrap();

    let addrs = reserve_ports(2);
    let endpoints: Vec<String> = addrs.iter().map(|a| format!("http://{}", a)).collect();

    let ring_file = bucket_dir.path().join("hashrings.json");
    std::fs::write(
        &ring_file,
        serde_json::to_vec(&serde_json::json!([{ "endpoints": endpoints }])).unwrap(),
    )
    .unwrap();

    let shutdown = CancellationToken::new();
    let node0 = spawn_receiver(
        addrs[0],
        &endpoints,
        2,
        "r0",
        Arc::clone(&bucket),
        &ring_file,
        shutdown.clone(),
    );
    let node1 = spawn_receiver(
        addrs[1],
        &endpoints,
        2,
        "r1",
        Arc::clone(&bucket),
        &ring_file,
        shutdown.clone(),
    );

    // destination pair is deterministic: hashing the canonical labelset
    // twice yields the same endpoints
    let labels = Labels::from_pairs(vec![("__name__", "up"), ("job", "api")]).unwrap();
    let ring = Hashring::new(vec![HashringEntry {
        hashring: None,
        tenants: Vec::new(),
        endpoints: endpoints.clone(),
    }])
    .unwrap();
    let pair_a = ring.endpoints_for("t1", &labels, 2).unwrap();
    let pair_b = ring.endpoints_for("t1", &labels, 2).unwrap();
    assert_eq!(pair_a, pair_b);
    assert_eq!(pair_a.len(), 2);

    // a write against either node replicates to both
    let samples: Vec<(i64, f64)> = (0..100).map(|i| (i * 1000, i as f64)).collect();
    let status = post_write(&node0.endpoint, "t1", &write_request("api", &samples)).await;
    assert_eq!(status, hyper::StatusCode::OK);

    // flush both and ship into the shared bucket
    for node in [&node0, &node1] {
        node.receiver.writer().flush(60_000).await.unwrap();
        node.shipper.ship_once().await.unwrap();
    }

    // one block per replica
    let store = {
        let fetcher = Arc::new(MetaFetcher::new(Arc::clone(&bucket), Vec::new()));
        let cache = Arc::new(CacheIndexCache::in_memory(64 * 1024 * 1024, 1024 * 1024));
        Arc::new(BucketStore::new(
            Arc::clone(&bucket),
            fetcher,
            cache,
            BucketStoreConfig::default(),
        ))
    };
    store.sync_blocks().await.unwrap();
    assert_eq!(store.block_count(), 2);

    // serve the gateway over HTTP and query through the federator with
    // dedup on the replica label
    let store_ready = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let store_addr = server::spawn_server(
        "127.0.0.1:0".parse().unwrap(),
        server::store_handler(store, store_ready),
        shutdown.clone(),
    )
    .unwrap();

    let client: Arc<dyn StoreClient> =
        Arc::new(HttpStoreClient::new(format!("http://{}", store_addr)));
    let federator = QueryFederator::new(vec![client], "receive_replica".to_string());

    let matchers = vec![Matcher::new(MatcherType::Eq, "__name__", "up").unwrap()];
    let (series, warnings) = federator
        .select(&matchers, 0, 200_000, &SelectOptions::default())
        .await
        .unwrap();

    assert!(warnings.is_empty());
    assert_eq!(series.len(), 1, "replicas deduplicate into one series");
    assert!(!series[0].labels.has("receive_replica"));
    // exactly one sample per timestamp
    assert_eq!(series[0].samples.len(), 100);
    for (got, want) in series[0].samples.iter().zip(samples.iter()) {
        assert_eq!(got, want);
    }

    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn quorum_shortfall_returns_retryable_status() {
    let bucket_dir = tempfile::tempdir().unwrap();
    let bucket = cairn::objstore::create_bucket(&BucketConfig::Filesystem {
        directory: bucket_dir.path().join("bucket"),
    })
    .unwrap();

    // two endpoints in the ring, only one running: rf=2 needs both
    let addrs = reserve_ports(2);
    let endpoints: Vec<String> = addrs.iter().map(|a| format!("http://{}", a)).collect();
    let ring_file = bucket_dir.path().join("hashrings.json");
    std::fs::write(
        &ring_file,
        serde_json::to_vec(&serde_json::json!([{ "endpoints": endpoints }])).unwrap(),
    )
    .unwrap();

    let shutdown = CancellationToken::new();
    let node0 = spawn_receiver(
        addrs[0],
        &endpoints,
        2,
        "r0",
        Arc::clone(&bucket),
        &ring_file,
        shutdown.clone(),
    );

    let status = post_write(&node0.endpoint, "t1", &write_request("api", &[(0, 1.0)])).await;
    assert_eq!(status, hyper::StatusCode::SERVICE_UNAVAILABLE);

    shutdown.cancel();
}
