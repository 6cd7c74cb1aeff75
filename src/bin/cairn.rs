//! Component launcher: `cairn <store|receive|compact> ...`.
//!
//! Flag surface is deliberately minimal; anything interesting lives in the
//! library configuration types.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Error};
use tokio_util::sync::CancellationToken;

use cairn::block::fetcher::{DeduplicationFilter, DeletionMarkFilter, MetaFetcher};
use cairn::block::index_cache::CacheIndexCache;
use cairn::compact::{Compactor, CompactorConfig};
use cairn::objstore::caching::{
    match_component, match_suffix, CachingBucket, DEFAULT_CHUNK_SUBRANGE_SIZE,
    DEFAULT_INDEX_SUBRANGE_SIZE, DEFAULT_MAX_SUB_REQUESTS,
};
use cairn::objstore::{self, BucketConfig, ObjectBucket};
use cairn::receive::{Hashring, HashringWatcher, HttpForwarder, Receiver, ReceiverConfig, TsdbWriter};
use cairn::server;
use cairn::shipper::Shipper;
use cairn::store::{BucketStore, BucketStoreConfig};

fn usage() -> ! {
    eprintln!("usage: cairn store   <bucket-dir> [listen-addr]");
    eprintln!("       cairn receive <bucket-dir> <tsdb-dir> <hashring-file> <local-endpoint> [listen-addr]");
    eprintln!("       cairn compact <bucket-dir> <work-dir>");
    std::process::exit(2);
}

fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        log::info!("shutdown requested, draining");
        trigger.cancel();
    });
    token
}

fn open_bucket(dir: &str) -> Result<Arc<dyn ObjectBucket>, Error> {
    let config = BucketConfig::Filesystem { directory: PathBuf::from(dir) };
    Ok(objstore::create_bucket(&config)?)
}

async fn run_store(args: &[String]) -> Result<(), Error> {
    let bucket_dir = args.first().map(String::as_str).unwrap_or_else(|| usage());
    let listen = args.get(1).map(String::as_str).unwrap_or("0.0.0.0:10901");

    let backing = open_bucket(bucket_dir)?;
    let meta_cache = cairn::objstore::cache::create_cache(&cairn::objstore::cache::CacheConfig::InMemory {
        max_bytes: 64 * 1024 * 1024,
        max_item_bytes: 1024 * 1024,
    });
    let range_cache = cairn::objstore::cache::create_cache(&cairn::objstore::cache::CacheConfig::InMemory {
        max_bytes: 512 * 1024 * 1024,
        max_item_bytes: 16 * 1024 * 1024,
    });
    let bucket: Arc<dyn ObjectBucket> = Arc::new(
        CachingBucket::new(backing)
            .cache_exists(
                match_suffix("meta.json"),
                Arc::clone(&meta_cache),
                Duration::from_secs(120),
                Duration::from_secs(15),
            )
            .cache_get(
                match_suffix("meta.json"),
                Arc::clone(&meta_cache),
                1024 * 1024,
                Duration::from_secs(120),
                Duration::from_secs(120),
                Duration::from_secs(15),
            )
            .cache_get_range(
                match_component("/chunks/"),
                Arc::clone(&range_cache),
                DEFAULT_CHUNK_SUBRANGE_SIZE,
                Duration::from_secs(24 * 3600),
                Duration::from_secs(24 * 3600),
                DEFAULT_MAX_SUB_REQUESTS,
            )
            .cache_get_range(
                match_suffix("/index"),
                range_cache,
                DEFAULT_INDEX_SUBRANGE_SIZE,
                Duration::from_secs(24 * 3600),
                Duration::from_secs(24 * 3600),
                DEFAULT_MAX_SUB_REQUESTS,
            ),
    );

    let deletion_filter = Arc::new(DeletionMarkFilter::new(
        Arc::clone(&bucket),
        Duration::from_secs(0),
    ));
    let fetcher = Arc::new(MetaFetcher::new(
        Arc::clone(&bucket),
        vec![
            Box::new(ArcMetaFilter(deletion_filter)),
            Box::new(ArcMetaFilter(Arc::new(DeduplicationFilter::new()))),
        ],
    ));
    let index_cache = Arc::new(CacheIndexCache::in_memory(256 * 1024 * 1024, 4 * 1024 * 1024));
    let store = Arc::new(BucketStore::new(
        bucket,
        fetcher,
        index_cache,
        BucketStoreConfig::default(),
    ));

    store.sync_blocks().await?;
    log::info!("initial sync done, {} blocks", store.block_count());

    let ready = Arc::new(AtomicBool::new(true));
    let shutdown = shutdown_token();

    // periodic resync and header housekeeping
    let sync_store = Arc::clone(&store);
    let sync_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sync_shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(180)) => {}
            }
            if let Err(err) = sync_store.sync_blocks().await {
                log::warn!("block sync failed: {}", err);
            }
            sync_store.release_idle_headers();
        }
    });

    server::run_server(listen.parse()?, server::store_handler(store, ready), shutdown).await
}

async fn run_receive(args: &[String]) -> Result<(), Error> {
    if args.len() < 4 {
        usage();
    }
    let bucket = open_bucket(&args[0])?;
    let tsdb_dir = PathBuf::from(&args[1]);
    let hashring_path = PathBuf::from(&args[2]);
    let local_endpoint = args[3].clone();
    let listen = args.get(4).map(String::as_str).unwrap_or("0.0.0.0:19291");

    let external_labels = cairn::labels::Labels::from_pairs(vec![(
        "receive_replica".to_string(),
        std::env::var("CAIRN_RECEIVE_REPLICA").unwrap_or_else(|_| "0".to_string()),
    )])?;

    let writer = Arc::new(TsdbWriter::new(tsdb_dir.clone(), external_labels));
    let hashring = Hashring::load(&hashring_path)?;

    let mut receiver_config = ReceiverConfig::new(local_endpoint);
    if let Ok(rf) = std::env::var("CAIRN_REPLICATION_FACTOR") {
        receiver_config.replication_factor = rf.parse()?;
    }
    let forwarder = Arc::new(HttpForwarder::new(Duration::from_secs(30)));
    let receiver = Arc::new(Receiver::new(receiver_config, writer, forwarder, hashring));
    receiver.writer().set_ready(true);

    let shipper = Arc::new(Shipper::new(Arc::clone(&bucket), tsdb_dir)?);
    let shutdown = shutdown_token();

    let ship_shipper = Arc::clone(&shipper);
    let ship_shutdown = shutdown.clone();
    tokio::spawn(async move {
        ship_shipper
            .run(cairn::shipper::DEFAULT_SHIP_INTERVAL, ship_shutdown)
            .await;
    });

    // periodic head flush so blocks become shippable
    let flush_receiver = Arc::clone(&receiver);
    let flush_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = flush_shutdown.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(2 * 3600)) => {}
            }
            let now_ms = std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            if let Err(err) = flush_receiver.writer().flush(now_ms).await {
                log::warn!("head flush failed: {}", err);
            }
        }
    });

    // hashring file watcher drives the reload sequence
    let server_state = Arc::new(server::ReceiverServer {
        receiver: Arc::clone(&receiver),
        shipper,
        hashring_path: hashring_path.clone(),
    });
    let watch_state = Arc::clone(&server_state);
    let watch_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut watcher = HashringWatcher::new(hashring_path, Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = watch_shutdown.cancelled() => return,
                changed = watcher.next_change() => match changed {
                    Ok(new_ring) => {
                        log::info!("hashring changed, reloading");
                        let now_ms = std::time::SystemTime::now()
                            .duration_since(std::time::SystemTime::UNIX_EPOCH)
                            .map(|d| d.as_millis() as u64)
                            .unwrap_or(0);
                        let shipper = Arc::clone(&watch_state.shipper);
                        let result = watch_state
                            .receiver
                            .reload_hashring(new_ring, now_ms, move || async move {
                                shipper.ship_once().await.map(|_| ())
                            })
                            .await;
                        if let Err(err) = result {
                            log::error!("hashring reload failed: {}", err);
                        }
                    }
                    Err(err) => log::warn!("hashring watch failed: {}", err),
                },
            }
        }
    });

    let result =
        server::run_server(listen.parse()?, server::receive_handler(server_state), shutdown).await;

    // drain: seal and ship whatever is left
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    if let Err(err) = receiver.writer().flush(now_ms).await {
        log::warn!("final flush failed: {}", err);
    }
    result
}

async fn run_compact(args: &[String]) -> Result<(), Error> {
    if args.len() < 2 {
        usage();
    }
    let bucket = open_bucket(&args[0])?;
    let mut config = CompactorConfig::new(PathBuf::from(&args[1]));
    config.enable_vertical_compaction = std::env::var("CAIRN_VERTICAL_COMPACTION").is_ok();

    let compactor = Compactor::new(bucket, config);
    let shutdown = shutdown_token();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        match compactor.run_once().await {
            Ok(()) => {}
            Err(cairn::compact::CompactError::Halt(reason)) => {
                log::error!("{}", reason);
                // stay alive for inspection; an operator restarts us
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(3600)) => {}
                }
                continue;
            }
            Err(cairn::compact::CompactError::Retry(err)) => {
                log::warn!("compaction iteration failed: {}", err);
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(300)) => {}
        }
    }
}

/// Adapter so shared filters can sit in the fetcher's boxed chain.
struct ArcMetaFilter<F>(Arc<F>);

impl<F: cairn::block::fetcher::MetaFilter> cairn::block::fetcher::MetaFilter for ArcMetaFilter<F> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn filter<'a>(
        &'a self,
        metas: &'a mut cairn::block::fetcher::MetaMap,
    ) -> futures::future::BoxFuture<'a, Result<(), Error>> {
        self.0.filter(metas)
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (command, rest) = match args.split_first() {
        Some((command, rest)) => (command.as_str(), rest),
        None => usage(),
    };

    match command {
        "store" => run_store(rest).await,
        "receive" => run_receive(rest).await,
        "compact" => run_compact(rest).await,
        _ => bail!("unknown command '{}'", command),
    }
}
