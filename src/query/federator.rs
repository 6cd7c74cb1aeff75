//! Query federation across StoreAPI endpoints.
//!
//! A select fans the request out to every endpoint whose advertised time
//! range and label sets are compatible, merges the returned series streams
//! in label order and deduplicates replicas through the penalty iterator.
//! Endpoint failures become warnings under WARN and errors under ABORT.
//! Dropping the returned future cancels the outstanding fan-out.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Error};
use futures::future::BoxFuture;

use super::dedup::{DedupIterator, DEFAULT_DEDUP_GAP_MS};
use crate::labels::{Labels, Matcher};
use crate::store::proto::{self, series_response, PartialResponseStrategy};
use crate::tsdb::chunkenc;

/// Client side of the StoreAPI; implemented over HTTP and by test mocks.
pub trait StoreClient: Send + Sync {
    fn name(&self) -> &str;

    fn info<'a>(&'a self) -> BoxFuture<'a, Result<proto::InfoResponse, Error>>;

    fn series<'a>(
        &'a self,
        req: &'a proto::SeriesRequest,
    ) -> BoxFuture<'a, Result<Vec<proto::SeriesResponse>, Error>>;

    fn label_names<'a>(
        &'a self,
        req: &'a proto::LabelNamesRequest,
    ) -> BoxFuture<'a, Result<proto::LabelNamesResponse, Error>>;

    fn label_values<'a>(
        &'a self,
        req: &'a proto::LabelValuesRequest,
    ) -> BoxFuture<'a, Result<proto::LabelValuesResponse, Error>>;
}

/// Options of one federated select.
#[derive(Clone, Debug)]
pub struct SelectOptions {
    pub strategy: PartialResponseStrategy,
    /// maximum acceptable resolution; 0 selects raw data only
    pub max_resolution_window: i64,
    /// sub-aggregate used when decoding downsampled chunks
    pub aggregate: proto::AggrType,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            strategy: PartialResponseStrategy::Warn,
            max_resolution_window: 0,
            aggregate: proto::AggrType::Sum,
        }
    }
}

/// One deduplicated output series with materialized samples, the iterator
/// surface handed to the PromQL engine.
#[derive(Clone, Debug, PartialEq)]
pub struct QuerySeries {
    pub labels: Labels,
    pub samples: Vec<(i64, f64)>,
}

pub struct QueryFederator {
    stores: Vec<Arc<dyn StoreClient>>,
    replica_label: String,
    dedup_gap_ms: i64,
}

impl QueryFederator {
    pub fn new(stores: Vec<Arc<dyn StoreClient>>, replica_label: String) -> Self {
        Self { stores, replica_label, dedup_gap_ms: DEFAULT_DEDUP_GAP_MS }
    }

    /// Override the replica failover gap (defaults to five minutes).
    pub fn with_dedup_gap(mut self, gap_ms: i64) -> Self {
        self.dedup_gap_ms = gap_ms;
        self
    }

    /// Endpoints whose advertised state is compatible with the query.
    async fn eligible_stores(
        &self,
        matchers: &[Matcher],
        min_time: i64,
        max_time: i64,
    ) -> Vec<(Arc<dyn StoreClient>, Option<String>)> {
        let infos = futures::future::join_all(
            self.stores.iter().map(|store| async move { store.info().await }),
        )
        .await;

        let mut out = Vec::new();
        for (store, info) in self.stores.iter().zip(infos) {
            match info {
                Ok(info) => {
                    if info.max_time < min_time || info.min_time >= max_time {
                        continue; // advertised range misses the query window
                    }
                    if !label_sets_compatible(&info.label_sets, matchers, &self.replica_label) {
                        continue;
                    }
                    out.push((Arc::clone(store), None));
                }
                // stores with unknown state still get queried; their
                // failure surfaces through the normal path
                Err(err) => out.push((Arc::clone(store), Some(err.to_string()))),
            }
        }
        out
    }

    /// Federated Series: fan out, merge, deduplicate.
    pub async fn select(
        &self,
        matchers: &[Matcher],
        min_time: i64,
        max_time: i64,
        opts: &SelectOptions,
    ) -> Result<(Vec<QuerySeries>, Vec<String>), Error> {
        let req = proto::SeriesRequest {
            min_time,
            max_time,
            matchers: proto::matchers_to_proto(matchers),
            max_resolution_window: opts.max_resolution_window,
            aggregates: vec![opts.aggregate as i32],
            partial_response_strategy: opts.strategy as i32,
            sample_limit: 0,
        };

        let stores = self.eligible_stores(matchers, min_time, max_time).await;
        let mut warnings: Vec<String> = Vec::new();

        let results = futures::future::join_all(stores.iter().map(|(store, _)| {
            let req = &req;
            async move { (store.name().to_string(), store.series(req).await) }
        }))
        .await;

        // group replicas of the same underlying series
        let mut grouped: BTreeMap<Labels, BTreeMap<String, Vec<proto::Series>>> = BTreeMap::new();
        for (name, result) in results {
            match result {
                Ok(responses) => {
                    for response in responses {
                        match response.result {
                            Some(series_response::Result::Series(series)) => {
                                let labels = proto::labels_from_proto(&series.labels)?;
                                let replica = labels
                                    .get(&self.replica_label)
                                    .unwrap_or("")
                                    .to_string();
                                let key = labels.without(&self.replica_label);
                                grouped
                                    .entry(key)
                                    .or_default()
                                    .entry(replica)
                                    .or_default()
                                    .push(series);
                            }
                            Some(series_response::Result::Warning(warning)) => {
                                if opts.strategy == PartialResponseStrategy::Abort {
                                    bail!("store {}: {}", name, warning);
                                }
                                warnings.push(format!("store {}: {}", name, warning));
                            }
                            None => {}
                        }
                    }
                }
                Err(err) => {
                    if opts.strategy == PartialResponseStrategy::Abort {
                        return Err(err.context(format!("store {}", name)));
                    }
                    warnings.push(format!("store {}: {}", name, err));
                }
            }
        }

        let mut out = Vec::with_capacity(grouped.len());
        for (labels, replicas) in grouped {
            // replica order fixes dedup priority
            let mut replica_samples = Vec::with_capacity(replicas.len());
            for (_, series_list) in replicas {
                let mut samples = Vec::new();
                for series in series_list {
                    for chunk in &series.chunks {
                        samples.extend(decode_chunk_samples(chunk, opts.aggregate)?);
                    }
                }
                samples.sort_by_key(|s| s.0);
                samples.dedup_by_key(|s| s.0);
                replica_samples.push(samples);
            }
            let samples: Vec<(i64, f64)> =
                DedupIterator::new(replica_samples, self.dedup_gap_ms)
                    .filter(|&(t, _)| t >= min_time && t < max_time)
                    .collect();
            if !samples.is_empty() {
                out.push(QuerySeries { labels, samples });
            }
        }
        Ok((out, warnings))
    }

    pub async fn label_names(
        &self,
        min_time: i64,
        max_time: i64,
        strategy: PartialResponseStrategy,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        let req = proto::LabelNamesRequest {
            min_time,
            max_time,
            partial_response_strategy: strategy as i32,
        };
        let mut names = Vec::new();
        let mut warnings = Vec::new();

        let results = futures::future::join_all(self.stores.iter().map(|store| {
            let req = &req;
            async move { (store.name().to_string(), store.label_names(req).await) }
        }))
        .await;

        for (name, result) in results {
            match result {
                Ok(mut response) => {
                    names.append(&mut response.names);
                    warnings.extend(response.warnings);
                }
                Err(err) => {
                    if strategy == PartialResponseStrategy::Abort {
                        return Err(err.context(format!("store {}", name)));
                    }
                    warnings.push(format!("store {}: {}", name, err));
                }
            }
        }
        names.sort();
        names.dedup();
        Ok((names, warnings))
    }

    pub async fn label_values(
        &self,
        label: &str,
        min_time: i64,
        max_time: i64,
        strategy: PartialResponseStrategy,
    ) -> Result<(Vec<String>, Vec<String>), Error> {
        let req = proto::LabelValuesRequest {
            label: label.to_string(),
            min_time,
            max_time,
            partial_response_strategy: strategy as i32,
        };
        let mut values = Vec::new();
        let mut warnings = Vec::new();

        let results = futures::future::join_all(self.stores.iter().map(|store| {
            let req = &req;
            async move { (store.name().to_string(), store.label_values(req).await) }
        }))
        .await;

        for (name, result) in results {
            match result {
                Ok(mut response) => {
                    values.append(&mut response.values);
                    warnings.extend(response.warnings);
                }
                Err(err) => {
                    if strategy == PartialResponseStrategy::Abort {
                        return Err(err.context(format!("store {}", name)));
                    }
                    warnings.push(format!("store {}: {}", name, err));
                }
            }
        }
        values.sort();
        values.dedup();
        Ok((values, warnings))
    }
}

/// Whether any advertised label set can satisfy the matchers that name its
/// labels. Stores advertising nothing are always eligible; the replica
/// label never disqualifies.
fn label_sets_compatible(
    label_sets: &[proto::LabelSet],
    matchers: &[Matcher],
    replica_label: &str,
) -> bool {
    if label_sets.is_empty() {
        return true;
    }
    label_sets.iter().any(|ls| {
        let labels = match proto::labels_from_proto(&ls.labels) {
            Ok(labels) => labels,
            Err(_) => return false,
        };
        matchers.iter().all(|m| {
            if m.name == replica_label {
                return true;
            }
            match labels.get(&m.name) {
                Some(value) => m.matches_value(value),
                None => true, // store may still hold matching series
            }
        })
    })
}

/// Decode one wire chunk into samples; aggregate chunks surface the
/// requested sub-aggregate, counters via the reset-aware iterator.
fn decode_chunk_samples(
    chunk: &proto::Chunk,
    aggregate: proto::AggrType,
) -> Result<Vec<(i64, f64)>, Error> {
    let encoding = chunkenc::Encoding::from_u8(chunk.encoding as u8)?;
    match encoding {
        chunkenc::Encoding::Xor => {
            chunkenc::XorIterator::new(&chunk.data).collect::<Result<Vec<_>, _>>()
        }
        chunkenc::Encoding::Aggr => {
            let typ = match aggregate {
                proto::AggrType::Count => chunkenc::AGGR_COUNT,
                proto::AggrType::Sum | proto::AggrType::Raw => chunkenc::AGGR_SUM,
                proto::AggrType::Min => chunkenc::AGGR_MIN,
                proto::AggrType::Max => chunkenc::AGGR_MAX,
                proto::AggrType::Counter => chunkenc::AGGR_COUNTER,
            };
            let bytes = match chunkenc::aggr_sub_chunk(&chunk.data, typ)? {
                Some(bytes) => bytes,
                None => return Ok(Vec::new()),
            };
            let samples: Vec<(i64, f64)> =
                chunkenc::XorIterator::new(bytes).collect::<Result<Vec<_>, _>>()?;
            if typ == chunkenc::AGGR_COUNTER {
                // one chunk at a time; cross-chunk stitching happens in the
                // caller's sample merge
                Ok(crate::compact::downsample::CounterSeriesIterator::new(vec![samples]).collect())
            } else {
                Ok(samples)
            }
        }
    }
}
