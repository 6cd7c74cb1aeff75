//! StoreAPI and remote-write wire types.
//!
//! Hand-maintained prost messages; field numbers are frozen, append only.
//! Streamed responses travel as length-prefixed frames (u32 big endian
//! length, then the encoded message).

use anyhow::{bail, Error};
use prost::Message;

use crate::labels::{Label, Labels, Matcher, MatcherType};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelPair {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum MatcherKind {
    Eq = 0,
    Neq = 1,
    Re = 2,
    Nre = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelMatcher {
    #[prost(enumeration = "MatcherKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum PartialResponseStrategy {
    /// failing stores surface as warnings
    Warn = 0,
    /// any store failure fails the request
    Abort = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Chunk {
    #[prost(int64, tag = "1")]
    pub min_time: i64,
    #[prost(int64, tag = "2")]
    pub max_time: i64,
    /// chunk encoding byte as stored on disk
    #[prost(uint32, tag = "3")]
    pub encoding: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Series {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<LabelPair>,
    #[prost(message, repeated, tag = "2")]
    pub chunks: Vec<Chunk>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum AggrType {
    Raw = 0,
    Count = 1,
    Sum = 2,
    Min = 3,
    Max = 4,
    Counter = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SeriesRequest {
    #[prost(int64, tag = "1")]
    pub min_time: i64,
    #[prost(int64, tag = "2")]
    pub max_time: i64,
    #[prost(message, repeated, tag = "3")]
    pub matchers: Vec<LabelMatcher>,
    /// maximum acceptable resolution in ms; 0 asks for raw data
    #[prost(int64, tag = "4")]
    pub max_resolution_window: i64,
    #[prost(enumeration = "AggrType", repeated, tag = "5")]
    pub aggregates: Vec<i32>,
    #[prost(enumeration = "PartialResponseStrategy", tag = "6")]
    pub partial_response_strategy: i32,
    /// cap on samples touched by the request; 0 means unbounded
    #[prost(uint64, tag = "7")]
    pub sample_limit: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SeriesResponse {
    #[prost(oneof = "series_response::Result", tags = "1, 2")]
    pub result: Option<series_response::Result>,
}

pub mod series_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Series(super::Series),
        #[prost(string, tag = "2")]
        Warning(String),
    }
}

impl SeriesResponse {
    pub fn series(series: Series) -> Self {
        Self { result: Some(series_response::Result::Series(series)) }
    }

    pub fn warning(warning: String) -> Self {
        Self { result: Some(series_response::Result::Warning(warning)) }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelNamesRequest {
    #[prost(int64, tag = "1")]
    pub min_time: i64,
    #[prost(int64, tag = "2")]
    pub max_time: i64,
    #[prost(enumeration = "PartialResponseStrategy", tag = "3")]
    pub partial_response_strategy: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelNamesResponse {
    #[prost(string, repeated, tag = "1")]
    pub names: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub warnings: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelValuesRequest {
    #[prost(string, tag = "1")]
    pub label: String,
    #[prost(int64, tag = "2")]
    pub min_time: i64,
    #[prost(int64, tag = "3")]
    pub max_time: i64,
    #[prost(enumeration = "PartialResponseStrategy", tag = "4")]
    pub partial_response_strategy: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelValuesResponse {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ::prost::Enumeration)]
#[repr(i32)]
pub enum StoreType {
    Gateway = 0,
    Receiver = 1,
    Sidecar = 2,
    Ruler = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelSet {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<LabelPair>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InfoResponse {
    #[prost(int64, tag = "1")]
    pub min_time: i64,
    #[prost(int64, tag = "2")]
    pub max_time: i64,
    #[prost(message, repeated, tag = "3")]
    pub label_sets: Vec<LabelSet>,
    #[prost(enumeration = "StoreType", tag = "4")]
    pub store_type: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Sample {
    #[prost(double, tag = "1")]
    pub value: f64,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimeSeries {
    #[prost(message, repeated, tag = "1")]
    pub labels: Vec<LabelPair>,
    #[prost(message, repeated, tag = "2")]
    pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WriteRequest {
    #[prost(message, repeated, tag = "1")]
    pub timeseries: Vec<TimeSeries>,
    #[prost(string, tag = "2")]
    pub tenant: String,
    #[prost(int64, tag = "3")]
    pub replica: i64,
}

/// Convert wire labels into an internal label set.
pub fn labels_from_proto(pairs: &[LabelPair]) -> Result<Labels, Error> {
    Labels::new(
        pairs
            .iter()
            .map(|p| Label::new(p.name.clone(), p.value.clone()))
            .collect(),
    )
}

pub fn labels_to_proto(labels: &Labels) -> Vec<LabelPair> {
    labels
        .iter()
        .map(|l| LabelPair { name: l.name.clone(), value: l.value.clone() })
        .collect()
}

/// Compile wire matchers; regex patterns are anchored on compilation.
pub fn matchers_from_proto(matchers: &[LabelMatcher]) -> Result<Vec<Matcher>, Error> {
    matchers
        .iter()
        .map(|m| {
            let typ = match MatcherKind::from_i32(m.kind) {
                Some(MatcherKind::Eq) => MatcherType::Eq,
                Some(MatcherKind::Neq) => MatcherType::Neq,
                Some(MatcherKind::Re) => MatcherType::Re,
                Some(MatcherKind::Nre) => MatcherType::Nre,
                None => bail!("unknown matcher kind {}", m.kind),
            };
            Matcher::new(typ, m.name.clone(), m.value.clone())
        })
        .collect()
}

pub fn matchers_to_proto(matchers: &[Matcher]) -> Vec<LabelMatcher> {
    matchers
        .iter()
        .map(|m| LabelMatcher {
            kind: match m.typ {
                MatcherType::Eq => MatcherKind::Eq as i32,
                MatcherType::Neq => MatcherKind::Neq as i32,
                MatcherType::Re => MatcherKind::Re as i32,
                MatcherType::Nre => MatcherKind::Nre as i32,
            },
            name: m.name.clone(),
            value: m.value.clone(),
        })
        .collect()
}

/// Encode a message as one length-prefixed frame.
pub fn encode_frame<M: Message>(msg: &M) -> Vec<u8> {
    let body = msg.encode_to_vec();
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Decode the next frame from a buffer, returning the message and consumed
/// byte count. `None` when the buffer holds no complete frame yet.
pub fn decode_frame<M: Message + Default>(buf: &[u8]) -> Result<Option<(M, usize)>, Error> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let msg = M::decode(&buf[4..4 + len])?;
    Ok(Some((msg, 4 + len)))
}

/// Decode a whole frame stream.
pub fn decode_frames<M: Message + Default>(mut buf: &[u8]) -> Result<Vec<M>, Error> {
    let mut out = Vec::new();
    while let Some((msg, used)) = decode_frame::<M>(buf)? {
        out.push(msg);
        buf = &buf[used..];
    }
    if !buf.is_empty() {
        bail!("trailing {} bytes after last frame", buf.len());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_response_roundtrip() {
        let response = SeriesResponse::series(Series {
            labels: vec![LabelPair { name: "a".into(), value: "1".into() }],
            chunks: vec![Chunk { min_time: 0, max_time: 99, encoding: 1, data: vec![1, 2, 3] }],
        });

        let encoded = response.encode_to_vec();
        let decoded = SeriesResponse::decode(&encoded[..]).unwrap();
        assert_eq!(decoded, response);

        let warning = SeriesResponse::warning("boom".into());
        let decoded = SeriesResponse::decode(&warning.encode_to_vec()[..]).unwrap();
        match decoded.result {
            Some(series_response::Result::Warning(w)) => assert_eq!(w, "boom"),
            other => panic!("unexpected {:?}", other.is_some()),
        }
    }

    #[test]
    fn test_frame_stream_roundtrip() {
        let messages: Vec<SeriesResponse> = (0..3)
            .map(|i| SeriesResponse::warning(format!("w{}", i)))
            .collect();

        let mut stream = Vec::new();
        for msg in &messages {
            stream.extend_from_slice(&encode_frame(msg));
        }

        let decoded: Vec<SeriesResponse> = decode_frames(&stream).unwrap();
        assert_eq!(decoded, messages);

        // partial frame is not an error, just incomplete
        assert!(decode_frame::<SeriesResponse>(&stream[..2]).unwrap().is_none());
        // trailing garbage is
        stream.push(0xff);
        assert!(decode_frames::<SeriesResponse>(&stream).is_err());
    }

    #[test]
    fn test_matcher_conversion() {
        let wire = vec![
            LabelMatcher { kind: MatcherKind::Eq as i32, name: "a".into(), value: "1".into() },
            LabelMatcher { kind: MatcherKind::Re as i32, name: "b".into(), value: "x.*".into() },
        ];
        let matchers = matchers_from_proto(&wire).unwrap();
        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers_to_proto(&matchers), wire);

        let bad = vec![LabelMatcher { kind: 9, name: "a".into(), value: "1".into() }];
        assert!(matchers_from_proto(&bad).is_err());
    }

    #[test]
    fn test_write_request_roundtrip() {
        let req = WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![LabelPair { name: "__name__".into(), value: "up".into() }],
                samples: vec![Sample { value: 1.0, timestamp: 1000 }],
            }],
            tenant: "t1".into(),
            replica: 2,
        };
        let decoded = WriteRequest::decode(&req.encode_to_vec()[..]).unwrap();
        assert_eq!(decoded, req);
    }
}
