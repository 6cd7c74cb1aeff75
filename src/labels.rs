//! Label sets and label matchers.
//!
//! A label set is an ordered list of name/value pairs (names ascending, no
//! duplicates). Label sets identify series and, attached to block metadata,
//! identify the producing shard. The canonical byte encoding defined here is
//! the hashing input used by the receiver hashring and the compactor group
//! key.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hasher;

use anyhow::{bail, Error};
use regex::Regex;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

/// Reserved label holding the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// An ordered set of labels (names ascending, no duplicate names).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Build a label set from unordered pairs. Fails on duplicate names.
    pub fn new(mut labels: Vec<Label>) -> Result<Self, Error> {
        labels.sort();
        for window in labels.windows(2) {
            if window[0].name == window[1].name {
                bail!("duplicate label name '{}'", window[0].name);
            }
        }
        Ok(Self(labels))
    }

    /// Build from pairs, for tests and fixed sets.
    pub fn from_pairs<N: Into<String> + Ord, V: Into<String>>(
        pairs: Vec<(N, V)>,
    ) -> Result<Self, Error> {
        Self::new(
            pairs
                .into_iter()
                .map(|(n, v)| Label::new(n, v))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<Label> {
        self.0.iter()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Returns a copy without the given label.
    pub fn without(&self, name: &str) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| l.name != name)
                .cloned()
                .collect(),
        )
    }

    /// Returns a copy with `other` merged in; values from `other` win on
    /// name conflicts. Used to append external block labels to series.
    pub fn merge(&self, other: &Labels) -> Labels {
        let mut map: BTreeMap<&str, &str> = BTreeMap::new();
        for l in self.iter() {
            map.insert(&l.name, &l.value);
        }
        for l in other.iter() {
            map.insert(&l.name, &l.value);
        }
        Labels(
            map.into_iter()
                .map(|(n, v)| Label::new(n, v))
                .collect(),
        )
    }

    /// Canonical byte encoding: for each pair, name and value as
    /// length-prefixed (u32 LE) byte strings. Unambiguous and stable, the
    /// hashing input for the hashring and group keys.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * 16);
        for label in self.iter() {
            buf.extend_from_slice(&(label.name.len() as u32).to_le_bytes());
            buf.extend_from_slice(label.name.as_bytes());
            buf.extend_from_slice(&(label.value.len() as u32).to_le_bytes());
            buf.extend_from_slice(label.value.as_bytes());
        }
        buf
    }

    /// Stable 64 bit hash of the canonical encoding.
    pub fn stable_hash(&self) -> u64 {
        let mut hasher = SipHasher13::new();
        hasher.write(&self.canonical_bytes());
        hasher.finish()
    }

    pub fn into_inner(self) -> Vec<Label> {
        self.0
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}=\"{}\"", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl From<BTreeMap<String, String>> for Labels {
    fn from(map: BTreeMap<String, String>) -> Self {
        // BTreeMap iteration is already name-ordered and duplicate free
        Labels(map.into_iter().map(|(n, v)| Label { name: n, value: v }).collect())
    }
}

impl From<Labels> for BTreeMap<String, String> {
    fn from(labels: Labels) -> Self {
        labels
            .0
            .into_iter()
            .map(|l| (l.name, l.value))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatcherType {
    Eq,
    Neq,
    Re,
    Nre,
}

/// A single selector against one label name. Regex matchers are anchored.
#[derive(Clone, Debug)]
pub struct Matcher {
    pub typ: MatcherType,
    pub name: String,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    pub fn new<N: Into<String>, V: Into<String>>(
        typ: MatcherType,
        name: N,
        value: V,
    ) -> Result<Self, Error> {
        let name = name.into();
        let value = value.into();
        let re = match typ {
            MatcherType::Re | MatcherType::Nre => {
                Some(Regex::new(&format!("^(?:{})$", value))?)
            }
            _ => None,
        };
        Ok(Self { typ, name, value, re })
    }

    pub fn eq<N: Into<String>, V: Into<String>>(name: N, value: V) -> Self {
        Self {
            typ: MatcherType::Eq,
            name: name.into(),
            value: value.into(),
            re: None,
        }
    }

    /// Whether the matcher accepts the given label value.
    pub fn matches_value(&self, value: &str) -> bool {
        match self.typ {
            MatcherType::Eq => value == self.value,
            MatcherType::Neq => value != self.value,
            MatcherType::Re => self.re.as_ref().map(|re| re.is_match(value)).unwrap_or(false),
            MatcherType::Nre => self.re.as_ref().map(|re| !re.is_match(value)).unwrap_or(true),
        }
    }

    /// Whether the matcher accepts the label set. A missing label is treated
    /// as the empty value.
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or(""))
    }

    /// True for matchers that can only be satisfied by the empty value,
    /// e.g. `x=""` or `x=~"|foo"` on a missing label.
    pub fn matches_empty(&self) -> bool {
        self.matches_value("")
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let op = match self.typ {
            MatcherType::Eq => "=",
            MatcherType::Neq => "!=",
            MatcherType::Re => "=~",
            MatcherType::Nre => "!~",
        };
        write!(f, "{}{}\"{}\"", self.name, op, self.value)
    }
}

/// Whether all matchers accept the label set.
pub fn matches_all(matchers: &[Matcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches(labels))
}
