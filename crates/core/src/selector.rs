//! Equality-based label selectors (`app=web,tier!=db,canary,!legacy`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::Resource;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid selector term: {0:?}")]
    InvalidTerm(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|m| m.get(k));
        match self {
            Requirement::Equals(k, v) => get(k) == Some(v),
            // a missing label satisfies `!=`
            Requirement::NotEquals(k, v) => get(k) != Some(v),
            Requirement::Exists(k) => get(k).is_some(),
            Requirement::NotExists(k) => get(k).is_none(),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    reqs: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn is_everything(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }

    pub fn matches_object<K: Resource>(&self, obj: &K) -> bool {
        self.matches(obj.labels())
    }
}

fn valid_key(k: &str) -> bool {
    !k.is_empty() && !k.contains(['=', '!', ' '])
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut reqs = Vec::new();
        for raw in s.split(',') {
            let term = raw.trim();
            if term.is_empty() {
                continue;
            }
            let bad = || SelectorError::InvalidTerm(term.to_string());
            let req = if let Some((k, v)) = term.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==") {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = term.split_once('=') {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = term.strip_prefix('!') {
                Requirement::NotExists(k.trim().to_string())
            } else {
                Requirement::Exists(term.to_string())
            };
            let (key, value) = match &req {
                Requirement::Equals(k, v) | Requirement::NotEquals(k, v) => (k.as_str(), Some(v.as_str())),
                Requirement::Exists(k) | Requirement::NotExists(k) => (k.as_str(), None),
            };
            if !valid_key(key) || value.is_some_and(|v| v.contains(['=', '!'])) {
                return Err(bad());
            }
            reqs.push(req);
        }
        Ok(Self { reqs })
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .reqs
            .iter()
            .map(|r| match r {
                Requirement::Equals(k, v) => format!("{}={}", k, v),
                Requirement::NotEquals(k, v) => format!("{}!={}", k, v),
                Requirement::Exists(k) => k.clone(),
                Requirement::NotExists(k) => format!("!{}", k),
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}
