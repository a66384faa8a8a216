//! Session search filters and results.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::{
    flag, AttributeValue, SessionDescriptor, SessionId, SessionKind, Visibility, LOCKED_KEY,
    STARTED_KEY,
};

/// Comparison against one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOp {
    Eq(AttributeValue),
    Ne(AttributeValue),
    Gt(AttributeValue),
    Gte(AttributeValue),
    Lt(AttributeValue),
    Lte(AttributeValue),
    /// Key present, any value.
    Exists,
}

impl QueryOp {
    pub fn matches(&self, value: Option<&AttributeValue>) -> bool {
        let ordering = |expected: &AttributeValue| value.and_then(|v| v.compare(expected));
        match self {
            Self::Eq(expected) => value == Some(expected),
            Self::Ne(expected) => value != Some(expected),
            Self::Gt(expected) => ordering(expected) == Some(Ordering::Greater),
            Self::Gte(expected) => {
                matches!(ordering(expected), Some(Ordering::Greater | Ordering::Equal))
            }
            Self::Lt(expected) => ordering(expected) == Some(Ordering::Less),
            Self::Lte(expected) => matches!(ordering(expected), Some(Ordering::Less | Ordering::Equal)),
            Self::Exists => value.is_some(),
        }
    }
}

/// Search filter. Conditions are ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilter {
    pub conditions: Vec<(String, QueryOp)>,
    pub max_results: usize,
    pub min_open_slots: usize,
    pub ignored_sessions: Vec<SessionId>,
    pub kind: Option<SessionKind>,
    pub include_private: bool,
    /// Look up exactly one session. Needs backend support.
    pub by_id: Option<SessionId>,
}

impl Default for SearchFilter {
    fn default() -> Self {
        Self {
            conditions: Vec::new(),
            max_results: 50,
            min_open_slots: 1,
            ignored_sessions: Vec::new(),
            kind: None,
            include_private: false,
            by_id: None,
        }
    }
}

impl SearchFilter {
    /// Create empty filter (matches every open public session).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: SessionId) -> Self {
        Self {
            by_id: Some(id),
            min_open_slots: 0,
            ..Default::default()
        }
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.conditions.push((key.into(), QueryOp::Eq(value.into())));
        self
    }

    pub fn ne(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.conditions.push((key.into(), QueryOp::Ne(value.into())));
        self
    }

    pub fn gt(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.conditions.push((key.into(), QueryOp::Gt(value.into())));
        self
    }

    pub fn gte(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.conditions.push((key.into(), QueryOp::Gte(value.into())));
        self
    }

    pub fn lt(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.conditions.push((key.into(), QueryOp::Lt(value.into())));
        self
    }

    pub fn lte(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.conditions.push((key.into(), QueryOp::Lte(value.into())));
        self
    }

    pub fn exists(mut self, key: impl Into<String>) -> Self {
        self.conditions.push((key.into(), QueryOp::Exists));
        self
    }

    pub fn kind(mut self, kind: SessionKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn max_results(mut self, max: usize) -> Self {
        self.max_results = max;
        self
    }

    pub fn min_open_slots(mut self, slots: usize) -> Self {
        self.min_open_slots = slots;
        self
    }

    pub fn ignore(mut self, id: SessionId) -> Self {
        self.ignored_sessions.push(id);
        self
    }

    pub fn include_private(mut self) -> Self {
        self.include_private = true;
        self
    }

    /// Whether a descriptor should be returned. Backends without native
    /// filtering can apply this locally.
    pub fn matches(&self, desc: &SessionDescriptor) -> bool {
        if let Some(id) = &self.by_id {
            return &desc.id == id;
        }
        let listed = match desc.visibility {
            Visibility::Public => true,
            Visibility::Private => self.include_private,
            Visibility::InviteOnly => false,
        };
        if !listed
            || self.ignored_sessions.contains(&desc.id)
            || desc.open_slots < self.min_open_slots
            || flag(&desc.attributes, LOCKED_KEY)
            || flag(&desc.attributes, STARTED_KEY)
        {
            return false;
        }
        if self.kind.is_some_and(|kind| kind != desc.kind) {
            return false;
        }
        self.conditions
            .iter()
            .all(|(key, op)| op.matches(desc.attributes.get(key)))
    }
}

/// Finite sequence of search results.
#[derive(Debug, Default)]
pub struct SearchResults {
    inner: std::vec::IntoIter<SessionDescriptor>,
}

impl SearchResults {
    pub fn new(results: Vec<SessionDescriptor>) -> Self {
        Self {
            inner: results.into_iter(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl Iterator for SearchResults {
    type Item = SessionDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for SearchResults {}
