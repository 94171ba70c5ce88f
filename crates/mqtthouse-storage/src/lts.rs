//! Learned Topic Structure
//!
//! The LTS trie maps variable-length MQTT topics to fixed-width *static
//! keys* so that topics sharing a learned shape collapse to the same key,
//! with the high-cardinality levels pulled out as explicit *varying tokens*.
//! This is what turns topic-filter matching into key-range scanning for the
//! skipstream layout.
//!
//! ## Structure
//!
//! The trie is a state machine. Each state has token-labelled edges, at
//! most one wildcard (`+`) edge, and at most one end-of-topic edge leading
//! to a terminal state. The terminal state's id, encoded big-endian at a
//! fixed width, is the static key of the topic shape.
//!
//! A per-level threshold decides when a level stops being enumerable: once
//! a state has accumulated that many distinct token edges, unseen tokens
//! are routed through the `+` edge and become varying tokens of the shape.
//! Tokens that earned a literal edge before the level saturated keep it.
//!
//! ## Consistency
//!
//! The trie is monotone: edges and terminals are only ever added. Mutation
//! happens through a [`TrieSession`], which stages new edges against a
//! read-only snapshot and emits the KV pairs that persist them. The staged
//! edges are merged into the shared trie only after the owning batch has
//! committed, so the in-memory mirror never gets ahead of the backend.

use std::collections::HashMap;

use mqtthouse_core::{FilterLevel, Topic, TopicFilter};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Trie state identifier. State 0 is the root.
pub type StateId = u64;

const ROOT: StateId = 0;

const EDGE_TAG_TOKEN: u8 = 0x00;
const EDGE_TAG_PLUS: u8 = 0x01;
const EDGE_TAG_EOT: u8 = 0x02;

/// Label of one outgoing trie edge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EdgeLabel {
    /// A literal topic token.
    Token(String),
    /// The wildcard edge absorbing promoted tokens.
    Plus,
    /// End-of-topic transition to a terminal state.
    Eot,
}

/// One level of a topic-shape template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TplSegment {
    Literal(String),
    Wildcard,
}

/// Constraint on one varying token, compressed from a topic filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaryingConstraint {
    /// The filter does not constrain this slot.
    Any,
    /// The filter requires this exact token.
    Exact(String),
}

/// One shape compatible with a topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch {
    pub static_key: Vec<u8>,
    pub varying: Vec<VaryingConstraint>,
}

/// Counters describing a trie, for debugging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieInfo {
    /// Number of allocated states (including terminals, excluding the root).
    pub states: usize,
    /// Number of learned topic shapes.
    pub shapes: usize,
}

/// The learned topic structure of one generation.
#[derive(Debug, Clone)]
pub struct LtsTrie {
    key_bytes: usize,
    thresholds: Vec<usize>,
    next_state: StateId,
    children: HashMap<StateId, HashMap<EdgeLabel, StateId>>,
    templates: HashMap<StateId, Vec<TplSegment>>,
}

impl LtsTrie {
    pub fn new(key_bytes: usize, thresholds: Vec<usize>) -> Self {
        Self {
            key_bytes,
            thresholds,
            next_state: 1,
            children: HashMap::new(),
            templates: HashMap::new(),
        }
    }

    /// Rebuild a trie from persisted edge pairs.
    pub fn restore(
        key_bytes: usize,
        thresholds: Vec<usize>,
        pairs: &[(Vec<u8>, Vec<u8>)],
    ) -> Result<Self> {
        let mut trie = Self::new(key_bytes, thresholds);
        for (key, value) in pairs {
            if key.len() < key_bytes + 1 {
                return Err(Error::CorruptKey(format!(
                    "trie edge key too short: {} bytes",
                    key.len()
                )));
            }
            let parent = decode_state(&key[..key_bytes])?;
            let label = decode_edge(&key[key_bytes..])?;
            let child = decode_state(value)?;
            trie.next_state = trie.next_state.max(parent + 1).max(child + 1);
            trie.children.entry(parent).or_default().insert(label, child);
        }
        trie.rebuild_templates();
        Ok(trie)
    }

    /// Serialise every edge as the KV pairs that persist it.
    pub fn dump(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = Vec::new();
        for (parent, edges) in &self.children {
            for (label, child) in edges {
                pairs.push(self.edge_pair(*parent, label, *child)?);
            }
        }
        Ok(pairs)
    }

    pub fn static_key_bytes(&self) -> usize {
        self.key_bytes
    }

    pub fn info(&self) -> TrieInfo {
        TrieInfo {
            states: (self.next_state - 1) as usize,
            shapes: self.templates.len(),
        }
    }

    /// Read-only topic resolution; returns `None` for unlearned topics.
    pub fn lookup_topic_key(&self, tokens: &[&str]) -> Option<(Vec<u8>, Vec<String>)> {
        let mut state = ROOT;
        let mut varying = Vec::new();
        for tok in tokens {
            if let Some(next) = self.edge(state, &EdgeLabel::Token(tok.to_string())) {
                state = next;
            } else if let Some(next) = self.edge(state, &EdgeLabel::Plus) {
                varying.push(tok.to_string());
                state = next;
            } else {
                return None;
            }
        }
        let terminal = self.edge(state, &EdgeLabel::Eot)?;
        let static_key = self.encode_state(terminal).ok()?;
        Some((static_key, varying))
    }

    /// Template of a learned shape.
    pub fn reverse_lookup(&self, static_key: &[u8]) -> Result<&[TplSegment]> {
        let state = decode_state(static_key)?;
        self.templates
            .get(&state)
            .map(|t| t.as_slice())
            .ok_or(Error::StaticKeyNotFound)
    }

    /// Every learned shape compatible with the filter, with the filter
    /// compressed to per-slot varying constraints.
    pub fn match_topics(&self, filter: &TopicFilter) -> Vec<TopicMatch> {
        let mut out = Vec::new();
        let mut varying = Vec::new();
        self.match_rec(ROOT, filter.levels(), &mut varying, &mut out);
        out.sort_by(|a, b| a.static_key.cmp(&b.static_key));
        out
    }

    fn match_rec(
        &self,
        state: StateId,
        rest: &[FilterLevel],
        varying: &mut Vec<VaryingConstraint>,
        out: &mut Vec<TopicMatch>,
    ) {
        let Some(edges) = self.children.get(&state) else {
            return;
        };
        match rest.first() {
            None => {
                if let Some(&terminal) = edges.get(&EdgeLabel::Eot) {
                    self.push_match(terminal, varying, out);
                }
            }
            Some(FilterLevel::Hash) => {
                // '#' matches zero levels here and every level below.
                if let Some(&terminal) = edges.get(&EdgeLabel::Eot) {
                    self.push_match(terminal, varying, out);
                }
                for (label, &next) in edges {
                    match label {
                        EdgeLabel::Token(_) => self.match_rec(next, rest, varying, out),
                        EdgeLabel::Plus => {
                            varying.push(VaryingConstraint::Any);
                            self.match_rec(next, rest, varying, out);
                            varying.pop();
                        }
                        EdgeLabel::Eot => {}
                    }
                }
            }
            Some(FilterLevel::Plus) => {
                for (label, &next) in edges {
                    match label {
                        EdgeLabel::Token(_) => self.match_rec(next, &rest[1..], varying, out),
                        EdgeLabel::Plus => {
                            varying.push(VaryingConstraint::Any);
                            self.match_rec(next, &rest[1..], varying, out);
                            varying.pop();
                        }
                        EdgeLabel::Eot => {}
                    }
                }
            }
            Some(FilterLevel::Literal(tok)) => {
                if let Some(&next) = edges.get(&EdgeLabel::Token(tok.clone())) {
                    self.match_rec(next, &rest[1..], varying, out);
                }
                // The token may have been absorbed by the wildcard edge.
                if let Some(&next) = edges.get(&EdgeLabel::Plus) {
                    varying.push(VaryingConstraint::Exact(tok.clone()));
                    self.match_rec(next, &rest[1..], varying, out);
                    varying.pop();
                }
            }
        }
    }

    fn push_match(
        &self,
        terminal: StateId,
        varying: &[VaryingConstraint],
        out: &mut Vec<TopicMatch>,
    ) {
        if let Ok(static_key) = self.encode_state(terminal) {
            out.push(TopicMatch {
                static_key,
                varying: varying.to_vec(),
            });
        }
    }

    /// Merge a committed session into the shared trie. Existing edges win;
    /// the session only stages edges that were absent when it was opened,
    /// and writers are serialised, so conflicts cannot arise.
    pub fn apply(&mut self, staged: StagedTrie) {
        for (state, edges) in staged.children {
            let entry = self.children.entry(state).or_default();
            for (label, child) in edges {
                entry.entry(label).or_insert(child);
            }
        }
        for (terminal, template) in staged.templates {
            self.templates.entry(terminal).or_insert(template);
        }
        self.next_state = self.next_state.max(staged.next_state);
    }

    fn edge(&self, state: StateId, label: &EdgeLabel) -> Option<StateId> {
        self.children.get(&state)?.get(label).copied()
    }

    fn token_edge_count(&self, state: StateId) -> usize {
        self.children
            .get(&state)
            .map(|edges| {
                edges
                    .keys()
                    .filter(|l| matches!(l, EdgeLabel::Token(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    fn threshold_at(&self, level: usize) -> usize {
        let i = level.min(self.thresholds.len().saturating_sub(1));
        self.thresholds.get(i).copied().unwrap_or(usize::MAX)
    }

    fn encode_state(&self, state: StateId) -> Result<Vec<u8>> {
        if self.key_bytes < 8 && state >= 1u64 << (8 * self.key_bytes as u32) {
            return Err(Error::StaticKeyOverflow(self.key_bytes));
        }
        Ok(state.to_be_bytes()[8 - self.key_bytes..].to_vec())
    }

    fn edge_pair(
        &self,
        parent: StateId,
        label: &EdgeLabel,
        child: StateId,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut key = self.encode_state(parent)?;
        key.extend_from_slice(&encode_edge(label));
        Ok((key, self.encode_state(child)?))
    }

    fn rebuild_templates(&mut self) {
        let mut templates = HashMap::new();
        let mut stack: Vec<(StateId, Vec<TplSegment>)> = vec![(ROOT, Vec::new())];
        while let Some((state, path)) = stack.pop() {
            if let Some(edges) = self.children.get(&state) {
                for (label, &child) in edges {
                    match label {
                        EdgeLabel::Token(tok) => {
                            let mut next = path.clone();
                            next.push(TplSegment::Literal(tok.clone()));
                            stack.push((child, next));
                        }
                        EdgeLabel::Plus => {
                            let mut next = path.clone();
                            next.push(TplSegment::Wildcard);
                            stack.push((child, next));
                        }
                        EdgeLabel::Eot => {
                            templates.insert(child, path.clone());
                        }
                    }
                }
            }
        }
        self.templates = templates;
    }
}

fn decode_state(bytes: &[u8]) -> Result<StateId> {
    if bytes.is_empty() || bytes.len() > 8 {
        return Err(Error::CorruptKey(format!(
            "bad static key width: {}",
            bytes.len()
        )));
    }
    let mut full = [0u8; 8];
    full[8 - bytes.len()..].copy_from_slice(bytes);
    Ok(u64::from_be_bytes(full))
}

fn encode_edge(label: &EdgeLabel) -> Vec<u8> {
    match label {
        EdgeLabel::Token(tok) => {
            let mut out = Vec::with_capacity(1 + tok.len());
            out.push(EDGE_TAG_TOKEN);
            out.extend_from_slice(tok.as_bytes());
            out
        }
        EdgeLabel::Plus => vec![EDGE_TAG_PLUS],
        EdgeLabel::Eot => vec![EDGE_TAG_EOT],
    }
}

fn decode_edge(bytes: &[u8]) -> Result<EdgeLabel> {
    match bytes.split_first() {
        Some((&EDGE_TAG_TOKEN, tok)) => {
            let tok = std::str::from_utf8(tok)
                .map_err(|e| Error::CorruptKey(format!("trie token not utf-8: {e}")))?;
            Ok(EdgeLabel::Token(tok.to_string()))
        }
        Some((&EDGE_TAG_PLUS, [])) => Ok(EdgeLabel::Plus),
        Some((&EDGE_TAG_EOT, [])) => Ok(EdgeLabel::Eot),
        _ => Err(Error::CorruptKey("unknown trie edge encoding".to_string())),
    }
}

/// Substitute varying tokens back into a shape template.
pub fn decompress_topic(template: &[TplSegment], varying: &[String]) -> Result<Topic> {
    let wildcards = template
        .iter()
        .filter(|s| matches!(s, TplSegment::Wildcard))
        .count();
    if wildcards != varying.len() {
        return Err(Error::CorruptValue(format!(
            "shape has {wildcards} varying slots, entry carries {}",
            varying.len()
        )));
    }
    let mut slot = 0;
    let levels = template.iter().map(|seg| match seg {
        TplSegment::Literal(tok) => tok.as_str(),
        TplSegment::Wildcard => {
            let tok = varying[slot].as_str();
            slot += 1;
            tok
        }
    });
    Ok(Topic::from_levels(levels))
}

/// Compress a topic filter against a shape template. Returns one constraint
/// per wildcard slot, or `None` when the filter cannot select this shape.
pub fn compress_topic_filter(
    template: &[TplSegment],
    filter: &[FilterLevel],
) -> Option<Vec<VaryingConstraint>> {
    let mut out = Vec::new();
    let mut fi = 0;
    for seg in template {
        match filter.get(fi) {
            Some(FilterLevel::Hash) => {
                // '#' consumes the rest of the template without advancing.
                if matches!(seg, TplSegment::Wildcard) {
                    out.push(VaryingConstraint::Any);
                }
            }
            Some(FilterLevel::Plus) => {
                if matches!(seg, TplSegment::Wildcard) {
                    out.push(VaryingConstraint::Any);
                }
                fi += 1;
            }
            Some(FilterLevel::Literal(tok)) => {
                match seg {
                    TplSegment::Literal(lit) if lit == tok => {}
                    TplSegment::Literal(_) => return None,
                    TplSegment::Wildcard => out.push(VaryingConstraint::Exact(tok.clone())),
                }
                fi += 1;
            }
            None => return None,
        }
    }
    match filter.get(fi) {
        None => Some(out),
        Some(FilterLevel::Hash) if fi == filter.len() - 1 => Some(out),
        Some(_) => None,
    }
}

/// True when the varying tokens of a stored entry satisfy the compressed
/// constraints. Rejects truncated-hash collisions.
pub fn constraints_match(constraints: &[VaryingConstraint], varying: &[String]) -> bool {
    if constraints.len() != varying.len() {
        return false;
    }
    constraints.iter().zip(varying).all(|(c, tok)| match c {
        VaryingConstraint::Any => true,
        VaryingConstraint::Exact(expected) => expected == tok,
    })
}

// ---------------------------------------------------------------------------
// Batch-scoped mutation
// ---------------------------------------------------------------------------

/// Edges and terminals created while cooking one batch, plus the KV pairs
/// that persist them. Applied to the shared trie after the batch commits.
#[derive(Debug, Clone, Default)]
pub struct StagedTrie {
    children: HashMap<StateId, HashMap<EdgeLabel, StateId>>,
    templates: HashMap<StateId, Vec<TplSegment>>,
    next_state: StateId,
    /// Persistence pairs destined for the trie column family.
    pub ops: Vec<(Vec<u8>, Vec<u8>)>,
}

impl StagedTrie {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A write view over a trie snapshot. Lookups see both the snapshot and the
/// edges staged so far, so a batch that stores two messages on the same new
/// topic learns the shape once.
pub struct TrieSession<'a> {
    base: &'a LtsTrie,
    staged: StagedTrie,
}

impl<'a> TrieSession<'a> {
    pub fn new(base: &'a LtsTrie) -> Self {
        let staged = StagedTrie {
            next_state: base.next_state,
            ..Default::default()
        };
        Self { base, staged }
    }

    /// Resolve a topic to its static key and varying tokens, learning new
    /// structure as needed.
    pub fn topic_key(&mut self, tokens: &[&str]) -> Result<(Vec<u8>, Vec<String>)> {
        let mut state = ROOT;
        let mut varying = Vec::new();
        let mut template = Vec::with_capacity(tokens.len());
        for (level, tok) in tokens.iter().enumerate() {
            let label = EdgeLabel::Token(tok.to_string());
            if let Some(next) = self.edge(state, &label) {
                template.push(TplSegment::Literal(tok.to_string()));
                state = next;
            } else if self.token_count(state) >= self.base.threshold_at(level) {
                // Saturated level: the token is variable.
                varying.push(tok.to_string());
                template.push(TplSegment::Wildcard);
                state = match self.edge(state, &EdgeLabel::Plus) {
                    Some(next) => next,
                    None => self.add_edge(state, EdgeLabel::Plus)?,
                };
            } else {
                template.push(TplSegment::Literal(tok.to_string()));
                state = self.add_edge(state, label)?;
            }
        }
        let terminal = match self.edge(state, &EdgeLabel::Eot) {
            Some(terminal) => terminal,
            None => {
                let terminal = self.add_edge(state, EdgeLabel::Eot)?;
                self.staged.templates.insert(terminal, template);
                terminal
            }
        };
        Ok((self.base.encode_state(terminal)?, varying))
    }

    /// Read-only resolution over the snapshot plus staged edges.
    pub fn lookup_topic_key(&self, tokens: &[&str]) -> Option<(Vec<u8>, Vec<String>)> {
        let mut state = ROOT;
        let mut varying = Vec::new();
        for tok in tokens {
            if let Some(next) = self.edge(state, &EdgeLabel::Token(tok.to_string())) {
                state = next;
            } else if let Some(next) = self.edge(state, &EdgeLabel::Plus) {
                varying.push(tok.to_string());
                state = next;
            } else {
                return None;
            }
        }
        let terminal = self.edge(state, &EdgeLabel::Eot)?;
        let static_key = self.base.encode_state(terminal).ok()?;
        Some((static_key, varying))
    }

    pub fn into_staged(self) -> StagedTrie {
        self.staged
    }

    fn edge(&self, state: StateId, label: &EdgeLabel) -> Option<StateId> {
        if let Some(edges) = self.staged.children.get(&state) {
            if let Some(&child) = edges.get(label) {
                return Some(child);
            }
        }
        self.base.edge(state, label)
    }

    fn token_count(&self, state: StateId) -> usize {
        let staged = self
            .staged
            .children
            .get(&state)
            .map(|edges| {
                edges
                    .keys()
                    .filter(|l| matches!(l, EdgeLabel::Token(_)))
                    .count()
            })
            .unwrap_or(0);
        self.base.token_edge_count(state) + staged
    }

    fn add_edge(&mut self, state: StateId, label: EdgeLabel) -> Result<StateId> {
        let key_bytes = self.base.key_bytes;
        if key_bytes < 8 && self.staged.next_state >= 1u64 << (8 * key_bytes as u32) {
            return Err(Error::StaticKeyOverflow(key_bytes));
        }
        let child = self.staged.next_state;
        self.staged.next_state += 1;
        self.staged.ops.push(self.base.edge_pair(state, &label, child)?);
        self.staged
            .children
            .entry(state)
            .or_default()
            .insert(label, child);
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trie(thresholds: Vec<usize>) -> LtsTrie {
        LtsTrie::new(8, thresholds)
    }

    /// Learn a topic, commit the session, and return its key.
    fn learn(trie: &mut LtsTrie, topic: &str) -> (Vec<u8>, Vec<String>) {
        let tokens: Vec<&str> = topic.split('/').collect();
        let mut session = TrieSession::new(trie);
        let key = session.topic_key(&tokens).unwrap();
        let staged = session.into_staged();
        trie.apply(staged);
        key
    }

    fn lookup(trie: &LtsTrie, topic: &str) -> Option<(Vec<u8>, Vec<String>)> {
        let tokens: Vec<&str> = topic.split('/').collect();
        trie.lookup_topic_key(&tokens)
    }

    // ---------------------------------------------------------------
    // Learning
    // ---------------------------------------------------------------

    #[test]
    fn test_same_topic_same_key() {
        let mut t = trie(vec![100, 10]);
        let (k1, v1) = learn(&mut t, "foo/bar");
        let (k2, v2) = learn(&mut t, "foo/bar");
        assert_eq!(k1, k2);
        assert!(v1.is_empty());
        assert!(v2.is_empty());
    }

    #[test]
    fn test_distinct_topics_distinct_keys() {
        let mut t = trie(vec![100, 10]);
        let (k1, _) = learn(&mut t, "foo/bar");
        let (k2, _) = learn(&mut t, "foo/bar/baz");
        let (k3, _) = learn(&mut t, "foo/qux");
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k2, k3);
    }

    #[test]
    fn test_static_key_width() {
        let mut t = LtsTrie::new(4, vec![100, 10]);
        let (key, _) = learn(&mut t, "a/b");
        assert_eq!(key.len(), 4);
    }

    #[test]
    fn test_saturation_promotes_new_tokens() {
        // Level 1 saturates immediately: every device id is variable.
        let mut t = trie(vec![100, 0, 100]);
        let (k1, v1) = learn(&mut t, "dev/1/temp");
        let (k2, v2) = learn(&mut t, "dev/2/temp");
        assert_eq!(k1, k2);
        assert_eq!(v1, vec!["1".to_string()]);
        assert_eq!(v2, vec!["2".to_string()]);
    }

    #[test]
    fn test_saturation_after_threshold() {
        let mut t = trie(vec![100, 2]);
        let (ka, va) = learn(&mut t, "dev/a");
        let (kb, vb) = learn(&mut t, "dev/b");
        // Two distinct tokens reach the threshold; "c" is promoted.
        let (kc, vc) = learn(&mut t, "dev/c");
        let (kd, vd) = learn(&mut t, "dev/d");
        assert!(va.is_empty() && vb.is_empty());
        assert_ne!(ka, kb);
        assert_eq!(kc, kd);
        assert_eq!(vc, vec!["c".to_string()]);
        assert_eq!(vd, vec!["d".to_string()]);
    }

    #[test]
    fn test_threshold_list_last_entry_repeats() {
        // [100, 0]: level 1 and every deeper level promote immediately.
        let mut t = trie(vec![100, 0]);
        let (k1, v1) = learn(&mut t, "dev/1/temp");
        let (k2, v2) = learn(&mut t, "dev/2/humidity");
        assert_eq!(k1, k2);
        assert_eq!(v1, vec!["1".to_string(), "temp".to_string()]);
        assert_eq!(v2, vec!["2".to_string(), "humidity".to_string()]);
    }

    #[test]
    fn test_empty_threshold_list_never_promotes() {
        let mut t = trie(Vec::new());
        for i in 0..50u64 {
            let (_, varying) = learn(&mut t, &format!("dev/{i}"));
            assert!(varying.is_empty());
        }
        assert_eq!(t.info().shapes, 50);
    }

    #[test]
    fn test_literal_edge_wins_after_saturation() {
        let mut t = trie(vec![100, 1]);
        let (ka, _) = learn(&mut t, "dev/a");
        let (_kb, vb) = learn(&mut t, "dev/b");
        assert_eq!(vb, vec!["b".to_string()]);
        // "a" earned its literal edge before saturation and keeps it.
        let (ka2, va2) = learn(&mut t, "dev/a");
        assert_eq!(ka, ka2);
        assert!(va2.is_empty());
    }

    #[test]
    fn test_session_sees_own_edges() {
        let t = trie(vec![100, 10]);
        let mut session = TrieSession::new(&t);
        let (k1, _) = session.topic_key(&["new", "topic"]).unwrap();
        let (k2, _) = session.topic_key(&["new", "topic"]).unwrap();
        assert_eq!(k1, k2);
        // Only one set of edges was staged for the shared path.
        let staged = session.into_staged();
        assert_eq!(staged.ops.len(), 3); // new, topic, eot
    }

    #[test]
    fn test_info_counts_shapes() {
        let mut t = trie(vec![100, 10]);
        learn(&mut t, "a/b");
        learn(&mut t, "a/c");
        assert_eq!(t.info().shapes, 2);
    }

    // ---------------------------------------------------------------
    // Lookup (read-only)
    // ---------------------------------------------------------------

    #[test]
    fn test_lookup_fails_closed() {
        let mut t = trie(vec![100, 10]);
        learn(&mut t, "foo/bar");
        assert!(lookup(&t, "foo/bar").is_some());
        assert!(lookup(&t, "foo/baz").is_none());
        assert!(lookup(&t, "foo").is_none());
        assert!(lookup(&t, "foo/bar/baz").is_none());
    }

    #[test]
    fn test_lookup_follows_wildcard() {
        let mut t = trie(vec![100, 0, 100]);
        let (key, _) = learn(&mut t, "dev/1/temp");
        let found = lookup(&t, "dev/99/temp").unwrap();
        assert_eq!(found.0, key);
        assert_eq!(found.1, vec!["99".to_string()]);
    }

    // ---------------------------------------------------------------
    // Reverse lookup and templates
    // ---------------------------------------------------------------

    #[test]
    fn test_reverse_lookup_literal_shape() {
        let mut t = trie(vec![100, 10]);
        let (key, _) = learn(&mut t, "foo/bar");
        let template = t.reverse_lookup(&key).unwrap();
        assert_eq!(
            template,
            &[
                TplSegment::Literal("foo".to_string()),
                TplSegment::Literal("bar".to_string())
            ]
        );
    }

    #[test]
    fn test_reverse_lookup_wildcard_shape() {
        let mut t = trie(vec![100, 0, 100]);
        let (key, _) = learn(&mut t, "dev/7/temp");
        let template = t.reverse_lookup(&key).unwrap();
        assert_eq!(
            template,
            &[
                TplSegment::Literal("dev".to_string()),
                TplSegment::Wildcard,
                TplSegment::Literal("temp".to_string())
            ]
        );
    }

    #[test]
    fn test_reverse_lookup_unknown_key() {
        let t = trie(vec![100, 10]);
        let missing = 99u64.to_be_bytes().to_vec();
        assert!(matches!(
            t.reverse_lookup(&missing),
            Err(Error::StaticKeyNotFound)
        ));
    }

    // ---------------------------------------------------------------
    // Filter matching
    // ---------------------------------------------------------------

    fn match_keys(t: &LtsTrie, filter: &str) -> Vec<TopicMatch> {
        t.match_topics(&TopicFilter::parse(filter).unwrap())
    }

    #[test]
    fn test_match_exact_filter() {
        let mut t = trie(vec![100, 10]);
        let (key, _) = learn(&mut t, "foo/bar");
        learn(&mut t, "foo/baz");
        let matches = match_keys(&t, "foo/bar");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].static_key, key);
        assert!(matches[0].varying.is_empty());
    }

    #[test]
    fn test_match_plus_counts_levels() {
        let mut t = trie(vec![100, 10]);
        learn(&mut t, "foo/bar");
        learn(&mut t, "foo/bar/baz");
        assert_eq!(match_keys(&t, "+/+").len(), 1);
        assert_eq!(match_keys(&t, "foo/#").len(), 2);
        assert_eq!(match_keys(&t, "#").len(), 2);
    }

    #[test]
    fn test_match_literal_through_wildcard_edge() {
        let mut t = trie(vec![100, 0, 100]);
        let (key, _) = learn(&mut t, "dev/1/temp");
        let matches = match_keys(&t, "dev/42/temp");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].static_key, key);
        assert_eq!(
            matches[0].varying,
            vec![VaryingConstraint::Exact("42".to_string())]
        );
    }

    #[test]
    fn test_match_hash_over_wildcard_shapes() {
        let mut t = trie(vec![100, 0, 100]);
        learn(&mut t, "dev/1/temp");
        learn(&mut t, "dev/1/humidity");
        let matches = match_keys(&t, "dev/#");
        assert_eq!(matches.len(), 2);
        for m in &matches {
            assert_eq!(m.varying, vec![VaryingConstraint::Any]);
        }
    }

    #[test]
    fn test_match_no_learned_shape() {
        let mut t = trie(vec![100, 10]);
        learn(&mut t, "foo/bar");
        assert!(match_keys(&t, "other/#").is_empty());
    }

    // ---------------------------------------------------------------
    // Dump / restore
    // ---------------------------------------------------------------

    #[test]
    fn test_dump_restore_roundtrip() {
        let mut t = trie(vec![100, 0, 100]);
        let (k1, _) = learn(&mut t, "dev/1/temp");
        let (k2, _) = learn(&mut t, "foo/bar");
        let pairs = t.dump().unwrap();

        let restored = LtsTrie::restore(8, vec![100, 0, 100], &pairs).unwrap();
        assert_eq!(lookup(&restored, "dev/55/temp").unwrap().0, k1);
        assert_eq!(lookup(&restored, "foo/bar").unwrap().0, k2);
        assert_eq!(restored.info(), t.info());

        // Templates were rebuilt from the edges.
        assert_eq!(restored.reverse_lookup(&k1).unwrap(), t.reverse_lookup(&k1).unwrap());
    }

    #[test]
    fn test_restore_continues_learning() {
        let mut t = trie(vec![100, 10]);
        learn(&mut t, "a/b");
        let pairs = t.dump().unwrap();

        let mut restored = LtsTrie::restore(8, vec![100, 10], &pairs).unwrap();
        let (k_old, _) = learn(&mut restored, "a/b");
        let (k_new, _) = learn(&mut restored, "a/c");
        assert_eq!(k_old, lookup(&t, "a/b").unwrap().0);
        assert_ne!(k_new, k_old);
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let pairs = vec![(vec![0u8; 3], vec![1u8; 8])];
        assert!(LtsTrie::restore(8, vec![100, 10], &pairs).is_err());
    }

    // ---------------------------------------------------------------
    // Compression round-trips
    // ---------------------------------------------------------------

    #[test]
    fn test_decompress_restores_topic() {
        let mut t = trie(vec![100, 0, 100]);
        let (key, varying) = learn(&mut t, "dev/17/temp");
        let template = t.reverse_lookup(&key).unwrap();
        let topic = decompress_topic(template, &varying).unwrap();
        assert_eq!(topic.as_str(), "dev/17/temp");
    }

    #[test]
    fn test_decompress_rejects_arity_mismatch() {
        let template = vec![TplSegment::Literal("a".to_string()), TplSegment::Wildcard];
        assert!(decompress_topic(&template, &[]).is_err());
    }

    #[test]
    fn test_compress_filter_roundtrip() {
        let template = vec![
            TplSegment::Literal("dev".to_string()),
            TplSegment::Wildcard,
            TplSegment::Literal("temp".to_string()),
        ];
        let filter = TopicFilter::parse("dev/42/temp").unwrap();
        let constraints = compress_topic_filter(&template, filter.levels()).unwrap();
        assert_eq!(constraints, vec![VaryingConstraint::Exact("42".to_string())]);

        let filter = TopicFilter::parse("dev/+/temp").unwrap();
        let constraints = compress_topic_filter(&template, filter.levels()).unwrap();
        assert_eq!(constraints, vec![VaryingConstraint::Any]);

        let filter = TopicFilter::parse("dev/#").unwrap();
        let constraints = compress_topic_filter(&template, filter.levels()).unwrap();
        assert_eq!(constraints, vec![VaryingConstraint::Any]);
    }

    #[test]
    fn test_compress_filter_incompatible() {
        let template = vec![
            TplSegment::Literal("dev".to_string()),
            TplSegment::Wildcard,
        ];
        let wrong_literal = TopicFilter::parse("other/+").unwrap();
        assert!(compress_topic_filter(&template, wrong_literal.levels()).is_none());
        let too_short = TopicFilter::parse("dev").unwrap();
        assert!(compress_topic_filter(&template, too_short.levels()).is_none());
        let too_long = TopicFilter::parse("dev/+/extra").unwrap();
        assert!(compress_topic_filter(&template, too_long.levels()).is_none());
    }

    #[test]
    fn test_constraints_match_rejects_collision() {
        let constraints = vec![VaryingConstraint::Exact("42".to_string())];
        assert!(constraints_match(&constraints, &["42".to_string()]));
        assert!(!constraints_match(&constraints, &["43".to_string()]));
        assert!(!constraints_match(&constraints, &[]));
    }

    // ---------------------------------------------------------------
    // Staged commit protocol
    // ---------------------------------------------------------------

    #[test]
    fn test_staged_edges_invisible_until_applied() {
        let t = trie(vec![100, 10]);
        let mut session = TrieSession::new(&t);
        session.topic_key(&["fresh", "shape"]).unwrap();
        let staged = session.into_staged();
        // The shared trie has not learned anything yet.
        assert!(lookup(&t, "fresh/shape").is_none());
        assert!(!staged.is_empty());

        let mut t = t;
        t.apply(staged);
        assert!(lookup(&t, "fresh/shape").is_some());
    }

    #[test]
    fn test_ops_mirror_staged_edges() {
        let t = trie(vec![100, 10]);
        let mut session = TrieSession::new(&t);
        session.topic_key(&["x", "y"]).unwrap();
        let staged = session.into_staged();
        // Restoring from just the emitted ops yields the same structure.
        let restored = LtsTrie::restore(8, vec![100, 10], &staged.ops).unwrap();
        assert!(lookup(&restored, "x/y").is_some());
    }
}
