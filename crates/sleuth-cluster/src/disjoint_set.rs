//! Disjoint-set forest over address tokens.
//!
//! Arena of indices: `parent[i]`, `rank[i]`, plus a token → index label map.
//! The forest only grows. `find` compresses the whole visited path onto the
//! root, so after [`DisjointSet::finalize`] every node points straight at its
//! root and [`DisjointSet::clusters`] can read roots without mutation.

use std::collections::HashMap;

use bincode::{Decode, Encode};
use sleuth_core::error::ClusterError;
use sleuth_core::types::Token;

/// Union-find over string labels, union by rank with full path compression.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
    /// index → token, in creation order
    tokens: Vec<Token>,
    labels: HashMap<Token, usize>,
}

/// Serialized forest: index `i` is labelled `tokens[i]`.
#[derive(Encode, Decode)]
struct Snapshot {
    tokens: Vec<String>,
    parent: Vec<u64>,
    rank: Vec<u8>,
}

impl DisjointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label `token` as a new singleton unless it already exists. Returns its index.
    pub fn make_set(&mut self, token: &str) -> usize {
        if let Some(&index) = self.labels.get(token) {
            return index;
        }
        let index = self.parent.len();
        self.parent.push(index);
        self.rank.push(0);
        self.tokens.push(token.to_owned());
        self.labels.insert(token.to_owned(), index);
        index
    }

    /// Root index of `token`'s set.
    pub fn find(&mut self, token: &str) -> Result<usize, ClusterError> {
        let index = self
            .labels
            .get(token)
            .copied()
            .ok_or_else(|| ClusterError::UnknownToken(token.to_owned()))?;
        Ok(self.find_root(index))
    }

    /// Root of forest index `index`.
    pub fn find_index(&mut self, index: usize) -> Result<usize, ClusterError> {
        if index >= self.parent.len() {
            return Err(ClusterError::UnknownIndex(index));
        }
        Ok(self.find_root(index))
    }

    fn find_root(&mut self, index: usize) -> usize {
        let mut root = index;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = index;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Merge the sets of `a` and `b`. Both must be labelled. Returns the surviving root.
    pub fn union(&mut self, a: &str, b: &str) -> Result<usize, ClusterError> {
        let ra = self.find(a)?;
        let rb = self.find(b)?;
        Ok(self.link(ra, rb))
    }

    fn link(&mut self, ra: usize, rb: usize) -> usize {
        if ra == rb {
            return ra;
        }
        let (high, low) = if self.rank[ra] < self.rank[rb] {
            (rb, ra)
        } else {
            (ra, rb)
        };
        self.parent[low] = high;
        if self.rank[high] == self.rank[low] {
            self.rank[high] += 1;
        }
        high
    }

    /// Whether `a` and `b` are in the same set.
    pub fn same_set(&mut self, a: &str, b: &str) -> Result<bool, ClusterError> {
        Ok(self.find(a)? == self.find(b)?)
    }

    /// Flatten the forest: every node points at its root afterwards. Idempotent.
    pub fn finalize(&mut self) {
        for index in 0..self.parent.len() {
            self.find_root(index);
        }
    }

    /// `(token, parent)` pairs in index order. Parents are roots after [`finalize`](Self::finalize).
    pub fn clusters(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.tokens
            .iter()
            .zip(self.parent.iter())
            .map(|(token, parent)| (token.as_str(), *parent))
    }

    /// Number of labelled tokens.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Number of distinct sets.
    pub fn cluster_count(&self) -> usize {
        self.parent
            .iter()
            .enumerate()
            .filter(|(i, p)| *i == **p)
            .count()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.labels.contains_key(token)
    }

    /// Encode the whole forest for durable storage.
    pub fn snapshot(&self) -> Result<Vec<u8>, ClusterError> {
        let snapshot = Snapshot {
            tokens: self.tokens.clone(),
            parent: self.parent.iter().map(|p| *p as u64).collect(),
            rank: self.rank.clone(),
        };
        bincode::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| ClusterError::CorruptSnapshot(e.to_string()))
    }

    /// Rebuild a forest from [`snapshot`](Self::snapshot) bytes.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, ClusterError> {
        let (snapshot, _): (Snapshot, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ClusterError::CorruptSnapshot(e.to_string()))?;

        let len = snapshot.tokens.len();
        if snapshot.parent.len() != len || snapshot.rank.len() != len {
            return Err(ClusterError::CorruptSnapshot(format!(
                "length mismatch: {} tokens, {} parents, {} ranks",
                len,
                snapshot.parent.len(),
                snapshot.rank.len()
            )));
        }

        let mut parent = Vec::with_capacity(len);
        for (i, p) in snapshot.parent.iter().enumerate() {
            let p = usize::try_from(*p)
                .ok()
                .filter(|p| *p < len)
                .ok_or_else(|| ClusterError::CorruptSnapshot(format!("parent of {i} out of range")))?;
            parent.push(p);
        }
        if let Some(node) = first_cyclic(&parent) {
            return Err(ClusterError::CorruptSnapshot(format!(
                "node {node} never reaches a root"
            )));
        }

        let mut labels = HashMap::with_capacity(len);
        for (i, token) in snapshot.tokens.iter().enumerate() {
            if labels.insert(token.clone(), i).is_some() {
                return Err(ClusterError::CorruptSnapshot(format!("duplicate token {token}")));
            }
        }

        Ok(Self {
            parent,
            rank: snapshot.rank,
            tokens: snapshot.tokens,
            labels,
        })
    }
}

/// First node whose parent chain loops without reaching a self-parented root.
fn first_cyclic(parent: &[usize]) -> Option<usize> {
    const UNSEEN: u8 = 0;
    const ON_PATH: u8 = 1;
    const ROOTED: u8 = 2;

    let mut state = vec![UNSEEN; parent.len()];
    let mut path = Vec::new();
    for start in 0..parent.len() {
        let mut node = start;
        while state[node] == UNSEEN && parent[node] != node {
            state[node] = ON_PATH;
            path.push(node);
            node = parent[node];
        }
        if state[node] == ON_PATH {
            return Some(start);
        }
        state[node] = ROOTED;
        for visited in path.drain(..) {
            state[visited] = ROOTED;
        }
    }
    None
}
