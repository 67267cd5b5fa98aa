//! Tree hash (SHA-256 Merkle) checksums as validated by the archive service
//!
//! Data is split into 1 MiB leaves, each leaf is hashed with SHA-256, then
//! adjacent digests are hashed pairwise level by level until one root remains.
//! An odd digest at the end of a level is carried up unchanged.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

use crate::pool::ChunkResult;

/// Leaf size fixed by the service's checksum algorithm
pub const LEAF_SIZE: usize = 1024 * 1024;

/// Read buffer used when hashing from a reader
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A 32-byte tree hash digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeHash([u8; 32]);

impl TreeHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut out).ok()?;
        Some(Self(out))
    }

    /// Tree hash of zero bytes: the plain SHA-256 of the empty string
    pub fn of_empty() -> Self {
        Self(Sha256::digest(b"").into())
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({})", self.to_hex())
    }
}

/// Checksums of one byte range, computed in a single pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartDigest {
    pub tree: TreeHash,
    /// Plain SHA-256 of the same bytes (used for request signing)
    pub linear: [u8; 32],
    pub length: u64,
}

impl PartDigest {
    pub fn linear_hex(&self) -> String {
        hex::encode(self.linear)
    }
}

/// Incremental tree hasher; holds one leaf state plus one digest per finished leaf
pub struct TreeHasher {
    leaves: Vec<TreeHash>,
    leaf: Sha256,
    leaf_len: usize,
    linear: Sha256,
    total: u64,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            leaves: Vec::new(),
            leaf: Sha256::new(),
            leaf_len: 0,
            linear: Sha256::new(),
            total: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.linear.update(data);
        self.total += data.len() as u64;

        while !data.is_empty() {
            let take = (LEAF_SIZE - self.leaf_len).min(data.len());
            self.leaf.update(&data[..take]);
            self.leaf_len += take;
            data = &data[take..];
            if self.leaf_len == LEAF_SIZE {
                self.finish_leaf();
            }
        }
    }

    fn finish_leaf(&mut self) {
        let digest: [u8; 32] = self.leaf.finalize_reset().into();
        self.leaves.push(TreeHash(digest));
        self.leaf_len = 0;
    }

    pub fn finish(mut self) -> PartDigest {
        if self.leaf_len > 0 {
            self.finish_leaf();
        }
        PartDigest {
            tree: combine(&self.leaves),
            linear: self.linear.finalize().into(),
            length: self.total,
        }
    }
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash everything `reader` yields using a bounded buffer
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<PartDigest> {
    let mut hasher = TreeHasher::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finish())
}

/// Convenience for in-memory data
pub fn hash_bytes(data: &[u8]) -> PartDigest {
    let mut hasher = TreeHasher::new();
    hasher.update(data);
    hasher.finish()
}

fn hash_pair(left: &TreeHash, right: &TreeHash) -> TreeHash {
    let mut h = Sha256::new();
    h.update(left.0);
    h.update(right.0);
    TreeHash(h.finalize().into())
}

/// Fold node digests pairwise up to a single root
pub fn combine(nodes: &[TreeHash]) -> TreeHash {
    if nodes.is_empty() {
        return TreeHash::of_empty();
    }
    let mut level = nodes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [odd] => *odd,
                _ => unreachable!("chunks(2) yields one or two nodes"),
            })
            .collect();
    }
    level[0]
}

/// Whole-archive checksum from per-chunk results, independent of completion order
pub fn combine_chunks(results: &[ChunkResult]) -> TreeHash {
    let mut ordered: Vec<&ChunkResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.index);
    let digests: Vec<TreeHash> = ordered.iter().map(|r| r.checksum).collect();
    combine(&digests)
}
