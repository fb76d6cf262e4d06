//! Merkle tree commitment over a block's transactions
//!
//! Nodes carry hex strings. A parent is the double SHA-256 of the
//! concatenated hex *text* of its children, and an odd level is padded by
//! repeating its last node.

use super::hash::double_sha256_hex;

/// A node in the merkle tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleNode {
    pub value: String,
    pub children: Vec<MerkleNode>,
}

impl MerkleNode {
    /// Create a leaf node from its already-hashed value
    pub fn leaf(value: String) -> Self {
        Self {
            value,
            children: Vec::new(),
        }
    }

    /// Create an internal node over a chunk of children
    pub fn internal(children: Vec<MerkleNode>) -> Self {
        let combined: String = children.iter().map(|c| c.value.as_str()).collect();
        Self {
            value: double_sha256_hex(combined.as_bytes()),
            children,
        }
    }
}

/// Build the tree over string leaves and return its root
///
/// Each leaf is hashed before it enters the tree. Returns `None` for an
/// empty leaf list.
pub fn compute_root<S: AsRef<str>>(leaves: &[S]) -> Option<MerkleNode> {
    let nodes: Vec<MerkleNode> = leaves
        .iter()
        .map(|leaf| MerkleNode::leaf(double_sha256_hex(leaf.as_ref().as_bytes())))
        .collect();
    find_root(nodes)
}

fn find_root(mut nodes: Vec<MerkleNode>) -> Option<MerkleNode> {
    if nodes.is_empty() {
        return None;
    }

    // A single leaf is still paired with itself once.
    loop {
        let mut next_level = Vec::with_capacity((nodes.len() + 1) / 2);
        for chunk in nodes.chunks(2) {
            let mut pair = chunk.to_vec();
            while pair.len() < 2 {
                pair.push(chunk[chunk.len() - 1].clone());
            }
            next_level.push(MerkleNode::internal(pair));
        }

        if next_level.len() == 1 {
            return next_level.pop();
        }
        nodes = next_level;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> String {
        double_sha256_hex(s.as_bytes())
    }

    #[test]
    fn test_two_leaves() {
        let root = compute_root(&["foo", "bar"]).unwrap();

        let foo_h = h("foo");
        let bar_h = h("bar");
        assert_eq!(root.value, h(&format!("{}{}", foo_h, bar_h)));
        assert_eq!(root.children[0].value, foo_h);
        assert_eq!(root.children[1].value, bar_h);
    }

    #[test]
    fn test_three_leaves_pads_last() {
        let root = compute_root(&["foo", "bar", "baz"]).unwrap();

        let foo_h = h("foo");
        let bar_h = h("bar");
        let baz_h = h("baz");
        let left = h(&format!("{}{}", foo_h, bar_h));
        let right = h(&format!("{}{}", baz_h, baz_h));

        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].value, left);
        assert_eq!(root.children[1].value, right);
        assert_eq!(root.children[1].children[0].value, baz_h);
        assert_eq!(root.children[1].children[1].value, baz_h);
        assert_eq!(root.value, h(&format!("{}{}", left, right)));
    }

    #[test]
    fn test_single_leaf_pairs_with_itself() {
        let root = compute_root(&["only"]).unwrap();
        let leaf = h("only");
        assert_eq!(root.value, h(&format!("{}{}", leaf, leaf)));
        assert_eq!(root.children.len(), 2);
    }

    #[test]
    fn test_empty() {
        let leaves: [&str; 0] = [];
        assert!(compute_root(&leaves).is_none());
    }
}
