//! Arena-allocated rooted tree used for both the taxonomy and the backbone.
//!
//! Nodes are append-only; grafting rewires `parent`/`children` rather than
//! removing anything from the arena, so `NodeId`s stay valid for the life
//! of the tree. Branch lengths are derived from node ages rather than
//! stored, which keeps graft/lock operations to pure topology edits.

use std::collections::HashMap;

use rand::Rng;

use crate::bitset::Bitset;
use crate::errors::{TactError, TactResult};

pub type NodeId = usize;

#[derive(Debug, Clone, Default)]
pub struct Node {
    pub age: f64,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Rank label on a taxonomy-tree internal node (e.g. "Felidae").
    pub label: Option<String>,
    /// Species name on a backbone-tree leaf.
    pub taxon: Option<String>,
    /// Whether the edge above this node is locked against grafting.
    pub locked: bool,
    pub annotations: HashMap<String, String>,
}

impl Node {
    pub fn leaf(taxon: impl Into<String>, age: f64) -> Self {
        Node {
            age,
            taxon: Some(taxon.into()),
            ..Default::default()
        }
    }

    pub fn internal(label: Option<String>, age: f64) -> Self {
        Node {
            age,
            label,
            ..Default::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TactTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl TactTree {
    pub fn with_root(root: Node) -> Self {
        TactTree { nodes: vec![root], root: 0 }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inserts a detached node (no parent yet) and returns its id.
    pub fn insert_detached(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Inserts `node` as a new child of `parent`.
    pub fn insert_child(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        node.parent = Some(parent);
        let id = self.insert_detached(node);
        self.nodes[parent].children.push(id);
        id
    }

    pub fn edge_length(&self, id: NodeId) -> Option<f64> {
        let parent = self.nodes[id].parent?;
        Some(self.nodes[parent].age - self.nodes[id].age)
    }

    /// All node ids in the subtree rooted at `id`, in pre-order,
    /// including `id` itself.
    pub fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.nodes[n].children.iter().rev());
        }
        out
    }

    /// All node ids strictly under `id` (descendants only, `id` excluded).
    pub fn descendant_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = self.subtree_ids(id);
        out.retain(|&n| n != id);
        out
    }

    pub fn leaves_under(&self, id: NodeId) -> Vec<NodeId> {
        self.subtree_ids(id)
            .into_iter()
            .filter(|&n| self.nodes[n].is_leaf())
            .collect()
    }

    pub fn leaf_taxa_under(&self, id: NodeId) -> Vec<String> {
        self.leaves_under(id)
            .into_iter()
            .filter_map(|n| self.nodes[n].taxon.clone())
            .collect()
    }

    pub fn all_leaves(&self) -> Vec<NodeId> {
        self.leaves_under(self.root)
    }

    pub fn all_taxa(&self) -> Vec<String> {
        self.leaf_taxa_under(self.root)
    }

    /// Post-order walk of all internal (non-leaf) node ids, rooted at the
    /// tree's root.
    pub fn postorder_internal(&self) -> Vec<NodeId> {
        let mut order = Vec::new();
        self.postorder_visit(self.root, &mut order);
        order.into_iter().filter(|&n| !self.nodes[n].is_leaf()).collect()
    }

    fn postorder_visit(&self, id: NodeId, out: &mut Vec<NodeId>) {
        for &child in &self.nodes[id].children {
            self.postorder_visit(child, out);
        }
        out.push(id);
    }

    /// Returns `true` if every internal node has exactly two children.
    pub fn is_binary(&self) -> bool {
        self.subtree_ids(self.root)
            .into_iter()
            .all(|n| self.nodes[n].is_leaf() || self.nodes[n].children.len() == 2)
    }

    /// Returns `true` if all leaves under `id` have age `0` (within
    /// `tolerance`).
    pub fn is_ultrametric(&self, tolerance: f64) -> bool {
        self.all_leaves().iter().all(|&n| self.nodes[n].age.abs() <= tolerance)
    }

    /// Locks every descendant edge under `id` against further grafting.
    /// When `stem` is set, also locks the edge above `id` itself.
    pub fn lock(&mut self, id: NodeId, stem: bool) {
        for n in self.descendant_ids(id) {
            self.nodes[n].locked = true;
        }
        if stem {
            self.nodes[id].locked = true;
        }
    }

    /// Unlocks every descendant edge under `id`. When `stem` is set, also
    /// unlocks the edge above `id` itself.
    pub fn unlock(&mut self, id: NodeId, stem: bool) {
        for n in self.descendant_ids(id) {
            self.nodes[n].locked = false;
        }
        if stem {
            self.nodes[id].locked = false;
        }
    }

    /// `true` if every edge in the subtree rooted at `id` (the node's own
    /// edge included) is locked.
    pub fn is_fully_locked(&self, id: NodeId) -> bool {
        self.subtree_ids(id).iter().all(|&n| self.nodes[n].locked)
    }

    /// Candidate edges (by child-node id) available for grafting within
    /// the clade rooted at `recipient`: unlocked, and spanning `age`.
    /// When `stem` is set, the recipient's own subtending edge is also a
    /// candidate.
    fn eligible_edges(&self, recipient: NodeId, age: f64, stem: bool) -> Vec<NodeId> {
        let mut candidates = self.descendant_ids(recipient);
        if stem {
            candidates.push(recipient);
        }
        candidates
            .into_iter()
            .filter(|&n| {
                if self.nodes[n].locked {
                    return false;
                }
                let Some(parent) = self.nodes[n].parent else {
                    return false;
                };
                self.nodes[n].age <= age && age <= self.nodes[parent].age
            })
            .collect()
    }

    /// Minimum age at which a new node could be grafted into the clade
    /// rooted at `id`: the lower bound of the union of unlocked-edge age
    /// intervals, or an error if that union is not a single interval
    /// (some unlocked edges are disjoint from others).
    pub fn min_graftable_age(&self, id: NodeId) -> TactResult<f64> {
        let mut intervals: Vec<(f64, f64)> = self
            .descendant_ids(id)
            .into_iter()
            .filter(|&n| !self.nodes[n].locked)
            .filter_map(|n| {
                let parent = self.nodes[n].parent?;
                Some((self.nodes[n].age, self.nodes[parent].age))
            })
            .collect();
        if intervals.is_empty() {
            return Ok(0.0);
        }
        intervals.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        let mut merged = vec![intervals[0]];
        for &(lo, hi) in &intervals[1..] {
            let last = merged.last_mut().unwrap();
            if lo <= last.1 {
                last.1 = last.1.max(hi);
            } else {
                merged.push((lo, hi));
            }
        }
        if merged.len() > 1 {
            let label = self.nodes[id]
                .taxon
                .clone()
                .or_else(|| self.nodes[id].label.clone())
                .unwrap_or_else(|| format!("node#{id}"));
            return Err(TactError::DisjointConstraint { node: label });
        }
        Ok(merged[0].0)
    }

    /// Grafts the detached subtree rooted at `graft_root` (already given
    /// an age) into the clade rooted at `recipient`, at a uniformly
    /// random eligible edge. Returns the id of the new crown of the
    /// clade (which is `graft_root` itself if the stem edge above
    /// `recipient` was chosen).
    pub fn graft(
        &mut self,
        recipient: NodeId,
        graft_root: NodeId,
        stem: bool,
        rng: &mut impl Rng,
    ) -> TactResult<NodeId> {
        let graft_age = self.nodes[graft_root].age;
        let eligible = self.eligible_edges(recipient, graft_age, stem);
        if eligible.is_empty() {
            let label = self.nodes[recipient]
                .taxon
                .clone()
                .or_else(|| self.nodes[recipient].label.clone())
                .unwrap_or_else(|| format!("node#{recipient}"));
            return Err(TactError::Placement { recipient: label, stem });
        }
        let focal = eligible[rng.gen_range(0..eligible.len())];
        let seed = self.nodes[focal].parent.expect("focal always has a parent");

        if self.nodes[seed].age < graft_age || graft_age < self.nodes[focal].age {
            return Err(TactError::Invariant(format!(
                "graft would produce a negative branch length at node {focal}"
            )));
        }

        self.nodes[seed].children.retain(|&c| c != focal);
        self.nodes[seed].children.push(graft_root);
        self.nodes[graft_root].parent = Some(seed);
        self.nodes[graft_root].children.push(focal);
        self.nodes[focal].parent = Some(graft_root);

        if focal == recipient {
            Ok(graft_root)
        } else {
            Ok(recipient)
        }
    }

    /// Sorts the children of every internal node so that the larger
    /// subtree (by leaf count) comes first, matching dendropy's
    /// `ladderize`.
    pub fn ladderize(&mut self) {
        let order = self.postorder_internal();
        for id in order {
            let mut sizes: Vec<(NodeId, usize)> = self.nodes[id]
                .children
                .iter()
                .map(|&c| (c, self.subtree_ids(c).len()))
                .collect();
            sizes.sort_by(|a, b| b.1.cmp(&a.1));
            self.nodes[id].children = sizes.into_iter().map(|(c, _)| c).collect();
        }
    }
}

/// Bitset-backed most-recent-common-ancestor index, built fresh from the
/// tree's current topology. Rebuild after any grafting operation.
pub struct TreeIndex {
    leaf_index: HashMap<String, usize>,
    node_bitsets: HashMap<NodeId, Bitset>,
    words: usize,
}

impl TreeIndex {
    pub fn build(tree: &TactTree) -> Self {
        let leaves = tree.all_leaves();
        let mut leaf_index = HashMap::new();
        for (i, &leaf) in leaves.iter().enumerate() {
            if let Some(taxon) = &tree.get(leaf).taxon {
                leaf_index.insert(taxon.clone(), i);
            }
        }
        let words = leaf_index.len().div_ceil(64).max(1);

        let mut node_bitsets = HashMap::new();
        Self::compute(tree, tree.root(), &leaf_index, words, &mut node_bitsets);

        TreeIndex { leaf_index, node_bitsets, words }
    }

    fn compute(
        tree: &TactTree,
        id: NodeId,
        leaf_index: &HashMap<String, usize>,
        words: usize,
        out: &mut HashMap<NodeId, Bitset>,
    ) -> Bitset {
        let node = tree.get(id);
        let mut bs = Bitset::zeros(words);
        if node.is_leaf() {
            if let Some(taxon) = &node.taxon {
                if let Some(&idx) = leaf_index.get(taxon) {
                    bs.set(idx);
                }
            }
        } else {
            for &child in &node.children {
                let child_bs = Self::compute(tree, child, leaf_index, words, out);
                bs.or_assign(&child_bs);
            }
        }
        out.insert(id, bs.clone());
        bs
    }

    fn labels_bitset(&self, labels: &[String]) -> Option<Bitset> {
        let mut bs = Bitset::zeros(self.words);
        for label in labels {
            let idx = *self.leaf_index.get(label)?;
            bs.set(idx);
        }
        Some(bs)
    }

    /// Most recent common ancestor of a set of leaf labels, or `None` if
    /// any label is absent from the tree.
    pub fn mrca(&self, tree: &TactTree, labels: &[String]) -> Option<NodeId> {
        let target = self.labels_bitset(labels)?;
        let target_size = target.count_ones();
        if target_size == 0 {
            return None;
        }
        let mut best: Option<(NodeId, usize)> = None;
        for id in tree.subtree_ids(tree.root()) {
            let Some(bs) = self.node_bitsets.get(&id) else { continue };
            if target.is_subset(bs) {
                let size = bs.count_ones();
                if best.map(|(_, best_size)| size < best_size).unwrap_or(true) {
                    best = Some((id, size));
                }
            }
        }
        best.map(|(id, _)| id)
    }

    /// `true` if the leaf set under `node` is a subset of `labels`.
    pub fn is_monophyletic(&self, _tree: &TactTree, node: NodeId, labels: &[String]) -> bool {
        let Some(node_bs) = self.node_bitsets.get(&node) else { return false };
        let Some(target) = self.labels_bitset(labels) else { return false };
        node_bs.is_subset(&target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toy_tree() -> TactTree {
        let mut tree = TactTree::with_root(Node::internal(None, 3.0));
        let root = tree.root();
        let a = tree.insert_child(root, Node::internal(None, 2.0));
        tree.insert_child(root, Node::leaf("D", 0.0));
        tree.insert_child(a, Node::leaf("A", 0.0));
        let bc = tree.insert_child(a, Node::internal(None, 1.0));
        tree.insert_child(bc, Node::leaf("B", 0.0));
        tree.insert_child(bc, Node::leaf("C", 0.0));
        tree
    }

    #[test]
    fn mrca_finds_smallest_enclosing_clade() {
        let tree = toy_tree();
        let index = TreeIndex::build(&tree);
        let bc = index.mrca(&tree, &["B".to_string(), "C".to_string()]).unwrap();
        assert_eq!(tree.leaf_taxa_under(bc).len(), 2);
    }

    #[test]
    fn is_monophyletic_checks_subset() {
        let tree = toy_tree();
        let index = TreeIndex::build(&tree);
        let a = tree
            .descendant_ids(tree.root())
            .into_iter()
            .find(|&n| tree.leaves_under(n).len() == 3)
            .unwrap();
        assert!(index.is_monophyletic(&tree, a, &["A".into(), "B".into(), "C".into(), "D".into()]));
        assert!(!index.is_monophyletic(&tree, a, &["A".into(), "B".into()]));
    }

    #[test]
    fn graft_inserts_leaf_without_negative_branch_lengths() {
        let mut tree = toy_tree();
        let root = tree.root();
        let graft_id = tree.insert_detached(Node::leaf("E", 0.5));
        let mut rng = rand_pcg::Pcg64::seed_from_u64(7);
        tree.graft(root, graft_id, false, &mut rng).unwrap();
        assert!(tree.all_taxa().contains(&"E".to_string()));
        for id in tree.subtree_ids(tree.root()) {
            if let Some(len) = tree.edge_length(id) {
                assert!(len >= -1e-9, "negative edge length at {id}: {len}");
            }
        }
    }

    #[test]
    fn min_graftable_age_is_zero_for_unlocked_tree() {
        let tree = toy_tree();
        assert_eq!(tree.min_graftable_age(tree.root()).unwrap(), 0.0);
    }

    #[test]
    fn is_binary_detects_polytomies() {
        let tree = toy_tree();
        assert!(tree.is_binary());
    }
}
