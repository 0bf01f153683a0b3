//! Construction of a ranked taxonomy tree from a CSV table.
//!
//! Each row is a full rank path (e.g. `Family,Genus,Species`) with the
//! species in the last column. Consecutive rows are diffed against the
//! previous row's rank path to decide how much of the tree to reuse,
//! turning an `O(rows * depth)` table scan into a single pass.

use std::collections::HashMap;

use crate::errors::{TactError, TactResult};
use crate::tree::{Node, NodeId, TactTree};

/// Builds a [`TactTree`] whose internal nodes carry rank labels and whose
/// leaves carry species names, from rows of `(rank values..., species)`.
/// `headers` names each rank column (species column excluded).
pub fn build_taxonomic_tree(headers: &[String], rows: &[Vec<String>]) -> TactResult<TactTree> {
    if rows.is_empty() {
        return Err(TactError::Input("taxonomy table has no rows".into()));
    }

    let mut tree = TactTree::with_root(Node::internal(Some("root".to_string()), 0.0));
    let root = tree.root();

    // path_nodes[i] is the tree node for headers[i] as of the previous row.
    let mut path_nodes: Vec<NodeId> = Vec::new();
    let mut path_values: Vec<String> = Vec::new();
    // Disambiguates identical labels that recur under different parents.
    let mut seen_labels: HashMap<String, usize> = HashMap::new();

    for row in rows {
        if row.len() != headers.len() + 1 {
            return Err(TactError::Input(format!(
                "row has {} columns, expected {} ranks + 1 species column",
                row.len(),
                headers.len()
            )));
        }
        let ranks = &row[..headers.len()];
        let species = row[headers.len()].trim();
        if species.is_empty() {
            return Err(TactError::Input("empty species cell in taxonomy table".into()));
        }
        for cell in ranks {
            if cell.trim().is_empty() {
                return Err(TactError::Input(format!(
                    "empty rank cell for species {species}"
                )));
            }
        }

        let shared = ranks
            .iter()
            .zip(path_values.iter())
            .take_while(|(a, b)| a.as_str() == b.as_str())
            .count();

        path_nodes.truncate(shared);
        path_values.truncate(shared);

        let mut parent = if shared == 0 { root } else { path_nodes[shared - 1] };
        for (rank_value, rank_name) in ranks[shared..].iter().zip(&headers[shared..]) {
            let label = unique_label(rank_value, rank_name, &mut seen_labels);
            let id = tree.insert_child(parent, Node::internal(Some(label), 0.0));
            path_nodes.push(id);
            path_values.push(rank_value.clone());
            parent = id;
        }

        let leaf_label = species.replace('_', " ");
        tree.insert_child(parent, Node::leaf(leaf_label, 0.0));
    }

    Ok(tree)
}

fn unique_label(raw: &str, rank_name: &str, seen: &mut HashMap<String, usize>) -> String {
    let entry = seen.entry(raw.to_string()).or_insert(0);
    *entry += 1;
    if *entry == 1 {
        raw.to_string()
    } else {
        format!("{raw}__{rank_name}__")
    }
}

/// Checks that every leaf has the same number of ranked ancestors,
/// returning the counts grouped by depth when they differ.
pub fn check_uniform_depth(tree: &TactTree) -> TactResult<()> {
    let mut stats: HashMap<usize, usize> = HashMap::new();
    for leaf in tree.all_leaves() {
        let mut depth = 0;
        let mut cur = tree.get(leaf).parent;
        while let Some(id) = cur {
            depth += 1;
            cur = tree.get(id).parent;
        }
        *stats.entry(depth).or_insert(0) += 1;
    }
    if stats.len() > 1 {
        let mut msg = String::from(
            "the tips of the taxonomy tree do not have equal numbers of ranked ancestors:\n",
        );
        let mut keys: Vec<_> = stats.keys().copied().collect();
        keys.sort();
        for k in keys {
            msg.push_str(&format!("* {} tips have {k} ranked ancestors\n", stats[&k]));
        }
        return Err(TactError::Input(msg));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_tree_with_shared_prefixes_collapsed() {
        let headers = vec!["Family".to_string(), "Genus".to_string()];
        let rows = vec![
            vec!["Felidae".into(), "Panthera".into(), "Panthera leo".into()],
            vec!["Felidae".into(), "Panthera".into(), "Panthera tigris".into()],
            vec!["Felidae".into(), "Felis".into(), "Felis catus".into()],
        ];
        let tree = build_taxonomic_tree(&headers, &rows).unwrap();
        assert_eq!(tree.all_taxa().len(), 3);
        check_uniform_depth(&tree).unwrap();
    }

    #[test]
    fn rejects_empty_cells() {
        let headers = vec!["Family".to_string()];
        let rows = vec![vec!["".into(), "Felis catus".into()]];
        assert!(build_taxonomic_tree(&headers, &rows).is_err());
    }

    #[test]
    fn disambiguates_duplicate_labels() {
        let headers = vec!["Order".to_string(), "Family".to_string()];
        let rows = vec![
            vec!["Incertae".into(), "Alpha".into(), "Alpha one".into()],
            vec!["Other".into(), "Alpha".into(), "Alpha two".into()],
        ];
        let tree = build_taxonomic_tree(&headers, &rows).unwrap();
        assert_eq!(tree.all_taxa().len(), 2);
    }
}
