//! Pre-order build of per-rank birth/death rates and crown capture
//! probabilities, fit against the backbone tree.

use indexmap::IndexMap;

use crate::errors::TactResult;
use crate::numerics::{crown_capture_probability, optim_bd, optim_yule};
use crate::tree::{NodeId, TactTree, TreeIndex};

#[derive(Debug, Clone)]
pub struct RateTableEntry {
    pub birth: f64,
    pub death: f64,
    pub ccp: f64,
    pub source: String,
}

/// Per-rank fitted rates, in taxonomy pre-order (parents before children).
#[derive(Debug, Default)]
pub struct RateTable(IndexMap<String, RateTableEntry>);

impl RateTable {
    pub fn get(&self, label: &str) -> Option<&RateTableEntry> {
        self.0.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RateTableEntry)> {
        self.0.iter()
    }
}

/// Builds the rate table by walking the taxonomy tree in pre-order,
/// fitting a birth-death (or, in Yule mode, pure-birth) process to each
/// labeled rank using the subset of its species present in `backbone`.
pub fn build_rate_table(
    taxonomy: &TactTree,
    backbone: &TactTree,
    min_ccp: f64,
    yule: bool,
    seed: u64,
) -> TactResult<RateTable> {
    let backbone_index = TreeIndex::build(backbone);
    let backbone_taxa: std::collections::HashSet<String> = backbone.all_taxa().into_iter().collect();
    let taxonomy_taxa: Vec<String> = taxonomy.all_taxa();

    let root_extant: Vec<String> = taxonomy_taxa
        .iter()
        .filter(|t| backbone_taxa.contains(*t))
        .cloned()
        .collect();
    let root_sf = (root_extant.len() as f64 / taxonomy_taxa.len() as f64).clamp(1e-9, 1.0);

    let root_ages: Vec<f64> = backbone
        .all_leaves()
        .into_iter()
        .filter_map(|leaf| backbone.get(leaf).parent)
        .map(|p| backbone.get(p).age)
        .collect();
    let root_rates = if root_ages.is_empty() {
        (0.0, 0.0)
    } else if yule {
        optim_yule(&root_ages, root_sf, true, true)
            .map(|bd| (bd.birth, bd.death))
            .unwrap_or((0.0, 0.0))
    } else {
        optim_bd(&root_ages, root_sf, true, true, seed)
            .map(|bd| (bd.birth, bd.death))
            .unwrap_or((0.0, 0.0))
    };

    let mut table = RateTable::default();

    let mut preorder = Vec::new();
    collect_preorder_internal(taxonomy, taxonomy.root(), &mut preorder);

    for node in preorder {
        if node == taxonomy.root() {
            continue;
        }
        let label = match &taxonomy.get(node).label {
            Some(l) => l.clone(),
            None => continue,
        };

        let parent = taxonomy.get(node).parent;
        let (parent_b, parent_d, parent_src) = parent
            .and_then(|p| taxonomy.get(p).label.clone())
            .and_then(|pl| table.get(&pl).map(|e| (e.birth, e.death, e.source.clone())))
            .unwrap_or((root_rates.0, root_rates.1, "ROOT".to_string()));

        let species: Vec<String> = taxonomy.leaf_taxa_under(node);
        let extant_species: Vec<String> =
            species.iter().filter(|s| backbone_taxa.contains(*s)).cloned().collect();

        if extant_species.is_empty() {
            table.0.insert(
                label,
                RateTableEntry {
                    birth: parent_b,
                    death: parent_d,
                    ccp: 0.0,
                    source: format!("from {parent_src} (unsampled)"),
                },
            );
            continue;
        }

        let mrca = backbone_index.mrca(backbone, &extant_species);
        let monophyletic = mrca
            .map(|m| backbone_index.is_monophyletic(backbone, m, &species))
            .unwrap_or(false);
        if mrca.is_none() || !monophyletic {
            table.0.insert(
                label,
                RateTableEntry {
                    birth: parent_b,
                    death: parent_d,
                    ccp: 0.0,
                    source: format!("from {parent_src} (not monophyletic)"),
                },
            );
            continue;
        }
        let mrca = mrca.unwrap();

        let extant = extant_species.len();
        let total = species.len();
        if extant > total {
            table.0.insert(
                label,
                RateTableEntry {
                    birth: parent_b,
                    death: parent_d,
                    ccp: 0.0,
                    source: "extant exceeds total".to_string(),
                },
            );
            continue;
        }

        let ccp = crown_capture_probability(total, extant)?;
        if total == 1 {
            table.0.insert(
                label,
                RateTableEntry { birth: parent_b, death: parent_d, ccp, source: "singleton".to_string() },
            );
            continue;
        }
        if total == 2 {
            table.0.insert(
                label,
                RateTableEntry { birth: parent_b, death: parent_d, ccp, source: "cherry".to_string() },
            );
            continue;
        }
        if ccp < min_ccp {
            table.0.insert(
                label,
                RateTableEntry {
                    birth: parent_b,
                    death: parent_d,
                    ccp,
                    source: "crown capture probability".to_string(),
                },
            );
            continue;
        }

        let ages = branching_ages(backbone, mrca);
        let sf = (extant as f64 / total as f64).clamp(1e-9, 1.0);
        let fitted = if yule {
            optim_yule(&ages, sf, true, true).map(|bd| (bd.birth, bd.death))
        } else {
            optim_bd(&ages, sf, true, true, seed).map(|bd| (bd.birth, bd.death))
        };
        let (b, d) = fitted.unwrap_or((parent_b, parent_d));
        table
            .0
            .insert(label, RateTableEntry { birth: b, death: d, ccp, source: "computed".to_string() });
    }

    Ok(table)
}

fn collect_preorder_internal(tree: &TactTree, id: NodeId, out: &mut Vec<NodeId>) {
    if !tree.get(id).is_leaf() {
        out.push(id);
        for &child in &tree.get(id).children {
            collect_preorder_internal(tree, child, out);
        }
    }
}

fn branching_ages(tree: &TactTree, node: NodeId) -> Vec<f64> {
    tree.descendant_ids(node)
        .into_iter()
        .filter(|&n| !tree.get(n).is_leaf())
        .map(|n| tree.get(n).age)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;

    fn backbone() -> TactTree {
        let mut tree = TactTree::with_root(Node::internal(None, 4.0));
        let root = tree.root();
        let a = tree.insert_child(root, Node::internal(None, 2.0));
        tree.insert_child(root, Node::leaf("D", 0.0));
        tree.insert_child(a, Node::leaf("A", 0.0));
        let bc = tree.insert_child(a, Node::internal(None, 1.0));
        tree.insert_child(bc, Node::leaf("B", 0.0));
        tree.insert_child(bc, Node::leaf("C", 0.0));
        tree
    }

    fn taxonomy() -> TactTree {
        let mut tree = TactTree::with_root(Node::internal(Some("root".into()), 0.0));
        let root = tree.root();
        let fam = tree.insert_child(root, Node::internal(Some("Famidae".into()), 0.0));
        tree.insert_child(fam, Node::leaf("A", 0.0));
        tree.insert_child(fam, Node::leaf("B", 0.0));
        tree.insert_child(fam, Node::leaf("C", 0.0));
        tree.insert_child(fam, Node::leaf("D", 0.0));
        tree.insert_child(fam, Node::leaf("E", 0.0));
        tree
    }

    #[test]
    fn marks_unsampled_rank_when_no_species_present() {
        let backbone = backbone();
        let mut taxonomy = taxonomy();
        let root = taxonomy.root();
        let empty = taxonomy.insert_child(root, Node::internal(Some("Emptidae".into()), 0.0));
        taxonomy.insert_child(empty, Node::leaf("Z", 0.0));

        let table = build_rate_table(&taxonomy, &backbone, 0.8, true, 1).unwrap();
        assert_eq!(table.get("Emptidae").unwrap().source, "from ROOT (unsampled)");
    }

    #[test]
    fn computes_rate_for_well_sampled_rank() {
        let backbone = backbone();
        let taxonomy = taxonomy();
        let table = build_rate_table(&taxonomy, &backbone, 0.1, true, 1).unwrap();
        let entry = table.get("Famidae").unwrap();
        assert!(entry.birth >= 0.0);
    }
}
