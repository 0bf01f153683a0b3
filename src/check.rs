//! `check-results`: compares how well a TACT-simulated tree preserves
//! each taxonomy rank's monophyly and fitted rates relative to the
//! original backbone.

use crate::io::ResultsRow;
use crate::numerics::{optim_bd, optim_yule};
use crate::tree::{NodeId, TactTree, TreeIndex};

fn branching_ages(tree: &TactTree, node: NodeId) -> Vec<f64> {
    tree.descendant_ids(node)
        .into_iter()
        .filter(|&n| !tree.get(n).is_leaf())
        .map(|n| tree.get(n).age)
        .collect()
}

fn fit_rates(tree: &TactTree, node: NodeId, sampling_fraction: f64, yule: bool, seed: u64) -> (f64, f64) {
    let ages = branching_ages(tree, node);
    if ages.is_empty() {
        return (0.0, 0.0);
    }
    let result =
        if yule { optim_yule(&ages, sampling_fraction, true, true) } else { optim_bd(&ages, sampling_fraction, true, true, seed) };
    result.map(|bd| (bd.birth, bd.death)).unwrap_or((0.0, 0.0))
}

/// Builds one [`ResultsRow`] per labeled taxonomy rank, comparing the
/// backbone's and the simulated tree's tip counts, monophyly, and
/// locally-fit birth/death rates.
pub fn compare_taxonomy(
    taxonomy: &TactTree,
    backbone: &TactTree,
    simulated: &TactTree,
    yule: bool,
    seed: u64,
) -> Vec<ResultsRow> {
    let backbone_index = TreeIndex::build(backbone);
    let simulated_index = TreeIndex::build(simulated);
    let backbone_taxa: std::collections::HashSet<String> = backbone.all_taxa().into_iter().collect();
    let simulated_taxa: std::collections::HashSet<String> = simulated.all_taxa().into_iter().collect();

    let mut preorder = Vec::new();
    collect_preorder_internal(taxonomy, taxonomy.root(), &mut preorder);

    let mut rows = Vec::new();
    for node in preorder {
        if node == taxonomy.root() {
            continue;
        }
        let Some(label) = taxonomy.get(node).label.clone() else { continue };
        let species = taxonomy.leaf_taxa_under(node);

        let backbone_extant: Vec<String> =
            species.iter().filter(|s| backbone_taxa.contains(s)).cloned().collect();
        let simulated_extant: Vec<String> =
            species.iter().filter(|s| simulated_taxa.contains(s)).cloned().collect();

        let backbone_mrca = backbone_index.mrca(backbone, &backbone_extant);
        let simulated_mrca = simulated_index.mrca(simulated, &simulated_extant);

        let backbone_monophyletic = backbone_mrca
            .map(|m| backbone_index.is_monophyletic(backbone, m, &species))
            .unwrap_or(false);
        let simulated_monophyletic = simulated_mrca
            .map(|m| simulated_index.is_monophyletic(simulated, m, &species))
            .unwrap_or(false);

        let (backbone_birth, backbone_death) = backbone_mrca
            .map(|m| {
                let sf = (backbone_extant.len() as f64 / species.len() as f64).min(1.0);
                fit_rates(backbone, m, sf, yule, seed)
            })
            .unwrap_or((0.0, 0.0));
        let (simulated_birth, simulated_death) = simulated_mrca
            .map(|m| {
                let sf = (simulated_extant.len() as f64 / species.len() as f64).min(1.0);
                fit_rates(simulated, m, sf, yule, seed)
            })
            .unwrap_or((0.0, 0.0));

        let mut warnings = Vec::new();
        if backbone_extant.len() > species.len() || simulated_extant.len() > species.len() {
            warnings.push("more tips than taxonomy suggests".to_string());
        }
        if backbone_monophyletic != simulated_monophyletic {
            warnings.push("monophyly differs between backbone and simulated".to_string());
        }

        rows.push(ResultsRow {
            node: label,
            taxonomy_tips: species.len(),
            backbone_tips: backbone_extant.len(),
            simulated_tips: simulated_extant.len(),
            backbone_monophyletic,
            simulated_monophyletic,
            backbone_birth,
            simulated_birth,
            backbone_death,
            simulated_death,
            warnings,
        });
    }
    rows
}

fn collect_preorder_internal(tree: &TactTree, id: NodeId, out: &mut Vec<NodeId>) {
    if !tree.get(id).is_leaf() {
        out.push(id);
        for &child in &tree.get(id).children {
            collect_preorder_internal(tree, child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Node;

    fn toy_taxonomy() -> TactTree {
        let mut tree = TactTree::with_root(Node::internal(Some("root".into()), 0.0));
        let root = tree.root();
        let fam = tree.insert_child(root, Node::internal(Some("Famidae".into()), 0.0));
        tree.insert_child(fam, Node::leaf("A", 0.0));
        tree.insert_child(fam, Node::leaf("B", 0.0));
        tree
    }

    fn toy_tree() -> TactTree {
        let mut tree = TactTree::with_root(Node::internal(None, 1.0));
        let root = tree.root();
        tree.insert_child(root, Node::leaf("A", 0.0));
        tree.insert_child(root, Node::leaf("B", 0.0));
        tree
    }

    #[test]
    fn reports_one_row_per_labeled_rank() {
        let taxonomy = toy_taxonomy();
        let backbone = toy_tree();
        let simulated = toy_tree();
        let rows = compare_taxonomy(&taxonomy, &backbone, &simulated, true, 1);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].backbone_monophyletic);
        assert!(rows[0].simulated_monophyletic);
    }
}
