//! The grafting engine: the post-order taxonomy walk that adds missing
//! taxa onto the backbone tree, and the synthetic-subtree builder it
//! grafts in.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::errors::{TactError, TactResult};
use crate::rates::RateTable;
use crate::sampler::get_new_times;
use crate::tree::{Node, NodeId, TactTree, TreeIndex};

/// A constraint describing which tips form an MRCA for the TOML-driven
/// variant of the engine (mirrors a `[[tact]].include`/`.exclude` block).
#[derive(Debug, Clone)]
pub struct Constraint {
    pub mrca: Vec<String>,
    pub stem: bool,
}

/// One `[[tact]]` item: graft `missing` taxa onto the MRCA implied by
/// `include`, respecting `exclude` sub-clades.
#[derive(Debug, Clone)]
pub struct ConstraintItem {
    pub name: String,
    pub missing: usize,
    pub include: Vec<Constraint>,
    pub exclude: Vec<Constraint>,
    pub preserve_generic_monophyly: bool,
}

fn branching_ages(tree: &TactTree, node: NodeId) -> Vec<f64> {
    tree.descendant_ids(node)
        .into_iter()
        .filter(|&n| !tree.get(n).is_leaf())
        .map(|n| tree.get(n).age)
        .collect()
}

fn parent_age_or_self(tree: &TactTree, node: NodeId) -> f64 {
    tree.get(node).parent.map(|p| tree.get(p).age).unwrap_or(tree.get(node).age)
}

/// The oldest age new branching times may be drawn up to: the clade's own
/// crown age, unless the fit behind it is too thin (low crown capture
/// probability, or a singleton) to trust, in which case times are drawn up
/// to the parent's age instead (matching `get_new_branching_times`).
fn told_for(tree: &TactTree, node: NodeId, ccp: f64, min_ccp: f64) -> f64 {
    if ccp < min_ccp {
        parent_age_or_self(tree, node)
    } else {
        tree.get(node).age
    }
}

/// Builds a synthetic binary subtree for `species` given a
/// sorted-descending list of branching `ages` (one per species, the
/// first being the clade's stem age). Returns the id of the detached
/// seed node (not yet attached to any tree); its one child (the crown)
/// is locked so the clade's interior cannot be grafted into again, but
/// its own stem edge remains open.
pub fn create_clade(tree: &mut TactTree, species: &[String], ages: &[f64], rng: &mut impl Rng) -> NodeId {
    let mut ages = ages.to_vec();
    ages.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let seed_age = ages.remove(0);
    let seed = tree.insert_detached(Node::internal(None, seed_age));

    if species.len() == 1 {
        tree.insert_child(seed, Node::leaf(species[0].clone(), 0.0));
        return seed;
    }

    let crown_age = ages.remove(0);
    let crown = tree.insert_child(seed, Node::internal(None, crown_age));

    for &age in &ages {
        let candidates: Vec<NodeId> = tree
            .subtree_ids(crown)
            .into_iter()
            .filter(|&n| tree.get(n).children.len() < 2 && tree.get(n).age > age)
            .collect();
        let chosen = candidates[rng.gen_range(0..candidates.len())];
        tree.insert_child(chosen, Node::internal(None, age));
    }

    let mut shuffled: Vec<String> = species.to_vec();
    shuffled.shuffle(rng);

    let open_slots: Vec<NodeId> = tree
        .subtree_ids(crown)
        .into_iter()
        .flat_map(|n| {
            let need = 2usize.saturating_sub(tree.get(n).children.len());
            std::iter::repeat(n).take(need)
        })
        .collect();

    for (slot, name) in open_slots.into_iter().zip(shuffled.into_iter()) {
        tree.insert_child(slot, Node::leaf(name, 0.0));
    }

    tree.lock(crown, false);
    seed
}

fn draw_clade_times(
    backbone: &TactTree,
    mrca: NodeId,
    birth: f64,
    death: f64,
    ccp: f64,
    min_ccp: f64,
    missing: usize,
    rng: &mut impl Rng,
) -> TactResult<Vec<f64>> {
    let told = told_for(backbone, mrca, ccp, min_ccp);
    let ages = branching_ages(backbone, mrca);
    let mut times = get_new_times(&ages, birth, death, missing, Some(told), Some(0.0), rng)?;

    let parent_age = parent_age_or_self(backbone, mrca);
    let need_extra_tyoung = if backbone.is_fully_locked(mrca) {
        Some(backbone.get(mrca).age)
    } else {
        let min_age = backbone.min_graftable_age(mrca)?;
        let max_time = times.iter().cloned().fold(f64::MIN, f64::max);
        if min_age > max_time {
            Some(min_age)
        } else {
            None
        }
    };
    if let Some(tyoung) = need_extra_tyoung {
        if let Some(extra) = get_new_times(&[], birth, death, 1, Some(parent_age), Some(tyoung), rng)?
            .into_iter()
            .next()
        {
            if let Some(idx) = times
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(i, _)| i)
            {
                times[idx] = extra;
            } else {
                times.push(extra);
            }
        }
    }
    Ok(times)
}

fn taxonomy_depth(tree: &TactTree, node: NodeId) -> usize {
    let mut depth = 0;
    let mut cur = tree.get(node).parent;
    while let Some(id) = cur {
        depth += 1;
        cur = tree.get(id).parent;
    }
    depth
}

fn is_taxonomy_descendant(tree: &TactTree, ancestor: NodeId, node: NodeId) -> bool {
    let mut cur = Some(node);
    while let Some(id) = cur {
        if id == ancestor {
            return true;
        }
        cur = tree.get(id).parent;
    }
    false
}

/// Runs the full post-order grafting state machine over `taxonomy`,
/// mutating `backbone` in place to add every missing taxon.
pub fn run_grafting(
    backbone: &mut TactTree,
    taxonomy: &TactTree,
    rates: &RateTable,
    min_ccp: f64,
    rng: &mut impl Rng,
) -> TactResult<()> {
    let mut tree_tips: HashSet<String> = backbone.all_taxa().into_iter().collect();
    let mut full_clades: Vec<NodeId> = Vec::new();

    for taxon_node in taxonomy.postorder_internal() {
        if taxon_node == taxonomy.root() {
            continue;
        }
        let Some(label) = taxonomy.get(taxon_node).label.clone() else { continue };
        let species: HashSet<String> = taxonomy.leaf_taxa_under(taxon_node).into_iter().collect();
        let extant: Vec<String> = species.iter().filter(|s| tree_tips.contains(*s)).cloned().collect();

        if extant.is_empty() {
            full_clades.push(taxon_node);
            continue;
        }

        let index = TreeIndex::build(backbone);
        let Some(mut mrca) = index.mrca(backbone, &extant) else { continue };
        let species_vec: Vec<String> = species.iter().cloned().collect();
        if !index.is_monophyletic(backbone, mrca, &species_vec) {
            continue;
        }

        if extant.len() == species.len() {
            backbone.lock(mrca, false);
            continue;
        }
        if species.iter().all(|s| tree_tips.contains(s)) {
            backbone.lock(mrca, false);
            continue;
        }

        let rate = rates.get(&label);
        let (birth, death, ccp) = rate.map(|r| (r.birth, r.death, r.ccp)).unwrap_or((0.0, 0.0, 0.0));

        let mut matched: Vec<NodeId> =
            full_clades.iter().copied().filter(|&c| is_taxonomy_descendant(taxonomy, taxon_node, c)).collect();
        matched.shuffle(rng);
        matched.sort_by_key(|&c| std::cmp::Reverse(taxonomy_depth(taxonomy, c)));

        for clade in matched {
            let clade_species: Vec<String> = taxonomy.leaf_taxa_under(clade);
            if clade_species.iter().all(|s| tree_tips.contains(s)) {
                full_clades.retain(|&c| c != clade);
                continue;
            }
            let times = draw_clade_times(backbone, mrca, birth, death, ccp, min_ccp, clade_species.len(), rng)?;
            let seed = create_clade(backbone, &clade_species, &times, rng);
            let stem = backbone.is_fully_locked(mrca) || ccp < min_ccp;
            mrca = backbone.graft(mrca, seed, stem, rng)?;
            tree_tips.extend(clade_species);
            full_clades.retain(|&c| c != clade);
        }

        let now_extant: Vec<String> = species.iter().filter(|s| tree_tips.contains(*s)).cloned().collect();
        if now_extant.len() < species.len() {
            let missing_species: Vec<String> =
                species.iter().filter(|s| !tree_tips.contains(*s)).cloned().collect();
            let tyoung = backbone.min_graftable_age(mrca)?;
            let ages = branching_ages(backbone, mrca);
            let told = told_for(backbone, mrca, ccp, min_ccp);
            let times = get_new_times(&ages, birth, death, missing_species.len(), Some(told), Some(tyoung), rng)?;
            let mut shuffled = missing_species.clone();
            shuffled.shuffle(rng);
            for (name, age) in shuffled.into_iter().zip(times.into_iter()) {
                let stub = backbone.insert_detached(Node::internal(None, age));
                backbone.insert_child(stub, Node::leaf(name, 0.0));
                let stem = ccp < min_ccp;
                mrca = backbone.graft(mrca, stub, stem, rng)?;
            }
            tree_tips.extend(missing_species);
            backbone.lock(mrca, false);
        }
    }

    if !backbone.is_binary() {
        return Err(TactError::Invariant("tree is not binary after grafting".into()));
    }
    backbone.ladderize();
    Ok(())
}

/// Applies one TOML `[[tact]]` constraint item to `tree`, grafting
/// `item.missing` new tips onto the MRCA implied by `item.include`
/// (minus anything re-locked by `item.exclude`).
pub fn apply_constraint(
    tree: &mut TactTree,
    item: &ConstraintItem,
    min_ccp: f64,
    seed: u64,
    rng: &mut impl Rng,
) -> TactResult<()> {
    use crate::numerics::{get_ra, optim_bd};

    let included_tips: Vec<String> = item.include.iter().flat_map(|c| c.mrca.clone()).collect();
    let index = TreeIndex::build(tree);
    let mrca = index.mrca(tree, &included_tips).ok_or_else(|| {
        TactError::Input(format!("could not find MRCA for include tips in constraint {}", item.name))
    })?;

    let extant_tips = tree.leaves_under(mrca).len();
    let should_include_root = extant_tips == 1 && item.include.len() == 1;

    let sf = (extant_tips as f64 / (extant_tips + item.missing) as f64).clamp(1e-9, 1.0);
    let ages = branching_ages(tree, mrca);
    let bd = optim_bd(&ages, sf, should_include_root, true, seed)
        .unwrap_or_else(|_| crate::numerics::get_bd(0.01, 0.0));
    let _ = get_ra(bd.birth, bd.death);

    tree.lock(mrca, true);

    for include in &item.include {
        let inner = TreeIndex::build(tree)
            .mrca(tree, &include.mrca)
            .ok_or_else(|| TactError::Input(format!("could not find MRCA for include {:?}", include.mrca)))?;
        tree.unlock(inner, include.stem);

        if item.preserve_generic_monophyly {
            let mut genera: std::collections::HashMap<String, Vec<String>> = std::collections::HashMap::new();
            for tip in tree.leaf_taxa_under(inner) {
                let genus = tip.split([' ', '_']).next().unwrap_or(&tip).to_string();
                genera.entry(genus).or_default().push(tip);
            }
            if genera.len() > 1 {
                for (_, tips) in genera {
                    if let Some(node) = TreeIndex::build(tree).mrca(tree, &tips) {
                        let leaves: HashSet<String> = tree.leaf_taxa_under(node).into_iter().collect();
                        let wanted: HashSet<String> = tips.iter().cloned().collect();
                        if leaves == wanted {
                            tree.lock(node, true);
                        }
                    }
                }
            }
        }
    }

    for exclude in &item.exclude {
        if let Some(node) = TreeIndex::build(tree).mrca(tree, &exclude.mrca) {
            tree.lock(node, true);
        }
    }

    let told = ages.iter().cloned().fold(f64::MIN, f64::max);
    let tyoung = tree.min_graftable_age(mrca)?;
    let times = get_new_times(&ages, bd.birth, bd.death, item.missing, Some(told), Some(tyoung), rng)?;

    let mut current = mrca;
    for (idx, time) in times.into_iter().enumerate() {
        let name = format!("{} tact {idx}", item.name);
        let stub = tree.insert_detached(Node::internal(None, time));
        tree.insert_child(stub, Node::leaf(name, 0.0));
        current = tree.graft(current, stub, true, rng)?;
    }
    let _ = current;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::RateTable;
    use rand::SeedableRng;

    fn toy_taxonomy() -> TactTree {
        let mut tree = TactTree::with_root(Node::internal(Some("root".into()), 0.0));
        let root = tree.root();
        let fam = tree.insert_child(root, Node::internal(Some("Famidae".into()), 0.0));
        tree.insert_child(fam, Node::leaf("A", 0.0));
        tree.insert_child(fam, Node::leaf("B", 0.0));
        tree.insert_child(fam, Node::leaf("C", 0.0));
        tree
    }

    fn toy_backbone() -> TactTree {
        let mut tree = TactTree::with_root(Node::internal(None, 2.0));
        let root = tree.root();
        tree.insert_child(root, Node::leaf("A", 0.0));
        tree.insert_child(root, Node::leaf("B", 0.0));
        tree
    }

    #[test]
    fn create_clade_produces_correct_leaf_count() {
        let mut tree = TactTree::with_root(Node::internal(None, 0.0));
        let mut rng = rand_pcg::Pcg64::seed_from_u64(3);
        let species = vec!["X".to_string(), "Y".to_string(), "Z".to_string()];
        let ages = vec![3.0, 2.0, 1.0];
        let seed = create_clade(&mut tree, &species, &ages, &mut rng);
        assert_eq!(tree.leaf_taxa_under(seed).len(), 3);
        assert_eq!(tree.get(seed).children.len(), 1);
    }

    #[test]
    fn run_grafting_adds_missing_species_and_stays_binary() {
        let mut backbone = toy_backbone();
        let taxonomy = toy_taxonomy();
        let rates = RateTable::default();
        let mut rng = rand_pcg::Pcg64::seed_from_u64(11);
        run_grafting(&mut backbone, &taxonomy, &rates, 0.8, &mut rng).unwrap();
        assert!(backbone.all_taxa().contains(&"C".to_string()));
        assert!(backbone.is_binary());
    }
}
