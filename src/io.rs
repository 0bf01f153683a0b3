//! Newick/NEXUS tree I/O, taxonomy-CSV parsing, rate-table and
//! results-CSV writing, and TOML constraint-file loading.

use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use itertools::{Itertools, Position};
use serde::Deserialize;

use crate::engine::{Constraint, ConstraintItem};
use crate::errors::{TactError, TactResult};
use crate::rates::RateTable;
use crate::tree::{Node, NodeId, TactTree};

// ---------------------------------------------------------------------
// Newick / NEXUS
// ---------------------------------------------------------------------

/// Reads a dated, ultrametric Newick tree into a [`TactTree`], deriving
/// node ages from branch lengths the same way dendropy's
/// `calc_node_ages(is_force_max_age=True)` does: a node's age is the
/// maximum root-to-leaf path length below it, so minor floating-point
/// asymmetry between sister branches does not produce negative lengths
/// elsewhere.
pub fn read_newick(path: impl AsRef<Path>) -> TactResult<TactTree> {
    let content = fs::read_to_string(path.as_ref())?;
    let phylo = phylotree::tree::Tree::from_newick(content.trim())?;
    convert_phylotree(&phylo)
}

fn convert_phylotree(phylo: &phylotree::tree::Tree) -> TactResult<TactTree> {
    let root_id = phylo.get_root()?;
    let root_node = phylo.get(&root_id)?;
    let mut tact = TactTree::with_root(Node::internal(root_node.name.clone(), 0.0));
    let tact_root = tact.root();

    let mut edge_lengths: HashMap<NodeId, f64> = HashMap::new();
    build_children(phylo, root_id, tact_root, &mut tact, &mut edge_lengths)?;
    assign_ages(&mut tact, tact.root(), &edge_lengths);
    Ok(tact)
}

fn build_children(
    phylo: &phylotree::tree::Tree,
    phylo_id: usize,
    tact_id: NodeId,
    tact: &mut TactTree,
    edge_lengths: &mut HashMap<NodeId, f64>,
) -> TactResult<()> {
    let node = phylo.get(&phylo_id)?;
    for &child_id in &node.children {
        let child = phylo.get(&child_id)?;
        let is_leaf = child.children.is_empty();
        let new_node = if is_leaf {
            let name = child
                .name
                .clone()
                .ok_or_else(|| TactError::Input("leaf node without a name".into()))?;
            Node::leaf(name.replace('_', " "), 0.0)
        } else {
            Node::internal(child.name.clone(), 0.0)
        };
        let new_id = tact.insert_child(tact_id, new_node);
        edge_lengths.insert(new_id, child.parent_edge.unwrap_or(0.0));
        build_children(phylo, child_id, new_id, tact, edge_lengths)?;
    }
    Ok(())
}

fn assign_ages(tact: &mut TactTree, id: NodeId, edge_lengths: &HashMap<NodeId, f64>) -> f64 {
    let children = tact.get(id).children.clone();
    if children.is_empty() {
        tact.get_mut(id).age = 0.0;
        return 0.0;
    }
    let mut age = 0.0_f64;
    for &child in &children {
        let child_age = assign_ages(tact, child, edge_lengths);
        let edge_len = *edge_lengths.get(&child).unwrap_or(&0.0);
        age = age.max(child_age + edge_len);
    }
    tact.get_mut(id).age = age;
    age
}

fn fmt_newick_node(tree: &TactTree, id: NodeId) -> String {
    let node = tree.get(id);
    let length = tree.edge_length(id);
    if node.is_leaf() {
        let name = node.taxon.clone().unwrap_or_default().replace(' ', "_");
        match length {
            Some(len) => format!("{name}:{len}"),
            None => name,
        }
    } else {
        let children = node
            .children
            .iter()
            .map(|&c| fmt_newick_node(tree, c))
            .collect::<Vec<_>>()
            .join(",");
        let label = node.label.clone().unwrap_or_default();
        match length {
            Some(len) => format!("({children}){label}:{len}"),
            None => format!("({children}){label}"),
        }
    }
}

/// Serializes `tree` as a single Newick string (unrooted convention,
/// no trailing root branch length).
pub fn write_newick(tree: &TactTree) -> String {
    format!("{};", fmt_newick_node(tree, tree.root()))
}

/// Writes a forest (one replicate per line) to `path` as Newick.
pub fn write_newick_forest(path: impl AsRef<Path>, trees: &[TactTree]) -> TactResult<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    for tree in trees {
        writeln!(out, "{}", write_newick(tree))?;
    }
    Ok(())
}

/// Writes a forest to `path` as a minimal NEXUS TREES block (a
/// translate table plus one `TREE` statement per replicate).
pub fn write_nexus_forest(path: impl AsRef<Path>, trees: &[TactTree]) -> TactResult<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    writeln!(out, "#NEXUS")?;
    writeln!(out, "BEGIN TREES;")?;
    if let Some(first) = trees.first() {
        let taxa = first.all_taxa();
        writeln!(out, "\tTRANSLATE")?;
        for (i, pos_taxon) in taxa.iter().with_position().enumerate() {
            let comma = match pos_taxon {
                Position::Last(_) | Position::Only(_) => "",
                _ => ",",
            };
            let taxon = pos_taxon.into_inner();
            writeln!(out, "\t\t{} '{}'{comma}", i + 1, taxon.replace(' ', "_"))?;
        }
        writeln!(out, "\t;")?;
    }
    for (idx, tree) in trees.iter().enumerate() {
        writeln!(out, "\tTREE tact_{idx} = {}", write_newick(tree))?;
    }
    writeln!(out, "END;")?;
    Ok(())
}

// ---------------------------------------------------------------------
// Taxonomy CSV
// ---------------------------------------------------------------------

/// Reads a taxonomy table: rank columns from the CSV header (all but
/// the last column), species names in the last column.
pub fn read_taxonomy_csv(path: impl AsRef<Path>) -> TactResult<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path.as_ref())?;
    let header_record = reader.headers()?.clone();
    if header_record.len() < 2 {
        return Err(TactError::Input("taxonomy CSV needs at least one rank column plus species".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for column in header_record.iter() {
        if !seen.insert(column) {
            return Err(TactError::Input(format!("duplicate column name in taxonomy CSV: {column}")));
        }
    }
    let headers: Vec<String> = header_record.iter().take(header_record.len() - 1).map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok((headers, rows))
}

// ---------------------------------------------------------------------
// Rates CSV
// ---------------------------------------------------------------------

/// Writes the per-rank fitted rate table as CSV:
/// `rank,birth,death,ccp,source`.
pub fn write_rates_csv(path: impl AsRef<Path>, table: &RateTable) -> TactResult<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    writer.write_record(["rank", "birth", "death", "ccp", "source"])?;
    for (label, entry) in table.iter() {
        writer.write_record([
            label.as_str(),
            &entry.birth.to_string(),
            &entry.death.to_string(),
            &entry.ccp.to_string(),
            &entry.source,
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// One row of `check-results` output, comparing a taxonomy rank's
/// representation in the backbone versus a TACT-simulated tree.
#[derive(Debug, Clone)]
pub struct ResultsRow {
    pub node: String,
    pub taxonomy_tips: usize,
    pub backbone_tips: usize,
    pub simulated_tips: usize,
    pub backbone_monophyletic: bool,
    pub simulated_monophyletic: bool,
    pub backbone_birth: f64,
    pub simulated_birth: f64,
    pub backbone_death: f64,
    pub simulated_death: f64,
    pub warnings: Vec<String>,
}

/// Writes `check-results` rows to CSV, with the same header as the
/// original implementation's comparison report.
pub fn write_results_csv(path: impl AsRef<Path>, rows: &[ResultsRow]) -> TactResult<()> {
    let mut writer = csv::Writer::from_path(path.as_ref())?;
    writer.write_record([
        "node",
        "taxonomy_tips",
        "backbone_tips",
        "simulated_tips",
        "backbone_monophyletic",
        "simulated_monophyletic",
        "backbone_birth",
        "simulated_birth",
        "backbone_death",
        "simulated_death",
        "warnings",
    ])?;
    for row in rows {
        writer.write_record([
            row.node.as_str(),
            &row.taxonomy_tips.to_string(),
            &row.backbone_tips.to_string(),
            &row.simulated_tips.to_string(),
            &row.backbone_monophyletic.to_string(),
            &row.simulated_monophyletic.to_string(),
            &row.backbone_birth.to_string(),
            &row.simulated_birth.to_string(),
            &row.backbone_death.to_string(),
            &row.simulated_death.to_string(),
            &row.warnings.join(";"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------
// TOML constraint configuration
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConstraint {
    mrca: Vec<String>,
    #[serde(default)]
    stem: bool,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    name: String,
    missing: usize,
    #[serde(default)]
    include: Vec<RawConstraint>,
    #[serde(default)]
    exclude: Vec<RawConstraint>,
    #[serde(default)]
    preserve_generic_monophyly: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    tact: Vec<RawItem>,
}

fn normalize(raw: RawConstraint) -> Constraint {
    Constraint { mrca: raw.mrca.into_iter().map(|s| s.replace('_', " ")).collect(), stem: raw.stem }
}

/// Loads a `[[tact]]` TOML constraint file, rejecting singleton
/// `include` blocks that do not set `stem = true` (there is no edge
/// above a lone leaf to attach a crown to).
pub fn read_constraints(path: impl AsRef<Path>) -> TactResult<Vec<ConstraintItem>> {
    let content = fs::read_to_string(path.as_ref())?;
    let raw: RawConfig = toml::from_str(&content)?;

    let mut items = Vec::with_capacity(raw.tact.len());
    for item in raw.tact {
        if item.include.is_empty() {
            return Err(TactError::Config(format!("constraint '{}' needs at least one include", item.name)));
        }
        let include: Vec<Constraint> = item.include.into_iter().map(normalize).collect();
        for c in &include {
            if c.mrca.len() == 1 && !c.stem {
                return Err(TactError::Config(format!(
                    "constraint '{}': singleton include {:?} requires stem = true",
                    item.name, c.mrca
                )));
            }
        }
        let exclude: Vec<Constraint> = item.exclude.into_iter().map(normalize).collect();
        items.push(ConstraintItem {
            name: item.name,
            missing: item.missing,
            include,
            exclude,
            preserve_generic_monophyly: item.preserve_generic_monophyly,
        });
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_newick_roundtrips_taxon_names() {
        let mut tree = TactTree::with_root(Node::internal(None, 1.0));
        let root = tree.root();
        tree.insert_child(root, Node::leaf("A", 0.0));
        tree.insert_child(root, Node::leaf("B", 0.0));
        let newick = write_newick(&tree);
        assert!(newick.contains("A:"));
        assert!(newick.contains("B:"));
    }

    #[test]
    fn rejects_singleton_include_without_stem() {
        let toml_text = r#"
            [[tact]]
            name = "test"
            missing = 1
            [[tact.include]]
            mrca = ["Felis catus"]
            stem = false
        "#;
        let path = std::env::temp_dir().join("tact_test_constraints.toml");
        fs::write(&path, toml_text).unwrap();
        let result = read_constraints(&path);
        assert!(result.is_err());
    }
}
