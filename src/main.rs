use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use tact::check::compare_taxonomy;
use tact::engine::{apply_constraint, run_grafting};
use tact::io::{
    read_constraints, read_newick, read_taxonomy_csv, write_newick, write_newick_forest,
    write_nexus_forest, write_rates_csv, write_results_csv,
};
use tact::rates::build_rate_table;
use tact::replicate::{check_uniform_tip_counts, run_replicates};
use tact::taxonomy::{build_taxonomic_tree, check_uniform_depth};

#[derive(Parser, Debug)]
#[command(name = "tact", version, about = "Graft missing taxa onto a dated backbone phylogeny")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a ranked taxonomy tree from a CSV table
    BuildTaxonomicTree {
        /// CSV file with rank columns followed by a species column
        taxonomy_csv: PathBuf,
        /// Output Newick path
        #[arg(short, long)]
        output: PathBuf,
        /// Emit extra diagnostics (repeat for more)
        #[arg(short = 'v', action = clap::ArgAction::Count)]
        verbose: u8,
    },
    /// Graft missing taxa onto a backbone phylogeny
    AddTaxa {
        /// Dated, ultrametric backbone Newick tree
        #[arg(long)]
        backbone: PathBuf,
        /// Ranked taxonomy Newick tree (from build-taxonomic-tree)
        #[arg(long)]
        taxonomy: Option<PathBuf>,
        /// TOML constraint file, as an alternative to --taxonomy
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output basename (writes `<output>.newick.tre` / `.nexus.tre`)
        #[arg(short, long)]
        output: PathBuf,
        /// Minimum crown capture probability before falling back to a parent's rate
        #[arg(long, default_value_t = 0.8)]
        min_ccp: f64,
        /// Fit a pure-birth (Yule) process instead of birth-death
        #[arg(long, default_value_t = false)]
        yule: bool,
        /// Number of independent replicates to produce
        #[arg(long, default_value_t = 1)]
        replicates: usize,
        /// RNG seed for the first replicate (subsequent replicates derive from it)
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Run replicates across threads
        #[arg(long, default_value_t = false)]
        parallel: bool,
        #[arg(short = 'v', action = clap::ArgAction::Count)]
        verbose: u8,
    },
    /// Compare a simulated tree's rank monophyly and rates against the backbone
    CheckResults {
        /// Ranked taxonomy Newick tree
        #[arg(long)]
        taxonomy: PathBuf,
        /// Original backbone Newick tree
        #[arg(long)]
        backbone: PathBuf,
        /// TACT-simulated Newick tree
        #[arg(long)]
        simulated: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = false)]
        yule: bool,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(short = 'v', action = clap::ArgAction::Count)]
        verbose: u8,
    },
}

fn log_if(level: u8, threshold: u8, msg: impl AsRef<str>) {
    if level >= threshold {
        eprintln!("{}", msg.as_ref());
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::BuildTaxonomicTree { taxonomy_csv, output, verbose } => {
            run_build_taxonomic_tree(taxonomy_csv, output, verbose)
        }
        Command::AddTaxa { backbone, taxonomy, config, output, min_ccp, yule, replicates, seed, parallel, verbose } => {
            run_add_taxa(backbone, taxonomy, config, output, min_ccp, yule, replicates, seed, parallel, verbose)
        }
        Command::CheckResults { taxonomy, backbone, simulated, output, yule, seed, verbose } => {
            run_check_results(taxonomy, backbone, simulated, output, yule, seed, verbose)
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run_build_taxonomic_tree(taxonomy_csv: PathBuf, output: PathBuf, verbose: u8) -> tact::TactResult<()> {
    let t0 = Instant::now();
    let (headers, rows) = read_taxonomy_csv(&taxonomy_csv)?;
    log_if(verbose, 1, format!("read {} taxonomy rows in {:.3}s", rows.len(), t0.elapsed().as_secs_f64()));

    let tree = build_taxonomic_tree(&headers, &rows)?;
    if let Err(e) = check_uniform_depth(&tree) {
        eprintln!("warning: {e}");
    }

    std::fs::write(&output, write_newick(&tree))?;
    log_if(verbose, 1, format!("wrote {}", output.display()));
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_add_taxa(
    backbone_path: PathBuf,
    taxonomy_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    output: PathBuf,
    min_ccp: f64,
    yule: bool,
    replicates: usize,
    seed: u64,
    parallel: bool,
    verbose: u8,
) -> tact::TactResult<()> {
    let t0 = Instant::now();
    let backbone = read_newick(&backbone_path)?;
    log_if(verbose, 1, format!("read backbone in {:.3}s ({} tips)", t0.elapsed().as_secs_f64(), backbone.all_leaves().len()));

    match (taxonomy_path, config_path) {
        (Some(taxonomy_path), None) => {
            let taxonomy = read_newick(&taxonomy_path)?;

            let t1 = Instant::now();
            let rates = build_rate_table(&taxonomy, &backbone, min_ccp, yule, seed)?;
            log_if(verbose, 1, format!("built rate table in {:.3}s", t1.elapsed().as_secs_f64()));
            write_rates_csv(format!("{}.rates.csv", output.display()), &rates)?;

            let bar = ProgressBar::new(replicates as u64);
            if let Ok(style) = ProgressStyle::with_template("TACT [{bar:40}] {pos}/{len}") {
                bar.set_style(style);
            }
            let t2 = Instant::now();
            let results = run_replicates(&backbone, &taxonomy, &rates, min_ccp, replicates, seed, parallel);
            bar.finish_and_clear();
            log_if(verbose, 1, format!("ran {replicates} replicates in {:.3}s", t2.elapsed().as_secs_f64()));

            if let Some((expected, actual, idx)) = check_uniform_tip_counts(&results) {
                eprintln!("warning: replicate {idx} has {actual} tips, expected {expected}");
            }

            let trees: Vec<_> = results
                .into_iter()
                .filter_map(|r| match r {
                    Ok(t) => Some(t),
                    Err(e) => {
                        eprintln!("warning: a replicate failed: {e}");
                        None
                    }
                })
                .collect();
            if trees.is_empty() {
                return Err(tact::TactError::Invariant("no replicate completed successfully".into()));
            }

            write_newick_forest(format!("{}.newick.tre", output.display()), &trees)?;
            write_nexus_forest(format!("{}.nexus.tre", output.display()), &trees)?;
            Ok(())
        }
        (None, Some(config_path)) => {
            let items = read_constraints(&config_path)?;
            let bar = ProgressBar::new(replicates as u64);
            if let Ok(style) = ProgressStyle::with_template("TACT [{bar:40}] {pos}/{len}") {
                bar.set_style(style);
            }
            let work = |idx: usize| -> tact::TactResult<tact::TactTree> {
                use rand::SeedableRng;
                let mut tree = backbone.clone();
                let mut rng = rand_pcg::Pcg64::seed_from_u64(seed.wrapping_add(idx as u64));
                for item in &items {
                    apply_constraint(&mut tree, item, min_ccp, seed, &mut rng)?;
                }
                if !tree.is_binary() {
                    return Err(tact::TactError::Invariant("tree is not binary after grafting".into()));
                }
                tree.ladderize();
                Ok(tree)
            };
            let results: Vec<_> = if parallel {
                use rayon::prelude::*;
                (0..replicates).into_par_iter().map(work).collect()
            } else {
                (0..replicates).map(work).collect()
            };
            bar.finish_and_clear();

            let trees: Vec<_> = results
                .into_iter()
                .filter_map(|r| match r {
                    Ok(t) => Some(t),
                    Err(e) => {
                        eprintln!("warning: a replicate failed: {e}");
                        None
                    }
                })
                .collect();
            if trees.is_empty() {
                return Err(tact::TactError::Invariant("no replicate completed successfully".into()));
            }
            write_newick_forest(format!("{}.newick.tre", output.display()), &trees)?;
            write_nexus_forest(format!("{}.nexus.tre", output.display()), &trees)?;
            Ok(())
        }
        (Some(_), Some(_)) => Err(tact::TactError::Config("pass only one of --taxonomy or --config".into())),
        (None, None) => Err(tact::TactError::Config("one of --taxonomy or --config is required".into())),
    }
}

fn run_check_results(
    taxonomy_path: PathBuf,
    backbone_path: PathBuf,
    simulated_path: PathBuf,
    output: PathBuf,
    yule: bool,
    seed: u64,
    verbose: u8,
) -> tact::TactResult<()> {
    let taxonomy = read_newick(&taxonomy_path)?;
    let backbone = read_newick(&backbone_path)?;
    let simulated = read_newick(&simulated_path)?;

    let t0 = Instant::now();
    let rows = compare_taxonomy(&taxonomy, &backbone, &simulated, yule, seed);
    log_if(verbose, 1, format!("compared {} ranks in {:.3}s", rows.len(), t0.elapsed().as_secs_f64()));

    write_results_csv(&output, &rows)?;
    Ok(())
}
