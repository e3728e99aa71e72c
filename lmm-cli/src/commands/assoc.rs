//! Association testing.
//!
//! lmm assoc --pheno-file ... --pheno-cols ... --test-markers ... --output-file ...

use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;
use tracing::{info, warn};

use lmm_core::eigen::DEFAULT_MIN_EIGENVALUE;
use lmm_core::kinship::{append_bias, genome_wide_eigen, loco_eigendecompositions};
use lmm_core::model::DirCheckpoint;
use lmm_core::{AssocConfig, AssociationDriver, H2SearchConfig, LikelihoodObjective, Ridge};
use lmm_geno::dosage::read_dosage_table;
use lmm_geno::phenotype::parse_phenotype_file;
use lmm_geno::{InMemoryMarkers, MarkerReader};

#[derive(Args)]
pub struct AssocArgs {
    /// Phenotype/covariate file (tab or space delimited, with header)
    #[arg(long)]
    pheno_file: String,

    /// Phenotype column names (comma-separated)
    #[arg(long)]
    pheno_cols: String,

    /// Covariate column names (comma-separated); an intercept is always added
    #[arg(long, default_value = "")]
    covar_cols: String,

    /// Sample ID column name
    #[arg(long, default_value = "IID")]
    sample_id_col: String,

    /// Dosage table of markers to test
    #[arg(long)]
    test_markers: String,

    /// Dosage table of markers defining the kinship (defaults to the test markers)
    #[arg(long)]
    kinship_markers: Option<String>,

    /// Build one kinship per tested chromosome, leaving that chromosome out
    #[arg(long, default_value = "false")]
    loco: bool,

    /// Select h2 by maximum likelihood instead of REML
    #[arg(long, default_value = "false")]
    ml_search: bool,

    /// Fix the ridge at this natural-log delta instead of searching
    #[arg(long, allow_hyphen_values = true)]
    log_delta: Option<f64>,

    /// Fix the ridge at this heritability instead of searching
    #[arg(long, conflicts_with = "log_delta")]
    h2: Option<f64>,

    /// Number of grid points for the h2 search
    #[arg(long, default_value = "10")]
    n_grid: usize,

    /// Markers read and rotated per batch
    #[arg(long, default_value = "1000")]
    batch_size: usize,

    /// Eigenvalues at or below this are dropped from the kinship
    #[arg(long, default_value_t = DEFAULT_MIN_EIGENVALUE)]
    min_eigenvalue: f64,

    /// Directory for rotation and null-model checkpoints
    #[arg(long)]
    checkpoint_dir: Option<String>,

    /// Output file path
    #[arg(long)]
    output_file: String,
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(|c| c.to_string())
        .collect()
}

/// IDs of `first` present in every other list, in `first` order.
fn shared_samples(first: &[String], others: &[&[String]]) -> Vec<String> {
    first
        .iter()
        .filter(|id| others.iter().all(|o| o.contains(id)))
        .cloned()
        .collect()
}

fn config_from_args(args: &AssocArgs) -> Result<AssocConfig> {
    let fixed_ridge = match (args.h2, args.log_delta) {
        (None, None) => None,
        (h2, log_delta) => Some(Ridge::from_options(h2, log_delta, None)?),
    };
    let config = AssocConfig {
        search: H2SearchConfig {
            n_grid: args.n_grid,
            ..Default::default()
        },
        h2_objective: if args.ml_search {
            LikelihoodObjective::Full
        } else {
            LikelihoodObjective::Restricted
        },
        fixed_ridge,
        batch_size: args.batch_size,
    };
    Ok(config)
}

pub fn run(args: AssocArgs) -> Result<()> {
    info!("=== LMM association testing ===");
    info!("Phenotype file: {}", args.pheno_file);
    info!("Test markers: {}", args.test_markers);

    let config = config_from_args(&args)?;

    let pheno_cols = split_list(&args.pheno_cols);
    let covar_cols = split_list(&args.covar_cols);
    let table = parse_phenotype_file(
        Path::new(&args.pheno_file),
        &pheno_cols,
        &covar_cols,
        &args.sample_id_col,
    )?
    .drop_all_missing()?;
    info!(
        "Loaded {} phenotypes and {} covariates for {} samples",
        table.phenotype_names.len(),
        table.covariate_names.len(),
        table.n_samples()
    );

    let mut test_reader = read_dosage_table(Path::new(&args.test_markers))?;
    let mut kinship_reader: InMemoryMarkers = match &args.kinship_markers {
        Some(path) => read_dosage_table(Path::new(path))?,
        None => test_reader.clone(),
    };

    let samples = shared_samples(
        &table.sample_ids,
        &[test_reader.sample_ids(), kinship_reader.sample_ids()],
    );
    if samples.is_empty() {
        bail!("No overlapping samples between phenotype and marker files");
    }
    info!("Sample intersection: {} samples", samples.len());
    test_reader.set_sample_subset(&samples)?;
    kinship_reader.set_sample_subset(&samples)?;
    let table = table.align_to(&samples)?;

    let (covariates, covariate_names) = append_bias(&table.covariates, &table.covariate_names);

    let kinship = if args.loco {
        let chroms = test_reader.chromosomes()?;
        info!("Building LOCO kinships for {} chromosomes", chroms.len());
        loco_eigendecompositions(&mut kinship_reader, &chroms, args.min_eigenvalue)?
    } else {
        genome_wide_eigen(&mut kinship_reader, args.min_eigenvalue)?
    };

    let mut driver = AssociationDriver::new(
        config,
        kinship,
        covariates,
        covariate_names,
        table.phenotypes,
        table.phenotype_names,
    )?;
    if let Some(dir) = &args.checkpoint_dir {
        info!("Checkpoints in {}", dir);
        driver = driver.with_checkpoint(Arc::new(DirCheckpoint::new(dir)?));
    }

    info!("Testing {} markers...", test_reader.n_markers());
    let results = driver.run(&mut test_reader)?;

    for failure in &results.failures {
        warn!(
            "Untested: phenotype {}, chromosome {}, marker {}: {}",
            failure.phenotype_id,
            failure.chromosome,
            failure.marker_id.as_deref().unwrap_or("(all)"),
            failure.reason
        );
    }

    let output_file = std::fs::File::create(&args.output_file)?;
    let mut writer = BufWriter::new(output_file);
    results.write_sorted(&mut writer)?;
    writer.flush()?;

    info!(
        "{} tests written, {} failures",
        results.records.len(),
        results.failures.len()
    );
    info!("Results written to {}", args.output_file);
    Ok(())
}
