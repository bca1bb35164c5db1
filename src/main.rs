use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::path::PathBuf;

use igsfit::logging::init_logging;
use igsfit::pipeline::{self, PipelineConfig};
use igsfit::reconcile::ReconcileConfig;

const DEFAULT_MODEL_SCRIPT: &str = "create_brms.R";

#[derive(Parser)]
#[command(name = "igsfit")]
#[command(version)]
#[command(about = "Prepare intergenic spacer data and a taxonomy tree for phylogenetic model fitting")]
#[command(long_about = r#"
igsfit - Intergenic spacer model preparation

Builds the inputs of a phylogenetic regression over intergenic regions:
  1. Loads the sample metadata table (ncbi_taxid, Species, ncbi_name, Genome_length)
  2. Builds a tree of the samples' taxa from the NCBI taxonomy
  3. Replaces taxa that end up as internal nodes with their first descendant
     (bounded number of rounds)
  4. Joins the aggregated IGS summary with the metadata and derives
     polarity_bin and log10_length
  5. Runs the model script

OUTPUT FILES (in --output):
  tree.nwk               Ultrametric tree, leaves are taxon_tree ids
  taxon_remap.tsv        ncbi_taxid → taxon_tree
  filtered.tsv           Joined and derived table passed to the model
  brms_fit.log           Model runner stdout and stderr
  brms_err.log           Written only when the model runner fails
  brms_result.txt        Model summary (written by the script)
  brms_model.rds         Serialized model (written by the script)
  brms_results_row.tsv   One-row result table (written by the script)

EXAMPLES:
  igsfit --tsv samples.tsv --igs summary_igs_intergenic.tsv -o brms_output/
  igsfit --tsv samples.tsv --igs summary.tsv --taxdump ./taxonomy --update-taxa --skip-fit
"#)]
struct Args {
    #[arg(long, value_name = "FILE", help_heading = "Input")]
    tsv: PathBuf,

    #[arg(long, value_name = "FILE", help_heading = "Input")]
    igs: PathBuf,

    #[arg(long = "an-column", value_name = "NAME", default_value = "AN", help_heading = "Input")]
    an_column: String,

    #[arg(short = 'o', long, value_name = "DIR", default_value = "./brms_output", help_heading = "Output")]
    output: PathBuf,

    #[arg(long, help_heading = "Output")]
    overwrite: bool,

    #[arg(short = 'v', long, help_heading = "Output")]
    verbose: bool,

    #[arg(long, value_name = "DIR", default_value = "./taxonomy", help_heading = "Taxonomy")]
    taxdump: PathBuf,

    #[arg(long = "update-taxa", help_heading = "Taxonomy")]
    update_taxa: bool,

    #[arg(long = "max-retries", value_name = "NUM", default_value = "2", help_heading = "Taxonomy")]
    max_retries: usize,

    #[arg(long, value_name = "PROG", default_value = "Rscript", help_heading = "Model")]
    rscript: String,

    #[arg(long = "model-script", value_name = "FILE", help_heading = "Model")]
    model_script: Option<PathBuf>,

    #[arg(long = "skip-fit", help_heading = "Model")]
    skip_fit: bool,
}

fn default_model_script() -> Result<PathBuf> {
    let exe = env::current_exe().context("Failed to locate the igsfit executable")?;
    Ok(exe
        .parent()
        .map(|dir| dir.join(DEFAULT_MODEL_SCRIPT))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_SCRIPT)))
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let model_script = match args.model_script {
        Some(path) => path,
        None => default_model_script()?,
    };

    let config = PipelineConfig {
        metadata: args.tsv,
        summary: args.igs,
        output_dir: args.output,
        key_column: args.an_column,
        taxdump_dir: args.taxdump,
        update_taxa: args.update_taxa,
        reconcile: ReconcileConfig {
            max_retries: args.max_retries,
        },
        rscript: args.rscript,
        model_script,
        skip_fit: args.skip_fit,
        overwrite: args.overwrite,
    };

    pipeline::run(&config).context("igsfit failed")?;
    Ok(())
}
