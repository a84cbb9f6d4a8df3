// ========================================================================================
//
//                              THE COMMAND LINE: DXMETA
//
// ========================================================================================
//
// Reads a study table, runs the batch and writes the tables. The analysis itself
// lives in the library; this file resolves paths, loads the configuration, reports
// progress on stderr and turns any fatal error into a non-zero exit status.

use clap::{Parser, Subcommand};
use dxmeta::config::AnalysisConfig;
use dxmeta::data::load_study_table;
use dxmeta::pipeline::{BatchReport, analyze_rows};
use dxmeta::report::{bias_verdict, write_report, write_validation_log};
use dxmeta::validate::validate_rows;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "dxmeta",
    version,
    about = "Bivariate random-effects meta-analysis of diagnostic test accuracy."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate, pool and report every biomarker in a study table.
    Analyze {
        /// Tab-separated study table (comma-separated if the name ends in .csv).
        input: PathBuf,

        /// TOML file overriding the default analysis settings.
        #[clap(long)]
        config: Option<PathBuf>,

        /// Directory for the output tables.
        #[clap(long, default_value = "dxmeta_out")]
        out: PathBuf,
    },
    /// Check a study table and write the per-row validation log without pooling.
    Validate {
        input: PathBuf,

        #[clap(long)]
        config: Option<PathBuf>,

        /// Where to write the validation log.
        #[clap(long, default_value = "validation.tsv")]
        out: PathBuf,
    },
}

// ========================================================================================
//                                   ENTRY POINT
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let start_time = Instant::now();

    let args = Args::parse();
    match args.command {
        Command::Analyze { input, config, out } => {
            let config = load_config(config.as_deref());
            let report = run_analysis(&input, &config);
            print_summary(&report);
            match write_report(&report, &out) {
                Ok(paths) => eprintln!("> Wrote {} files to {}", paths.len(), out.display()),
                Err(e) => {
                    eprintln!("Error writing the report: {}", e);
                    process::exit(1);
                }
            }
        }
        Command::Validate { input, config, out } => {
            let config = load_config(config.as_deref());
            let rows = read_table(&input);
            let validation = validate_rows(rows, &config);
            eprintln!(
                "> {} accepted, {} corrected, {} rejected.",
                validation.accepted.len(),
                validation.corrected_count(),
                validation.rejected_count()
            );
            if let Err(e) = write_validation_log(&validation, &out) {
                eprintln!("Error writing the validation log: {}", e);
                process::exit(1);
            }
            eprintln!("> Validation log written to {}", out.display());
        }
    }

    eprintln!("> Finished in {:.2?}.", start_time.elapsed());
}

// ========================================================================================
//                                     HELPERS
// ========================================================================================

fn load_config(path: Option<&Path>) -> AnalysisConfig {
    let Some(path) = path else {
        return AnalysisConfig::default();
    };
    eprintln!("> Loading configuration from {}", path.display());
    match AnalysisConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    }
}

fn read_table(input: &Path) -> Vec<dxmeta::data::IngestedRow> {
    eprintln!("> Reading studies from {}", input.display());
    match load_study_table(input) {
        Ok(rows) => rows,
        Err(e) => {
            eprintln!("Error reading the study table: {}", e);
            process::exit(1);
        }
    }
}

fn run_analysis(input: &Path, config: &AnalysisConfig) -> BatchReport {
    let rows = read_table(input);
    match analyze_rows(rows, config) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(1);
        }
    }
}

fn print_summary(report: &BatchReport) {
    eprintln!(
        "> {} studies accepted ({} continuity-corrected), {} rejected.",
        report.validation.accepted.len(),
        report.validation.corrected_count(),
        report.validation.rejected_count()
    );
    for biomarker in &report.biomarkers {
        match biomarker.pooled() {
            Some(pooled) => {
                let estimate = &pooled.analysis.estimate;
                eprintln!(
                    "> {} ({} studies): sensitivity {:.3} [{:.3}, {:.3}], specificity {:.3} [{:.3}, {:.3}], evidence {}",
                    biomarker.biomarker,
                    biomarker.n_studies,
                    estimate.sensitivity.estimate,
                    estimate.sensitivity.lower,
                    estimate.sensitivity.upper,
                    estimate.specificity.estimate,
                    estimate.specificity.lower,
                    estimate.specificity.upper,
                    pooled.evidence_grade
                );
            }
            None => eprintln!(
                "> {} ({} studies): narrative synthesis only",
                biomarker.biomarker, biomarker.n_studies
            ),
        }
        eprintln!("    publication bias: {}", bias_verdict(&biomarker.publication_bias));
    }
}
