use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use process_lca::export;
use process_lca::{
    Catalog, Classifications, FlowDirection, HelperBackend, HelperCommand, ImpactReport,
    LcaError, LcaSetupTable, Pipeline, PipelineConfig, ServiceContext,
};

#[derive(Debug, Parser)]
#[command(
    name = "process-lca",
    disable_help_subcommand = true,
    about = "Life-cycle impact scoring for process-simulation flow sheets",
    long_about = "Classify the streams of a simulator export, normalize them to the reference flow, and score them against the impact categories of an assessment framework.",
    after_help = "Set RUST_LOG=process_lca=debug for detailed progress output."
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Pipeline configuration file (JSON)"
    )]
    config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        conflicts_with = "helper",
        help = "Activity catalog (JSON) serving both inventory and impact engine"
    )]
    catalog: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PROGRAM",
        help = "Helper program speaking the JSON-lines inventory protocol"
    )]
    helper: Option<String>,
    #[arg(
        long = "helper-arg",
        global = true,
        value_name = "ARG",
        allow_hyphen_values = true,
        help = "Argument passed to the helper program, repeat as needed"
    )]
    helper_args: Vec<String>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List the impact categories of the configured framework.
    Categories,
    /// Search the inventory for activities or biosphere flows.
    Search {
        #[arg(long, value_enum, default_value_t = SearchTarget::Technosphere)]
        target: SearchTarget,
        query: String,
    },
    /// Build the setup table and score it.
    Run {
        #[arg(long, value_name = "PATH", help = "Material workbook")]
        material: PathBuf,
        #[arg(long, value_name = "PATH", help = "Utility workbook")]
        utility: Option<PathBuf>,
        #[arg(
            long,
            value_name = "PATH",
            help = "Declared flow types and activities (JSON)"
        )]
        classifications: PathBuf,
        #[arg(
            long = "category",
            value_name = "NAME",
            help = "Impact category to score, repeat as needed (default: all)"
        )]
        categories: Vec<String>,
        #[arg(
            long,
            value_name = "PATH",
            help = "Write the result table to an .xlsx or .csv file"
        )]
        output: Option<PathBuf>,
        #[arg(
            long = "timeout-secs",
            value_name = "SECONDS",
            help = "Abort the run when external calls take longer than this"
        )]
        timeout_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SearchTarget {
    Technosphere,
    /// Resources taken from nature.
    Resource,
    /// Emissions to the environment.
    Emission,
}

fn main() -> Result<(), Box<dyn Error>> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::default(),
    };
    let context = service_context(&cli, &config)?;
    let pipeline = Pipeline::new(context, config);

    match cli.command {
        CliCommand::Categories => {
            for category in pipeline.categories()? {
                println!("{}\t{}", category.method().join(" / "), category.unit);
            }
        }
        CliCommand::Search { target, query } => {
            let options = match target {
                SearchTarget::Technosphere => pipeline.search_technosphere(&query)?,
                SearchTarget::Resource => pipeline.search_biosphere(&query, FlowDirection::Input)?,
                SearchTarget::Emission => pipeline.search_biosphere(&query, FlowDirection::Output)?,
            };
            for option in options {
                println!("{}\t{}", option.value, option.label);
            }
        }
        CliCommand::Run {
            material,
            utility,
            classifications,
            categories,
            output,
            timeout_secs,
        } => {
            let mut guard = pipeline.guard();
            if let Some(seconds) = timeout_secs {
                guard = guard.with_timeout(Duration::from_secs(seconds));
            }

            let material_tables =
                pipeline.parse_material_bytes(&fs::read(&material)?, &file_name(&material))?;
            let utilities = match &utility {
                Some(path) => pipeline.parse_utility_bytes(&fs::read(path)?, &file_name(path))?,
                None => Vec::new(),
            };
            let declarations: Classifications =
                serde_json::from_slice(&fs::read(&classifications)?).map_err(|err| {
                    LcaError::Configuration(format!(
                        "unable to parse {}: {err}",
                        classifications.display()
                    ))
                })?;

            let table =
                pipeline.run_pipeline(&material_tables, &utilities, &declarations, &guard)?;
            print_setup_table(&table);

            let selected = if categories.is_empty() {
                pipeline.categories()?
            } else {
                pipeline.select_categories(&categories)?
            };
            let report = pipeline.compute_impacts(&table, &selected, &guard)?;
            print_totals(&report);

            if let Some(path) = output {
                export::write_results(&report, &path)?;
            }
        }
    }

    Ok(())
}

fn service_context(cli: &Cli, config: &PipelineConfig) -> Result<ServiceContext, LcaError> {
    if let Some(path) = &cli.catalog {
        return Ok(ServiceContext::shared(Arc::new(Catalog::from_path(path)?)));
    }

    let command = match &cli.helper {
        Some(program) => Some(HelperCommand {
            program: program.clone(),
            args: cli.helper_args.clone(),
        }),
        None => config.helper.clone(),
    };
    let Some(command) = command else {
        return Err(LcaError::Configuration(
            "provide --catalog, --helper, or a helper in the configuration file".into(),
        ));
    };

    let mut backend = HelperBackend::new(command);
    if let Some(timeout) = config.call_timeout() {
        backend = backend.with_timeout(timeout);
    }
    Ok(ServiceContext::shared(Arc::new(backend)))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_setup_table(table: &LcaSetupTable) {
    println!(
        "Reference flow: {} ({} kg/hr)",
        table.reference_flow, table.reference_mass_flow
    );
    for record in &table.records {
        println!(
            "  {:<24} {:<16} {:<32} {:>12.6} {}",
            record.stream_name,
            record.role.label(),
            record.activity.key(),
            record.amount,
            record
                .activity_unit
                .as_ref()
                .map(|unit| unit.label())
                .unwrap_or("")
        );
    }
    if !table.skipped.is_empty() {
        println!("Not evaluated: {}", table.skipped.join(", "));
    }
}

fn print_totals(report: &ImpactReport) {
    for (category, total) in &report.totals_by_category {
        println!("{category}: {}", total.display());
    }
}
