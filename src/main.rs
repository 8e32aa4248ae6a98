//! # CFR Pipeline Main Driver
//!
//! ## Purpose
//! Command-line entry point for the acquisition pipeline: runs the
//! current-period or annual-edition acquisitions, builds the global
//! similarity index, and serves ad-hoc corpus queries.
//!
//! ## Input/Output Specification
//! - **Input**: configuration file, command line arguments, environment
//!   variables
//! - **Output**: a populated corpus database and query results on stdout
//!
//! ## Architecture Flow
//! 1. Parse command line arguments and load configuration
//! 2. Initialize logging and tracing
//! 3. Open the corpus store and build the pipeline
//! 4. Dispatch the requested subcommand

use clap::{Arg, ArgMatches, Command};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cfr_pipeline::{
    config::Config,
    errors::{PipelineError, Result},
    Period, Pipeline, RunSummary,
};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("cfr-pipeline")
        .version("1.0.0")
        .about("Acquires and indexes the Code of Federal Regulations")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.toml"),
        )
        .subcommand(Command::new("current").about("Fetch the current period"))
        .subcommand(Command::new("historical").about("Fetch the configured annual editions"))
        .subcommand(Command::new("all").about("Fetch the current period and all annual editions"))
        .subcommand(
            Command::new("build-index")
                .about("Build the corpus-wide similarity index")
                .arg(period_arg()),
        )
        .subcommand(
            Command::new("similar")
                .about("Sections most similar to a given section")
                .arg(Arg::new("title").required(true).value_parser(clap::value_parser!(u16)))
                .arg(Arg::new("section").required(true))
                .arg(period_arg())
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("global")
                        .long("global")
                        .help("Query the corpus-wide index instead of the peer group")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("pairs")
                .about("Most similar section pairs across the corpus")
                .arg(period_arg())
                .arg(
                    Arg::new("title")
                        .long("title")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("20"),
                )
                .arg(
                    Arg::new("min-similarity")
                        .long("min-similarity")
                        .value_parser(clap::value_parser!(f32))
                        .default_value("0.5"),
                ),
        )
        .subcommand(
            Command::new("duplicates")
                .about("Near-duplicate sections with their full text")
                .arg(period_arg())
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("100"),
                )
                .arg(
                    Arg::new("min-similarity")
                        .long("min-similarity")
                        .value_parser(clap::value_parser!(f32))
                        .default_value("0.95"),
                ),
        )
        .subcommand(
            Command::new("stats")
                .about("Corpus-level similarity statistics")
                .arg(period_arg()),
        )
        .subcommand(
            Command::new("search")
                .about("Substring search over section text")
                .arg(Arg::new("query").required(true))
                .arg(
                    Arg::new("title")
                        .long("title")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(period_arg())
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("10"),
                ),
        )
        .subcommand_required(true)
        .get_matches();

    let config_path = matches.get_one::<String>("config").cloned().unwrap_or_default();
    let config = Config::from_file(&config_path)?;
    init_logging(&config)?;
    info!("configuration loaded from {}", config_path);

    let pipeline = Pipeline::new(config).await?;

    match matches.subcommand() {
        Some(("current", _)) => report(pipeline.run_current().await?),
        Some(("historical", _)) => report(pipeline.run_historical().await?),
        Some(("all", _)) => report(pipeline.run_all().await?),
        Some(("build-index", sub)) => {
            let period = parse_period(sub)?;
            let indexed = pipeline.build_global_index(&period)?;
            println!("indexed {} sections ({})", indexed, period);
        }
        Some(("similar", sub)) => run_similar(&pipeline, sub)?,
        Some(("pairs", sub)) => run_pairs(&pipeline, sub)?,
        Some(("duplicates", sub)) => run_duplicates(&pipeline, sub)?,
        Some(("stats", sub)) => run_stats(&pipeline, sub)?,
        Some(("search", sub)) => run_search(&pipeline, sub)?,
        _ => unreachable!("subcommand is required"),
    }

    Ok(())
}

fn period_arg() -> Arg {
    Arg::new("period")
        .long("period")
        .value_name("PERIOD")
        .help("\"current\" or an annual edition year")
        .default_value("current")
}

fn parse_period(matches: &ArgMatches) -> Result<Period> {
    let raw = matches
        .get_one::<String>("period")
        .map(String::as_str)
        .unwrap_or("current");
    if raw.eq_ignore_ascii_case("current") {
        return Ok(Period::Current);
    }
    raw.parse::<u16>()
        .map(Period::Annual)
        .map_err(|_| PipelineError::Config {
            message: format!("invalid period {:?}, expected \"current\" or a year", raw),
        })
}

fn run_similar(pipeline: &Pipeline, matches: &ArgMatches) -> Result<()> {
    let period = parse_period(matches)?;
    let title = *matches.get_one::<u16>("title").unwrap_or(&0);
    let section_id = matches
        .get_one::<String>("section")
        .cloned()
        .unwrap_or_default();
    let limit = matches.get_one::<usize>("limit").copied();

    let path = pipeline
        .store()
        .sections_for_title(&period, title)?
        .into_iter()
        .map(|s| s.path)
        .find(|p| p.section == section_id)
        .ok_or_else(|| PipelineError::Config {
            message: format!("section {} not found in title {} ({})", section_id, title, period),
        })?;

    let results = if matches.get_flag("global") {
        pipeline.similarity().global_similar(&period, &path, limit)
    } else {
        pipeline.similarity().similar(&period, &path, limit)?
    };

    for result in results {
        println!("{:.4}  {}  {}", result.score, result.path, result.heading);
    }
    Ok(())
}

fn run_pairs(pipeline: &Pipeline, matches: &ArgMatches) -> Result<()> {
    let period = parse_period(matches)?;
    let title = matches.get_one::<u16>("title").copied();
    let limit = matches.get_one::<usize>("limit").copied().unwrap_or(20);
    let floor = matches.get_one::<f32>("min-similarity").copied().unwrap_or(0.5);

    let pairs = pipeline
        .similarity()
        .most_similar_pairs(&period, title, limit, floor)?;
    for pair in pairs {
        println!("{:.4}  {}  <->  {}", pair.score, pair.first, pair.second);
    }
    Ok(())
}

fn run_duplicates(pipeline: &Pipeline, matches: &ArgMatches) -> Result<()> {
    let period = parse_period(matches)?;
    let limit = matches.get_one::<usize>("limit").copied().unwrap_or(100);
    let floor = matches.get_one::<f32>("min-similarity").copied().unwrap_or(0.95);

    let duplicates = pipeline.similarity().find_duplicates(&period, floor, limit)?;
    for dup in duplicates {
        println!(
            "{:.4}  {}  <->  {}",
            dup.pair.score, dup.pair.first, dup.pair.second
        );
        println!("  {}: {}", dup.pair.first, dup.first_text);
        println!("  {}: {}", dup.pair.second, dup.second_text);
    }
    Ok(())
}

fn run_stats(pipeline: &Pipeline, matches: &ArgMatches) -> Result<()> {
    let period = parse_period(matches)?;
    let stats = pipeline.similarity().stats(&period)?;
    println!(
        "pairs {} titles {} avg {:.4}",
        stats.total_pairs, stats.titles_with_pairs, stats.avg_similarity
    );
    for (bucket, count) in stats.distribution.iter().enumerate() {
        println!("  [{:.1}-{:.1})  {}", bucket as f32 / 10.0, (bucket + 1) as f32 / 10.0, count);
    }
    Ok(())
}

fn run_search(pipeline: &Pipeline, matches: &ArgMatches) -> Result<()> {
    let period = parse_period(matches)?;
    let query = matches.get_one::<String>("query").cloned().unwrap_or_default();
    let title = matches.get_one::<u16>("title").copied();
    let limit = matches.get_one::<usize>("limit").copied().unwrap_or(10);

    let hits = pipeline.store().search(&period, &query, title, limit)?;
    for hit in hits {
        println!("{}  {}", hit.path, hit.snippet);
    }
    Ok(())
}

fn report(summary: RunSummary) {
    println!(
        "attempted {} succeeded {} skipped {} failed {} sections {} words {}",
        summary.attempted,
        summary.succeeded,
        summary.skipped,
        summary.failed,
        summary.sections,
        summary.words
    );
}

/// Initialize logging and tracing
fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&config.logging.level))
        .map_err(|e| PipelineError::Config {
            message: format!("invalid log level {:?}: {}", config.logging.level, e),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json_format {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true).json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}
