use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use finops_rag::answer::{client_from_config, generate_answer};
use finops_rag::eval::{evaluate, load_cases, DEFAULT_KS};
use finops_rag::{load_dataset, Dataset, GuardDecision, InputGuard, RagConfig, RagEngine, SearchParams};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "finops", version = VERSION, about = "FinOps retrieval assistant CLI")]
struct Cli {
    /// TOML configuration file (defaults to $FINOPS_CONFIG, then finops.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the index database path
    #[arg(long = "index-db", global = true)]
    index_db: Option<PathBuf>,
    /// Override the source records file
    #[arg(long, global = true)]
    records: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build (or incrementally rebuild) the index from the records file
    Build,
    /// Ask a question against the current index
    Ask {
        question: String,
        #[arg(long = "top-k")]
        top_k: Option<usize>,
        #[arg(long)]
        threshold: Option<f32>,
        /// Forward the assembled context to the configured generation provider
        #[arg(long, action = ArgAction::SetTrue)]
        generate: bool,
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// Run only the input guard on a piece of text
    Guard { text: String },
    /// Show the stored index header and staleness against the records file
    Inspect,
    /// Recall@k over a JSON list of {id, question, expected} cases
    Eval {
        #[arg(long)]
        cases: PathBuf,
        #[arg(long, value_delimiter = ',')]
        ks: Option<Vec<usize>>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = RagConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(path) = cli.index_db {
        config.store_path = path;
    }
    if let Some(path) = cli.records {
        config.records_path = path;
    }

    match cli.command {
        Commands::Build => {
            let engine = RagEngine::new(&config)?;
            let dataset = read_dataset(&config)?;
            let report = engine.build_index(&dataset)?;
            println!(
                "indexed {} records ({} embedded, {} reused) into {}",
                report.entries,
                report.embedded,
                report.reused,
                config.store_path.display()
            );
            println!("dataset hash {}", report.dataset_hash);
        }
        Commands::Ask {
            question,
            top_k,
            threshold,
            generate,
            json,
        } => {
            let engine = RagEngine::new(&config)?;
            let dataset = read_dataset(&config)?;
            let defaults = engine.params();
            let params = SearchParams {
                top_k: top_k.unwrap_or(defaults.top_k),
                threshold: threshold.unwrap_or(defaults.threshold),
            };
            let response = engine.ask_with(&question, &dataset, params)?;
            let sanitized = match &response.decision {
                GuardDecision::Allow(text) => text.clone(),
                GuardDecision::Reject(rejection) => {
                    bail!("query rejected: {}", rejection.reason);
                }
            };
            let context = response.context.clone().unwrap_or_default();
            let answer = if generate {
                let client = client_from_config(&config.generation)?;
                Some(generate_answer(&client, &context, &sanitized)?)
            } else {
                None
            };
            if json {
                print_json(&AskOutput {
                    response: &response,
                    answer: answer.as_ref().map(|a| a.answer.as_str()),
                })?;
            } else {
                let result = response.result.unwrap_or_default();
                for (rank, scored) in result.matches.iter().enumerate() {
                    println!("{:>2}. {:<24} {:.3}", rank + 1, scored.record_id, scored.score);
                }
                if result.is_empty() {
                    println!("no records above threshold {:.2}", params.threshold);
                }
                println!();
                println!("{context}");
                if let Some(answer) = answer {
                    println!();
                    println!("{}", answer.answer);
                }
            }
        }
        Commands::Guard { text } => {
            let guard = InputGuard::new(&config.guard)?;
            match guard.check(&text) {
                GuardDecision::Allow(sanitized) => println!("allow: {sanitized}"),
                GuardDecision::Reject(rejection) => {
                    println!("reject ({:?}): {}", rejection.category, rejection.reason)
                }
            }
        }
        Commands::Inspect => {
            let engine = RagEngine::new(&config)?;
            let status = engine.status()?;
            print_json(&status)?;
            if let Some(built) = status.dataset_hash.as_deref() {
                match read_dataset(&config) {
                    Ok(dataset) if dataset.hash() == built => println!("index is current"),
                    Ok(dataset) => println!(
                        "index is stale: records hash to {}; run `finops build`",
                        dataset.hash()
                    ),
                    Err(err) => println!("records unavailable: {err:#}"),
                }
            }
        }
        Commands::Eval { cases, ks, out } => {
            let engine = RagEngine::new(&config)?;
            let dataset = read_dataset(&config)?;
            let cases = load_cases(&cases)?;
            let ks = ks.unwrap_or_else(|| DEFAULT_KS.to_vec());
            let threshold = engine.params().threshold;
            let report = evaluate(&cases, &ks, threshold, &dataset, |question, params| {
                engine.search(question, &dataset, params)
            })?;
            for recall in &report.per_k {
                println!(
                    "Recall@{}: {}/{} = {:.2}",
                    recall.k, recall.n_found, recall.n_queries, recall.recall
                );
            }
            if let Some(path) = out {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                let body = serde_json::to_string_pretty(&report)?;
                fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
                println!("saved detailed results to {}", path.display());
            }
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct AskOutput<'a> {
    #[serde(flatten)]
    response: &'a finops_rag::AskResponse,
    answer: Option<&'a str>,
}

fn read_dataset(config: &RagConfig) -> Result<Dataset> {
    load_dataset(&config.records_path, &config.context.tips)
        .with_context(|| format!("failed to load records from {}", config.records_path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ask_flags() {
        let cli = Cli::parse_from([
            "finops",
            "--records",
            "data/r.json",
            "ask",
            "which service is idle?",
            "--top-k",
            "3",
            "--generate",
        ]);
        assert_eq!(cli.records, Some(PathBuf::from("data/r.json")));
        match cli.command {
            Commands::Ask {
                question,
                top_k,
                generate,
                ..
            } => {
                assert_eq!(question, "which service is idle?");
                assert_eq!(top_k, Some(3));
                assert!(generate);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_eval_k_list() {
        let cli = Cli::parse_from(["finops", "eval", "--cases", "cases.json", "--ks", "1,3,10"]);
        match cli.command {
            Commands::Eval { ks, .. } => assert_eq!(ks, Some(vec![1, 3, 10])),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
