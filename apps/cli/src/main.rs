use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_stream::wrappers::WatchStream;

use sonarbench_core_sdk::{
    catalog::Catalog,
    config::AppConfig,
    coordinator::{RunCoordinator, RunState},
    cost::compute_breakdown,
    db::{self, SqliteStore},
    export::ExportDocument,
    llm::PerplexityDispatcher,
    models::{format_elapsed, ModelStatus, RunParameters, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE},
    pricing::PricingTable,
    server, telemetry,
};

/**
 * \brief Sends one prompt to every Perplexity model and compares the answers.
 */
#[derive(Parser, Debug)]
#[command(name = "sonarbench", version, about = "Compare Perplexity models side by side")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief Run a prompt against every model in the catalog.
     */
    Compare {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
        temperature: f64,
        #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
        max_tokens: u32,
        /** \brief Overrides and replaces the stored key. */
        #[arg(long)]
        api_key: Option<String>,
        /** \brief Directory to write the JSON export into. */
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /**
     * \brief Manage the stored API key.
     */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief List the catalog with prices and context windows.
     */
    Models,

    /**
     * \brief Start the local HTTP API.
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },

    /**
     * \brief Turn the file log on or off.
     */
    Telemetry {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    Set { value: String },
    Clear,
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::from_env().context("read configuration failed")?;
    telemetry::set_log_dir(&config.log_dir);
    let store = SqliteStore::open(&config.db_path).context("open database failed")?;
    telemetry::set_enabled(db::get_telemetry_enabled(&store).unwrap_or(false));

    match cli.command {
        Commands::Compare {
            prompt,
            temperature,
            max_tokens,
            api_key,
            export,
        } => {
            let credential = match api_key {
                Some(key) => {
                    db::remember_credential(&store, &key).context("save api key failed")?;
                    key
                }
                None => db::stored_credential(&store)
                    .context("load api key failed")?
                    .unwrap_or_default(),
            };
            let params = RunParameters {
                prompt,
                temperature,
                max_tokens,
                credential,
            };
            compare(&config, params, export).await?;
        }
        Commands::Key { action } => match action {
            KeyAction::Set { value } => {
                db::remember_credential(&store, &value).context("save api key failed")?;
                println!("Saved API key {}", db::mask_credential(&value));
            }
            KeyAction::Clear => {
                db::remember_credential(&store, "").context("clear api key failed")?;
                println!("Cleared stored API key");
            }
            KeyAction::Show => match db::stored_credential(&store)? {
                Some(key) => println!("Stored API key: {}", db::mask_credential(&key)),
                None if config.fallback_api_key.is_some() => {
                    println!("No stored API key; using PERPLEXITY_API_KEY from the environment")
                }
                None => println!("No API key configured"),
            },
        },
        Commands::Models => {
            let catalog = Catalog::perplexity_default();
            let pricing = PricingTable::perplexity_default();
            for id in catalog.ids() {
                println!(
                    "{:<36} {:<32} {}",
                    id,
                    pricing.describe(id),
                    catalog.context_window(id)
                );
            }
        }
        Commands::Serve { addr } => {
            server::run(&addr, &config).await?;
        }
        Commands::Telemetry { state } => {
            let enabled = state == "on";
            db::set_telemetry_enabled(&store, enabled).context("save telemetry failed")?;
            telemetry::set_enabled(enabled);
            println!(
                "Telemetry {} (log: {})",
                state,
                telemetry::log_path().display()
            );
        }
    }

    Ok(())
}

async fn compare(config: &AppConfig, params: RunParameters, export: Option<PathBuf>) -> Result<()> {
    let dispatcher = Arc::new(PerplexityDispatcher::new(&config.api_base)?);
    let coordinator = RunCoordinator::new(dispatcher, Catalog::perplexity_default())
        .with_fallback_credential(config.fallback_api_key.clone())
        .with_dispatch_timeout(config.dispatch_timeout);
    let pricing = PricingTable::perplexity_default();

    let mut updates = WatchStream::new(coordinator.subscribe());
    coordinator.start(params)?;
    println!("Comparing {} models...", coordinator.catalog().len());

    let mut reported = HashSet::new();
    while let Some(state) = updates.next().await {
        for (id, status) in state.statuses() {
            if status.is_terminal() && reported.insert(id.clone()) {
                match status {
                    ModelStatus::Error { error } => {
                        println!("  ✗ {} [{}] {}", id, status.label(), error)
                    }
                    _ => {
                        let elapsed = state
                            .result(id)
                            .map(|r| format_elapsed(r.elapsed_millis))
                            .unwrap_or_default();
                        println!("  ✓ {} [{}] {}", id, status.label(), elapsed);
                    }
                }
            }
        }
        if state.is_settled() {
            break;
        }
    }

    let state = coordinator.snapshot();
    print_results(&state, &pricing);

    if let Some(dir) = export {
        let doc = ExportDocument::now(&state, &pricing).context("build export failed")?;
        let path = doc.write_to_dir(&dir).context("write export failed")?;
        println!("Exported to {}", path.display());
    }
    Ok(())
}

fn print_results(state: &RunState, pricing: &PricingTable) {
    if let Some(err) = state.headline_error() {
        println!();
        println!("{}", err);
    }
    for result in state.results() {
        let costs = compute_breakdown(pricing.lookup(&result.model_id), &result.token_usage);
        println!();
        println!(
            "== {} ({}, {} context) ==",
            result.model_id,
            format_elapsed(result.elapsed_millis),
            state.catalog().context_window(&result.model_id)
        );
        println!("{}", result.response_text);
        println!(
            "tokens: prompt={} completion={} total={}",
            result.token_usage.prompt, result.token_usage.completion, result.token_usage.total
        );
        println!(
            "cost:   request {} + tokens {} = {}",
            costs.request_cost, costs.token_cost, costs.total
        );
        if !result.citations.is_empty() {
            println!("citations:");
            for (i, url) in result.citations.iter().enumerate() {
                println!("  [{}] {}", i + 1, url);
            }
        }
    }
}
