//! agreement-rs CLI: activation patching for subject-verb agreement

use std::sync::Arc;

use agreement_rs::explain::{DEFAULT_BASE_URL, DEFAULT_LLM_MODEL, DEFAULT_TIMEOUT_SECS};
use agreement_rs::server::{DEFAULT_HOST, DEFAULT_PORT};
use agreement_rs::{
    AgreementModel, AgreementPipeline, Explainer, ExplainerConfig, Explanation, HookPoint,
    PatchConfig, PatchSite, ServerConfig, DEFAULT_MODEL_ID,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "agreement-rs")]
#[command(about = "Layer-wise activation patching for subject-verb agreement")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Model ID from `HuggingFace`
    #[arg(short, long, env = "MODEL_ID", default_value = DEFAULT_MODEL_ID, global = true)]
    model: String,

    /// Force CPU mode
    #[arg(long, global = true)]
    cpu: bool,

    /// Activation to patch: resid-post or attn-z
    #[arg(long, default_value = "resid-post", global = true)]
    hook: HookPoint,

    /// Positions to patch: verb, differing or all
    #[arg(long, default_value = "verb", global = true)]
    patch_site: PatchSite,

    /// Scan only the first N layers
    #[arg(long, global = true)]
    max_layers: Option<usize>,

    /// API key for the explanation provider (explanations disabled if unset)
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true, global = true)]
    groq_api_key: Option<String>,

    /// Chat model used for explanations
    #[arg(long, env = "LLM_MODEL", default_value = DEFAULT_LLM_MODEL, global = true)]
    llm_model: String,

    /// OpenAI-compatible base URL of the explanation provider
    #[arg(long, env = "LLM_BASE_URL", default_value = DEFAULT_BASE_URL, global = true)]
    llm_base_url: String,

    /// Explanation request timeout in seconds
    #[arg(long, env = "LLM_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS, global = true)]
    llm_timeout_secs: u64,

    /// Address to bind
    #[arg(long, env = "HOST", default_value = DEFAULT_HOST, global = true)]
    host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT, global = true)]
    port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the demo page and the /predict endpoint (default)
    Serve,
    /// Analyze one sentence and print the report
    Analyze {
        /// Sentence containing has/have, is/are, was/were or does/do
        sentence: String,

        /// Print the full JSON response instead of the text report
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let patch = PatchConfig {
        hook: cli.hook,
        site: cli.patch_site,
        max_layers: cli.max_layers,
    };
    patch.validate()?;

    // Load model off the async runtime; downloads and mmap are blocking
    info!("Loading model...");
    let model_id = cli.model.clone();
    let force_cpu = Some(cli.cpu);
    let model = tokio::task::spawn_blocking(move || {
        AgreementModel::from_pretrained_with_device(&model_id, force_cpu)
    })
    .await
    .context("Model loading task failed")??;
    info!(
        "Model: {} layers, {} hidden, {} context",
        model.n_layers(),
        model.d_model(),
        model.n_ctx()
    );

    let explainer = Explainer::from_config(&ExplainerConfig {
        api_key: cli.groq_api_key.clone(),
        model: cli.llm_model.clone(),
        base_url: cli.llm_base_url.clone(),
        timeout_secs: cli.llm_timeout_secs,
    })?;
    let pipeline = Arc::new(AgreementPipeline::new(Arc::new(model), patch, explainer));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Analyze { sentence, json } => analyze(&pipeline, &sentence, json).await,
        Command::Serve => {
            let config = ServerConfig {
                host: cli.host,
                port: cli.port,
            };
            agreement_rs::serve(&config, pipeline).await
        }
    }
}

async fn analyze(pipeline: &AgreementPipeline, sentence: &str, json: bool) -> Result<()> {
    if json {
        let response = pipeline.analyze(sentence).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    let analysis = pipeline.patch(sentence).await?;
    println!("{}", analysis.report());

    println!("\n=== Explanation ===");
    match pipeline.explain(&analysis).await {
        Explanation::Available(text) => println!("{text}"),
        Explanation::Unavailable(reason) => println!("(unavailable: {reason})"),
    }
    Ok(())
}
