//! `rvbbit run <cascade.yaml> --input <json|@file>`

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use rvbbit_engine::CascadeStatus;

use crate::bootstrap;

#[derive(Args)]
pub struct RunArgs {
    /// Path to the cascade YAML file
    pub cascade: std::path::PathBuf,

    /// Inputs as inline JSON, or @path to a JSON file
    #[arg(long, default_value = "{}")]
    pub input: String,

    /// Print the full outcome (outputs, state, errors) instead of just the
    /// final output
    #[arg(long)]
    pub verbose: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    let inputs: Value = if let Some(path) = args.input.strip_prefix('@') {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading input file {path}"))?;
        serde_json::from_str(&raw).context("parsing input file as JSON")?
    } else {
        serde_json::from_str(&args.input).context("parsing --input as JSON")?
    };

    let runtime = bootstrap::runtime().await?;
    let outcome = runtime.scheduler.run_file(&args.cascade, inputs).await?;
    runtime.events.flush().await;

    if args.verbose {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "session_id": outcome.session_id,
                "status": outcome.status,
                "outputs": outcome.outputs,
                "state": outcome.state,
                "errors": outcome.errors.iter().map(|e| &e.message).collect::<Vec<_>>(),
            }))?
        );
    } else {
        println!("{}", serde_json::to_string_pretty(&outcome.final_output())?);
    }

    runtime.events.close().await;
    if outcome.status == CascadeStatus::Failed {
        let message = outcome
            .errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "cascade failed".to_string());
        anyhow::bail!(rvbbit_core::Error::Other(message));
    }
    Ok(())
}
