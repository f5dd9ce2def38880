//! `rvbbit mcp add/list/status` — manage external MCP tool servers.
//!
//! Server definitions live in `<root>/mcp.json`; `status` starts each
//! configured server, introspects its tools, and reports.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use rvbbit_registry::{discover_mcp, McpServerConfig, SkillRegistry};

use crate::bootstrap;

#[derive(Subcommand)]
pub enum McpCommand {
    /// Add a server: `rvbbit mcp add <name> <command> [args...]`
    Add(AddArgs),
    /// List configured servers
    List,
    /// Connect to each server and report its tools
    Status,
}

#[derive(Args)]
pub struct AddArgs {
    pub name: String,
    pub command: String,
    #[arg(trailing_var_arg = true)]
    pub args: Vec<String>,
}

pub async fn execute(command: McpCommand) -> Result<()> {
    match command {
        McpCommand::Add(args) => add(args),
        McpCommand::List => list(),
        McpCommand::Status => status().await,
    }
}

fn load_configs() -> Result<Vec<McpServerConfig>> {
    let path = bootstrap::mcp_config_path();
    match std::fs::read_to_string(&path) {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

fn save_configs(configs: &[McpServerConfig]) -> Result<()> {
    let path = bootstrap::mcp_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(configs)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn add(args: AddArgs) -> Result<()> {
    let mut configs = load_configs()?;
    if configs.iter().any(|c| c.name == args.name) {
        anyhow::bail!("mcp server '{}' already configured", args.name);
    }
    configs.push(McpServerConfig {
        name: args.name.clone(),
        command: args.command,
        args: args.args,
        env: Default::default(),
    });
    save_configs(&configs)?;
    println!("added mcp server '{}'", args.name);
    Ok(())
}

fn list() -> Result<()> {
    let configs = load_configs()?;
    if configs.is_empty() {
        println!("no mcp servers configured (use `rvbbit mcp add`)");
        return Ok(());
    }
    for config in configs {
        println!("{}\t{} {}", config.name, config.command, config.args.join(" "));
    }
    Ok(())
}

async fn status() -> Result<()> {
    let configs = load_configs()?;
    if configs.is_empty() {
        println!("no mcp servers configured");
        return Ok(());
    }
    let registry = SkillRegistry::new();
    let connections = discover_mcp(&registry, &configs).await?;
    for config in &configs {
        match connections.iter().find(|c| c.server == config.name) {
            Some(connection) => {
                println!(
                    "{}\tup\t{} tools: {}",
                    config.name,
                    connection.tools.len(),
                    connection.tools.join(", ")
                );
            }
            None => println!("{}\tdown", config.name),
        }
    }
    Ok(())
}
