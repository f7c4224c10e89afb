//! portgate - operator CLI
//!
//! Thin command-line front end over the reconciliation engine. The
//! orchestration layer normally embeds the library; this binary is for
//! operators and for the boot hook that restores enforcement after a
//! restart.
//!
//! # Usage
//!
//! ```bash
//! portgate list --server mc-01                      # Declared rules of one server
//! portgate add mc-01 203.0.113.0/24 25565 --kind block --priority 50
//! portgate update 7 --priority 10                   # Patch a rule
//! portgate remove 7                                 # Delete a rule
//! portgate sync mc-01                               # Re-apply one server
//! portgate rebuild                                  # Re-apply everything (boot hook)
//! portgate cleanup mc-01 --ports 25565,27015-27020  # Drop rules outside the allocation
//! portgate purge mc-01                              # Delete every rule of a server
//! portgate status                                   # Backend and drift overview
//! ```

use clap::{Parser, Subcommand};
use portgate::config::{self, AppConfig};
use portgate::core::allocation::PortRange;
use portgate::core::enforcement::default_adapter;
use portgate::core::json_store::JsonFileStore;
use portgate::core::rule::{Rule, RulePatch, RuleRequest};
use portgate::{BulkOutcome, Manager, audit, utils};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "portgate")]
#[command(about = "Per-server port access rules enforced ahead of Docker NAT", long_about = None)]
struct Cli {
    /// Config file (default: <data_dir>/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List declared rules
    List {
        /// Only rules of this server
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Declare and enforce a new rule
    Add {
        server: String,
        /// Remote address or CIDR
        remote: String,
        port: u32,
        /// allow or block
        #[arg(short, long, default_value = "allow")]
        kind: String,
        /// tcp or udp (default: tcp)
        #[arg(short, long)]
        protocol: Option<String>,
        /// Lower sorts earlier (default: 100)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(short, long, default_value = "")]
        description: String,
    },
    /// Change fields of an existing rule
    Update {
        id: u64,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        port: Option<u32>,
        #[arg(long)]
        protocol: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        priority: Option<i32>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a rule
    Remove { id: u64 },
    /// Re-apply every rule of a server
    Sync { server: String },
    /// Re-apply every rule of every server
    Rebuild,
    /// Delete rules whose port is no longer allocated to the server
    Cleanup {
        server: String,
        /// Allocated ports, e.g. 25565,27015-27020
        #[arg(long, value_delimiter = ',', required = true)]
        ports: Vec<PortRange>,
    },
    /// Delete every rule of a server
    Purge { server: String },
    /// Show the enforcement backend and which rules are live
    Status {
        #[arg(short, long)]
        server: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    match runtime.block_on(handle_cli(cli.config, cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

async fn build_manager(config: &AppConfig) -> Result<Manager, Box<dyn std::error::Error>> {
    if config.store_path.is_none() {
        utils::ensure_dirs()?;
    }
    let store_path = config
        .store_path()
        .ok_or("Cannot determine data directory, set store_path in the config")?;
    let store = JsonFileStore::open(store_path).await?;
    let adapter = default_adapter(&config.enforcement);

    let manager = Manager::new(Arc::new(store), adapter);
    if !config.audit_log {
        return Ok(manager);
    }
    match audit::AuditLog::new() {
        Ok(log) => Ok(manager.with_audit(log)),
        Err(e) => {
            tracing::warn!("Audit log unavailable: {e}");
            Ok(manager)
        }
    }
}

async fn handle_cli(
    config_path: Option<PathBuf>,
    command: Commands,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_config(config_path.as_deref()).await;
    let manager = build_manager(&config).await?;

    match command {
        Commands::List { server } => {
            let rules = match server {
                Some(server) => manager.rules(&server).await?,
                None => manager.all_rules().await?,
            };
            if rules.is_empty() {
                println!("No rules.");
            }
            for rule in &rules {
                print_rule(rule);
            }
        }
        Commands::Add {
            server,
            remote,
            port,
            kind,
            protocol,
            priority,
            description,
        } => {
            let mut request = RuleRequest::new(server, remote, port, kind)
                .with_priority(priority)
                .with_description(description);
            request.protocol = protocol;

            let rule = manager.create_rule(request).await?;
            println!("✓ Rule #{} created and enforced.", rule.id);
        }
        Commands::Update {
            id,
            remote,
            port,
            protocol,
            kind,
            priority,
            description,
        } => {
            let patch = RulePatch {
                remote,
                port,
                protocol,
                kind,
                priority,
                description,
            };
            let rule = manager.update_rule(id, patch).await?;
            println!("✓ Rule #{} updated.", rule.id);
        }
        Commands::Remove { id } => {
            manager.delete_rule(id).await?;
            println!("✓ Rule #{id} deleted.");
        }
        Commands::Sync { server } => {
            let outcome = manager.sync_rules(&server).await?;
            print_outcome(&format!("Synced {server}"), outcome);
        }
        Commands::Rebuild => {
            let outcome = manager.rebuild_all_rules().await?;
            print_outcome(
                &format!("Rebuilt {} servers", outcome.servers),
                outcome.rules,
            );
        }
        Commands::Cleanup { server, ports } => {
            let valid: HashSet<u16> = ports
                .iter()
                .flat_map(|range| range.start..=range.end)
                .collect();
            let outcome = manager.cleanup_invalid_port_rules(&server, &valid).await?;
            print_outcome(&format!("Cleaned up {server}"), outcome);
        }
        Commands::Purge { server } => {
            let outcome = manager.delete_all_rules_for_server(&server).await?;
            print_outcome(&format!("Purged {server}"), outcome);
        }
        Commands::Status { server } => {
            println!("Enforcement backend: {}", manager.adapter_name());
            println!(
                "Chain: {}/{}",
                config.enforcement.table, config.enforcement.chain
            );
            if let Some(path) = config.store_path() {
                println!("Rule store: {}", path.display());
            }

            let rules = match server {
                Some(server) => manager.rules(&server).await?,
                None => manager.all_rules().await?,
            };
            let mut drifted = 0;
            for rule in &rules {
                let state = match manager.enforcement_status(rule.id).await {
                    Ok(true) => "enforced",
                    Ok(false) => {
                        drifted += 1;
                        "MISSING"
                    }
                    Err(_) => "unknown",
                };
                println!("  {state:<9} {}", rule.describe());
            }
            println!("Rules: {} ({drifted} not enforced)", rules.len());
        }
    }
    Ok(())
}

fn print_rule(rule: &Rule) {
    println!(
        "#{:<5} {:<16} {:<5} {:<20} {:>5}/{:<3} prio {:<5} {}",
        rule.id,
        utils::truncate_string(&rule.server_id, 16),
        rule.kind,
        rule.remote,
        rule.port,
        rule.protocol,
        rule.priority,
        utils::truncate_string(&rule.description, 32)
    );
}

fn print_outcome(label: &str, outcome: BulkOutcome) {
    let mark = if outcome.is_clean() { "✓" } else { "✗" };
    println!(
        "{mark} {label}: {} attempted, {} succeeded, {} failed",
        outcome.attempted, outcome.succeeded, outcome.failed
    );
    if !outcome.is_clean() {
        println!("  See the log output above for per-rule errors.");
    }
}
