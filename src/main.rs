//! # etcd-adapter - command line front end
//!
//! Runs single operations against an etcd v3 compatible cluster and prints
//! the results as JSON, one document per line.

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use etcd_adapter::{Client, ClientConfig, KeyValue, OpOptions, Response};

/// Command line client for etcd v3 compatible stores.
///
/// Reads go through the paging engine, so `--offset` and `--limit` work on
/// ranges of any size.
#[derive(Parser, Debug)]
#[command(
    name = "etcd-adapter",
    version,
    about = "Command line client for etcd v3 compatible stores"
)]
struct Args {
    /// Store endpoints, comma-separated. Overrides the config file.
    /// Format: host:port or http://host:port[,...]
    #[arg(long, global = true)]
    endpoints: Option<String>,

    /// Time in milliseconds allowed for establishing a connection.
    #[arg(long, global = true)]
    dial_timeout_ms: Option<u64>,

    /// Time in milliseconds allowed for each remote call.
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,

    /// Path to a TOML client config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    /// RUST_LOG takes precedence when set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a key, a prefix or a key range.
    Get {
        key: String,
        #[arg(long)]
        prefix: bool,
        /// Exclusive end of the range.
        #[arg(long)]
        end_key: Option<String>,
        #[arg(long)]
        keys_only: bool,
        #[arg(long)]
        count_only: bool,
        /// Maximum number of rows, 0 for all.
        #[arg(long, default_value_t = 0)]
        limit: i64,
        /// Rows skipped before collecting. Negative disables the window.
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        offset: i64,
        #[arg(long)]
        descend: bool,
        /// Read at this revision, 0 for the latest.
        #[arg(long, default_value_t = 0)]
        rev: i64,
    },
    /// Write a key.
    Put {
        key: String,
        value: String,
        /// Lease to attach, 0 for none.
        #[arg(long, default_value_t = 0)]
        lease: i64,
        #[arg(long)]
        prev_kv: bool,
    },
    /// Delete a key or a prefix.
    Del {
        key: String,
        #[arg(long)]
        prefix: bool,
        #[arg(long)]
        prev_kv: bool,
    },
    /// Print changes until interrupted.
    Watch {
        key: String,
        #[arg(long)]
        prefix: bool,
        /// First revision to deliver, 0 for changes from now on.
        #[arg(long, default_value_t = 0)]
        rev: i64,
        #[arg(long)]
        prev_kv: bool,
    },
    /// Discard history below a revision, 0 for the current one.
    Compact {
        #[arg(default_value_t = 0)]
        rev: i64,
    },
    /// Lease operations.
    Lease {
        #[command(subcommand)]
        command: LeaseCommand,
    },
    /// List cluster members.
    Members,
}

#[derive(Subcommand, Debug)]
enum LeaseCommand {
    Grant { ttl: i64 },
    Renew { id: i64 },
    Revoke { id: i64 },
    Ttl { id: i64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let config = build_client_config(&args)?;
    let client = Client::connect(config).await;
    if let Some(err) = client.err() {
        error!(error = %err, endpoints = ?client.endpoints(), "failed to connect");
        return Err(err.into());
    }

    let result = run(&client, args.command).await;
    client.close();
    if let Err(e) = &result {
        error!("command failed: {e}");
    }
    result
}

async fn run(client: &Client, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get {
            key,
            prefix,
            end_key,
            keys_only,
            count_only,
            limit,
            offset,
            descend,
            rev,
        } => {
            let mut op = OpOptions::get(key).limit(limit).offset(offset).revision(rev);
            op.prefix = prefix;
            op.end_key = end_key.map(String::into_bytes);
            op.key_only = keys_only;
            op.count_only = count_only;
            if descend {
                op = op.descend();
            }
            print(response_json(&client.get(&op).await?));
        }
        Command::Put {
            key,
            value,
            lease,
            prev_kv,
        } => {
            let mut op = OpOptions::put(key, value).lease(lease);
            op.prev_kv = prev_kv;
            print(response_json(&client.put(&op).await?));
        }
        Command::Del {
            key,
            prefix,
            prev_kv,
        } => {
            let mut op = OpOptions::delete(key);
            op.prefix = prefix;
            op.prev_kv = prev_kv;
            print(response_json(&client.delete(&op).await?));
        }
        Command::Watch {
            key,
            prefix,
            rev,
            prev_kv,
        } => {
            let mut op = OpOptions::get(key).revision(rev);
            op.prefix = prefix;
            op.prev_kv = prev_kv;

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received interrupt, stopping watch");
                    on_interrupt.cancel();
                }
            });
            client
                .watch(&op, &cancel, |resp| {
                    print(response_json(resp));
                    Ok(())
                })
                .await?;
        }
        Command::Compact { rev } => {
            client.compact(rev).await?;
            print(json!({ "compacted": rev }));
        }
        Command::Lease { command } => match command {
            LeaseCommand::Grant { ttl } => {
                let id = client.lease_grant(ttl).await?;
                print(json!({ "id": id }));
            }
            LeaseCommand::Renew { id } => {
                let ttl = client.lease_renew(id).await?;
                print(json!({ "id": id, "ttl": ttl }));
            }
            LeaseCommand::Revoke { id } => {
                client.lease_revoke(id).await?;
                print(json!({ "id": id, "revoked": true }));
            }
            LeaseCommand::Ttl { id } => {
                let (ttl, granted_ttl) = client.lease_time_to_live(id).await?;
                print(json!({ "id": id, "ttl": ttl, "granted_ttl": granted_ttl }));
            }
        },
        Command::Members => {
            let members: Vec<Value> = client
                .member_list()
                .await?
                .into_iter()
                .map(|m| {
                    json!({
                        "id": format!("{:x}", m.id),
                        "name": m.name,
                        "peer_urls": m.peer_urls,
                        "client_urls": m.client_urls,
                        "is_learner": m.is_learner,
                    })
                })
                .collect();
            print(Value::Array(members));
        }
    }
    Ok(())
}

fn print(value: Value) {
    println!("{value}");
}

fn kv_json(kv: &KeyValue) -> Value {
    json!({
        "key": kv.key_str(),
        "value": kv.value.as_ref().map(|_| kv.value_str()),
        "create_revision": kv.create_revision,
        "mod_revision": kv.mod_revision,
        "version": kv.version,
        "lease": kv.lease,
    })
}

fn response_json(resp: &Response) -> Value {
    json!({
        "action": resp.action.to_string(),
        "succeeded": resp.succeeded,
        "count": resp.count,
        "revision": resp.revision,
        "kvs": resp.kvs.as_ref().map(|kvs| kvs.iter().map(kv_json).collect::<Vec<_>>()),
    })
}

/// Initialize the tracing/logging system. Logs go to stderr so stdout
/// carries only command output.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match log_level {
            "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
            _ => {
                eprintln!("Invalid log level: {}. Using 'info'", log_level);
                EnvFilter::new("info")
            }
        },
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    Ok(())
}

/// Build the client config: file (or defaults), then flag overrides.
fn build_client_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };

    if let Some(endpoints) = &args.endpoints {
        config.endpoints = parse_urls(endpoints);
    }
    if let Some(ms) = args.dial_timeout_ms {
        config.dial_timeout_ms = ms;
    }
    if let Some(ms) = args.request_timeout_ms {
        config.request_timeout_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

/// Parse comma-separated URLs into a vector, trimming whitespace.
fn parse_urls(urls_str: &str) -> Vec<String> {
    urls_str
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
