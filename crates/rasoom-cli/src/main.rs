mod bench;
mod node;
mod pidfile;
mod server;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rasoom_core::time::{millis_to_iso8601, now_unix_millis};
use rasoom_core::{DEFAULT_PRIORITY, DecodedMessage, Envelope, Pipeline, RawInput, Resolution, Tier};
use rasoom_router::{DeliveryStatus, FunctionCatalog, ProtocolAdapter, SendAck};
use rasoom_store::{DataDir, RosterEntry, Settings};
use rmcp::{ServiceExt, transport::stdio};
use serde_json::json;

use crate::node::Node;

#[derive(Parser)]
#[command(name = "rasoom", about = "Rasoom frame codec, tier router and MCP server")]
struct Cli {
    /// Data directory (default: $RASOOM_DATA_DIR, then ~/.rasoom)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start MCP server on stdio transport
    Serve,

    /// Encode a raw multi-channel input (JSON) into a frame
    Encode {
        /// JSON file holding a raw input
        input: PathBuf,

        /// Sending agent id
        #[arg(long)]
        source: String,

        /// Target tier
        #[arg(long, default_value = "prime")]
        to: Tier,

        /// Recipient agent id
        #[arg(long)]
        agent: Option<String>,

        /// Recipient cluster id
        #[arg(long)]
        cluster: Option<String>,

        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: u8,

        #[arg(long, default_value_t = 0)]
        sequence: u32,

        /// Request emergency bypass
        #[arg(long)]
        bypass: bool,

        /// Write the binary frame here instead of printing hex
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Decode a frame file (binary or hex)
    Decode {
        input: PathBuf,

        /// Print the full decoded message as JSON
        #[arg(long)]
        json: bool,

        /// Keep going past uncorrectable blocks
        #[arg(long)]
        lossy: bool,
    },

    /// Send a text command from a roster member, e.g. `@domain !7 >d-12 rebalance`
    Send {
        sender: String,

        #[arg(required = true)]
        command: Vec<String>,

        /// Override the command's target tier
        #[arg(long)]
        tier: Option<Tier>,
    },

    /// Add or update a roster member
    Join {
        agent_id: String,

        #[arg(long)]
        tier: Tier,

        #[arg(long)]
        cluster: Option<String>,
    },

    /// Remove a roster member and its subscriptions
    Leave { agent_id: String },

    /// List roster members
    Roster {
        #[arg(long)]
        json: bool,
    },

    /// List or purge persisted dead letters
    DeadLetters {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,

        /// Delete instead of listing
        #[arg(long)]
        purge: bool,

        /// With --purge: only letters older than this Unix time (ms)
        #[arg(long, requires = "purge")]
        before_ms: Option<u64>,
    },

    /// Prime → Domain cluster multicast latency trials
    Bench {
        #[arg(long, default_value_t = 150)]
        members: usize,

        #[arg(long, default_value_t = 100)]
        trials: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,

        #[arg(long)]
        json: bool,
    },

    /// Show data directory and roster statistics
    Stats,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Serve => cmd_serve(&cli).await,
        Commands::Encode {
            input,
            source,
            to,
            agent,
            cluster,
            priority,
            sequence,
            bypass,
            out,
        } => {
            let mut env = Envelope::new(source.as_str())
                .to(*to)
                .priority(*priority)
                .sequence(*sequence);
            if let Some(agent) = agent {
                env = env.agent(agent.as_str());
            }
            if let Some(cluster) = cluster {
                env = env.cluster(cluster.as_str());
            }
            if *bypass {
                env = env.bypass();
            }
            cmd_encode(&cli, input, &env, out.as_deref())
        }
        Commands::Decode { input, json, lossy } => cmd_decode(&cli, input, *json, *lossy),
        Commands::Send {
            sender,
            command,
            tier,
        } => cmd_send(&cli, sender, &command.join(" "), *tier).await,
        Commands::Join {
            agent_id,
            tier,
            cluster,
        } => cmd_join(&cli, agent_id, *tier, cluster.clone()),
        Commands::Leave { agent_id } => cmd_leave(&cli, agent_id),
        Commands::Roster { json } => cmd_roster(&cli, *json),
        Commands::DeadLetters {
            limit,
            json,
            purge,
            before_ms,
        } => cmd_dead_letters(&cli, *limit, *json, *purge, *before_ms),
        Commands::Bench {
            members,
            trials,
            seed,
            json,
        } => cmd_bench(&cli, *members, *trials, *seed, *json).await,
        Commands::Stats => cmd_stats(&cli),
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let (settings, _) = DataDir::resolve(cli.data_dir.as_deref())
        .load_settings()
        .context("failed to load settings")?;
    Ok(settings)
}

fn pipeline(settings: &Settings) -> Result<Pipeline> {
    Pipeline::new(settings.pipeline.clone()).context("invalid pipeline settings")
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

async fn cmd_serve(cli: &Cli) -> Result<()> {
    let node = Node::open(cli.data_dir.as_deref())?;
    let pidfile = pidfile::acquire(&node.dir.pid_path());

    let pipeline = node.pipeline()?;
    let (router, mailboxes) = node.start_router().await?;
    tracing::info!(members = mailboxes.len(), "starting MCP server");
    let adapter = ProtocolAdapter::new(pipeline, router, &node.settings.registry);
    let server = server::RasoomServer::new(adapter, node.store, mailboxes);

    match server.clone().serve(stdio()).await {
        Ok(service) => {
            tokio::select! {
                result = service.waiting() => {
                    result.context("MCP session failed")?;
                }
                _ = shutdown_signal() => {}
            }
        }
        // client went away before the handshake finished
        Err(e) => tracing::info!("MCP session not started: {e}"),
    }

    server.shutdown().await;
    if let Some(path) = pidfile {
        pidfile::release(&path);
    }
    Ok(())
}

fn cmd_encode(cli: &Cli, input: &Path, env: &Envelope, out: Option<&Path>) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let raw: RawInput = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a raw input", input.display()))?;
    let msg = pipeline(&load_settings(cli)?)?
        .encode(&raw, env)
        .context("failed to encode")?;

    match out {
        Some(path) => {
            std::fs::write(path, msg.frame.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
            let intent = msg
                .intents
                .first()
                .map(|p| p.leaf.label.as_str())
                .unwrap_or("-");
            println!(
                "wrote {} bytes to {} (tier={}, intent={intent}, escalate={})",
                msg.frame.as_bytes().len(),
                path.display(),
                msg.frame.header().target_tier,
                msg.series.metadata.escalate,
            );
        }
        None => println!("{}", msg.frame.to_hex()),
    }
    Ok(())
}

/// Hex text if the whole file is hex digits, raw bytes otherwise.
fn read_frame(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let trimmed = bytes.trim_ascii();
    if !trimmed.is_empty() && trimmed.len() % 2 == 0 && trimmed.iter().all(u8::is_ascii_hexdigit) {
        return hex::decode(trimmed).context("invalid hex frame");
    }
    Ok(bytes)
}

fn cmd_decode(cli: &Cli, input: &Path, json: bool, lossy: bool) -> Result<()> {
    let bytes = read_frame(input)?;
    let p = pipeline(&load_settings(cli)?)?;
    let msg = if lossy {
        p.decode_lossy(&bytes)
    } else {
        p.decode(&bytes)
    }
    .context("failed to decode frame")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&msg)?);
    } else {
        print_decoded(&msg);
    }
    Ok(())
}

fn print_decoded(msg: &DecodedMessage) {
    let h = &msg.header;
    let labels: Vec<&str> = Resolution::ALL
        .iter()
        .filter_map(|&r| msg.intent(r).map(|p| p.leaf.label.as_str()))
        .collect();
    let units: Vec<String> = msg.units.iter().map(|u| u.notation()).collect();
    println!("source:     {}", h.source_id);
    println!("tier:       {}", h.target_tier);
    println!("type:       {:?}", h.message_type);
    println!("priority:   {}", h.priority);
    println!("sequence:   {}", h.sequence);
    println!("time:       {}", millis_to_iso8601(h.timestamp_ms));
    if !labels.is_empty() {
        println!("intent:     {}", labels.join(" / "));
    }
    if let Some(text) = &msg.text {
        println!("text:       {text}");
    }
    println!("units:      {}", units.join(" "));
    println!("ambiguity:  {:.3}", msg.ambiguity);
    println!("escalate:   {}", msg.metadata().escalate);
    println!("tier check: {}", if msg.tier_check.is_consistent() { "consistent" } else { "inconsistent" });
    println!("corrected:  {}", msg.corrected);
    println!("degraded:   {}", msg.degraded);
}

async fn cmd_send(cli: &Cli, sender: &str, line: &str, tier: Option<Tier>) -> Result<()> {
    let node = Node::open(cli.data_dir.as_deref())?;
    let pipeline = node.pipeline()?;
    let (router, _mailboxes) = node.start_router().await?;
    let adapter = ProtocolAdapter::new(pipeline, router.clone(), &node.settings.registry);

    let receipt = adapter
        .send_command(sender, line, tier)
        .await
        .context("send rejected")?;
    let ack = SendAck::from(&receipt);
    let outcome = receipt.outcome().await?;
    router.shutdown().await;
    node.persist_dead_letters(&router).await?;

    println!("{}", serde_json::to_string_pretty(&json!({ "ack": ack, "outcome": outcome }))?);
    if outcome.status != DeliveryStatus::Delivered {
        bail!("delivery ended {:?}; failed: {}", outcome.status, outcome.failed.join(", "));
    }
    Ok(())
}

fn cmd_join(cli: &Cli, agent_id: &str, tier: Tier, cluster_id: Option<String>) -> Result<()> {
    let node = Node::open(cli.data_dir.as_deref())?;
    let members = node.members()?;
    let existing = members.iter().find(|m| m.agent_id == agent_id);
    if existing.is_none_or(|m| m.tier != tier) {
        let max = node.settings.router.limits.bounds(tier).max;
        let count = members.iter().filter(|m| m.tier == tier).count();
        if count >= max {
            bail!("{tier} tier is full ({max} members)");
        }
    }
    node.store
        .upsert_member(&RosterEntry {
            agent_id: agent_id.to_string(),
            tier,
            cluster_id,
            joined_ms: now_unix_millis(),
        })
        .context("failed to save member")?;
    let verb = if existing.is_some() { "updated" } else { "joined" };
    println!("{verb} {agent_id} ({tier})");
    Ok(())
}

fn cmd_leave(cli: &Cli, agent_id: &str) -> Result<()> {
    let node = Node::open(cli.data_dir.as_deref())?;
    if !node.store.remove_member(agent_id).context("failed to remove member")? {
        bail!("agent '{agent_id}' is not in the roster");
    }
    println!("left {agent_id}");
    Ok(())
}

fn cmd_roster(cli: &Cli, json: bool) -> Result<()> {
    let node = Node::open(cli.data_dir.as_deref())?;
    let members = node.members()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&members)?);
    } else if members.is_empty() {
        println!("(no members)");
    } else {
        for m in &members {
            println!(
                "{:<7} {:<24} {}",
                m.tier.as_str(),
                m.agent_id,
                m.cluster_id.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

fn cmd_dead_letters(
    cli: &Cli,
    limit: usize,
    json: bool,
    purge: bool,
    before_ms: Option<u64>,
) -> Result<()> {
    let node = Node::open(cli.data_dir.as_deref())?;
    if purge {
        let n = node
            .store
            .purge_dead_letters(before_ms)
            .context("failed to purge dead letters")?;
        println!("purged {n} dead letters");
        return Ok(());
    }

    let letters = node
        .store
        .dead_letters(Some(limit))
        .context("failed to read dead letters")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&letters)?);
    } else if letters.is_empty() {
        println!("(no dead letters)");
    } else {
        for dl in &letters {
            println!(
                "{} {} {} -> {} {} {} attempts={}",
                millis_to_iso8601(dl.dead_at_ms),
                dl.message_id,
                dl.source_id,
                dl.recipient,
                dl.route,
                dl.reason.as_str(),
                dl.attempts,
            );
        }
    }
    Ok(())
}

async fn cmd_bench(cli: &Cli, members: usize, trials: usize, seed: u64, json: bool) -> Result<()> {
    let settings = load_settings(cli)?;
    let pipeline = pipeline(&settings)?;
    let report = bench::cluster_multicast(settings.router, &pipeline, members, trials, seed).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!("members:    {}", report.members);
    println!("trials:     {}", report.trials);
    println!("p50:        {}us", report.p50_us);
    println!("p95:        {}us", report.p95_us);
    println!("p99:        {}us", report.p99_us);
    println!("max:        {}us", report.max_us);
    println!(
        "in budget:  {:.1}% (<= {}us)",
        report.within_budget * 100.0,
        report.budget_us
    );
    Ok(())
}

fn cmd_stats(cli: &Cli) -> Result<()> {
    let node = Node::open(cli.data_dir.as_deref())?;
    let members = node.members()?;
    let (catalog, merge) = FunctionCatalog::with_registry(&node.settings.registry);
    let db_size = node.store.db_size().context("failed to read db size")?;
    let subscriptions = node
        .store
        .subscriptions()
        .context("failed to read subscriptions")?
        .len();
    let dead = node
        .store
        .dead_letter_count()
        .context("failed to count dead letters")?;

    let schema = node.store.schema_version().context("failed to read schema version")?;
    let last_stop = node
        .store
        .last_shutdown_ms()
        .context("failed to read shutdown stamp")?;

    println!("data_dir:   {}", node.dir.root().display());
    println!("db_size:    {:.1}KB (schema v{})", db_size as f64 / 1024.0, schema.unwrap_or(0));
    println!(
        "last stop:  {}",
        last_stop.map(millis_to_iso8601).as_deref().unwrap_or("never")
    );
    for tier in Tier::ALL {
        let bounds = node.settings.router.limits.bounds(tier);
        let count = members.iter().filter(|m| m.tier == tier).count();
        let label = format!("{tier}:");
        println!("{label:<11} {count} (min {}, max {})", bounds.min, bounds.max);
    }
    println!("subscribed: {subscriptions}");
    println!("dead:       {dead}");
    println!(
        "catalog:    {} functions ({} external, {} conflicts)",
        catalog.len(),
        merge.added.len(),
        merge.conflicts.len()
    );
    Ok(())
}
