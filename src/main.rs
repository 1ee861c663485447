//! # Flowpost: marketing-automation flow engine
//!
//! Usage:
//!   flowpost serve                        # HTTP API + background engine loop
//!   flowpost run                          # engine loop only (tick-all + queue worker)
//!   flowpost tick <flow_id> --max 50      # one tick of one flow
//!   flowpost import-flow flow.json        # load a flow document
//!   flowpost diagnose <flow_id>           # structural report

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use flowpost_core::{FlowpostConfig, Recipient, SenderIdentity};
use flowpost_scheduler::ops::{self, RequeueFilter};
use flowpost_scheduler::{
    EngineSettings, EnrollRequest, FlowDocument, FlowEngine, QueueWorker, SchedulerDb,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "flowpost",
    version,
    about = "📬 Flowpost: per-recipient automation flows"
)]
struct Cli {
    /// Config file (default: $FLOWPOST_CONFIG or ~/.flowpost/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Start the HTTP API (and the engine loop)
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Do not run the background engine loop
        #[arg(long)]
        no_engine: bool,
    },
    /// Run the engine loop in the foreground
    Run,
    /// Tick one flow
    Tick {
        flow_id: String,
        #[arg(long)]
        max: Option<usize>,
    },
    /// Tick every flow with due runs
    TickAll {
        #[arg(long)]
        max_flows: Option<usize>,
        #[arg(long)]
        max_per_flow: Option<usize>,
    },
    /// Enroll a recipient into one flow or by trigger event
    Enroll {
        recipient_id: String,
        #[arg(long)]
        flow: Option<String>,
        #[arg(long)]
        event: Option<String>,
        #[arg(long)]
        list: Option<String>,
    },
    /// Process one batch of the job queue
    Worker {
        #[arg(long)]
        limit: Option<usize>,
        /// Project jobs for this flow's active runs first
        #[arg(long)]
        project: Option<String>,
    },
    /// Put failed runs back to active
    Requeue {
        #[arg(long)]
        run: Option<String>,
        #[arg(long)]
        flow: Option<String>,
        #[arg(long)]
        recipient: Option<String>,
    },
    /// Make every active run of a flow due now
    Kick { flow_id: String },
    /// Cancel one run
    Cancel { run_id: String },
    /// Delete all runs, jobs and events of a flow
    Reset {
        flow_id: String,
        /// Confirm deletion
        #[arg(long)]
        yes: bool,
    },
    /// Run counts by status and node
    Stats { flow_id: String },
    /// Structural report of a flow
    Diagnose { flow_id: String },
    /// Import a flow document {id, owner_id, name?, nodes, edges}
    ImportFlow { path: PathBuf },
    /// Create or update a recipient
    AddRecipient {
        id: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Set an owner's default sender identity
    SetSender {
        owner: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Store HTML content under a reference
    PutContent {
        owner: String,
        html_ref: String,
        path: PathBuf,
    },
    /// Issue an API token scoped to one owner
    IssueToken {
        owner: String,
        #[arg(long, default_value = "cli")]
        label: String,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var("FLOWPOST_CONFIG").ok())
        .map(|p| PathBuf::from(shellexpand::tilde(&p).to_string()))
        .unwrap_or_else(FlowpostConfig::default_path)
}

fn load_config(path: &Path) -> Result<FlowpostConfig> {
    let mut config = if path.exists() {
        FlowpostConfig::load_from(path)?
    } else {
        FlowpostConfig::default()
    };
    config.apply_env_overrides();
    Ok(config)
}

fn build_engine(config: &FlowpostConfig) -> Result<Arc<FlowEngine>> {
    let db_path = config.resolved_database_path();
    let db = Arc::new(
        SchedulerDb::open(&db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?,
    );
    tracing::debug!("Database: {}", db_path.display());
    let gateway = flowpost_channels::build_gateway(&config.delivery)?;
    let engine = FlowEngine::new(db, gateway).with_settings(EngineSettings::from(&config.engine));
    Ok(Arc::new(engine))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "flowpost=debug,flowpost_scheduler=debug,flowpost_gateway=debug,tower_http=debug"
    } else {
        "flowpost=info,flowpost_scheduler=info,flowpost_channels=info,flowpost_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let path = config_path(&cli);

    if let Command::Init { force } = &cli.command {
        if path.exists() && !force {
            println!("⚠️  {} already exists (use --force to overwrite)", path.display());
            return Ok(());
        }
        FlowpostConfig::default().save_to(&path)?;
        println!("✅ Wrote {}", path.display());
        return Ok(());
    }

    let config = load_config(&path)?;
    let engine = build_engine(&config)?;
    let db = engine.db().clone();
    let now = Utc::now();

    match cli.command {
        Command::Init { .. } => {}
        Command::Serve { port, no_engine } => {
            let mut gateway_config = config.gateway.clone();
            if let Some(port) = port {
                gateway_config.port = port;
            }
            println!("📬 Flowpost v{}", env!("CARGO_PKG_VERSION"));
            println!("   🌐 API:       http://{}:{}", gateway_config.host, gateway_config.port);
            println!("   🗄️  Database:  {}", config.resolved_database_path().display());
            println!("   📮 Delivery:  {}", engine.collaborators().gateway.name());
            println!();

            if !no_engine {
                let loop_engine = engine.clone();
                let interval = engine.settings().tick_interval_secs;
                tokio::spawn(async move {
                    flowpost_scheduler::spawn_engine_loop(loop_engine, interval).await;
                });
            }
            flowpost_gateway::start(&gateway_config, engine).await?;
        }
        Command::Run => {
            let interval = engine.settings().tick_interval_secs;
            flowpost_scheduler::spawn_engine_loop(engine, interval).await;
        }
        Command::Tick { flow_id, max } => {
            print_json(&engine.tick(&flow_id, max).await?)?;
        }
        Command::TickAll {
            max_flows,
            max_per_flow,
        } => {
            print_json(&engine.tick_all(max_flows, max_per_flow).await?)?;
        }
        Command::Enroll {
            recipient_id,
            flow,
            event,
            list,
        } => {
            let outcome = engine.enroll(&EnrollRequest {
                recipient_id,
                flow_id: flow,
                event,
                list_id: list,
            })?;
            print_json(&outcome)?;
        }
        Command::Worker { limit, project } => {
            let worker = QueueWorker::new(engine.clone());
            if let Some(flow_id) = project {
                print_json(&worker.project_flow(&flow_id, now)?)?;
            }
            print_json(&worker.run_batch(limit).await?)?;
        }
        Command::Requeue {
            run,
            flow,
            recipient,
        } => {
            let filter = RequeueFilter {
                run_id: run,
                flow_id: flow,
                recipient_id: recipient,
            };
            print_json(&ops::requeue(&db, &filter, now)?)?;
        }
        Command::Kick { flow_id } => {
            let touched = ops::kick(&db, &flow_id, now)?;
            println!("👢 {touched} active run(s) of {flow_id} due now");
        }
        Command::Cancel { run_id } => {
            let (run, changed) = ops::cancel(&db, &run_id, now)?;
            if !changed {
                println!("ℹ️  Run {run_id} was already {}", run.status.as_str());
            }
            print_json(&run)?;
        }
        Command::Reset { flow_id, yes } => {
            let counts = ops::reset_flow(&db, &flow_id, yes)?;
            print_json(&counts)?;
        }
        Command::Stats { flow_id } => {
            let flow = engine
                .collaborators()
                .flows
                .load_flow(&flow_id)?
                .with_context(|| format!("flow {flow_id} not found"))?;
            print_json(&ops::node_stats(&db, &flow)?)?;
        }
        Command::Diagnose { flow_id } => {
            let flow = engine
                .collaborators()
                .flows
                .load_flow(&flow_id)?
                .with_context(|| format!("flow {flow_id} not found"))?;
            let diagnosis = ops::diagnose(&db, &flow)?;
            print_json(&diagnosis)?;
            if !diagnosis.ok {
                println!("⚠️  {} problem(s) found", diagnosis.problems.len());
            }
        }
        Command::ImportFlow { path } => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let doc: FlowDocument = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            let flow = db.upsert_flow(&doc, now)?;
            println!(
                "✅ Imported flow {} ({} nodes, {} edges, owner {})",
                flow.id,
                flow.nodes.len(),
                flow.edges.len(),
                flow.owner_id
            );
            if flow.trigger().is_none() {
                println!("⚠️  Flow has no trigger node; ticks will be rejected");
            }
        }
        Command::AddRecipient {
            id,
            owner,
            email,
            name,
        } => {
            db.upsert_recipient(
                &Recipient {
                    id: id.clone(),
                    owner_id: owner,
                    email,
                    name,
                },
                now,
            )?;
            println!("✅ Recipient {id} saved");
        }
        Command::SetSender { owner, email, name } => {
            db.set_sender(
                &owner,
                &SenderIdentity {
                    from_email: email,
                    from_name: name,
                },
                now,
            )?;
            println!("✅ Sender for {owner} saved");
        }
        Command::PutContent {
            owner,
            html_ref,
            path,
        } => {
            let html = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            db.put_content(&owner, &html_ref, &html, now)?;
            println!("✅ Content {html_ref} saved ({} bytes)", html.len());
        }
        Command::IssueToken { owner, label } => {
            let token = db.issue_owner_token(&owner, &label, now)?;
            println!("🔑 Token for {owner} (shown once):\n{token}");
        }
    }

    Ok(())
}
