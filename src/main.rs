use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use conductor::config::{Config, ConfigHandle};
use conductor::core::TaskStatus;
use conductor::orchestration::{
    replay, AuditEventType, AuditFilter, AuditLedger, DelegationRouter, EscalationSink,
    Orchestrator, SystemSnapshot,
};
use conductor::plan::Plan;
use conductor::{clog, clog_error, clog_warn, simulate, Error, Result};

/// Conductor - task orchestration and delegation engine
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Ingest a plan and report cycles and unknown dependencies
    Validate {
        /// Plan file (TOML)
        plan: PathBuf,
    },

    /// Show the delegation decision for every ready task in a plan
    Route {
        /// Plan file (TOML)
        plan: PathBuf,
    },

    /// Run a plan through the orchestration loop with scripted workers
    Simulate {
        /// Plan file (TOML)
        plan: PathBuf,

        /// Write the audit ledger to this JSON-lines file
        #[arg(long)]
        journal: Option<PathBuf>,
    },

    /// Query an audit journal
    Audit {
        /// Journal file written by `simulate --journal`
        journal: PathBuf,

        /// Only entries about this task or worker
        #[arg(long)]
        entity: Option<String>,

        /// Only entries of this type (repeatable)
        #[arg(long = "event")]
        events: Vec<AuditEventType>,

        /// Entries recorded at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Entries recorded before this RFC 3339 time
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Print raw JSON lines instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Rebuild task and worker state from an audit journal
    Replay {
        /// Journal file written by `simulate --journal`
        journal: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);
    if cli.debug {
        clog!("Conductor starting (debug mode enabled)");
    }

    if let Err(e) = run(cli) {
        clog_error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Validate { plan } => run_validate(&plan),
        Command::Route { plan } => run_route(&plan, &config.snapshot()),
        Command::Simulate { plan, journal } => run_simulate(&plan, journal.as_deref(), config),
        Command::Audit {
            journal,
            entity,
            events,
            since,
            until,
            json,
        } => {
            let mut filter = AuditFilter::new();
            if let Some(entity) = entity {
                filter = filter.entity(entity);
            }
            for event in events {
                filter = filter.event_type(event);
            }
            if let Some(since) = since {
                filter = filter.since(since);
            }
            if let Some(until) = until {
                filter = filter.until(until);
            }
            run_audit(&journal, &filter, json)
        }
        Command::Replay { journal } => run_replay(&journal, &config.snapshot()),
        Command::Config => {
            print!("{}", config.snapshot().to_toml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ConfigHandle> {
    match path {
        Some(path) => ConfigHandle::from_path(path),
        None => ConfigHandle::from_path(&Config::config_path()?),
    }
}

fn run_validate(path: &Path) -> Result<()> {
    let plan = Plan::load(path)?;
    let ingested = plan.ingest(Utc::now());

    println!(
        "{}: {} task(s) accepted, {} rejected",
        path.display(),
        ingested.graph.len(),
        ingested.rejected.len()
    );
    for (id, error) in &ingested.rejected {
        println!("  rejected {}: {}", id, error);
    }
    for (id, missing) in ingested.unresolved() {
        let names: Vec<&str> = missing.iter().map(|m| m.as_str()).collect();
        println!("  {} waits on unknown task(s): {}", id, names.join(", "));
    }
    let order = ingested.graph.topological_order()?;
    let names: Vec<&str> = order.iter().map(|id| id.as_str()).collect();
    println!("  order: {}", names.join(" -> "));

    if ingested.rejected.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "{} task(s) rejected",
            ingested.rejected.len()
        )))
    }
}

fn run_route(path: &Path, config: &Config) -> Result<()> {
    let plan = Plan::load(path)?;
    let ingested = plan.ingest(Utc::now());
    let registry = plan.registry()?;
    let mut router = DelegationRouter::new();
    let load = HashMap::new();

    for id in ingested.graph.ready_tasks() {
        let Some(task) = ingested.graph.get(&id) else {
            continue;
        };
        let report = router.route(task, &registry, config, &load, Utc::now())?;
        match report.decision {
            Ok(decision) => println!(
                "{:<24} -> {:<24} {}",
                id, decision.chosen_worker, decision.rationale
            ),
            Err(failure) => println!("{:<24} -> (none)                   {}", id, failure.trail()),
        }
    }
    Ok(())
}

fn run_simulate(path: &Path, journal: Option<&Path>, config: ConfigHandle) -> Result<()> {
    let plan = Plan::load(path)?;
    let ledger = Arc::new(match journal {
        Some(journal) => AuditLedger::with_journal(journal)?,
        None => AuditLedger::new(),
    });
    if ledger.last_seq()? > 0 {
        return Err(Error::Config(format!(
            "journal {} already has entries; simulate needs a fresh journal",
            journal.map(|p| p.display().to_string()).unwrap_or_default()
        )));
    }

    // Hot reload applies to decisions made after the file changes
    let _watcher = match config.path() {
        Some(p) if p.parent().is_some_and(|dir| dir.exists()) => match config.watch() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                clog_warn!("Config watch unavailable: {}", e);
                None
            }
        },
        _ => None,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let (summary, live, entries) = rt.block_on(async {
        let (sink, mut escalations) = EscalationSink::channel();
        let (mut orchestrator, directives) =
            Orchestrator::new(config.clone(), Arc::clone(&ledger), sink);
        let handle = orchestrator.handle();

        for worker in &plan.workers {
            handle.register_worker(worker.clone()).await?;
        }
        for spec in &plan.tasks {
            if let Err(e) = handle.submit_task(spec.clone()).await {
                println!("rejected {}: {}", spec.id, e);
            }
        }

        let workers = tokio::spawn(simulate::run_workers(directives, handle.clone(), plan.clone()));
        let operator = handle.clone();
        let escalation_printer = tokio::spawn(async move {
            while let Some(escalation) = escalations.recv().await {
                println!("escalation: {}", escalation);
                for rejection in &escalation.rejections {
                    println!("    {}", rejection);
                }
                for failure in &escalation.failure_history {
                    println!("    history: {}", failure);
                }
                // No operator during a simulation
                if let Some(task) = escalation.task_id() {
                    if let Err(e) = operator.abandon(task, "escalated during simulation").await {
                        clog_warn!("Could not abandon {}: {}", task, e);
                    }
                }
            }
        });

        let summary = orchestrator.run().await?;
        let live = handle.snapshot().await?;
        workers.abort();
        escalation_printer.abort();
        Ok::<_, Error>((summary, live, ledger.entries()?))
    })?;

    println!();
    print_snapshot(&live);
    println!();
    println!("{}", summary.counts);
    println!("{} ledger entries", summary.last_seq);

    let rebuilt = replay(&entries, &config.snapshot())?.snapshot()?;
    if rebuilt == live {
        println!("replay matches live state");
        Ok(())
    } else {
        Err(Error::ReplayMismatch {
            seq: summary.last_seq,
            detail: "replayed state differs from live state".to_string(),
        })
    }
}

fn run_audit(path: &Path, filter: &AuditFilter, json: bool) -> Result<()> {
    let ledger = AuditLedger::from_entries(AuditLedger::load(path)?)?;
    if json {
        let stdout = io::stdout();
        ledger.export_jsonl(filter, &mut stdout.lock())?;
        return Ok(());
    }

    let mut out = io::stdout().lock();
    for entry in ledger.query(filter)? {
        let transition = match (&entry.before_state, &entry.after_state) {
            (Some(before), Some(after)) => format!("{} -> {}", before, after),
            (Some(before), None) => before.clone(),
            _ => String::new(),
        };
        writeln!(
            out,
            "{:>5}  {}  {:<20} {:<22} {:<14} {}",
            entry.seq,
            entry.recorded_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            entry.event_type,
            entry.entity_id,
            entry.actor,
            transition
        )?;
    }
    Ok(())
}

fn run_replay(path: &Path, config: &Config) -> Result<()> {
    let entries = AuditLedger::load(path)?;
    let state = replay(&entries, config)?;
    print_snapshot(&state.snapshot()?);
    println!();
    let (completed, total) = state.graph.progress();
    println!(
        "{} ({}/{} done), replayed {} entries",
        state.graph.status_counts(),
        completed,
        total,
        state.last_seq
    );
    Ok(())
}

fn print_snapshot(snapshot: &SystemSnapshot) {
    for task in &snapshot.tasks {
        let worker = task.assigned_worker.as_deref().unwrap_or("-");
        let detail = match &task.status {
            TaskStatus::Blocked { reason } | TaskStatus::Abandoned { reason } => reason.as_str(),
            _ => "",
        };
        println!(
            "{:<24} {:<12} {:<20} attempts={} {}",
            task.id,
            task.status.name(),
            worker,
            task.attempts,
            detail
        );
    }
    for worker in &snapshot.workers {
        let latency = worker
            .average_latency_ms()
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "worker {:<17} circuit={:<10} failures={} avg_latency={}",
            worker.name(),
            worker.circuit_state,
            worker.failure_count,
            latency
        );
    }
}
