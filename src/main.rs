//! Muster - Coordination Layer for Autonomous Agent Fleets
//!
//! Main entry point for the Muster CLI.

use clap::{Parser, Subcommand};
use muster::config::MusterConfig;
use muster::conflict::{ClaimLedger, ConflictQueue};
use muster::lifecycle::AgentProcessController;
use muster::monitor::LoopHealthMonitor;
use muster::refinement::{RefinementLoop, ReviewFeedback};
use muster::review::{ReviewQueue, ReviewStatus};
use muster::scheduler::CategoryScheduler;
use muster::session::SessionRegistry;
use muster::store::StateStore;
use std::process;
use std::time::Duration;

/// Muster - single-host coordination for a fleet of worker agents
#[derive(Parser, Debug)]
#[command(name = "muster")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (default: ~/.config/muster/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage agent worker processes
    #[command(subcommand)]
    Agent(AgentCommands),

    /// Inspect and work the review queue
    #[command(subcommand)]
    Review(ReviewCommands),

    /// Manage the merge-conflict queue
    #[command(subcommand)]
    Conflict(ConflictCommands),

    /// Inspect escalations raised by the refinement loop
    #[command(subcommand)]
    Escalation(EscalationCommands),

    /// Show ideation category usage and the next LRU pick
    Categories,

    /// Run the full loop health check
    Health,

    /// Dump Prometheus metrics
    Metrics,
}

#[derive(Subcommand, Debug)]
enum AgentCommands {
    /// Start a worker process for an agent
    Start {
        /// Agent identifier (e.g., a1)
        agent_id: String,
    },

    /// Stop an agent's worker (grace period, then kill)
    Stop {
        agent_id: String,
    },

    /// Pause a running agent
    Pause {
        agent_id: String,
    },

    /// Resume a paused agent
    Resume {
        agent_id: String,
    },

    /// List all agent sessions
    List,

    /// Reconcile crashed workers with session state
    Reap,

    /// Stop every running worker
    StopAll {
        /// Aggregate timeout in seconds before force-killing stragglers
        #[arg(short, long, default_value = "30")]
        timeout: u64,
    },
}

#[derive(Subcommand, Debug)]
enum ReviewCommands {
    /// List review items, oldest first
    List,

    /// Claim an item for review
    Claim {
        review_id: String,
    },

    /// Approve a claimed item
    Approve {
        review_id: String,
    },

    /// Reject a claimed item and run the refinement loop
    Reject {
        review_id: String,

        /// Unmet acceptance criteria (repeatable)
        #[arg(short = 'u', long = "unmet")]
        unmet_criteria: Vec<String>,

        /// Quality issues (repeatable)
        #[arg(short = 'q', long = "quality")]
        quality_issues: Vec<String>,

        /// Requested changes (repeatable)
        #[arg(short = 'r', long = "request")]
        requested_changes: Vec<String>,
    },

    /// List items whose review claim has expired
    TimedOut,

    /// Purge completed items past the retention window
    Cleanup,
}

#[derive(Subcommand, Debug)]
enum ConflictCommands {
    /// List queued conflicts, oldest first
    List,

    /// Remove a conflict after manual resolution (claim stays with the agent)
    Resolve {
        conflict_id: String,
    },

    /// Abort the conflicted work and return the issue to the backlog
    Abort {
        conflict_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum EscalationCommands {
    /// List escalations, newest first
    List,

    /// Mark an escalation as seen
    Ack {
        issue: u64,
    },
}

fn main() {
    // Initialize logging
    if let Err(e) = muster::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> muster::Result<()> {
    // Load configuration
    let config = if let Some(config_path) = cli.config.clone() {
        MusterConfig::load(config_path)?
    } else {
        MusterConfig::load_or_default()?
    };
    config.validate()?;

    tracing::info!(state_dir = %config.state_dir.display(), "Configuration loaded");

    let store = StateStore::open(&config.state_dir)?;
    let registry = SessionRegistry::new(store.clone());
    let reviews = ReviewQueue::new(store.clone(), &config);
    let claims = ClaimLedger::new(store.clone());
    let scheduler = CategoryScheduler::new(store.clone(), &config);
    let monitor = LoopHealthMonitor::new(
        store.clone(),
        registry.clone(),
        reviews.clone(),
        claims.clone(),
        scheduler.clone(),
        config.clone(),
    );
    let registry = registry.with_transition_hook(monitor.transition_hook());

    match cli.command {
        Commands::Agent(cmd) => {
            let controller = AgentProcessController::new(registry.clone(), config.clone());
            match cmd {
                AgentCommands::Start { agent_id } => {
                    let pid = controller.start(&agent_id)?;
                    println!("Started worker for '{}' (pid {})", agent_id, pid);
                }
                AgentCommands::Stop { agent_id } => {
                    controller.stop(&agent_id)?;
                    println!("Stopped worker for '{}'", agent_id);
                }
                AgentCommands::Pause { agent_id } => {
                    controller.pause(&agent_id)?;
                    println!("Paused '{}'", agent_id);
                }
                AgentCommands::Resume { agent_id } => {
                    controller.resume(&agent_id)?;
                    println!("Resumed '{}'", agent_id);
                }
                AgentCommands::List => {
                    let sessions = registry.list()?;
                    println!("{} agent session(s):", sessions.len());
                    for s in sessions {
                        let assignment = s
                            .current_project
                            .map(|p| format!("project {}", p))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "  {:<12} {:<10} {:<14} tasks={} errors={} heartbeat={}",
                            s.agent_id,
                            s.status,
                            assignment,
                            s.tasks_completed,
                            s.error_count,
                            s.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                AgentCommands::Reap => {
                    let crashed = controller.reap()?;
                    if crashed.is_empty() {
                        println!("No crashed workers");
                    } else {
                        println!("Crashed workers: {}", crashed.join(", "));
                    }
                }
                AgentCommands::StopAll { timeout } => {
                    let stopped = controller.stop_all(Duration::from_secs(timeout))?;
                    println!("Stopped {} worker(s)", stopped);
                }
            }
        }

        Commands::Review(cmd) => match cmd {
            ReviewCommands::List => {
                let items = reviews.list()?;
                println!("{} review item(s):", items.len());
                for i in items {
                    println!(
                        "  {:<8} project={} issue={} {:?} by {} ({})",
                        i.review_id,
                        i.project,
                        i.issue,
                        i.status,
                        i.completed_by,
                        i.enqueued_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            ReviewCommands::Claim { review_id } => match reviews.claim(&review_id)? {
                Some(item) => println!(
                    "Claimed {} (project {}, issue {}, branch {})",
                    item.review_id, item.project, item.issue, item.branch_name
                ),
                None => println!("Claim lost: '{}' is unavailable", review_id),
            },
            ReviewCommands::Approve { review_id } => {
                reviews.update_status(&review_id, ReviewStatus::Approved, None)?;
                println!("Approved {}", review_id);
            }
            ReviewCommands::Reject {
                review_id,
                unmet_criteria,
                quality_issues,
                requested_changes,
            } => {
                let feedback = ReviewFeedback {
                    unmet_criteria,
                    quality_issues,
                    requested_changes,
                };
                let refinement = RefinementLoop::new(store.clone(), reviews.clone(), &config);
                reviews.update_status(&review_id, ReviewStatus::Rejected, None)?;
                match refinement.handle_rejection(&review_id, &feedback)? {
                    muster::refinement::RejectionOutcome::Requeued { message } => {
                        println!("Rejected {}; work re-queued with feedback:\n\n{}", review_id, message);
                    }
                    muster::refinement::RejectionOutcome::Escalated { summary } => {
                        println!("Rejected {}; cycle limit reached, escalated:\n\n{}", review_id, summary);
                    }
                }
            }
            ReviewCommands::TimedOut => {
                let items = reviews.list_timed_out()?;
                println!("{} timed-out claim(s):", items.len());
                for i in items {
                    println!("  {} (claimed {:?})", i.review_id, i.claimed_at);
                }
            }
            ReviewCommands::Cleanup => {
                let purged = reviews.cleanup_old()?;
                println!("Purged {} item(s)", purged);
            }
        },

        Commands::Conflict(cmd) => {
            let conflicts = ConflictQueue::new(store.clone());
            match cmd {
                ConflictCommands::List => {
                    let items = conflicts.list()?;
                    println!("{} conflict(s):", items.len());
                    for c in items {
                        println!(
                            "  {:<14} project={} issue={} {:?} agent={} files={}",
                            c.conflict_id,
                            c.project,
                            c.issue,
                            c.status,
                            c.agent_id,
                            c.conflicting_files.len()
                        );
                    }
                }
                ConflictCommands::Resolve { conflict_id } => {
                    let item = conflicts.resolve(&conflict_id)?;
                    println!("Resolved {} (issue {})", conflict_id, item.issue);
                }
                ConflictCommands::Abort { conflict_id } => {
                    let item = conflicts.abort(&conflict_id, &claims)?;
                    println!(
                        "Aborted {}; issue {} returned to the backlog",
                        conflict_id, item.issue
                    );
                }
            }
        }

        Commands::Escalation(cmd) => {
            let refinement = RefinementLoop::new(store.clone(), reviews.clone(), &config);
            match cmd {
                EscalationCommands::List => {
                    let escalations = refinement.list_escalations()?;
                    println!("{} escalation(s):", escalations.len());
                    for e in escalations {
                        let mark = if e.acknowledged { "ack" } else { "NEW" };
                        println!(
                            "  [{}] issue={} project={} at {}",
                            mark,
                            e.issue,
                            e.project,
                            e.escalated_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                EscalationCommands::Ack { issue } => {
                    refinement.acknowledge(issue)?;
                    println!("Acknowledged escalation for issue {}", issue);
                }
            }
        }

        Commands::Categories => {
            let stats = scheduler.usage_stats()?;
            println!(
                "{} categories ({} available, {} exhausted):",
                stats.enabled, stats.available, stats.exhausted
            );
            for u in &stats.per_category {
                let last = u
                    .last_used_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                let flag = if u.no_idea_at.is_some() { " [exhausted]" } else { "" };
                println!(
                    "  {:<24} last_used={} generated={}{}",
                    u.category, last, u.projects_generated, flag
                );
            }
            match scheduler.next()? {
                Some(next) => println!("\nNext pick: {}", next),
                None => println!("\nNext pick: none (all categories exhausted)"),
            }
        }

        Commands::Health => {
            let report = monitor.validate_health()?;
            println!(
                "Loop health: {}",
                if report.healthy { "HEALTHY" } else { "UNHEALTHY" }
            );
            println!(
                "  in-flight: {}  review backlog: {}",
                report.queue.in_flight, report.queue.review_backlog
            );
            if let Some(avg) = report.average_cycle_secs {
                println!("  average cycle time: {}s", avg);
            }
            println!(
                "  category coverage: {:.0}% ({} unused)",
                report.coverage.coverage_percent,
                report.coverage.unused.len()
            );
            for s in &report.stuck_agents {
                println!(
                    "  stuck: {} ({}) for {}m",
                    s.agent_id,
                    s.status,
                    s.stuck_for_secs / 60
                );
            }
            for r in &report.recommendations {
                println!("  -> {}", r);
            }
        }

        Commands::Metrics => {
            // Refresh the gauges before dumping
            let _ = monitor.validate_health()?;
            print!("{}", muster::monitor::metrics::encode_metrics());
        }
    }

    Ok(())
}
