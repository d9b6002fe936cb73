//! # HeliosCS CLI (`helios`)
//!
//! Administration and operation of the support engine over the configured
//! SQLite database.
//!
//! ## Usage
//!
//! ```bash
//! helios --config ./config/helios.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `helios init` | Create the SQLite database and run schema migrations |
//! | `helios tenant add <id>` | Register or update a tenant |
//! | `helios customer add <id>` | Register or update a customer |
//! | `helios rule add` | Register a redaction rule |
//! | `helios knowledge publish` / `deactivate` | Manage knowledge sources |
//! | `helios session open` | Open a support session |
//! | `helios send` | Run one customer message through the pipeline |
//! | `helios action` | Apply an agent action to a session or ticket |
//! | `helios audit list` / `audit verify` | Inspect a tenant's audit chain |
//! | `helios sweep` | End idle sessions once |
//! | `helios serve` | Start the HTTP server |
//!
//! ## Examples
//!
//! ```bash
//! helios init
//! helios tenant add acme --name "Acme Bank"
//! helios customer add c1 --tenant acme --name Ada --email ada@example.com
//! helios rule add --tenant acme --name email --type email --pattern '[\w.+-]+@[\w-]+\.[\w.]+'
//! helios knowledge publish --tenant acme --name "Wire cutoffs" --type faq --file wires.md
//! helios session open --tenant acme --customer c1 --channel web
//! helios send --tenant acme --session <id> "When do wires close?"
//! helios --actor agent:u7 action --tenant acme --session <id> '{"action":"assign","agent_id":"u7"}'
//! helios audit verify --tenant acme
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use helios_cs::config::{self, LoggingConfig};
use helios_cs::db;
use helios_cs::ingest::{deactivate_source, publish_source, KnowledgeDraft};
use helios_cs::lifecycle::SessionAction;
use helios_cs::migrate;
use helios_cs::models::{
    AccountType, Actor, Channel, Customer, CustomerTier, KnowledgeSourceType, RedactionRule,
    RedactionType, Tenant, TenantSettings,
};
use helios_cs::pipeline::{InboundMessage, RequestContext};
use helios_cs::server;

/// HeliosCS: message-processing and escalation engine for multi-tenant
/// financial customer support.
#[derive(Parser)]
#[command(name = "helios", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/helios.toml")]
    config: PathBuf,

    /// Identity recorded in the audit trail: `system`, `agent:<id>` or
    /// `customer:<id>`.
    #[arg(long, global = true, default_value = "system")]
    actor: Actor,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage tenants.
    Tenant {
        #[command(subcommand)]
        action: TenantAction,
    },

    /// Manage customers.
    Customer {
        #[command(subcommand)]
        action: CustomerAction,
    },

    /// Manage redaction rules.
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Publish or deactivate knowledge sources.
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },

    /// Manage sessions.
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// Process one customer message and print the outcome.
    Send {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
        /// Client idempotency key; resending with the same key replays.
        #[arg(long)]
        key: Option<String>,
        /// Message text.
        text: String,
    },

    /// Apply an agent action, given as JSON, e.g. `{"action":"resolve"}`.
    Action {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        session: String,
        action: String,
    },

    /// Inspect the audit chain.
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },

    /// End sessions idle longer than `[pipeline] idle_timeout_secs`.
    Sweep,

    /// Start the HTTP server on `[server] bind`.
    Serve,
}

#[derive(Subcommand)]
enum TenantAction {
    /// Create or update a tenant.
    Add {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        high_threshold: Option<f64>,
        #[arg(long)]
        low_threshold: Option<f64>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        max_uncertain_turns: Option<u32>,
        /// Register the tenant as inactive.
        #[arg(long)]
        inactive: bool,
    },
    /// List all tenants.
    List,
}

#[derive(Subcommand)]
enum CustomerAction {
    /// Create or update a customer.
    Add {
        id: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long, default_value = "basic")]
        tier: CustomerTier,
        #[arg(long, default_value = "checking")]
        account_type: AccountType,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// Add a redaction rule.
    Add {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
        #[arg(long = "type")]
        rule_type: RedactionType,
        #[arg(long)]
        pattern: String,
    },
}

#[derive(Subcommand)]
enum KnowledgeAction {
    /// Publish a new source, or a new version of an existing one.
    Publish {
        #[arg(long)]
        tenant: String,
        /// Existing source id to republish.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        name: String,
        #[arg(long = "type", default_value = "document")]
        source_type: KnowledgeSourceType,
        /// File holding the source text.
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value = "")]
        category: String,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long, default_value = "")]
        author: String,
        /// RFC 3339 timestamp the source becomes retrievable.
        #[arg(long)]
        effective: Option<DateTime<Utc>>,
        /// RFC 3339 timestamp the source stops being retrievable.
        #[arg(long)]
        expiry: Option<DateTime<Utc>>,
    },
    /// Take a source out of retrieval.
    Deactivate {
        #[arg(long)]
        tenant: String,
        id: String,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Open a session for a customer.
    Open {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        customer: String,
        #[arg(long, default_value = "web")]
        channel: Channel,
    },
    /// Print a session's transcript.
    Show {
        #[arg(long)]
        tenant: String,
        id: String,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Print the tenant's audit trail.
    List {
        #[arg(long)]
        tenant: String,
    },
    /// Recompute the tenant's hash chain.
    Verify {
        #[arg(long)]
        tenant: String,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Arc::new(config::load_config(&cli.config)?);
    init_tracing(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(cfg).await?;
        }
        command => run_command(cfg, cli.actor, command).await?,
    }

    Ok(())
}

async fn run_command(cfg: Arc<config::Config>, actor: Actor, command: Commands) -> Result<()> {
    let engine = db::open_engine(cfg).await?;
    let store = engine.store().clone();

    match command {
        Commands::Tenant { action } => match action {
            TenantAction::Add {
                id,
                name,
                domain,
                high_threshold,
                low_threshold,
                top_k,
                max_uncertain_turns,
                inactive,
            } => {
                let mut tenant = match store.get_tenant(&id).await? {
                    Some(existing) => Tenant {
                        name,
                        updated_at: Utc::now(),
                        ..existing
                    },
                    None => Tenant::new(id, name),
                };
                tenant.domain = domain.or(tenant.domain);
                tenant.is_active = !inactive;
                tenant.settings = TenantSettings {
                    high_threshold: high_threshold.or(tenant.settings.high_threshold),
                    low_threshold: low_threshold.or(tenant.settings.low_threshold),
                    top_k: top_k.or(tenant.settings.top_k),
                    max_uncertain_turns: max_uncertain_turns
                        .or(tenant.settings.max_uncertain_turns),
                };
                store.put_tenant(&tenant).await?;
                print_json(&tenant)?;
            }
            TenantAction::List => {
                for t in store.list_tenants().await? {
                    let state = if t.is_active { "active" } else { "inactive" };
                    println!("{}\t{}\t{}", t.id, state, t.name);
                }
            }
        },
        Commands::Customer {
            action:
                CustomerAction::Add {
                    id,
                    tenant,
                    name,
                    email,
                    phone,
                    tier,
                    account_type,
                },
        } => {
            if store.get_tenant(&tenant).await?.is_none() {
                bail!("tenant not found: {}", tenant);
            }
            let customer = Customer {
                id,
                tenant_id: tenant,
                name,
                email,
                phone,
                tier,
                account_type,
                created_at: Utc::now(),
            };
            store.put_customer(&customer).await?;
            print_json(&customer)?;
        }
        Commands::Rule {
            action:
                RuleAction::Add {
                    tenant,
                    name,
                    rule_type,
                    pattern,
                },
        } => {
            if store.get_tenant(&tenant).await?.is_none() {
                bail!("tenant not found: {}", tenant);
            }
            // Reject broken patterns up front; the redactor would skip them.
            regex::Regex::new(&pattern).with_context(|| format!("invalid pattern: {}", pattern))?;
            let rule = RedactionRule::new(tenant, name, rule_type, pattern);
            store.put_redaction_rule(&rule).await?;
            print_json(&rule)?;
        }
        Commands::Knowledge { action } => match action {
            KnowledgeAction::Publish {
                tenant,
                id,
                name,
                source_type,
                file,
                category,
                tags,
                author,
                effective,
                expiry,
            } => {
                let content = std::fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?;
                let draft = KnowledgeDraft {
                    id,
                    name,
                    source_type,
                    content,
                    category,
                    tags,
                    author,
                    effective_date: effective,
                    expiry_date: expiry,
                };
                let ctx = RequestContext::new(tenant, actor);
                let report = publish_source(&engine, &ctx, draft).await?;
                print_json(&report)?;
            }
            KnowledgeAction::Deactivate { tenant, id } => {
                let ctx = RequestContext::new(tenant, actor);
                let source = deactivate_source(&engine, &ctx, &id).await?;
                println!("deactivated {} (version {})", source.id, source.version);
            }
        },
        Commands::Session { action } => match action {
            SessionCommand::Open {
                tenant,
                customer,
                channel,
            } => {
                let ctx = RequestContext::new(tenant, actor);
                let session = engine.open_session(&ctx, &customer, channel).await?;
                print_json(&session)?;
            }
            SessionCommand::Show { tenant, id } => {
                let ctx = RequestContext::new(tenant, actor);
                for m in engine.session_messages(&ctx, &id).await? {
                    println!(
                        "[{}] {}: {}",
                        m.created_at.format("%Y-%m-%d %H:%M:%S"),
                        m.message_type,
                        m.content
                    );
                }
            }
        },
        Commands::Send {
            tenant,
            session,
            key,
            text,
        } => {
            let ctx = RequestContext::new(tenant, actor);
            let inbound = InboundMessage {
                session_id: session,
                text,
                idempotency_key: key,
            };
            let outcome = engine.process_message(&ctx, inbound).await?;
            print_json(&outcome)?;
        }
        Commands::Action {
            tenant,
            session,
            action,
        } => {
            let action: SessionAction =
                serde_json::from_str(&action).context("Failed to parse action JSON")?;
            let ctx = RequestContext::new(tenant, actor);
            let outcome = engine.advance_session(&ctx, &session, action).await?;
            print_json(&outcome)?;
        }
        Commands::Audit { action } => match action {
            AuditAction::List { tenant } => {
                let ctx = RequestContext::new(tenant, actor);
                print_json(&engine.audit_trail(&ctx).await?)?;
            }
            AuditAction::Verify { tenant } => {
                let ctx = RequestContext::new(tenant, actor);
                let records = engine.audit_trail(&ctx).await?;
                engine
                    .recorder()
                    .verify(&records)
                    .with_context(|| format!("audit chain for {} is broken", ctx.tenant_id))?;
                println!("audit chain ok: {} records", records.len());
            }
        },
        Commands::Sweep => {
            let ended = engine.sweep_idle_sessions(Utc::now()).await?;
            println!("ended {} idle sessions", ended);
        }
        Commands::Init | Commands::Serve => unreachable!("handled in main"),
    }

    Ok(())
}
