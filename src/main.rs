use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use relationship_engine::analytics::{self, AnalyticsQuery};
use relationship_engine::api::{self, Envelope, RequestContext, Role};
use relationship_engine::config;
use relationship_engine::db;
use relationship_engine::engine::Engine;
use relationship_engine::error::{EngineError, EngineResult};
use relationship_engine::events::EventRequest;
use relationship_engine::job::{self, JobRequest};
use relationship_engine::recalc::RecalcRequest;
use relationship_engine::tasks::{self, ManualTaskRequest, StatusUpdate, TaskQuery};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "Relationship task scheduling engine")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Tenant the command operates on
    #[arg(long, global = true, default_value = "default")]
    tenant: String,

    /// Caller role: admin, staff or viewer
    #[arg(long, global = true, default_value = "admin")]
    role: String,

    /// Caller user id recorded in audit rows
    #[arg(long, global = true, default_value = "cli")]
    user: String,

    /// Trigger secret for `job`, `recalculate` and `trigger`
    #[arg(long, global = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daily generation job
    Job {
        /// Anchor codes to run (repeatable); all when omitted
        #[arg(long = "anchor")]
        anchors: Vec<String>,
        #[arg(long)]
        force_refresh: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the last job run and engine settings
    Health,
    /// Delete and regenerate open tasks
    Recalculate {
        #[arg(long)]
        anchor: Option<String>,
        /// Actually write; without it the run only projects counts
        #[arg(long)]
        apply: bool,
        #[arg(long)]
        force: bool,
    },
    /// Generate one anchor's tasks for one subject after a business event
    Trigger {
        /// sale_close, first_workout or occurrence_followup
        #[arg(long)]
        anchor: String,
        #[arg(long)]
        subject_id: String,
        #[arg(long)]
        occurrence_id: Option<i64>,
        /// Local day of the event (YYYY-MM-DD)
        #[arg(long)]
        event_date: Option<NaiveDate>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Query tasks
    Tasks {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        anchor: Option<String>,
        #[arg(long)]
        template_code: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        subject_id: Option<String>,
        #[arg(long)]
        classification_tag: Option<String>,
        #[arg(long)]
        scheduled_from: Option<String>,
        #[arg(long)]
        scheduled_to: Option<String>,
        #[arg(long)]
        created_from: Option<String>,
        #[arg(long)]
        created_to: Option<String>,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        page_size: Option<u32>,
        #[arg(long)]
        sort_by: Option<String>,
        #[arg(long)]
        sort_dir: Option<String>,
    },
    /// Create a task by hand
    CreateTask {
        #[arg(long)]
        subject_id: String,
        #[arg(long)]
        template_code: String,
        #[arg(long, default_value = "manual")]
        anchor: String,
        #[arg(long)]
        scheduled_for: DateTime<Utc>,
        #[arg(long)]
        channel: Option<String>,
        /// Message text; rendered from the template when omitted
        #[arg(long)]
        message: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Change a task's status
    UpdateTask {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        status: String,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long)]
        snooze_until: Option<DateTime<Utc>>,
    },
    /// Revert a task's latest status change
    UndoTask {
        #[arg(long)]
        id: i64,
    },
    /// Aggregate task statistics
    Analytics {
        #[arg(long)]
        period: Option<String>,
        #[arg(long)]
        anchor: Option<String>,
        #[arg(long)]
        classification_tag: Option<String>,
    },
    /// Promote pending tasks due by the end of today to due_today
    PromoteDue,
    /// Print an example configuration
    PrintConfig,
}

fn print<T: Serialize>(result: EngineResult<T>) -> Result<bool> {
    let envelope = Envelope::from_result(result);
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(envelope.ok)
}

fn request_context(args: &Args) -> EngineResult<RequestContext> {
    let role = Role::parse(&args.role)
        .ok_or_else(|| EngineError::Validation(format!("unknown role '{}'", args.role)))?;
    Ok(RequestContext {
        tenant_id: args.tenant.clone(),
        user_id: args.user.clone(),
        role,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Command::PrintConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let engine = Engine::from_config(pool, &cfg);
    let secret = cfg.cron_secret();
    let tenant = args.tenant.as_str();
    info!(tenant, "relationship engine ready");

    let ok = match &args.command {
        Command::Job {
            anchors,
            force_refresh,
            dry_run,
        } => {
            let request = JobRequest {
                anchors: (!anchors.is_empty()).then(|| anchors.clone()),
                force_refresh: *force_refresh,
                dry_run: *dry_run,
            };
            print(api::trigger_job(&engine, &secret, args.secret.as_deref(), tenant, &request).await)?
        }
        Command::Health => print(job::health(&engine, tenant).await)?,
        Command::Recalculate {
            anchor,
            apply,
            force,
        } => {
            let request = RecalcRequest {
                anchor: anchor.clone(),
                dry_run: !apply,
                force: *force,
            };
            print(api::trigger_recalculate(&engine, &secret, args.secret.as_deref(), tenant, &request).await)?
        }
        Command::Trigger {
            anchor,
            subject_id,
            occurrence_id,
            event_date,
            dry_run,
        } => {
            let request = EventRequest {
                anchor: anchor.clone(),
                subject_id: subject_id.clone(),
                occurrence_id: *occurrence_id,
                event_date: *event_date,
                dry_run: *dry_run,
            };
            print(api::trigger_event(&engine, &secret, args.secret.as_deref(), tenant, &request).await)?
        }
        Command::Tasks {
            status,
            anchor,
            template_code,
            channel,
            subject_id,
            classification_tag,
            scheduled_from,
            scheduled_to,
            created_from,
            created_to,
            page,
            page_size,
            sort_by,
            sort_dir,
        } => {
            let query = TaskQuery {
                status: status.clone(),
                anchor: anchor.clone(),
                template_code: template_code.clone(),
                channel: channel.clone(),
                subject_id: subject_id.clone(),
                classification_tag: classification_tag.clone(),
                scheduled_from: scheduled_from.clone(),
                scheduled_to: scheduled_to.clone(),
                created_from: created_from.clone(),
                created_to: created_to.clone(),
                page: *page,
                page_size: *page_size,
                sort_by: sort_by.clone(),
                sort_dir: sort_dir.clone(),
            };
            let result = match request_context(&args) {
                Ok(ctx) => tasks::query_tasks(&engine, &ctx, &query).await,
                Err(err) => Err(err),
            };
            print(result)?
        }
        Command::CreateTask {
            subject_id,
            template_code,
            anchor,
            scheduled_for,
            channel,
            message,
            notes,
        } => {
            let request = ManualTaskRequest {
                subject_id: subject_id.clone(),
                template_code: template_code.clone(),
                anchor: anchor.clone(),
                scheduled_for: Some(*scheduled_for),
                channel: channel.clone(),
                payload: message.as_ref().map(|m| serde_json::json!({ "message": m })),
                notes: notes.clone(),
                ..Default::default()
            };
            let result = match request_context(&args) {
                Ok(ctx) => tasks::create_manual_task(&engine, &ctx, &request).await,
                Err(err) => Err(err),
            };
            print(result)?
        }
        Command::UpdateTask {
            id,
            status,
            notes,
            snooze_until,
        } => {
            let update = StatusUpdate {
                status: status.clone(),
                notes: notes.clone(),
                snooze_until: *snooze_until,
            };
            let result = match request_context(&args) {
                Ok(ctx) => tasks::update_task_status(&engine, &ctx, *id, &update).await,
                Err(err) => Err(err),
            };
            print(result)?
        }
        Command::UndoTask { id } => {
            let result = match request_context(&args) {
                Ok(ctx) => tasks::undo_status_change(&engine, &ctx, *id).await,
                Err(err) => Err(err),
            };
            print(result)?
        }
        Command::Analytics {
            period,
            anchor,
            classification_tag,
        } => {
            let query = AnalyticsQuery {
                period: period.clone(),
                anchor: anchor.clone(),
                classification_tag: classification_tag.clone(),
            };
            print(analytics::summarize(&engine, tenant, &query).await)?
        }
        Command::PromoteDue => print(tasks::promote_due_tasks(&engine, tenant).await)?,
        Command::PrintConfig => true,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
