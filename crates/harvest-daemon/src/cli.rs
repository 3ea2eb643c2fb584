//! Command-line surface of `harvestd`.
//!
//! Management commands share the daemon's SQLite file: they validate and
//! write through the scheduler service, and a running daemon picks the
//! changes up on its next restart.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use harvest_core::{HarvestConfig, Schedule, TaskId};
use harvest_store::{ExecutionFilter, ExecutionStatus, Page, Task};

/// Task scheduler daemon for recurring data-harvest scripts.
#[derive(Parser)]
#[command(name = "harvestd", version, about)]
pub struct Cli {
    /// Path to harvest.toml (falls back to HARVEST_CONFIG, then
    /// ~/.harvest/harvest.toml).
    #[arg(short, long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler daemon (default).
    Run,

    /// Create the database schema and exit.
    InitDb,

    /// Manage task definitions.
    #[command(subcommand)]
    Task(TaskCommand),

    /// Show execution history, newest first.
    Executions {
        /// Only attempts of this task.
        #[arg(long)]
        task: Option<String>,
        /// Filter by status: pending, running, completed, failed, timeout,
        /// cancelled.
        #[arg(long)]
        status: Option<String>,
        /// Page size.
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Rows to skip.
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Show aggregate execution statistics.
    Stats {
        /// Restrict to one task.
        #[arg(long)]
        task: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Register a new task.
    Add {
        /// Human-readable task name.
        name: String,
        /// Script id from a [[script]] config entry.
        #[arg(long)]
        script: String,
        /// Interval expression: 30s, 5m, 1h, 1d; a bare number is minutes.
        #[arg(long, group = "schedule")]
        every: Option<String>,
        /// Daily fire time, HH:MM UTC.
        #[arg(long, group = "schedule")]
        daily: Option<String>,
        /// Weekly fire, DAY@HH:MM with day 0 = Monday.
        #[arg(long, group = "schedule")]
        weekly: Option<String>,
        /// Monthly fire, DAY@HH:MM with day of month 1-31.
        #[arg(long, group = "schedule")]
        monthly: Option<String>,
        /// Five-field cron expression, UTC.
        #[arg(long, group = "schedule")]
        cron: Option<String>,
        /// One-shot fire time, RFC 3339.
        #[arg(long, group = "schedule")]
        once: Option<String>,
        /// JSON object passed to the script.
        #[arg(long, default_value = "{}")]
        params: String,
        /// Retries per trigger; 0 disables retries.
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        /// Per-attempt deadline in seconds; 0 means no limit.
        #[arg(long, default_value_t = 0)]
        timeout: u64,
        /// Create the task paused.
        #[arg(long)]
        paused: bool,
    },
    /// List all tasks.
    List,
    /// Show one task in full.
    Show { id: String },
    /// Pause a task; pending fires and retries are dropped.
    Pause { id: String },
    /// Resume a paused task.
    Resume { id: String },
    /// Delete a task; its execution history is kept.
    Rm { id: String },
}

pub fn init_schema(config: &HarvestConfig) -> anyhow::Result<()> {
    crate::ensure_parent_dir(&config.database.path);
    let conn = rusqlite::Connection::open(&config.database.path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    harvest_store::db::init_db(&conn)?;
    println!("schema ready at {}", config.database.path);
    Ok(())
}

pub fn task_command(command: TaskCommand, config: &HarvestConfig) -> anyhow::Result<()> {
    let service = crate::build_service(config)?;
    match command {
        TaskCommand::Add {
            name,
            script,
            every,
            daily,
            weekly,
            monthly,
            cron,
            once,
            params,
            max_retries,
            timeout,
            paused,
        } => {
            let schedule = build_schedule(every, daily, weekly, monthly, cron, once)?;
            let parameters: serde_json::Value = serde_json::from_str(&params)?;
            if !parameters.is_object() {
                anyhow::bail!("--params must be a JSON object");
            }

            let mut new = harvest_store::NewTask::new(name, script, schedule);
            new.parameters = parameters;
            new.max_retries = max_retries;
            new.retry_on_failure = max_retries > 0;
            new.timeout_secs = timeout;
            new.is_active = !paused;

            let task = service.create_task(new)?;
            // Re-read to pick up the fire time the registration persisted.
            let task = service.get_task(&task.id)?;
            println!("created task {}", task.id);
            println!("  schedule: {}", schedule_label(&task.schedule));
            match task.next_execution_at.as_deref() {
                Some(next) => println!("  next:     {next}"),
                None => println!("  next:     — (paused)"),
            }
            println!("a running daemon applies this after restart");
        }
        TaskCommand::List => {
            let tasks = service.list_tasks()?;
            if tasks.is_empty() {
                println!("no tasks");
                return Ok(());
            }
            println!(
                "{:<36}  {:<20}  {:<22}  {:<6}  {}",
                "ID", "NAME", "SCHEDULE", "ACTIVE", "NEXT FIRE"
            );
            for task in &tasks {
                println!(
                    "{:<36}  {:<20}  {:<22}  {:<6}  {}",
                    task.id,
                    clip(&task.name, 20),
                    clip(&schedule_label(&task.schedule), 22),
                    task.is_active,
                    task.next_execution_at.as_deref().unwrap_or("—"),
                );
            }
        }
        TaskCommand::Show { id } => {
            let task = service.get_task(&TaskId::from(id))?;
            print_task(&task);
        }
        TaskCommand::Pause { id } => {
            service.pause_task(&TaskId::from(id.clone()))?;
            println!("paused task {id}");
            println!("a running daemon applies this after restart");
        }
        TaskCommand::Resume { id } => {
            let task = service.resume_task(&TaskId::from(id))?;
            println!("resumed task {}", task.id);
            println!("a running daemon applies this after restart");
        }
        TaskCommand::Rm { id } => {
            service.delete_task(&TaskId::from(id.clone()))?;
            println!("deleted task {id} (history kept)");
            println!("a running daemon applies this after restart");
        }
    }
    Ok(())
}

pub fn show_executions(
    config: &HarvestConfig,
    task: Option<String>,
    status: Option<String>,
    limit: u32,
    offset: u32,
) -> anyhow::Result<()> {
    let service = crate::build_service(config)?;
    let filter = ExecutionFilter {
        task_id: task.map(TaskId::from),
        status: status
            .as_deref()
            .map(str::parse::<ExecutionStatus>)
            .transpose()
            .map_err(anyhow::Error::msg)?,
        ..Default::default()
    };
    let page = service.list_executions(&filter, &Page { limit, offset })?;

    if page.executions.is_empty() {
        println!("no executions");
        return Ok(());
    }
    println!(
        "{:<28}  {:<9}  {:<9}  {:>2}  {:<19}  {:>8}  {}",
        "EXECUTION", "STATUS", "TRIGGER", "RC", "CREATED", "DURATION", "ERROR"
    );
    for e in &page.executions {
        println!(
            "{:<28}  {:<9}  {:<9}  {:>2}  {:<19}  {:>8}  {}",
            e.id,
            e.status,
            e.triggered_by,
            e.retry_count,
            clip(&e.created_at, 19),
            e.duration_secs
                .map(|d| format!("{d:.1}s"))
                .unwrap_or_default(),
            clip(e.error_message.as_deref().unwrap_or(""), 40),
        );
    }
    println!(
        "{} of {} attempts (offset {})",
        page.executions.len(),
        page.total,
        page.offset
    );
    Ok(())
}

pub fn show_stats(config: &HarvestConfig, task: Option<String>) -> anyhow::Result<()> {
    let service = crate::build_service(config)?;
    let filter = ExecutionFilter {
        task_id: task.map(TaskId::from),
        ..Default::default()
    };
    let stats = service.get_execution_stats(&filter)?;

    println!("total attempts:    {}", stats.total_count);
    println!("succeeded:         {}", stats.success_count);
    println!("failed or timeout: {}", stats.failed_count);
    println!("success rate:      {:.1}%", stats.success_rate);
    println!("average duration:  {:.1}s", stats.avg_duration_secs);
    println!("today:             {}", stats.today_count);
    Ok(())
}

fn build_schedule(
    every: Option<String>,
    daily: Option<String>,
    weekly: Option<String>,
    monthly: Option<String>,
    cron: Option<String>,
    once: Option<String>,
) -> anyhow::Result<Schedule> {
    if let Some(expr) = every {
        return Ok(Schedule::parse_interval(&expr)?);
    }
    if let Some(raw) = daily {
        let (hour, minute) = parse_hhmm(&raw)?;
        return Ok(Schedule::Daily { hour, minute });
    }
    if let Some(raw) = weekly {
        let (weekday, hour, minute) = parse_day_at(&raw)?;
        return Ok(Schedule::Weekly {
            weekday,
            hour,
            minute,
        });
    }
    if let Some(raw) = monthly {
        let (day, hour, minute) = parse_day_at(&raw)?;
        return Ok(Schedule::Monthly { day, hour, minute });
    }
    if let Some(expression) = cron {
        return Ok(Schedule::Cron { expression });
    }
    if let Some(raw) = once {
        let at = DateTime::parse_from_rfc3339(&raw)?.with_timezone(&Utc);
        return Ok(Schedule::Once { at });
    }
    anyhow::bail!("one of --every, --daily, --weekly, --monthly, --cron or --once is required")
}

fn parse_hhmm(raw: &str) -> anyhow::Result<(u8, u8)> {
    let (hour, minute) = raw
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected HH:MM, got {raw:?}"))?;
    Ok((hour.parse()?, minute.parse()?))
}

fn parse_day_at(raw: &str) -> anyhow::Result<(u8, u8, u8)> {
    let (day, time) = raw
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("expected DAY@HH:MM, got {raw:?}"))?;
    let (hour, minute) = parse_hhmm(time)?;
    Ok((day.parse()?, hour, minute))
}

fn schedule_label(schedule: &Schedule) -> String {
    match schedule {
        Schedule::Once { at } => format!("once at {}", at.format("%Y-%m-%d %H:%M")),
        Schedule::Interval { every_secs } => format!("every {every_secs}s"),
        Schedule::Daily { hour, minute } => format!("daily {hour:02}:{minute:02}"),
        Schedule::Weekly {
            weekday,
            hour,
            minute,
        } => format!("weekly day {weekday} {hour:02}:{minute:02}"),
        Schedule::Monthly { day, hour, minute } => {
            format!("monthly {day} {hour:02}:{minute:02}")
        }
        Schedule::Cron { expression } => format!("cron {expression}"),
    }
}

fn print_task(task: &Task) {
    println!("id:         {}", task.id);
    println!("name:       {}", task.name);
    println!("script:     {}", task.script_id);
    println!("schedule:   {}", schedule_label(&task.schedule));
    println!(
        "parameters: {}",
        serde_json::to_string(&task.parameters).unwrap_or_else(|_| "{}".to_string())
    );
    println!("active:     {}", task.is_active);
    if task.retry_on_failure {
        println!("retries:    up to {}", task.max_retries);
    } else {
        println!("retries:    off");
    }
    if task.timeout_secs > 0 {
        println!("timeout:    {}s", task.timeout_secs);
    } else {
        println!("timeout:    none");
    }
    println!(
        "last run:   {}",
        task.last_execution_at.as_deref().unwrap_or("never")
    );
    println!(
        "next fire:  {}",
        task.next_execution_at.as_deref().unwrap_or("—")
    );
    println!("created:    {}", task.created_at);
    println!("updated:    {}", task.updated_at);
}

/// Truncate to `width` characters with an ellipsis.
fn clip(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let cut: String = s.chars().take(width.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
