// Job commands

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use fairqueue::{EnqueueRequest, Job, Scheduler};
use uuid::Uuid;

use crate::output::{format_time, print_field, print_opt_field, OutputFormat};

#[derive(Args)]
pub struct EnqueueArgs {
    /// Job type (selects the handler and, if mapped, the queue)
    pub job_type: String,

    /// JSON payload
    #[arg(long, short, default_value = "{}")]
    pub payload: String,

    /// Tenant ID
    #[arg(long, short)]
    pub tenant: Option<String>,

    /// Queue name (routed by job type if omitted)
    #[arg(long)]
    pub queue: Option<String>,

    /// Priority, lower runs first
    #[arg(long)]
    pub priority: Option<i32>,

    /// Earliest run time (RFC 3339)
    #[arg(long)]
    pub run_at: Option<DateTime<Utc>>,

    /// Delay in seconds from now (ignored when --run-at is set)
    #[arg(long)]
    pub delay: Option<u64>,

    /// Per-job attempt limit override
    #[arg(long)]
    pub max_attempts: Option<u32>,
}

#[derive(Subcommand)]
pub enum JobsCommand {
    /// Show a job by ID
    Show {
        /// Job ID
        id: Uuid,
    },
}

pub async fn run(command: JobsCommand, scheduler: &Scheduler, output: OutputFormat) -> Result<()> {
    match command {
        JobsCommand::Show { id } => show(scheduler, output, id).await,
    }
}

pub async fn enqueue(
    scheduler: &Scheduler,
    output: OutputFormat,
    quiet: bool,
    args: EnqueueArgs,
) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("--payload is not valid JSON")?;

    let mut request = EnqueueRequest::new(args.job_type, payload);
    if let Some(tenant) = args.tenant {
        request = request.with_tenant(tenant);
    }
    if let Some(queue) = args.queue {
        request = request.with_queue(queue);
    }
    if let Some(priority) = args.priority {
        request = request.with_priority(priority);
    }
    if let Some(max_attempts) = args.max_attempts {
        request = request.with_max_attempts(max_attempts);
    }
    match (args.run_at, args.delay) {
        (Some(run_at), _) => request = request.with_run_at(run_at),
        (None, Some(secs)) => {
            let delay = chrono::Duration::seconds(i64::try_from(secs).context("--delay too large")?);
            request = request.with_run_at(scheduler.now() + delay);
        }
        (None, None) => {}
    }

    let job = scheduler.enqueue(request).await?;

    if output.is_text() {
        if quiet {
            println!("{}", job.id);
        } else {
            println!("Enqueued job: {}", job.id);
            print_field("Queue", &job.queue_name);
            print_field("Run at", &format_time(job.run_at));
        }
    } else {
        output.print_value(&job)?;
    }

    Ok(())
}

async fn show(scheduler: &Scheduler, output: OutputFormat, id: Uuid) -> Result<()> {
    let job = scheduler.get_job(id).await?;

    if output.is_text() {
        print_job(&job);
    } else {
        output.print_value(&job)?;
    }

    Ok(())
}

fn print_job(job: &Job) {
    let run_at = format_time(job.run_at);
    let locked_at = job.locked_at.map(format_time);
    let last_attempt_at = job.last_attempt_at.map(format_time);
    let finished_at = job.finished_at.map(format_time);
    let max_attempts = job.max_attempts.map(|n| n.to_string());

    print_field("ID", &job.id.to_string());
    print_field("Queue", &job.queue_name);
    print_field("Type", &job.job_type);
    print_opt_field("Tenant", job.tenant_id.as_deref());
    print_field("Status", job.status.as_str());
    print_field("Priority", &job.priority.to_string());
    print_field("Run at", &run_at);
    print_field("Attempts", &job.attempt_count.to_string());
    print_opt_field("Max attempts", max_attempts.as_deref());
    print_opt_field("Locked by", job.locked_by.as_deref());
    print_opt_field("Locked at", locked_at.as_deref());
    print_opt_field("Last attempt", last_attempt_at.as_deref());
    print_opt_field("Finished at", finished_at.as_deref());
    print_opt_field("Last error", job.last_error.as_deref());
    print_field("Created", &format_time(job.created_at));
    print_field("Payload", &job.payload.to_string());
}
