// Dead letter inspection commands

use anyhow::Result;
use clap::Subcommand;
use fairqueue::{DeadLetterFilter, DeadLetterJob, Pagination, Scheduler};
use uuid::Uuid;

use crate::output::{
    format_time, print_field, print_opt_field, print_table_header, print_table_row, OutputFormat,
};

#[derive(Subcommand)]
pub enum DeadLettersCommand {
    /// List dead letters, newest first
    List {
        /// Filter by queue
        #[arg(long)]
        queue: Option<String>,

        /// Filter by tenant
        #[arg(long, short)]
        tenant: Option<String>,

        /// Filter by job type
        #[arg(long = "type")]
        job_type: Option<String>,

        /// Rows to skip
        #[arg(long, default_value = "0")]
        offset: u32,

        /// Maximum rows to return
        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// Show a dead letter by ID
    Show {
        /// Dead letter ID
        id: Uuid,
    },
}

pub async fn run(
    command: DeadLettersCommand,
    scheduler: &Scheduler,
    output: OutputFormat,
) -> Result<()> {
    match command {
        DeadLettersCommand::List {
            queue,
            tenant,
            job_type,
            offset,
            limit,
        } => {
            let filter = DeadLetterFilter {
                queue_name: queue,
                tenant_id: tenant,
                job_type,
            };
            list(scheduler, output, filter, Pagination { offset, limit }).await
        }
        DeadLettersCommand::Show { id } => show(scheduler, output, id).await,
    }
}

async fn list(
    scheduler: &Scheduler,
    output: OutputFormat,
    filter: DeadLetterFilter,
    pagination: Pagination,
) -> Result<()> {
    let entries = scheduler.dead_letters(filter, pagination).await?;

    if output.is_text() {
        if entries.is_empty() {
            println!("No dead letters found");
            return Ok(());
        }

        print_table_header(&[
            ("ID", 36),
            ("QUEUE", 12),
            ("TYPE", 20),
            ("TENANT", 14),
            ("ATTEMPTS", 8),
            ("FAILED AT", 27),
            ("ERROR", 40),
        ]);
        for dead in &entries {
            let id = dead.id.to_string();
            let attempts = dead.attempt_count.to_string();
            let failed_at = format_time(dead.failed_at);
            print_table_row(&[
                (&id, 36),
                (&dead.queue_name, 12),
                (&dead.job_type, 20),
                (dead.tenant_id.as_deref().unwrap_or("-"), 14),
                (&attempts, 8),
                (&failed_at, 27),
                (dead.last_error.as_deref().unwrap_or("-"), 40),
            ]);
        }
    } else {
        output.print_value(&entries)?;
    }

    Ok(())
}

async fn show(scheduler: &Scheduler, output: OutputFormat, id: Uuid) -> Result<()> {
    let dead = scheduler.get_dead_letter(id).await?;

    if output.is_text() {
        print_dead_letter(&dead);
    } else {
        output.print_value(&dead)?;
    }

    Ok(())
}

fn print_dead_letter(dead: &DeadLetterJob) {
    let last_attempt_at = dead.last_attempt_at.map(format_time);

    print_field("ID", &dead.id.to_string());
    print_field("Original job", &dead.original_job_id.to_string());
    print_field("Queue", &dead.queue_name);
    print_field("Type", &dead.job_type);
    print_opt_field("Tenant", dead.tenant_id.as_deref());
    print_field("Attempts", &dead.attempt_count.to_string());
    print_opt_field("Last error", dead.last_error.as_deref());
    print_opt_field("Last attempt", last_attempt_at.as_deref());
    print_field("Failed at", &format_time(dead.failed_at));
    print_field("Created", &format_time(dead.created_at));
    print_field("Payload", &dead.payload.to_string());
}
