// Queue commands

use anyhow::{bail, Result};
use fairqueue::Scheduler;
use serde::Serialize;

use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Serialize)]
struct QueueDepth {
    queue: String,
    depth: u64,
}

pub async fn depth(scheduler: &Scheduler, output: OutputFormat, queue: Option<String>) -> Result<()> {
    let queues = match queue {
        Some(queue) if !scheduler.config().is_known_queue(&queue) => {
            bail!("unknown queue: {queue}")
        }
        Some(queue) => vec![queue],
        None => scheduler.config().queues.clone(),
    };

    let mut depths = Vec::with_capacity(queues.len());
    for queue in queues {
        let depth = scheduler.queue_depth(&queue).await?;
        depths.push(QueueDepth { queue, depth });
    }

    if output.is_text() {
        print_table_header(&[("QUEUE", 20), ("QUEUED", 10)]);
        for entry in &depths {
            print_table_row(&[(&entry.queue, 20), (&entry.depth.to_string(), 10)]);
        }
    } else {
        output.print_value(&depths)?;
    }

    Ok(())
}
