//! Queue resolution for enqueued jobs

use tracing::warn;

use crate::config::SchedulerConfig;

/// Pick the queue for a job.
///
/// An explicit queue wins when it is a configured queue; otherwise the
/// job type's mapping is used, then the default queue.
pub fn resolve_queue<'a>(
    config: &'a SchedulerConfig,
    job_type: &str,
    explicit: Option<&'a str>,
) -> &'a str {
    if let Some(queue) = explicit {
        if config.is_known_queue(queue) {
            return queue;
        }
        warn!(queue, job_type, "unknown queue requested, falling back to routing");
    }

    config
        .job_type_queues
        .get(job_type)
        .map(String::as_str)
        .unwrap_or(config.default_queue.as_str())
}
