// CLI subcommands

pub mod dead_letters;
pub mod jobs;
pub mod queues;
