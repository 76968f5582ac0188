use clap::Parser;

/// Syncs source tables into the configured form API.
///
/// Configuration is read from `./configuration` (see `APP_ENVIRONMENT`); these flags only narrow
/// down what a run does.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Only sync the named entity. Can be repeated; defaults to every enabled entity.
    #[arg(long = "entity", value_name = "NAME")]
    pub entities: Vec<String>,

    /// Run a single pass per entity and exit instead of running on the schedule.
    #[arg(long)]
    pub once: bool,
}
