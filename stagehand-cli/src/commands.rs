use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap the stack and supervise it until interrupted (default)
    Up,

    /// Run preflight checks only and print the findings
    Doctor,

    /// Reprint the most recent run's captured errors and root cause
    Diagnose,

    /// Gracefully terminate services started by a previous invocation
    Stop,
}
