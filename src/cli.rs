use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "sbstage",
    about = "Compile a Scratch project and run its scripts headlessly, printing host events as JSON lines."
)]
pub struct Args {
    #[arg(value_name = "INPUT", help = "Project archive (.sb3) or bare project.json.")]
    pub input: PathBuf,

    #[arg(long, default_value_t = 5.0, help = "Seconds to run before stopping.")]
    pub run_for: f64,

    #[arg(long, help = "Replay host input from this timeline file.")]
    pub timeline: Option<PathBuf>,

    #[arg(long, help = "Write the compiled program as JSON to this path.")]
    pub emit_ir: Option<PathBuf>,

    #[arg(long, help = "Number of broadcasts kept in the message history.")]
    pub history_cap: Option<usize>,

    #[arg(long, help = "Seed for 'pick random'.")]
    pub seed: Option<u64>,

    #[arg(
        long,
        default_value = "warn",
        help = "Log filter when RUST_LOG is unset (error, warn, info, debug, trace)."
    )]
    pub log_level: String,

    #[arg(long, help = "Compile only; report warnings and exit without running.")]
    pub check: bool,
}
