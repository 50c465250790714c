use std::path::PathBuf;

use clap::Parser;
use mirror_harness::config::HarnessConfig;

/// Run synthetic reflection cycles against a Mirror of Truth deployment and
/// score the replies with an LLM reviewer.
#[derive(Parser, Debug)]
#[command(name = "mirror_agent", version)]
pub struct Cli {
    /// Path to a TOML config file (default: mirror_harness.toml next to the binary)
    #[arg(long, env = "MIRROR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of reflection cycles to run
    #[arg(long)]
    pub cycles: Option<u32>,

    /// Directory for session logs
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Base URL of the product under test
    #[arg(long)]
    pub base_url: Option<String>,

    /// Seconds to wait between cycles
    #[arg(long)]
    pub delay_secs: Option<u64>,

    /// Fail a cycle when the persona reply is missing any answer
    #[arg(long)]
    pub strict_parsing: bool,

    /// Do not create the test account through Supabase; assume it exists
    #[arg(long)]
    pub skip_provision: bool,

    /// Print the effective configuration (secrets masked) and exit
    #[arg(long)]
    pub print_config: bool,

    /// Print the run summary as JSON on stdout when finished
    #[arg(long)]
    pub json: bool,
}

impl Cli {
    /// Flags win over file and environment values.
    pub fn apply_to(&self, config: &mut HarnessConfig) {
        if let Some(cycles) = self.cycles {
            config.cycles = cycles;
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = dir.clone();
        }
        if let Some(url) = &self.base_url {
            config.base_url = url.clone();
        }
        if let Some(delay) = self.delay_secs {
            config.delay_secs = delay;
        }
        if self.strict_parsing {
            config.strict_parsing = true;
        }
    }
}
