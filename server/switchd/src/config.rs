use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "xb-switchd", about = "Crossbar telephony switch daemon")]
pub struct Config {
    /// Logical switch name, exposed as ${SYSTEMNAME}.
    #[arg(long, default_value = "crossbar", env = "XB_SYSTEM_NAME")]
    pub system_name: String,

    /// Context new calls land in when the driver names none.
    #[arg(long, default_value = "default")]
    pub default_context: String,

    /// Dialplan description (JSON) loaded at boot and on reconfigure.
    #[arg(long, env = "XB_DIALPLAN")]
    pub dialplan: Option<PathBuf>,

    /// Directory scanned for loadable modules.
    #[arg(long, env = "XB_MODULE_DIR")]
    pub module_dir: Option<PathBuf>,

    /// Load exactly these modules (disables the directory scan).
    #[arg(long = "load")]
    pub load: Vec<String>,

    /// Modules loaded in a first pass.
    #[arg(long = "preload")]
    pub preload: Vec<String>,

    /// Modules skipped by the directory scan.
    #[arg(long = "noload")]
    pub noload: Vec<String>,

    /// Skip the module directory scan entirely.
    #[arg(long, default_value_t = false)]
    pub no_autoload: bool,

    /// Upper bound on concurrent calls.
    #[arg(long)]
    pub max_calls: Option<usize>,

    /// Indicate busy/congestion instead of waiting for digits when a run
    /// ends with nothing more to match.
    #[arg(long, default_value_t = true)]
    pub autofallthrough: bool,

    /// Finalise CDRs before running the h extension.
    #[arg(long, default_value_t = false)]
    pub end_cdr_before_h: bool,

    /// Disable CDR logging.
    #[arg(long, default_value_t = false)]
    pub no_cdr: bool,

    /// Read CLI verbs from stdin.
    #[arg(long, default_value_t = false)]
    pub console: bool,
}
