use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "xyzzy-agent")]
#[command(about = "Offline weaving, pointcut auto-complete and instrumentation tooling for the xyzzy JVM agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Agent configuration (JSON); falls back to XYZZY_AGENT_CONFIG.
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Weave every class of a jar with the given instrumentation.
    Weave {
        input: PathBuf,

        #[arg(short = 'i', long = "instrumentation", value_name = "JSON", required = true)]
        instrumentation: Vec<PathBuf>,

        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Class names on the classpath containing PARTIAL.
    Classes {
        partial: String,

        #[arg(long, value_name = "PATH", required = true)]
        classpath: Vec<PathBuf>,

        #[arg(long, value_name = "N", default_value_t = 100)]
        limit: usize,
    },
    /// Method names of CLASS containing PARTIAL.
    Methods {
        class_name: String,

        partial: String,

        #[arg(long, value_name = "PATH", required = true)]
        classpath: Vec<PathBuf>,

        #[arg(long, value_name = "N", default_value_t = 100)]
        limit: usize,
    },
    /// Signatures of every overload of METHOD in CLASS.
    Signatures {
        class_name: String,

        method_name: String,

        #[arg(long, value_name = "PATH", required = true)]
        classpath: Vec<PathBuf>,
    },
    /// Check instrumentation files; exits non-zero when any advice is invalid.
    Validate {
        #[arg(value_name = "JSON", required = true)]
        files: Vec<PathBuf>,
    },
    /// Gather plugin descriptors under DIR into one instrumentation list.
    List {
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,

        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}
