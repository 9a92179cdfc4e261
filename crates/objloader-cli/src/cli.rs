use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "objloader",
    about = "objloader -- load content-addressed object graphs",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Loader options file (TOML)
    #[arg(long, global = true)]
    pub config: Option<String>,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Download an object graph from a server
    Load(LoadArgs),
    /// Show how many objects a graph holds
    Count(CountArgs),
    /// Load an object graph from a JSON file
    File(FileArgs),
    /// Inspect or clear a local object store
    Store(StoreArgs),
    /// Show the effective loader configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct ServerArgs {
    /// Server base URL
    #[arg(long)]
    pub server: String,
    #[arg(long)]
    pub stream: String,
    /// Root object id
    #[arg(long)]
    pub object: String,
    /// Bearer token
    #[arg(long)]
    pub token: Option<String>,
    /// Extra request header, as NAME=VALUE
    #[arg(long = "header")]
    pub headers: Vec<String>,
}

#[derive(Args)]
pub struct LoadArgs {
    #[command(flatten)]
    pub server: ServerArgs,
    /// Local object store; objects are kept in memory when omitted
    #[arg(long)]
    pub db: Option<String>,
    #[arg(long)]
    pub read_worker: bool,
    #[arg(long)]
    pub write_worker: bool,
    /// Only print the summary
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct CountArgs {
    #[command(flatten)]
    pub server: ServerArgs,
    #[arg(long)]
    pub db: Option<String>,
}

#[derive(Args)]
pub struct FileArgs {
    /// JSON array of objects; the first one is the root
    pub path: String,
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct StoreArgs {
    pub db: String,
    /// Remove every stored object
    #[arg(long)]
    pub clear: bool,
}

#[derive(Args)]
pub struct ConfigArgs {}
