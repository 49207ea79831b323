use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    name = "procache",
    version,
    about = "Inspect and maintain a processed image cache",
    long_about = "Inspect and maintain a processed image cache directory.\n\
                  \n\
                  Entries are keyed by a fingerprint of the image source and every\n\
                  option that changes the output pixels. Budgets given on the command\n\
                  line override the configuration file."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Cache directory
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// Maximum total cache size with optional unit (B, KB, MB, GB, TB)
    #[arg(
        short,
        long,
        global = true,
        help = "Maximum total cache size with optional unit (B, KB, MB, GB, TB). Examples: \"100MB\", \"1GB\"."
    )]
    pub max_size: Option<String>,

    /// Maximum number of entries
    #[arg(long, global = true)]
    pub max_entries: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show entry count, total size and budget
    Stats,

    /// List entries, next eviction candidate first
    List {
        /// Only show the first N entries
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Print the cache key of a request
    Key {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Write a cached payload to a file, or print its size
    Get {
        key: String,

        /// Output file; the payload size is printed when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Store a file as the processed result of a request
    Put {
        #[command(flatten)]
        request: RequestArgs,

        /// Encoded image to store
        file: PathBuf,
    },

    /// Remove one entry
    Remove { key: String },

    /// Enforce the budget now
    Evict,

    /// Remove every entry
    Clear,
}

/// Source and transform options of a load request.
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Source URI, or a content digest with --content
    #[arg(short, long)]
    pub source: String,

    /// Treat --source as a content digest rather than a URI
    #[arg(long)]
    pub content: bool,

    /// Downsample bound as WIDTHxHEIGHT
    #[arg(long)]
    pub max: Option<String>,

    /// Resize target as WIDTHxHEIGHT
    #[arg(long)]
    pub resize: Option<String>,

    /// Resize to exactly the requested dimensions
    #[arg(long, requires = "resize")]
    pub exact: bool,

    /// Crop rectangle as x,y,width,height
    #[arg(long)]
    pub crop: Option<String>,

    /// Clockwise rotation in degrees
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub rotate: i32,

    /// Output format (original, png, jpeg, webp)
    #[arg(long, default_value = "original")]
    pub format: String,

    /// Encoder quality (0-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub quality: Option<u8>,

    #[arg(long)]
    pub low_quality: bool,

    #[arg(long)]
    pub thumbnail: bool,

    /// Disable EXIF orientation correction
    #[arg(long)]
    pub no_orient: bool,

    /// Key of a custom processor
    #[arg(long)]
    pub processor: Option<String>,
}
