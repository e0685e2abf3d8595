use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP daemon.
    ///
    /// Bind address comes from --bind, then VECDEDUP_ADDR, then config.
    Daemon {
        #[clap(short, long)]
        bind: Option<String>,
    },

    /// Print embedding statistics of an owner.
    Stats {
        /// Owner whose partition is inspected
        #[clap(short, long)]
        owner: String,
    },

    /// Group an owner's embeddings around k random centroids.
    Cluster {
        #[clap(short, long)]
        owner: String,

        /// Number of clusters
        #[clap(short)]
        k: usize,
    },

    /// Search an owner's embeddings with a free-text query.
    Search {
        #[clap(short, long)]
        owner: String,

        query: String,

        /// Minimum similarity in 0..1
        #[clap(short, long)]
        threshold: Option<f32>,

        /// Maximum number of results
        #[clap(short = 'n', long)]
        max_results: Option<usize>,
    },

    /// Delete a source and all of its embeddings.
    Delete {
        #[clap(short, long)]
        owner: String,

        source_ref_id: String,

        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },

    /// Register sources and embed their content from a JSON lines file.
    ///
    /// Each line: {"id", "title", "url"?, "summary"?, "metadata"?, "content", "taskType"?}
    EmbedFile {
        #[clap(short, long)]
        owner: String,

        path: std::path::PathBuf,

        /// Also report near duplicates of each item
        #[clap(long, default_value = "false")]
        check_duplicates: bool,
    },
}
