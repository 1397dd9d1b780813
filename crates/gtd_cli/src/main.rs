//! GTD CLI
//!
//! Command-line front end for a GTD replica.
//!
//! # Commands
//!
//! - `add`, `title`, `tag`, `defer`, `rm`, `rm-tag` - Record local changes
//! - `tags`, `items`, `pending` - Show the document and the outbox
//! - `sync` - Run one sync round (or keep syncing with `--watch`)
//! - `compact` - Collapse bookkeeping records in the command log
//! - `serve` - Run the reference sync server

mod commands;

use clap::{Parser, Subcommand};
use commands::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Getting-things-done lists that sync.
#[derive(Parser)]
#[command(name = "gtd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON settings file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Replica data directory (overrides the settings file)
    #[arg(global = true, short, long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an item and print its number
    Add {
        /// Item title
        title: String,

        /// Tag to file it under
        #[arg(short, long, default_value = gtd_core::INBOX)]
        tag: String,
    },

    /// Rename an item
    Title {
        /// Item number
        #[arg(value_parser = commands::parse_item_num)]
        num: u32,

        /// New title
        title: String,
    },

    /// Move an item to a tag
    Tag {
        /// Item number
        #[arg(value_parser = commands::parse_item_num)]
        num: u32,

        /// Tag name
        tag: String,
    },

    /// Park an item in the tickler until a date
    Defer {
        /// Item number
        #[arg(value_parser = commands::parse_item_num)]
        num: u32,

        /// Date the item returns to the inbox (YYYY-MM-DD)
        #[arg(value_parser = commands::parse_day)]
        date: time::Date,
    },

    /// Delete an item
    Rm {
        /// Item number
        #[arg(value_parser = commands::parse_item_num)]
        num: u32,
    },

    /// Delete a user tag
    RmTag {
        /// Tag name
        tag: String,
    },

    /// List tags with item counts
    Tags {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List items under a tag
    Items {
        /// Tag name
        #[arg(default_value = gtd_core::INBOX)]
        tag: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List commands waiting for upload
    Pending {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Synchronize with the configured server
    Sync {
        /// Keep running, syncing on the configured interval
        #[arg(short, long)]
        watch: bool,
    },

    /// Rewrite the command log, collapsing bookkeeping records
    Compact,

    /// Run the reference sync server
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:7443")]
        bind: SocketAddr,

        /// Server certificate (DER)
        #[arg(long)]
        cert: PathBuf,

        /// Server private key (PKCS#8 DER)
        #[arg(long)]
        key: PathBuf,

        /// Account as `name:password`; repeat for more accounts
        #[arg(short, long = "user", value_parser = commands::parse_account, required = true)]
        users: Vec<(String, String)>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let context = Context::new(cli.config.as_deref(), cli.data_dir)?;

    match cli.command {
        Commands::Add { title, tag } => commands::local::add(&context, &title, &tag)?,
        Commands::Title { num, title } => commands::local::set_title(&context, num, &title)?,
        Commands::Tag { num, tag } => commands::local::tag(&context, num, &tag)?,
        Commands::Defer { num, date } => commands::local::defer(&context, num, date)?,
        Commands::Rm { num } => commands::local::remove(&context, num)?,
        Commands::RmTag { tag } => commands::local::remove_tag(&context, &tag)?,
        Commands::Tags { format } => commands::list::tags(&context, &format)?,
        Commands::Items { tag, format } => commands::list::items(&context, &tag, &format)?,
        Commands::Pending { format } => commands::list::pending(&context, &format)?,
        Commands::Sync { watch } => commands::sync::run(&context, watch)?,
        Commands::Compact => commands::compact::run(&context)?,
        Commands::Serve {
            bind,
            cert,
            key,
            users,
        } => commands::serve::run(bind, &cert, &key, users)?,
        Commands::Version => {
            println!("gtd v{}", env!("CARGO_PKG_VERSION"));
            println!("gtd_core v{}", gtd_core::VERSION);
        }
    }

    Ok(())
}
