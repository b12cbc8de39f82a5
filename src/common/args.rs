use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Arguments {
    #[command(subcommand)]
    pub command: Command,
    /// If enabled, surpress all output.
    #[arg(short, long, default_value_t = false)]
    pub quiet: bool,
    /// Enable debug logging.
    ///
    /// - Level 1 enables ERROR, WARN and INFO.
    /// - Level 2 enables DEBUG.
    /// - Level 3 and up enables TRACE.
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the PyWire webserver in production mode.
    Serve {
        /// The directory containing page sources. Defaults to `pages/`.
        #[arg(short, long)]
        pages: Option<PathBuf>,
    },
    /// Start the PyWire development server, with hot reload and detailed error pages.
    Dev {
        /// The directory containing page sources. Defaults to `pages/`.
        #[arg(short, long)]
        pages: Option<PathBuf>,
    },
}

impl Arguments {
    pub fn pages_dir(&self) -> Option<&PathBuf> {
        match &self.command {
            Command::Serve { pages } | Command::Dev { pages } => pages.as_ref(),
        }
    }

    pub fn devel_mode(&self) -> bool {
        matches!(self.command, Command::Dev { .. })
    }
}
