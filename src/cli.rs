use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "docubot",
    version,
    about = "Upload documents and ask questions answered from their content"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload one or more files
    Ingest(IngestArgs),
    /// List uploaded documents
    List(ListArgs),
    /// Delete a document by id
    Delete(DeleteArgs),
    /// Delete every document and all indexed content
    Reset(ResetArgs),
    /// Ask a question answered from the uploaded documents
    Chat(ChatArgs),
    /// Remove leftovers of interrupted uploads and deletes
    Reconcile,
    /// Show system status and statistics
    Status(StatusArgs),
    /// Inspect and change persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Serve the HTTP API
    Serve(ServeArgs),
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Documents --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// Files to upload
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct DeleteArgs {
    /// Document id (as printed by `docubot list --json`)
    pub id: String,
}

#[derive(Debug, Parser)]
pub struct ResetArgs {
    /// Confirm that every document should be deleted
    #[arg(long)]
    pub yes: bool,
}

// -- Chat --

#[derive(Debug, Parser)]
pub struct ChatArgs {
    /// The question
    pub query: String,

    /// Conversation id used for topic tracking
    #[arg(short, long)]
    pub session: Option<String>,

    /// Output the answer as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show every setting with its effective value and source
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting
    Set {
        /// Setting key (e.g. search.k)
        key: String,
        /// New value
        value: String,
    },
    /// Remove a persisted setting (revert to default)
    Clear {
        /// Setting key
        key: String,
    },
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Serve --

#[derive(Debug, Parser)]
pub struct ServeArgs {
    /// Address to listen on (overrides server.bind)
    #[arg(long)]
    pub bind: Option<String>,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "docubot",
            &mut std::io::stdout(),
        );
    }
}
