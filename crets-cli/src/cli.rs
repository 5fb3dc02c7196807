use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crets_core::BackendType;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Apply sustainability requirements to work items"
)]
pub struct Cli {
    /// Path to the settings file (overrides CRETS_CONFIG)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the key-value store (".json", ".db" or ":memory:")
    #[clap(long, global = true)]
    pub store: Option<PathBuf>,

    /// Store backend, inferred from the path when omitted
    #[clap(long, global = true, value_parser = parse_backend)]
    pub backend: Option<BackendType>,

    /// Work item to operate on
    #[clap(long, short = 'w', global = true)]
    pub work_item: Option<String>,

    /// Operate on a new, unsaved work item (temporary id)
    #[clap(long = "new", global = true, conflicts_with = "work_item")]
    pub new_item: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum CatalogCommand {
    /// List catalog entries
    List {
        /// Print as an indented tree
        #[clap(long)]
        tree: bool,
    },

    /// Show a single catalog entry
    Show {
        /// Requirement id (e.g. Mod.1.1)
        id: String,
    },

    /// Replace the catalog with a JSON array file
    Import {
        file: PathBuf,

        /// Skip confirmation
        #[clap(long, short = 'y')]
        yes: bool,
    },

    /// Add a catalog entry
    Add {
        #[clap(long)]
        id: Option<String>,

        #[clap(long)]
        detail: Option<String>,

        #[clap(long)]
        parent: Option<String>,

        #[clap(long)]
        justification: Option<String>,

        /// Use interactive mode (prompts)
        #[clap(long)]
        interactive: bool,
    },

    /// Edit a catalog entry
    Edit {
        id: String,

        #[clap(long)]
        detail: Option<String>,

        #[clap(long)]
        justification: Option<String>,

        #[clap(long)]
        discussion: Option<String>,
    },

    /// Delete a catalog entry and everything below it
    Delete {
        id: String,

        /// Skip confirmation
        #[clap(long, short = 'y')]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ItemCommand {
    /// Show the requirements applied to the work item
    Show {
        /// Include removed requirements
        #[clap(long)]
        all: bool,

        /// Print raw JSON
        #[clap(long)]
        json: bool,
    },

    /// Check for and apply a pending batch
    Pending {
        /// Accept without prompting
        #[clap(long, short = 'y', conflicts_with = "decline")]
        yes: bool,

        /// Decline without prompting
        #[clap(long)]
        decline: bool,
    },

    /// Edit the work item's copy of a requirement
    Edit {
        id: String,

        #[clap(long)]
        detail: Option<String>,

        #[clap(long)]
        justification: Option<String>,

        #[clap(long)]
        discussion: Option<String>,
    },

    /// Undo local edits of a requirement
    Restore { id: String },

    /// Remove a requirement and its descendants from the work item
    Remove {
        id: String,

        /// Skip confirmation
        #[clap(long, short = 'y')]
        yes: bool,
    },

    /// Check that the work item's data is isolated from other items
    Verify,

    /// Move the work item's data to its permanent id after saving
    Save { permanent_id: String },

    /// Move data between two work item ids
    Migrate { from: String, to: String },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective settings
    Show,

    /// Print the settings file path
    Path,

    /// Write the effective settings to the settings file
    Init {
        /// Overwrite an existing file
        #[clap(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage the shared requirement catalog
    #[clap(subcommand)]
    Catalog(CatalogCommand),

    /// Publish catalog requirements to whichever work item picks them up
    Apply {
        /// Requirement ids to publish
        #[clap(required = true)]
        ids: Vec<String>,

        /// Print the publish report as JSON
        #[clap(long)]
        json: bool,
    },

    /// Work with the requirements applied to one work item
    #[clap(subcommand)]
    Item(ItemCommand),

    /// Watch the store and offer pending batches as they arrive
    Watch {
        /// Accept without prompting
        #[clap(long, short = 'y')]
        yes: bool,

        /// Stop after this many seconds
        #[clap(long)]
        seconds: Option<u64>,
    },

    /// Delete keys left behind by early builds
    Cleanup,

    /// Summarize how the store is partitioned between work items
    Report,

    /// Inspect or create the settings file
    #[clap(subcommand)]
    Config(ConfigCommand),
}

fn parse_backend(value: &str) -> Result<BackendType, String> {
    match value.to_ascii_lowercase().as_str() {
        "memory" => Ok(BackendType::Memory),
        "file" | "json" => Ok(BackendType::File),
        "sqlite" | "db" => Ok(BackendType::Sqlite),
        other => Err(format!(
            "unknown backend '{}' (expected memory, file or sqlite)",
            other
        )),
    }
}
