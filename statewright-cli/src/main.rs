mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cli::{engine_handlers, execution_handlers};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "statewright")]
#[command(version)]
#[command(about = "Durable state machine workflows with retries, parallel branches and task tokens")]
#[command(
    help_template = "{name} - {version}\n{about}\n\n{usage-heading}\n  {usage}\n\n{all-args}{options}\n"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a definition file and report problems
    Validate {
        /// Path to a YAML or JSON definition
        file: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run a definition in this process until it finishes
    ///
    /// Every task resource is executed as a shell job. Callback tasks get
    /// TASK_TOKEN and STATEWRIGHT_CALLBACK_URL in their environment.
    ///
    /// Examples:
    ///   statewright run flow.yaml --input '{"count": 0}'
    ///   statewright run flow.yaml --input @input.json --json
    Run {
        /// Path to a YAML or JSON definition
        file: PathBuf,

        /// Execution input: inline JSON or @path
        #[arg(short, long)]
        input: Option<String>,

        /// Persist to this JSON store instead of memory
        #[arg(long)]
        store: Option<PathBuf>,

        /// Give up after this many seconds
        #[arg(short, long, default_value = "3600")]
        timeout: u64,

        /// Log engine activity to stderr
        #[arg(short, long)]
        verbose: bool,

        /// Print the final execution as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start the statewright server
    Serve {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Server bind address
        #[arg(long)]
        host: Option<String>,

        /// Server port number
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory of definitions to register on startup
        #[arg(long)]
        definitions: Option<PathBuf>,
    },

    /// Register a definition with a server
    Deploy {
        file: PathBuf,

        #[arg(long, default_value = "")]
        server: String,

        #[arg(long)]
        json: bool,
    },

    /// List registered definitions
    Definitions {
        #[arg(long, default_value = "")]
        server: String,

        #[arg(long)]
        json: bool,
    },

    /// Start an execution on a server
    Start {
        /// Definition name
        definition: String,

        /// Execution input: inline JSON or @path
        #[arg(short, long)]
        input: Option<String>,

        #[arg(long, default_value = "")]
        server: String,

        #[arg(long)]
        json: bool,
    },

    /// List executions
    List {
        #[arg(long, default_value = "")]
        server: String,

        #[arg(long)]
        json: bool,
    },

    /// Show an execution
    Status {
        execution_id: String,

        #[arg(long, default_value = "")]
        server: String,

        #[arg(long)]
        json: bool,
    },

    /// Show an execution's transition history
    History {
        execution_id: String,

        #[arg(long, default_value = "")]
        server: String,

        #[arg(long)]
        json: bool,
    },

    /// Stop an execution
    Stop {
        execution_id: String,

        /// Reason recorded on the execution
        #[arg(short, long)]
        cause: Option<String>,

        #[arg(long, default_value = "")]
        server: String,

        #[arg(long)]
        json: bool,
    },

    /// Complete a task token successfully
    Complete {
        token: String,

        /// Task result: inline JSON or @path
        #[arg(short, long)]
        output: Option<String>,

        #[arg(long, default_value = "")]
        server: String,
    },

    /// Fail a task token
    Fail {
        token: String,

        /// Error code matched by retry and catch policies
        #[arg(short, long)]
        error: String,

        #[arg(short, long)]
        cause: Option<String>,

        #[arg(long, default_value = "")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, json } => {
            engine_handlers::handle_validate(file, json).await?;
        }
        Commands::Run {
            file,
            input,
            store,
            timeout,
            verbose,
            json,
        } => {
            engine_handlers::handle_run(file, input, store, timeout, verbose, json).await?;
        }
        Commands::Serve {
            config,
            host,
            port,
            definitions,
        } => {
            engine_handlers::handle_serve(config, host, port, definitions).await?;
        }
        Commands::Deploy { file, server, json } => {
            execution_handlers::handle_deploy(file, server, json).await?;
        }
        Commands::Definitions { server, json } => {
            execution_handlers::handle_definitions(server, json).await?;
        }
        Commands::Start {
            definition,
            input,
            server,
            json,
        } => {
            execution_handlers::handle_start(definition, input, server, json).await?;
        }
        Commands::List { server, json } => {
            execution_handlers::handle_list(server, json).await?;
        }
        Commands::Status {
            execution_id,
            server,
            json,
        } => {
            execution_handlers::handle_status(execution_id, server, json).await?;
        }
        Commands::History {
            execution_id,
            server,
            json,
        } => {
            execution_handlers::handle_history(execution_id, server, json).await?;
        }
        Commands::Stop {
            execution_id,
            cause,
            server,
            json,
        } => {
            execution_handlers::handle_stop(execution_id, cause, server, json).await?;
        }
        Commands::Complete {
            token,
            output,
            server,
        } => {
            execution_handlers::handle_complete(token, output, server).await?;
        }
        Commands::Fail {
            token,
            error,
            cause,
            server,
        } => {
            execution_handlers::handle_fail(token, error, cause, server).await?;
        }
    }

    Ok(())
}
