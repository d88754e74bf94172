//! Command-line argument parsing for sqlfleet.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::batch::{ConfirmationGate, ErrorPolicy, Impact};
use crate::db::CommandType;
use crate::output::{OutputFormat, ResultShape};

/// Run queries, scripts and server role changes across database instances.
#[derive(Parser, Debug)]
#[command(name = "sqlfleet")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a query, script files, URLs or server objects
    Query(QueryArgs),

    /// Manage server role membership
    Role {
        #[command(subcommand)]
        command: RoleCommand,
    },

    /// Manage passwords stored in the OS keyring
    Credential {
        #[command(subcommand)]
        command: CredentialCommand,
    },
}

/// Login used for every instance of an invocation.
#[derive(Args, Debug, Clone, Default)]
pub struct LoginArgs {
    /// Login name
    #[arg(short = 'U', long, env = "SQLFLEET_USER", value_name = "USER")]
    pub user: Option<String>,

    /// Password (prefer the keyring: `sqlfleet credential set`)
    #[arg(long, env = "SQLFLEET_PASSWORD", hide_env_values = true, value_name = "PASSWORD")]
    pub password: Option<String>,
}

/// Confirmation and error handling shared by mutating commands.
#[derive(Args, Debug, Clone, Default)]
pub struct ExecutionArgs {
    /// Report what would be done without doing it
    #[arg(long)]
    pub dry_run: bool,

    /// Answer yes to every confirmation prompt
    #[arg(short = 'y', long)]
    pub yes: bool,

    /// Stop at the first failing target instead of warning and continuing
    #[arg(long)]
    pub enable_exception: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

impl ExecutionArgs {
    pub fn policy(&self) -> ErrorPolicy {
        if self.enable_exception {
            ErrorPolicy::Raise
        } else {
            ErrorPolicy::Warn
        }
    }

    /// Builds the gate; `threshold` of `None` never prompts.
    pub fn gate(&self, threshold: Option<Impact>) -> ConfirmationGate {
        if self.dry_run {
            ConfirmationGate::dry_run()
        } else {
            ConfirmationGate::apply(threshold, self.yes)
        }
    }
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Target instances (host, host\INSTANCE, host,port, URL or configured name)
    #[arg(short = 'S', long = "sql-instance", value_name = "INSTANCE", value_delimiter = ',')]
    pub instances: Vec<String>,

    /// Newline-delimited JSON database handles ({"instance": .., "database": ..}); "-" for stdin
    #[arg(long, value_name = "FILE")]
    pub databases_from: Option<String>,

    #[command(flatten)]
    pub login: LoginArgs,

    /// Database to run in
    #[arg(short = 'd', long, value_name = "DATABASE")]
    pub database: Option<String>,

    /// Connect with read-only application intent
    #[arg(long)]
    pub read_only: bool,

    /// Query text, run once per target
    #[arg(short = 'Q', long, value_name = "SQL", conflicts_with_all = ["input", "object"])]
    pub query: Option<String>,

    /// Script files, directories, wildcard paths or http(s) URLs
    #[arg(short = 'i', long = "input", value_name = "PATH_OR_URL")]
    pub input: Vec<String>,

    /// Server objects to script and run (KIND:NAME)
    #[arg(long, value_name = "KIND:NAME", requires = "script_from")]
    pub object: Vec<String>,

    /// Instance to script objects from
    #[arg(long, value_name = "INSTANCE")]
    pub script_from: Option<String>,

    /// Query timeout in seconds (default from config)
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// How the query text is interpreted
    #[arg(long, value_name = "TYPE", default_value = "text")]
    pub command_type: CommandType,

    /// Query parameter NAME=VALUE (repeatable)
    #[arg(long = "param", value_name = "NAME=VALUE")]
    pub params: Vec<String>,

    /// Result shape
    #[arg(long = "as", value_enum, default_value_t)]
    pub shape: ResultShape,

    /// Tag results with their instance even for a single target
    #[arg(long)]
    pub append_instance: bool,

    /// Return server informational messages
    #[arg(long)]
    pub messages: bool,

    /// Ask before running queries at or above the configured impact threshold
    #[arg(long)]
    pub confirm: bool,

    #[command(flatten)]
    pub exec: ExecutionArgs,
}

#[derive(Subcommand, Debug)]
pub enum RoleCommand {
    /// Add logins or roles to server roles
    Add(MembershipArgs),
    /// Remove logins or roles from server roles
    Remove(MembershipArgs),
    /// List server roles and their members
    List(RoleListArgs),
}

#[derive(Args, Debug)]
pub struct MembershipArgs {
    /// Target instances
    #[arg(short = 'S', long = "sql-instance", value_name = "INSTANCE", value_delimiter = ',', required = true)]
    pub instances: Vec<String>,

    #[command(flatten)]
    pub login: LoginArgs,

    /// Server roles to change
    #[arg(long = "server-role", value_name = "ROLE", value_delimiter = ',', required = true)]
    pub server_roles: Vec<String>,

    /// Logins to add or remove
    #[arg(long = "login", value_name = "LOGIN", value_delimiter = ',')]
    pub logins: Vec<String>,

    /// Roles to add or remove
    #[arg(long = "role", value_name = "ROLE", value_delimiter = ',')]
    pub roles: Vec<String>,

    #[command(flatten)]
    pub exec: ExecutionArgs,
}

#[derive(Args, Debug)]
pub struct RoleListArgs {
    /// Target instances
    #[arg(short = 'S', long = "sql-instance", value_name = "INSTANCE", value_delimiter = ',', required = true)]
    pub instances: Vec<String>,

    #[command(flatten)]
    pub login: LoginArgs,

    /// Only these server roles
    #[arg(long = "server-role", value_name = "ROLE", value_delimiter = ',')]
    pub server_roles: Vec<String>,

    /// Stop at the first failing instance
    #[arg(long)]
    pub enable_exception: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommand {
    /// Store a password (read from --password, SQLFLEET_PASSWORD or stdin)
    Set {
        #[arg(long, value_name = "INSTANCE")]
        instance: String,
        #[arg(long, value_name = "USER")]
        user: String,
        #[arg(long, env = "SQLFLEET_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Delete a stored password
    Delete {
        #[arg(long, value_name = "INSTANCE")]
        instance: String,
        #[arg(long, value_name = "USER")]
        user: String,
    },
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    ///
    /// Uses the --config argument if provided, otherwise the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::config::Config::default_path)
    }
}
