use clap::{Parser, Subcommand, ValueEnum};

/// relayd: quota-metered relay gateway for LLM providers
#[derive(Parser)]
#[command(name = "relayd", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (defaults to RELAY_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage client tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Manage upstream channels
    Channel {
        #[command(subcommand)]
        command: ChannelCommands,
    },

    /// Manage users and balances
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a new `sk-` token for a user
    Create {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        name: String,
        /// Initial quota in internal units
        #[arg(long, default_value_t = 0)]
        quota: i64,
        #[arg(long)]
        unlimited: bool,
        /// Expire after this many days (never, if omitted)
        #[arg(long)]
        expires_in_days: Option<i64>,
    },
    /// List a user's tokens
    List {
        #[arg(long)]
        user_id: i64,
        /// Name substring or exact key
        #[arg(long, default_value = "")]
        keyword: String,
        #[arg(long, default_value_t = 0)]
        page: u32,
    },
    /// Edit a token. This is how an expired or exhausted token is re-enabled.
    Update {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        id: i64,
        #[arg(long)]
        name: Option<String>,
        /// Set the remaining quota
        #[arg(long)]
        quota: Option<i64>,
        #[arg(long)]
        unlimited: Option<bool>,
        /// New expiry in days from now
        #[arg(long, conflicts_with = "never_expires")]
        expires_in_days: Option<i64>,
        #[arg(long)]
        never_expires: bool,
        #[arg(long)]
        remind_threshold: Option<i64>,
        #[arg(long, value_enum)]
        status: Option<TokenStatusArg>,
    },
    /// Delete tokens by id
    Delete {
        #[arg(long)]
        user_id: i64,
        #[arg(long = "id", required = true)]
        ids: Vec<i64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum TokenStatusArg {
    Enabled,
    Disabled,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StatusFilter {
    Enabled,
    Disabled,
    AutoDisabled,
}

#[derive(Subcommand)]
pub enum ChannelCommands {
    /// Add a channel; repeat --key to create one channel per key
    Add {
        #[arg(long)]
        name: String,
        /// openai, azure, anthropic or bedrock
        #[arg(long)]
        provider: String,
        #[arg(long = "key", required = true)]
        keys: Vec<String>,
        #[arg(long, default_value = "")]
        base_url: String,
        /// Comma separated model names (defaults to the provider's known models)
        #[arg(long)]
        models: Option<String>,
        /// JSON object mapping requested to upstream model names
        #[arg(long)]
        model_mapping: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i64,
        #[arg(long, default_value_t = 1)]
        weight: u32,
        #[arg(long)]
        region: Option<String>,
        #[arg(long)]
        api_version: Option<String>,
    },
    /// List channels
    List {
        /// Name substring, exact key or exact id
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
        #[arg(long, default_value_t = 0)]
        page: u32,
    },
    /// Re-enable a channel
    Enable {
        #[arg(long)]
        id: i64,
    },
    /// Disable a channel manually
    Disable {
        #[arg(long)]
        id: i64,
    },
    /// Edit a channel's routing fields
    Update {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        /// Comma separated model names
        #[arg(long)]
        models: Option<String>,
        #[arg(long)]
        priority: Option<i64>,
        #[arg(long)]
        weight: Option<u32>,
    },
    /// Delete channels by id
    Delete {
        #[arg(long = "id", required = true)]
        ids: Vec<i64>,
    },
    /// Delete every disabled channel
    DeleteDisabled,
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Create a user
    Create {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long, default_value_t = 0)]
        quota: i64,
    },
    /// List users
    List {
        #[arg(long, default_value_t = 0)]
        page: u32,
    },
    /// Credit a user's balance
    Topup {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        amount: i64,
    },
}
