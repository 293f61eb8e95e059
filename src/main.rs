use std::sync::Arc;

use clap::{Parser, Subcommand};
use convosync::api::{ApiError, ConversationFilters};
use convosync::config::{DEFAULT_BASE_URL, SyncConfig};
use convosync::dispatch::{DomainEvent, EventHandler};
use convosync::types::ConversationStatus;
use convosync::{ClientError, ConnectionSnapshot, Draft, MutationError, SyncClient};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing scope; pass --scope or set CONVOSYNC_SCOPE")]
    MissingScope,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("signal handler failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "convosync", about = "Conversation sync client for the support console")]
struct Cli {
    #[arg(long, env = "CONVOSYNC_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    #[arg(long, env = "CONVOSYNC_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the push stream for a scope and print every applied event.
    Tail {
        #[arg(long, env = "CONVOSYNC_SCOPE")]
        scope: Option<String>,
    },
    /// Print one page of the inbox.
    Conversations {
        #[arg(long, value_parser = parse_status)]
        status: Option<ConversationStatus>,
        #[arg(long)]
        assigned_to: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Send a text message to a conversation.
    Send { conversation: String, content: String },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = SyncConfig {
        base_url: cli.base_url.trim_end_matches('/').to_owned(),
        token: cli.token,
        ..SyncConfig::from_env()
    };
    let client = SyncClient::new(&config)?;

    match cli.command {
        Command::Tail { scope } => {
            let scope = scope.or(config.scope).ok_or(CliError::MissingScope)?;
            run_tail(&client, &scope).await
        }
        Command::Conversations { status, assigned_to, search, page, limit } => {
            let filters = ConversationFilters { status, assigned_to, search, page, limit };
            let page = client.load_conversations(&filters).await?;
            println!("{}", serde_json::to_string_pretty(&page.conversations)?);
            eprintln!("total={} has_more={}", page.total, page.has_more);
            Ok(())
        }
        Command::Send { conversation, content } => {
            let message = client.send_message(&conversation, Draft::text(content)).await?;
            println!("{}", serde_json::to_string_pretty(&message)?);
            Ok(())
        }
    }
}

async fn run_tail(client: &SyncClient, scope: &str) -> Result<(), CliError> {
    client.register_handler(Arc::new(PrintEvents));
    let _connection = client
        .state()
        .subscribe_connection(|snapshot: &ConnectionSnapshot| {
            eprintln!(
                "connection: {:?} attempts={} exhausted={}",
                snapshot.state, snapshot.attempts, snapshot.exhausted
            );
        });

    let handle = client.connect(scope);
    tokio::signal::ctrl_c().await?;
    client.disconnect(&handle);
    Ok(())
}

/// Prints one line per applied push event.
struct PrintEvents;

impl EventHandler for PrintEvents {
    fn handle(&self, event: &DomainEvent) {
        match event {
            DomainEvent::MessageReceived { conversation, message } => {
                println!("{} {} {}: {}", event.kind(), conversation.id, message.id, message.content);
            }
            DomainEvent::MessageSent { conversation_id, message, .. }
            | DomainEvent::ScheduledMessageSent { conversation_id, message, .. } => {
                println!("{} {} {}: {}", event.kind(), conversation_id, message.id, message.content);
            }
            DomainEvent::ConversationUpdated { conversation_id, .. } => {
                println!("{} {}", event.kind(), conversation_id);
            }
            _ => println!("{}", event.kind()),
        }
    }
}

fn parse_status(raw: &str) -> Result<ConversationStatus, String> {
    match raw {
        "active" => Ok(ConversationStatus::Active),
        "closed" => Ok(ConversationStatus::Closed),
        "archived" => Ok(ConversationStatus::Archived),
        other => Err(format!("unknown status `{other}`; expected active, closed, or archived")),
    }
}
