//! Linkchat CLI
//!
//! Thin wrapper around linkchat-core for command-line usage. Every identity
//! (`--as <alias>`) shares the one local graph replica in the data directory,
//! so several demo peers can talk to each other on a single machine.
//!
//! ## Usage
//!
//! ```bash
//! # Show (and on first use, create) an identity
//! linkchat --as alice identity show
//!
//! # Invite someone to a conversation
//! linkchat --as alice invite send <bob_pub> "hi bob"
//!
//! # See and accept invites
//! linkchat --as bob invite list
//! linkchat --as bob invite accept <request_id>
//!
//! # Create a group
//! linkchat --as alice invite group <bob_pub> <carol_pub> --name "crew"
//!
//! # Talk
//! linkchat --as bob send <alice_pub> "hello"
//! linkchat --as alice history <bob_pub>
//!
//! # Follow live events
//! linkchat --as alice watch
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use linkchat_core::{
    contact_display_name, conversation_label, ChatClient, ChatConfig, ChatEvent, ClientEvent,
    GraphStore, Identity, LocalStore, Message, Projection, PubKey,
};
use ulid::Ulid;

/// How long a command lets live subscriptions deliver before reading state
const SETTLE_DELAY: Duration = Duration::from_millis(200);

/// Linkchat - end-to-end encrypted message chains
#[derive(Parser)]
#[command(name = "linkchat")]
#[command(version = "0.1.0")]
#[command(about = "Linkchat - end-to-end encrypted message chains")]
#[command(
    long_about = "Peer-to-peer encrypted messaging over a shared graph store. Every identity on this machine shares one local replica."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.linkchat)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Local identity to act as
    #[arg(long = "as", global = true, default_value = "me")]
    alias: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Contact management
    Contact {
        #[command(subcommand)]
        action: ContactAction,
    },

    /// Invites (conversation requests)
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },

    /// Conversation management
    Conversation {
        #[command(subcommand)]
        action: ConversationAction,
    },

    /// Send a text message to a conversation
    Send {
        /// Counterpart (or group) public key
        converse_pub: String,
        /// Message text
        text: String,
    },

    /// Show the messages of a conversation
    History {
        /// Counterpart (or group) public key
        converse_pub: String,
        /// Follow the chain from its root, including expired messages
        #[arg(long)]
        replay: bool,
    },

    /// Print live events until interrupted
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show identity info
    Show,
    /// Publish a new display name
    Rename {
        /// New display name
        name: String,
    },
}

#[derive(Subcommand)]
enum ContactAction {
    /// Resolve a published profile and store it as a contact
    Add {
        /// Public key (base58)
        pub_key: String,
    },
    /// List contacts
    List,
    /// Remove a contact
    Remove {
        /// Public key (base58)
        pub_key: String,
    },
}

#[derive(Subcommand)]
enum InviteAction {
    /// Invite an identity to a direct conversation
    Send {
        /// Public key (base58)
        to: String,
        /// Invite text
        #[arg(default_value = "Hi!")]
        text: String,
    },
    /// Create a group and invite its members
    Group {
        /// Member public keys (base58)
        #[arg(required = true, num_args = 1..)]
        members: Vec<String>,
        /// Group name
        #[arg(short, long)]
        name: Option<String>,
        /// Invite text
        #[arg(short, long, default_value = "Join my group!")]
        text: String,
    },
    /// List pending invites
    List,
    /// Accept a pending invite
    Accept {
        /// Request ID (ULID)
        request_id: String,
    },
    /// Decline a pending invite
    Decline {
        /// Request ID (ULID)
        request_id: String,
    },
}

#[derive(Subcommand)]
enum ConversationAction {
    /// List conversations
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a conversation
    Delete {
        /// Counterpart (or group) public key
        converse_pub: String,
    },
    /// Rename a group you administer
    Rename {
        /// Group public key
        converse_pub: String,
        /// New group name
        name: String,
    },
    /// Collapse surfaced messages and advance the stored frontier
    Expire {
        /// Counterpart (or group) public key
        converse_pub: String,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".linkchat")
}

fn identity_path(data_dir: &Path, alias: &str) -> PathBuf {
    data_dir.join("identities").join(format!("{}.json", alias))
}

/// Load the identity for `alias`, creating it on first use.
fn load_identity(data_dir: &Path, alias: &str) -> Result<Identity> {
    let path = identity_path(data_dir, alias);
    if path.exists() {
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        return Ok(Identity::from_json(&json)?);
    }
    let identity = Identity::generate(alias);
    save_identity(&path, &identity)?;
    tracing::info!(%alias, pub_key = %identity.pub_key(), "Created identity");
    Ok(identity)
}

fn save_identity(path: &Path, identity: &Identity) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, identity.to_json()?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn parse_pub(s: &str) -> Result<PubKey> {
    PubKey::parse(s.trim()).with_context(|| format!("invalid public key: {}", s))
}

fn parse_request_id(s: &str) -> Result<Ulid> {
    Ulid::from_string(s.trim()).with_context(|| format!("invalid request id: {}", s))
}

fn format_time(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn sender_name(projection: &Projection, from: &PubKey) -> String {
    if from == projection.me() {
        return "me".to_string();
    }
    projection
        .contacts
        .find(from)
        .map(|c| contact_display_name(c).to_string())
        .unwrap_or_else(|| from.short().to_string())
}

fn print_message(projection: &Projection, message: &Message) {
    let body = message
        .content()
        .map(|c| c.body().to_string())
        .unwrap_or_else(|| "(sealed)".to_string());
    println!(
        "[{}] {}: {}",
        format_time(message.timestamp),
        sender_name(projection, &message.from_pub),
        body
    );
}

/// Let live subscriptions deliver, then fold everything they queued.
async fn settle(client: &ChatClient) {
    tokio::time::sleep(SETTLE_DELAY).await;
    client.flush().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;
    let config = match &cli.config {
        Some(path) => ChatConfig::load(path)?,
        None => ChatConfig::default(),
    };

    let mut identity = load_identity(&data_dir, &cli.alias)?;
    let store: Arc<dyn GraphStore> = Arc::new(LocalStore::open(data_dir.join("replica.redb"))?);

    // Renames happen before the client publishes the profile
    if let Commands::Identity {
        action: IdentityAction::Rename { name },
    } = &cli.command
    {
        identity.rename(store.as_ref(), name.clone())?;
        save_identity(&identity_path(&data_dir, &cli.alias), &identity)?;
    }

    let client = ChatClient::new(identity, store, config)?;
    client.start()?;
    settle(&client).await;

    match cli.command {
        Commands::Identity { action } => {
            let identity = client.identity();
            match action {
                IdentityAction::Show => {
                    println!("Identity:");
                    println!("  Alias: {}", identity.alias());
                    println!("  Name: {}", identity.name().unwrap_or("(none)"));
                    println!("  Public key: {}", identity.pub_key());
                    println!("  Encryption key: {}", identity.pair().epub());
                }
                IdentityAction::Rename { .. } => {
                    println!("Identity renamed.");
                    println!("  Name: {}", identity.name().unwrap_or("(none)"));
                }
            }
        }

        Commands::Contact { action } => match action {
            ContactAction::Add { pub_key } => {
                let contact = client.add_contact(&parse_pub(&pub_key)?)?;
                println!("Contact added.");
                println!("  Name: {}", contact_display_name(&contact));
                println!("  Public key: {}", contact.pub_key);
            }
            ContactAction::List => {
                let snapshot = client.snapshot();
                let contacts = snapshot.contacts.contacts();
                if contacts.is_empty() {
                    println!("No contacts.");
                } else {
                    println!("Contacts ({}):", contacts.len());
                    for contact in contacts.iter() {
                        println!("  {} {}", contact_display_name(contact), contact.pub_key);
                    }
                }
            }
            ContactAction::Remove { pub_key } => {
                client.remove_contact(&parse_pub(&pub_key)?)?;
                println!("Contact removed.");
            }
        },

        Commands::Invite { action } => match action {
            InviteAction::Send { to, text } => {
                let conversation = client.send_request(&parse_pub(&to)?, text)?;
                println!("Invite sent.");
                println!("  Conversation: {}", conversation.converse_pub);
            }
            InviteAction::Group {
                members,
                name,
                text,
            } => {
                let members = members
                    .iter()
                    .map(|m| parse_pub(m))
                    .collect::<Result<Vec<_>>>()?;
                let conversation = client.send_group_requests(&members, text, name)?;
                client.flush().await;
                let failed = client.snapshot().conversations.errors().len();
                println!("Group created.");
                println!("  Group: {}", conversation.converse_pub);
                if failed > 0 {
                    println!("  Members not reached: {}", failed);
                }
            }
            InviteAction::List => {
                let snapshot = client.snapshot();
                let requests = snapshot.requests.requests();
                if requests.is_empty() {
                    println!("No pending invites.");
                } else {
                    println!("Pending invites ({}):", requests.len());
                    for request in requests.iter() {
                        println!();
                        println!("  ID: {}", request.uuid);
                        println!("  From: {}", sender_name(&snapshot, &request.from_pub));
                        println!("  Public key: {}", request.from_pub);
                        if let Some(content) = request.content() {
                            println!("  Text: {}", content.body());
                            if let Some(members) = content.member_pubs() {
                                println!("  Group members: {}", members.len());
                            }
                        }
                    }
                }
            }
            InviteAction::Accept { request_id } => {
                let conversation = client.accept_request(&parse_request_id(&request_id)?)?;
                println!("Invite accepted.");
                println!("  Conversation: {}", conversation.converse_pub);
            }
            InviteAction::Decline { request_id } => {
                client.decline_request(&parse_request_id(&request_id)?)?;
                println!("Invite declined.");
            }
        },

        Commands::Conversation { action } => match action {
            ConversationAction::List { json } => {
                let snapshot = client.snapshot();
                let contacts = snapshot.contacts.contacts();
                let conversations = snapshot.conversations.conversations();
                if json {
                    let rows: Vec<_> = conversations
                        .iter()
                        .map(|c| {
                            serde_json::json!({
                                "uuid": c.uuid.to_string(),
                                "label": conversation_label(c, contacts, snapshot.me()),
                                "converse_pub": c.converse_pub.to_string(),
                                "group": c.is_group(),
                                "unread": snapshot.unread_count(&c.converse_pub),
                                "last_timestamp": c.last_timestamp,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                } else if conversations.is_empty() {
                    println!("No conversations.");
                } else {
                    println!("Conversations ({}):", conversations.len());
                    for c in conversations.iter() {
                        println!();
                        println!("  {}", conversation_label(c, contacts, snapshot.me()));
                        println!("  Public key: {}", c.converse_pub);
                        if c.is_group() {
                            println!("  Members: {}", c.member_pubs.as_ref().map_or(0, Vec::len));
                        }
                        println!("  Unread: {}", snapshot.unread_count(&c.converse_pub));
                    }
                }
            }
            ConversationAction::Delete { converse_pub } => {
                client.delete_conversation(&parse_pub(&converse_pub)?)?;
                println!("Conversation deleted.");
            }
            ConversationAction::Rename { converse_pub, name } => {
                let conversation = client.rename_group(&parse_pub(&converse_pub)?, name)?;
                println!("Group renamed.");
                println!("  Name: {}", conversation.name.as_deref().unwrap_or("(none)"));
            }
            ConversationAction::Expire { converse_pub } => {
                if client.expire_messages(&parse_pub(&converse_pub)?)? {
                    println!("Messages expired.");
                } else {
                    println!("Nothing to expire.");
                }
            }
        },

        Commands::Send { converse_pub, text } => {
            let message = client.send_text(&parse_pub(&converse_pub)?, text)?;
            println!("Message sent.");
            println!("  ID: {}", message.uuid);
        }

        Commands::History {
            converse_pub,
            replay,
        } => {
            let converse_pub = parse_pub(&converse_pub)?;
            if replay {
                client.replay_history(&converse_pub)?;
                settle(&client).await;
            }
            let snapshot = client.snapshot();
            let mut messages = snapshot
                .messages
                .for_conversation(snapshot.me(), &converse_pub)
                .peekable();
            if messages.peek().is_none() {
                println!("No messages.");
            }
            for message in messages {
                print_message(&snapshot, message);
            }
            client.select_conversation(&converse_pub, None);
            client.flush().await;
        }

        Commands::Watch { seconds } => {
            let mut events = client.subscribe_events();
            let deadline = async {
                match seconds {
                    Some(s) => tokio::time::sleep(Duration::from_secs(s)).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);
            println!("Watching as {} (Ctrl+C to stop)...", client.identity().alias());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = &mut deadline => break,
                    event = events.recv() => match event {
                        Ok(ClientEvent::Notification(n)) => {
                            let snapshot = client.snapshot();
                            println!(
                                "New message from {}: {}",
                                sender_name(&snapshot, &n.from_pub),
                                n.preview.unwrap_or_default()
                            );
                        }
                        Ok(ClientEvent::Event(ChatEvent::RequestAppend(request))) => {
                            let snapshot = client.snapshot();
                            println!(
                                "Invite {} from {}",
                                request.uuid,
                                sender_name(&snapshot, &request.from_pub)
                            );
                        }
                        Ok(ClientEvent::Event(ChatEvent::MessageAppend(message))) => {
                            print_message(&client.snapshot(), &message);
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(skipped = n, "Event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
    }

    client.shutdown();
    Ok(())
}
