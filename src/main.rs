#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::{anyhow, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use walletchat::{
    config::{self, AppConfig},
    contacts::is_valid_address,
    identity::{FixedAccountProvider, IdentityProvider, IdentitySession, LocalWallet},
    ContactDirectory, ConversationSelector, DisplayMessage, DisplayStatus, EngineEvent, InMemoryNetwork,
    ReconciliationEngine,
};

/// Command line arguments for walletchat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "walletchat: wallet-authenticated messaging with optimistic sends.",
    long_about = "walletchat signs in with a local wallet key and lets you message contacts over an \
    in-process network. Type /help once started to list commands."
)]
struct Args {
    /// Directory holding config.json and the wallet key
    #[arg(long = "config", value_name = "PATH")]
    config_dir: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: LevelFilter,

    /// Sign in as this address instead of using the wallet key
    #[arg(long, value_name = "ADDRESS")]
    account: Option<String>,

    /// Extra addresses that are reachable on the demo network
    #[arg(long = "peer", value_name = "ADDRESS")]
    peers: Vec<String>,
}

// Always reachable, answers every direct message
const ECHO_PEER: &str = "0xec40000000000000000000000000000000000001";

const HELP: &str = "\
Commands:
  /add <address>            add a contact (checks reachability)
  /contacts                 list contacts
  /open <address>           open a direct conversation with a contact
  /group <address>...       open a group conversation with contacts
  /view                     show the conversation
  /retry <id>               retry a failed message
  /cancel <id>              drop a failed message
  /refresh                  re-fetch history now
  /fail <n>                 make the next n sends fail
  /whoami                   show your account and public key
  /quit                     exit
Anything else is sent as a message to the open conversation.";

/// Everything the REPL needs to act on user input
struct Session {
    directory: ContactDirectory,
    selector: ConversationSelector,
    engine: ReconciliationEngine,
    network: InMemoryNetwork,
    config: AppConfig,
    account: String,
    public_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, args.log_level)?;
    info!("walletchat starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    if let Some(dir) = &args.config_dir {
        config::set_config_dir_override(dir.clone());
        info!("Config directory overridden to: {}", dir.display());
    }
    let app_config = AppConfig::load()?;
    let key_dir = config::get_config_dir()?;

    let identity = match sign_in(args.account.as_deref(), &key_dir).await {
        Ok(identity) => identity,
        Err(e) => {
            error!("Authentication failed: {}", e);
            eprintln!("Could not sign in: {}", e);
            return Err(e);
        }
    };
    println!("Signed in as {}", identity.account());

    let network = InMemoryNetwork::new(identity.account().clone());
    network.set_echo_replies(true).await;
    network.register(ECHO_PEER).await;
    for peer in &args.peers {
        if !is_valid_address(peer) {
            warn!("Ignoring malformed peer address {}", peer);
            continue;
        }
        network.register(peer).await;
    }
    println!("Echo peer available at {}", ECHO_PEER);

    let client: Arc<dyn walletchat::MessagingClient> = Arc::new(network.clone());
    let (engine, events) = ReconciliationEngine::spawn(identity.account().clone(), client.clone(), app_config.engine_config());
    tokio::spawn(print_events(events));

    let mut session = Session {
        directory: ContactDirectory::new(identity.account().clone(), client.clone()),
        selector: ConversationSelector::with_min_group_size(client, app_config.min_group_size),
        engine,
        network,
        config: app_config,
        account: identity.account().to_string(),
        public_key: identity.public_key_hex(),
    };

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle_line(&mut session, line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("! {}", e),
        }
    }

    session.engine.shutdown().await?;
    identity.end();
    info!("walletchat exiting");
    Ok(())
}

async fn sign_in(account: Option<&str>, key_dir: &std::path::Path) -> Result<IdentitySession> {
    let session = match account {
        Some(account) => {
            if !is_valid_address(account) {
                return Err(anyhow!("{} is not a valid account address", account));
            }
            info!("Using fixed account {}", account);
            FixedAccountProvider::new(account).authenticate().await?
        }
        None => {
            info!("Authenticating with wallet in {}", key_dir.display());
            LocalWallet::new(key_dir).authenticate().await?
        }
    };
    Ok(session)
}

/// Returns Ok(false) when the user asked to quit
async fn handle_line(session: &mut Session, line: &str) -> Result<bool> {
    if !line.starts_with('/') {
        let local_id = session.engine.send(line).await?;
        println!("sending [{}]", short_id(&local_id));
        return Ok(true);
    }

    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let rest: Vec<&str> = parts.collect();

    match command {
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{}", HELP),
        "/whoami" => {
            println!("{}", session.account);
            if let Some(key) = &session.public_key {
                println!("public key {}", key);
            }
        }
        "/add" => {
            let address = rest.first().ok_or_else(|| anyhow!("usage: /add <address>"))?;
            let contact = session.directory.add_contact(address).await?;
            println!("added {}", contact.identity);
            if session.config.auto_open_on_add {
                session.selector.select_direct(&contact, &session.engine).await?;
                println!("opened conversation with {}", contact.identity);
            }
        }
        "/contacts" => {
            if session.directory.is_empty() {
                println!("no contacts yet");
            }
            for contact in session.directory.list_contacts() {
                println!("  {}", contact.identity);
            }
        }
        "/open" => {
            let address = rest.first().ok_or_else(|| anyhow!("usage: /open <address>"))?;
            let contact = session
                .directory
                .find(address)
                .cloned()
                .ok_or_else(|| anyhow!("{} is not a contact, /add it first", address))?;
            let conversation = session.selector.select_direct(&contact, &session.engine).await?;
            println!("opened {:?}", conversation);
        }
        "/group" => {
            let mut members = Vec::new();
            for address in &rest {
                let contact = session
                    .directory
                    .find(address)
                    .cloned()
                    .ok_or_else(|| anyhow!("{} is not a contact, /add it first", address))?;
                members.push(contact);
            }
            let conversation = session.selector.select_group(&members, &session.engine).await?;
            println!("opened {:?}", conversation);
        }
        "/view" => print_view(&session.engine.view().await?),
        "/retry" => {
            let id = resolve_id(session, rest.first().copied()).await?;
            session.engine.retry(&id).await?;
        }
        "/cancel" => {
            let id = resolve_id(session, rest.first().copied()).await?;
            session.engine.cancel(&id).await?;
            println!("cancelled [{}]", short_id(&id));
        }
        "/refresh" => session.engine.refresh().await?,
        "/fail" => {
            let count: usize = rest.first().unwrap_or(&"1").parse()?;
            session.network.fail_next_sends(count).await;
            println!("next {} sends will fail", count);
        }
        other => println!("unknown command {}, try /help", other),
    }
    Ok(true)
}

/// Accept either a full local id or the short prefix shown in /view
async fn resolve_id(session: &Session, given: Option<&str>) -> Result<String> {
    let given = given.ok_or_else(|| anyhow!("missing message id"))?;
    let view = session.engine.view().await?;
    let matches: Vec<&DisplayMessage> = view
        .iter()
        .filter(|m| m.is_pending() && m.id.starts_with(given))
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => Ok(given.to_string()),
        _ => Err(anyhow!("id prefix {} is ambiguous", given)),
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

fn print_view(messages: &[DisplayMessage]) {
    if messages.is_empty() {
        println!("(no messages)");
    }
    for message in messages {
        let marker = match message.status {
            DisplayStatus::Confirmed => String::new(),
            DisplayStatus::Unpublished => format!(" [{} sending]", short_id(&message.id)),
            DisplayStatus::Published => format!(" [{} sent]", short_id(&message.id)),
            DisplayStatus::Failed => format!(" [{} FAILED - /retry or /cancel]", short_id(&message.id)),
        };
        println!(
            "{} {}: {}{}",
            message.timestamp.format("%H:%M:%S"),
            short_id(&message.sender_address),
            message.content,
            marker
        );
    }
}

async fn print_events(mut events: tokio::sync::mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::SendFailed { local_id, reason } => {
                println!("! message [{}] failed: {}", short_id(&local_id), reason)
            }
            EngineEvent::GraceExpired { local_id } => {
                warn!("message {} never showed up in history", local_id)
            }
            EngineEvent::SyncFailed { reason } => println!("! history sync failed: {}", reason),
            EngineEvent::Reconciled { .. } | EngineEvent::ViewChanged { .. } => {}
        }
    }
}
