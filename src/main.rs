//! Supportchat CLI
//!
//! Sign in, manage support tickets and chat on the active one from a
//! terminal.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use supportchat::models::NewTicket;
use supportchat::{
    ChannelState, ChatError, ChatSession, ProjectedItem, SupportChatConfig, SupportClient, Ticket,
};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Supportchat - chat with support about your tickets
#[derive(Parser, Debug)]
#[command(name = "supportchat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Base URL of the REST API
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Base URL of the chat channel (derived from --api-url when omitted)
    #[arg(long, global = true)]
    ws_url: Option<String>,

    /// Directory for credentials, cached tickets and config.toml
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Ticket refresh interval in seconds
    #[arg(long, global = true)]
    poll_secs: Option<u64>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "user")]
        role: String,
        /// Read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Sign in and remember the session
    Login {
        #[arg(long)]
        email: String,
        /// Read from stdin when omitted
        #[arg(long)]
        password: Option<String>,
    },
    /// Forget the session and cached tickets
    Logout,
    /// List your tickets
    Tickets {
        /// Keep refreshing until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Open a new ticket
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        priority: Option<String>,
        #[arg(long)]
        assignee: Option<i64>,
    },
    /// Close the active ticket
    Close,
    /// Make a ticket active and print its conversation
    Activate { ticket_id: i64 },
    /// Chat on a ticket (the active one when omitted). `/quit` leaves.
    Chat { ticket_id: Option<i64> },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let data_dir = match cli.data_dir.clone() {
        Some(dir) => dir,
        None => get_supportchat_home()?,
    };
    let mut config = SupportChatConfig::load(data_dir)
        .await?
        .with_verbose(cli.verbose);
    if let Some(api_url) = cli.api_url.clone() {
        config = config.with_api_url(api_url);
    }
    if let Some(ws_url) = cli.ws_url.clone() {
        config = config.with_ws_url(ws_url);
    }
    if let Some(secs) = cli.poll_secs {
        config = config.with_poll_interval(Duration::from_secs(secs.max(1)));
    }
    info!("API {} / channel {}", config.api_url, config.ws_url);
    info!("Data directory: {:?}", config.data_dir());

    let mut client = SupportClient::new(config).await?;

    match cli.command {
        Command::Register {
            name,
            email,
            role,
            password,
        } => {
            let password = password_or_prompt(password)?;
            let user = client
                .register(&name, &email, &password, &role)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message("Registration failed.")))?;
            println!("Registered {} <{}> as user {}", user.name, user.email, user.id);
        }
        Command::Login { email, password } => {
            let password = password_or_prompt(password)?;
            let user_id = client
                .login(&email, &password)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message("Login failed.")))?;
            println!("Signed in as user {user_id}");
        }
        Command::Logout => {
            client.logout().await?;
            println!("Signed out");
        }
        Command::Tickets { watch } => list_tickets(&client, watch).await?,
        Command::Create {
            title,
            description,
            priority,
            assignee,
        } => {
            let mut ticket = NewTicket::new(title, description);
            if let Some(priority) = priority {
                ticket = ticket.with_priority(priority);
            }
            if let Some(assignee) = assignee {
                ticket = ticket.with_assignee(assignee);
            }
            // Make sure the open-ticket check sees the server's list
            if let Err(e) = client.refresh_tickets().await {
                warn!("Using cached tickets: {}", e);
            }
            let created = client
                .create_ticket(ticket)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message("Failed to create ticket.")))?;
            println!("Created ticket #{}: {}", created.id, created.title);
        }
        Command::Close => {
            let closed = client
                .close_active_ticket()
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message("Failed to close ticket.")))?;
            println!("Closed ticket #{}: {}", closed.id, closed.title);
        }
        Command::Activate { ticket_id } => {
            let session = client
                .activate_ticket(ticket_id)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message("Failed to load ticket.")))?;
            let mut out = io::stdout();
            print_items(&mut out, &session.view())?;
        }
        Command::Chat { ticket_id } => {
            let ticket_id = match ticket_id {
                Some(id) => id,
                None => client
                    .ticket_cache()
                    .read()
                    .await
                    .active()
                    .map(|t| t.id)
                    .context("No active ticket. Pass a ticket id or run `activate` first")?,
            };
            let session = client
                .activate_ticket(ticket_id)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message("Failed to open chat.")))?;
            run_chat(session).await?;
        }
    }

    Ok(())
}

async fn list_tickets(client: &SupportClient, watch: bool) -> anyhow::Result<()> {
    if !watch {
        let tickets = match client.refresh_tickets().await {
            Ok(tickets) => tickets,
            Err(e) => {
                warn!("Showing cached tickets: {}", e);
                client.tickets().await
            }
        };
        print_tickets(&tickets);
        return Ok(());
    }

    let poller = client.start_poller()?;
    let mut updates = poller.subscribe();
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                println!();
                print_tickets(&client.tickets().await);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    poller.stop();
    Ok(())
}

fn print_tickets(tickets: &[Ticket]) {
    if tickets.is_empty() {
        println!("No tickets");
        return;
    }
    for ticket in tickets {
        println!(
            "{} #{:<5} {:<7} {:<8} {}",
            if ticket.is_active { "●" } else { " " },
            ticket.id,
            ticket.status.as_str(),
            ticket.priority,
            ticket.title
        );
    }
    if let Some(open) = tickets.iter().find(|t| t.is_open()) {
        println!("Ticket #{} is open. Close it to create a new one.", open.id);
    }
}

async fn run_chat(session: &mut ChatSession) -> anyhow::Result<()> {
    let mut out = io::stdout();
    if let Some(ticket) = session.ticket() {
        writeln!(out, "#{} {} [{}]", ticket.id, ticket.title, ticket.status)?;
    }

    let (version, items) = session.view_versioned();
    let mut printed = print_new(&mut out, version, &items, None)?;
    let mut updates = session.updates();
    let mut channel = session.subscribe_channel();

    let (input_tx, mut input_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if input_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            line = input_rx.recv() => {
                let Some(line) = line else { break };
                if line.trim() == "/quit" {
                    break;
                }
                if line.trim().is_empty() {
                    continue;
                }
                let sent = match session.send(&line) {
                    // No live channel: store it over REST instead
                    Err(ChatError::ChannelNotOpen) => {
                        session.send_via_rest(&line).await.map(|_| ())
                    }
                    other => other,
                };
                if let Err(e) = sent {
                    writeln!(out, "! {}", e.user_message("Failed to send message"))?;
                }
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let (version, items) = session.view_versioned();
                printed = print_new(&mut out, version, &items, Some(printed))?;
            }
            changed = channel.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = channel.borrow_and_update().clone();
                match state {
                    ChannelState::Open => writeln!(out, "(connected)")?,
                    ChannelState::Closed { fault: Some(fault) } => {
                        writeln!(out, "(disconnected: {fault})")?;
                    }
                    _ => {}
                }
            }
        }
    }

    session.deactivate();
    Ok(())
}

/// How much of the view is on screen, and for which log version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Printed {
    version: u64,
    items: usize,
}

/// Print items past `printed`. When the log was replaced since (a new
/// version), everything is printed again from the top.
fn print_new(
    out: &mut impl Write,
    version: u64,
    items: &[ProjectedItem],
    printed: Option<Printed>,
) -> io::Result<Printed> {
    let start = match printed {
        Some(p) if p.version == version && p.items <= items.len() => p.items,
        Some(_) => {
            writeln!(out, "--- reloaded ---")?;
            0
        }
        None => 0,
    };
    print_items(out, &items[start..])?;
    Ok(Printed {
        version,
        items: items.len(),
    })
}

fn print_items(out: &mut impl Write, items: &[ProjectedItem]) -> io::Result<()> {
    for item in items {
        match item {
            ProjectedItem::Date { label } => writeln!(out, "--- {label} ---")?,
            ProjectedItem::Message { message, .. } => {
                let who = if message.is_user {
                    "you"
                } else if message.sender_name.is_empty() {
                    "?"
                } else {
                    message.sender_name.as_str()
                };
                writeln!(out, "[{}] {}: {}", message.timestamp, who, message.content)?;
            }
        }
    }
    out.flush()
}

fn password_or_prompt(password: Option<String>) -> anyhow::Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    eprint!("Password: ");
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Get the Supportchat data directory
fn get_supportchat_home() -> anyhow::Result<PathBuf> {
    if let Ok(home) = std::env::var("SUPPORTCHAT_HOME") {
        return Ok(PathBuf::from(home));
    }

    // Default to ~/.supportchat
    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?;
    Ok(home.join(".supportchat"))
}
