mod chat;
mod commands;
mod render;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lanchat_sync::config::{AcceptPolicy, SyncConfig, TransportKind};
use lanchat_sync::{telemetry, Session};

#[derive(Parser)]
#[command(author, version, about = "Headless LAN chat client")]
struct Args {
    /// Base URL of the local LAN chat server (overrides LANCHAT_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,
    /// Accept inbound files as soon as they show up in the open conversation
    #[arg(long, global = true)]
    auto_accept: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Show who you are and the peer roster
    Peers,
    /// Print roster and conversation changes until Ctrl-C
    Watch {
        /// Also follow the conversation with this peer (id or name)
        peer: Option<String>,
    },
    /// Interactive chat with one peer
    Chat { peer: String },
    /// Print the conversation with a peer
    History { peer: String },
    /// Send one text message
    Send {
        peer: String,
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Send a file; opens a file chooser when no path is given
    SendFile { peer: String, path: Option<PathBuf> },
    /// Accept an inbound file, retrying while it is still arriving (Ctrl-C cancels)
    Accept {
        peer: String,
        file_id: String,
        #[arg(long)]
        save_path: Option<String>,
    },
    /// Save a received file locally
    Download { file_id: String, dest: PathBuf },
    /// Change your display name
    Rename { name: String },
    /// Show settings, optionally changing the download folder
    Settings {
        #[arg(long)]
        download_path: Option<String>,
    },
    /// List themes, or apply one
    Themes {
        #[arg(long)]
        apply: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let args = Args::parse();

    let mut config = SyncConfig::from_env()?;
    if let Some(server) = args.server {
        config.server_url = server;
    }
    if args.auto_accept {
        config.transfer.accept_policy = AcceptPolicy::Automatic;
    }
    if config.transport != TransportKind::Http {
        bail!(
            "lanchat only speaks the HTTP transport; unset LANCHAT_TRANSPORT or set it to 'http'"
        );
    }
    tracing::debug!(server = %config.server_url, "connecting");

    let (mut session, updates) =
        Session::connect(&config, None).context("failed to start sync session")?;

    let command = args.command.unwrap_or(Command::Watch { peer: None });
    let result = match command {
        Command::Chat { peer } => return chat::run_chat(session, updates, &peer).await,
        Command::Watch { peer } => watch(&session, updates, peer).await,
        Command::Peers => commands::peers(&session).await,
        Command::History { peer } => commands::history(&session, &peer).await,
        Command::Send { peer, text } => commands::send(&session, &peer, &text.join(" ")).await,
        Command::SendFile { peer, path } => commands::send_file(&session, &peer, path).await,
        Command::Accept {
            peer,
            file_id,
            save_path,
        } => commands::accept(&session, &peer, &file_id, save_path).await,
        Command::Download { file_id, dest } => commands::download(&session, &file_id, dest).await,
        Command::Rename { name } => commands::rename(&session, &name).await,
        Command::Settings { download_path } => commands::settings(&session, download_path).await,
        Command::Themes { apply } => commands::themes(&session, apply).await,
    };
    session.shutdown().await;
    result
}

async fn watch(
    session: &Session,
    mut updates: tokio::sync::mpsc::UnboundedReceiver<lanchat_sync::SyncUpdate>,
    peer: Option<String>,
) -> Result<()> {
    let mut peer_name = String::from("peer");
    if let Some(query) = peer {
        let peer = commands::resolve_peer(session, &query).await?;
        peer_name = peer.display_name.clone();
        session.open_conversation(&peer.id).await?;
    }
    println!("Watching for changes, Ctrl-C to stop.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Some(update) => render::print_update(&update, &peer_name),
                None => break,
            },
        }
    }
    Ok(())
}
