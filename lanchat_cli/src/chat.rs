use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use lanchat_sync::models::{FileHandle, Peer};
use lanchat_sync::{Session, SyncError, SyncUpdate};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::commands::{pick_file, resolve_peer};
use crate::render;

enum LoopAction {
    Continue,
    Exit,
}

/// Interactive conversation with one peer. Plain lines are sent as text;
/// lines starting with `/` are commands.
pub async fn run_chat(
    mut session: Session,
    updates: UnboundedReceiver<SyncUpdate>,
    query: &str,
) -> Result<()> {
    let peer = resolve_peer(&session, query).await?;
    let printer = spawn_printer(updates, peer.display_name.clone());
    session.open_conversation(&peer.id).await?;

    println!(
        "Chatting with {} ({}). Type /help for commands.",
        peer.display_name, peer.address
    );

    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match handle_line(&session, &peer, trimmed).await {
            Ok(LoopAction::Continue) => {}
            Ok(LoopAction::Exit) => break,
            Err(err) => println!("Error: {err:#}"),
        }
    }

    session.close_conversation().await;
    session.shutdown().await;
    printer.abort();
    Ok(())
}

async fn handle_line(session: &Session, peer: &Peer, line: &str) -> Result<LoopAction> {
    if !line.starts_with('/') {
        session.send_text(line).await?;
        return Ok(LoopAction::Continue);
    }

    let tokens = shell_words::split(line).map_err(|err| anyhow!("unable to parse command: {err}"))?;
    let Some(command) = tokens.first() else {
        return Ok(LoopAction::Continue);
    };
    match command.as_str() {
        "/help" => print_help(),
        "/quit" | "/exit" => return Ok(LoopAction::Exit),
        "/peers" => {
            session.refresh_peers().await;
            render::print_roster(&session.roster().await);
        }
        "/history" => {
            // The printer task shows the re-rendered list.
            if session.messages().refresh().await.is_empty() {
                println!("No messages with {} yet.", peer.display_name);
            }
        }
        "/file" => {
            let path = match tokens.get(1) {
                Some(path) => PathBuf::from(path),
                None => pick_file().await.ok_or_else(|| anyhow!("no file selected"))?,
            };
            session.send_file(FileHandle::Path(path)).await?;
        }
        "/accept" => {
            let file_id = tokens
                .get(1)
                .cloned()
                .ok_or_else(|| anyhow!("usage: /accept <file_id> [save_path]"))?;
            let save_path = tokens.get(2).cloned();
            // Runs in the background so /cancel stays usable.
            let transfers = session.transfers().clone();
            tokio::spawn(async move {
                match transfers.accept_file(&file_id, save_path).await {
                    Ok(()) | Err(SyncError::UserCancelled) => {}
                    Err(err) => tracing::debug!(file_id = %file_id, error = %err, "accept ended"),
                }
            });
        }
        "/cancel" => {
            let file_id = tokens
                .get(1)
                .ok_or_else(|| anyhow!("usage: /cancel <file_id>"))?;
            if !session.cancel_accept(file_id).await {
                println!("no accept running for {file_id}");
            }
        }
        other => println!("Unknown command {other}. Type /help."),
    }
    Ok(LoopAction::Continue)
}

fn spawn_printer(
    mut updates: UnboundedReceiver<SyncUpdate>,
    peer_name: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            render::print_update(&update, &peer_name);
        }
    })
}

fn print_help() {
    println!("  <text>                      send a message");
    println!("  /file [path]                send a file (opens a chooser without a path)");
    println!("  /accept <file_id> [path]    accept an inbound file");
    println!("  /cancel <file_id>           stop waiting for a file");
    println!("  /history                    reload the conversation");
    println!("  /peers                      show the roster");
    println!("  /quit                       leave");
}
