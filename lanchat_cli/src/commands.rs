use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use lanchat_sync::models::{FileHandle, Peer};
use lanchat_sync::{Session, SyncError};

use crate::render;

/// Refreshes the roster once and resolves `query` against it.
pub async fn resolve_peer(session: &Session, query: &str) -> Result<Peer> {
    session.refresh_peers().await;
    let roster = session.roster().await;
    render::find_peer(&roster, query).ok_or_else(|| anyhow!("no peer matches '{query}'"))
}

pub async fn peers(session: &Session) -> Result<()> {
    let facade = session.facade();
    let name = facade.identity_name().await;
    match facade.identity_id().await {
        Ok(id) => println!("You are {name} ({id})"),
        Err(err) => println!("You are {name} (id unavailable: {err})"),
    }
    session.refresh_peers().await;
    render::print_roster(&session.roster().await);
    Ok(())
}

pub async fn history(session: &Session, query: &str) -> Result<()> {
    let peer = resolve_peer(session, query).await?;
    let messages = session.open_conversation(&peer.id).await?;
    if messages.is_empty() {
        println!("No messages with {} yet.", peer.display_name);
    }
    for message in &messages {
        println!("{}", render::format_message(message, &peer.display_name));
    }
    Ok(())
}

pub async fn send(session: &Session, query: &str, text: &str) -> Result<()> {
    let peer = resolve_peer(session, query).await?;
    session.open_conversation(&peer.id).await?;
    match session
        .send_text(text)
        .await
        .with_context(|| format!("failed to message {}", peer.display_name))?
    {
        Some(_) => println!("sent to {}", peer.display_name),
        None => println!("nothing to send"),
    }
    Ok(())
}

pub async fn send_file(session: &Session, query: &str, path: Option<PathBuf>) -> Result<()> {
    let peer = resolve_peer(session, query).await?;
    let path = match path {
        Some(path) => path,
        None => pick_file()
            .await
            .ok_or_else(|| anyhow!("no file selected"))?,
    };
    session.open_conversation(&peer.id).await?;
    let receipt = session
        .send_file(FileHandle::Path(path.clone()))
        .await
        .with_context(|| format!("failed to send {}", path.display()))?;
    println!(
        "sent {} ({}) to {}, file id {}",
        receipt.file_name,
        render::format_size(receipt.file_size),
        peer.display_name,
        receipt.file_id
    );
    Ok(())
}

/// Accepts a file, retrying while it is still arriving. Ctrl-C cancels the
/// retry loop.
pub async fn accept(
    session: &Session,
    query: &str,
    file_id: &str,
    save_path: Option<String>,
) -> Result<()> {
    let peer = resolve_peer(session, query).await?;
    session.open_conversation(&peer.id).await?;

    let transfers = session.transfers().clone();
    let id = file_id.to_string();
    let mut accept = tokio::spawn(async move { transfers.accept_file(&id, save_path).await });
    let result = tokio::select! {
        joined = &mut accept => joined?,
        _ = tokio::signal::ctrl_c() => {
            println!("cancelling...");
            session.cancel_accept(file_id).await;
            accept.await?
        }
    };
    match result {
        Ok(()) => println!("{file_id} accepted"),
        Err(SyncError::UserCancelled) => println!("{file_id}: cancelled"),
        Err(err) => return Err(err).with_context(|| format!("failed to accept {file_id}")),
    }
    Ok(())
}

pub async fn download(session: &Session, file_id: &str, dest: PathBuf) -> Result<()> {
    let written = session
        .facade()
        .save_download(file_id, dest.clone())
        .await
        .context("download task panicked")?
        .with_context(|| format!("failed to download {file_id}"))?;
    println!("saved {} to {}", render::format_size(written), dest.display());
    Ok(())
}

pub async fn rename(session: &Session, name: &str) -> Result<()> {
    let updated = session
        .facade()
        .update_identity_name(name)
        .await
        .context("failed to rename")?;
    println!("you are now {updated}");
    Ok(())
}

pub async fn settings(session: &Session, download_path: Option<String>) -> Result<()> {
    let facade = session.facade();
    if let Some(path) = download_path {
        facade
            .update_settings(&path)
            .await
            .context("failed to save settings")?;
    }
    match facade.settings().await {
        Ok(settings) => println!("download path: {}", settings.download_path),
        Err(err) => {
            tracing::warn!(error = %err, "failed to load settings");
            println!(
                "download path: {} (default)",
                facade.default_download_path().await
            );
        }
    }
    Ok(())
}

pub async fn themes(session: &Session, apply: Option<String>) -> Result<()> {
    let facade = session.facade();
    if let Some(name) = apply {
        let css = facade
            .theme_css(&name)
            .await
            .with_context(|| format!("failed to load theme {name}"))?;
        facade
            .save_current_theme(&name)
            .await
            .context("failed to save theme")?;
        println!("applied {name} ({} bytes of css)", css.len());
        return Ok(());
    }
    let current = facade.current_theme().await.unwrap_or_default();
    for theme in facade.list_themes().await.context("failed to list themes")? {
        let marker = if theme.name == current { "*" } else { " " };
        let custom = if theme.is_custom { " (custom)" } else { "" };
        println!("{marker} {:<16} {}{custom}", theme.name, theme.display_name);
    }
    Ok(())
}

pub async fn pick_file() -> Option<PathBuf> {
    rfd::AsyncFileDialog::new()
        .set_title("Choose a file to send")
        .pick_file()
        .await
        .map(|handle| handle.path().to_path_buf())
}
