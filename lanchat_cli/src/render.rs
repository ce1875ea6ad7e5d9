use chrono::{DateTime, Local};
use lanchat_sync::conversation::ConversationUpdate;
use lanchat_sync::models::{Message, Peer};
use lanchat_sync::presence::{PresenceDelta, Roster};
use lanchat_sync::transfer::TransferUpdate;
use lanchat_sync::SyncUpdate;

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}

pub fn format_time(timestamp: i64) -> String {
    DateTime::from_timestamp(timestamp, 0)
        .map(|utc| utc.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

pub fn format_peer(peer: &Peer) -> String {
    let state = if peer.online { "online" } else { "offline" };
    format!("{:<20} {:<24} {:<8} {}", peer.display_name, peer.address, state, peer.id)
}

pub fn format_message(message: &Message, peer_name: &str) -> String {
    let sender = if message.is_outgoing() { "you" } else { peer_name };
    let body = match &message.file {
        Some(meta) => format!(
            "[file] {} ({}) {} id={}",
            meta.file_name,
            format_size(meta.file_size),
            meta.status,
            meta.file_id
        ),
        None => message.content.clone(),
    };
    format!("{} {}: {}", format_time(message.timestamp), sender, body)
}

/// Matches a peer by id, then by display name ignoring case.
pub fn find_peer(roster: &Roster, query: &str) -> Option<Peer> {
    roster.get(query).cloned().or_else(|| {
        roster
            .peers()
            .iter()
            .find(|peer| peer.display_name.eq_ignore_ascii_case(query))
            .cloned()
    })
}

pub fn print_roster(roster: &Roster) {
    if roster.is_empty() {
        println!("No peers discovered yet.");
        return;
    }
    for peer in roster.peers() {
        println!("{}", format_peer(peer));
    }
}

pub fn print_update(update: &SyncUpdate, peer_name: &str) {
    match update {
        SyncUpdate::Presence(PresenceDelta::Added(peer)) => println!("+ {}", format_peer(peer)),
        SyncUpdate::Presence(PresenceDelta::Updated(peer)) => println!("~ {}", format_peer(peer)),
        SyncUpdate::Presence(PresenceDelta::Removed(id)) => println!("- peer {id} left"),
        SyncUpdate::Conversation(ConversationUpdate::Opened { messages, .. })
        | SyncUpdate::Conversation(ConversationUpdate::Rerendered { messages, .. }) => {
            println!("--- {peer_name} ---");
            for message in messages {
                println!("{}", format_message(message, peer_name));
            }
        }
        SyncUpdate::Conversation(ConversationUpdate::Appended { message, .. }) => {
            println!("{}", format_message(message, peer_name));
        }
        SyncUpdate::Conversation(ConversationUpdate::Closed { .. }) => {}
        SyncUpdate::Transfer(update) => print_transfer(update),
        SyncUpdate::Unread { peer_id, count } => println!("({count} unread from {peer_id})"),
    }
}

fn print_transfer(update: &TransferUpdate) {
    match update {
        TransferUpdate::UploadStarted { file_name, .. } => println!("uploading {file_name}..."),
        TransferUpdate::UploadFinished { receipt, .. } => println!(
            "sent {} ({})",
            receipt.file_name,
            format_size(receipt.file_size)
        ),
        TransferUpdate::UploadFailed {
            file_name, reason, ..
        } => println!("upload of {file_name} failed: {reason}"),
        TransferUpdate::AcceptWaiting { file_id } => {
            println!("{file_id} is still arriving, retrying (cancel to stop)")
        }
        TransferUpdate::AcceptFinished { file_id } => println!("{file_id} accepted"),
        TransferUpdate::AcceptCancelled { file_id } => println!("{file_id}: accept cancelled"),
        TransferUpdate::AcceptFailed { file_id, reason } => {
            println!("{file_id}: accept failed: {reason}")
        }
    }
}
