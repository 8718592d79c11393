use anyhow::Result;
use crossterm::{
    cursor::MoveTo,
    terminal::{Clear, ClearType},
    ExecutableCommand,
};
use std::fmt::Write as _;
use std::io::Write;

use crate::bridge::{PairingState, SessionMode, SessionStatus};

/// Clear the terminal and move the cursor home
pub fn clear_screen() -> Result<()> {
    let mut stdout = std::io::stdout();
    stdout.execute(Clear(ClearType::All))?;
    stdout.execute(MoveTo(0, 0))?;
    Ok(())
}

/// Redraw the whole status table
pub fn draw(status: &SessionStatus) -> Result<()> {
    clear_screen()?;
    let mut stdout = std::io::stdout();
    stdout.write_all(render(status).as_bytes())?;
    stdout.flush()?;
    Ok(())
}

pub fn render(status: &SessionStatus) -> String {
    let mode = match &status.mode {
        SessionMode::Idle => "idle".to_string(),
        SessionMode::Hosting => "hosting".to_string(),
        SessionMode::Joined { host } => format!("joined {}", host),
    };

    let mut out = String::new();
    let _ = writeln!(
        out,
        "lanlink | {} | local connections: {}",
        mode, status.active_local_connections
    );
    if let Some(addr) = status.listen_addr {
        let _ = writeln!(out, "Point your game at {}", addr);
    }
    out.push('\n');

    let _ = writeln!(
        out,
        "{:<20} {:<11} {:>8}  {:<28} {:>10}",
        "PLAYER", "STATE", "PING", "RELAY", "BACKLOG"
    );
    if status.peers.is_empty() {
        let _ = writeln!(out, "(no players connected)");
    }
    for row in &status.peers {
        let ping = row
            .latency_ms
            .map(|ms| format!("{} ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<20} {:<11} {:>8}  {:<28} {:>10}",
            row.peer.as_str(),
            state_label(row.state),
            ping,
            row.relay,
            format_bytes(row.backlog_bytes)
        );
    }

    if let Some(notice) = &status.last_notice {
        let _ = writeln!(out, "\n{}", notice);
    }
    out
}

fn state_label(state: PairingState) -> &'static str {
    match state {
        PairingState::Connecting => "connecting",
        PairingState::Bridged => "bridged",
        PairingState::Closing => "closing",
        PairingState::Closed => "closed",
    }
}

fn format_bytes(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
    }
}
