use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::ui;
use super::{Cli, Commands};
use crate::bridge::{BridgeSession, Notice};
use crate::config::BridgeConfig;
use crate::presence::{Presence, StaticRoom};
use crate::transport::{PeerId, TcpTransport};

pub async fn handle_command(cli: Cli) -> Result<()> {
    let mut config = BridgeConfig::default();
    cli.tuning.apply(&mut config);

    match cli.command {
        Commands::Host {
            game_port,
            peer_listen,
            name,
            allow,
        } => {
            config.game_port = game_port;
            let identity = PeerId::new(name);
            let transport = TcpTransport::new(identity.clone());
            let bound = transport
                .listen(peer_listen)
                .await
                .with_context(|| format!("cannot listen for peers on {}", peer_listen))?;

            let room: Arc<dyn Presence> = if allow.is_empty() {
                Arc::new(StaticRoom::open(identity.clone()))
            } else {
                let members = std::iter::once(identity.clone())
                    .chain(allow.into_iter().map(PeerId::from))
                    .collect();
                Arc::new(StaticRoom::new(identity.clone(), members))
            };

            let session = BridgeSession::spawn(config, Arc::new(transport.clone()), room)?;
            session.start_hosting().await?;
            info!(
                "{} is hosting game port {}; friends join with `lanlink join <your-ip>:{}`",
                identity,
                game_port,
                bound.port()
            );

            watch_session(&session, cli.watch, false).await?;
            transport.shutdown();
        }
        Commands::Join {
            host,
            listen_port,
            name,
        } => {
            config.listen_port = listen_port;
            let identity = PeerId::new(name.unwrap_or_else(default_name));
            let host = PeerId::new(host);
            let transport = TcpTransport::new(identity.clone());
            let room = Arc::new(StaticRoom::new(identity, vec![host.clone()]));

            let session = BridgeSession::spawn(config, Arc::new(transport.clone()), room)?;
            session
                .join_host(host.clone())
                .await
                .with_context(|| format!("cannot join {}", host))?;

            watch_session(&session, cli.watch, true).await?;
            transport.shutdown();
        }
    }

    Ok(())
}

/// Follow status updates until Ctrl+C, or until the session goes idle when
/// `until_idle` is set.
async fn watch_session(session: &BridgeSession, live: bool, until_idle: bool) -> Result<()> {
    let mut status = session.subscribe();
    let mut seen_notice = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Interrupted, disconnecting");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                if live {
                    ui::draw(&snapshot)?;
                }
                if snapshot.notice_seq != seen_notice {
                    seen_notice = snapshot.notice_seq;
                    if let Some(notice) = &snapshot.last_notice {
                        log_notice(notice);
                    }
                }
                if until_idle && snapshot.mode.is_idle() {
                    break;
                }
            }
        }
    }

    session.disconnect().await;
    Ok(())
}

fn log_notice(notice: &Notice) {
    match notice {
        Notice::JoinFailed { .. } | Notice::ResourceExhausted { .. } | Notice::Rejected { .. } => {
            warn!("{}", notice)
        }
        Notice::PairingClosed { .. } | Notice::Disconnected => info!("{}", notice),
    }
}

fn default_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("player-{}", &id[..8])
}
