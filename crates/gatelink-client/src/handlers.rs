//! Message ids this client understands and the handlers bound to them.
//!
//! Handlers run on the connection's receive loop, so they only decode the
//! payload and forward a [`ServerEvent`] to the session task.

use gatelink_net::{DispatchRegistry, RegisterError, ServiceCategory};
use tokio::sync::mpsc;

/// Keepalive. Sent by the client with a big-endian `u32` sequence and echoed
/// back by the server.
pub const HEARTBEAT: u32 = 0x0001;
/// Free-form UTF-8 notice from the server.
pub const NOTICE: u32 = 0x0002;
/// Result of an authentication attempt; first payload byte 0 means success.
pub const LOGIN_RESULT: u32 = 0x0101;
/// Opaque game state snapshot.
pub const WORLD_STATE: u32 = 0x0201;
/// Acknowledgement of a debug command.
pub const CHEAT_ACK: u32 = 0x0F01;

/// Decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    HeartbeatAck(u32),
    Notice(String),
    LoginResult { accepted: bool },
    WorldState { len: usize },
    CheatAck,
}

/// Build the registry for every category this binary knows about.
///
/// Fails if two handlers claim the same id within a category.
pub fn build_registry(
    events: mpsc::UnboundedSender<ServerEvent>,
) -> Result<DispatchRegistry, RegisterError> {
    let mut registry = DispatchRegistry::new();

    let tx = events.clone();
    let heartbeat = move |bytes: &[u8], offset: usize, len: usize| {
        match <[u8; 4]>::try_from(&bytes[offset..offset + len]) {
            Ok(seq) => {
                let _ = tx.send(ServerEvent::HeartbeatAck(u32::from_be_bytes(seq)));
            }
            Err(_) => tracing::warn!("Heartbeat ack with {len}-byte payload dropped"),
        }
    };
    registry.register(ServiceCategory::COMMON, HEARTBEAT, heartbeat)?;

    let tx = events.clone();
    let notice = move |bytes: &[u8], offset: usize, len: usize| {
        let text = String::from_utf8_lossy(&bytes[offset..offset + len]).into_owned();
        let _ = tx.send(ServerEvent::Notice(text));
    };
    registry.register(ServiceCategory::COMMON, NOTICE, notice)?;

    let tx = events.clone();
    let login_result = move |bytes: &[u8], offset: usize, len: usize| {
        let accepted = len > 0 && bytes[offset] == 0;
        let _ = tx.send(ServerEvent::LoginResult { accepted });
    };
    registry.register(ServiceCategory::LOGIN, LOGIN_RESULT, login_result)?;

    let tx = events.clone();
    let world_state = move |_: &[u8], _: usize, len: usize| {
        let _ = tx.send(ServerEvent::WorldState { len });
    };
    registry.register(ServiceCategory::GAME, WORLD_STATE, world_state)?;

    if ServiceCategory::cheats_enabled() {
        let cheat_ack = move |_: &[u8], _: usize, _: usize| {
            let _ = events.send(ServerEvent::CheatAck);
        };
        registry.register(ServiceCategory::CHEAT, CHEAT_ACK, cheat_ack)?;
    }

    Ok(registry)
}
