//! TCP client transport: connection lifecycle, message framing, double-buffered
//! sending, and handler dispatch by service category.

pub mod connection;
pub mod dispatch;
pub mod framing;
pub mod manager;
pub mod platform;
pub mod recv_buffer;
pub mod send_queue;
pub mod service;
pub mod tcp_client;

pub use connection::{
    ConnectError, Connection, ConnectionConfig, ConnectionState, ConnectionStateWatch, Disconnect,
    DisconnectKind,
};
pub use dispatch::{DispatchRegistry, MessageHandler, RegisterError};
pub use framing::{DecodeResult, FrameError, MAX_PAYLOAD_LEN, encode, try_decode_one};
pub use manager::{ConnectionManager, key_for};
pub use platform::SocketConfig;
pub use send_queue::{Batch, PendingSendBuffer, SendQueue};
pub use service::ServiceCategory;
pub use tcp_client::{ClientSession, GameClient};
