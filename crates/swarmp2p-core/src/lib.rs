pub mod config;
pub mod conn_pool;
pub mod connection;
pub mod dht;
pub mod gossip;
pub mod identity;
pub mod message;
pub mod net;
pub mod node;
pub mod ping;
pub mod service;
pub mod session;
pub mod simulator;
pub mod swarm;
pub mod timesync;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::{Config, SwarmConfig, TimeConfig, CLIENT_VERSION};
pub use conn_pool::{ConnectionPool, Dialer};
pub use connection::Connection;
pub use dht::{Dht, KadDht, FIND_NODE_PROTOCOL};
pub use gossip::{Gossip, Neighborhood};
pub use identity::LocalNode;
pub use message::{CommonMessageData, ProtocolMessage, ProtocolMessageMetadata};
pub use net::{IncomingMessageEvent, Net, NewConnectionEvent};
pub use node::{Node, PublicKey};
pub use ping::{Ping, PING_PROTOCOL};
pub use service::{Service, ServiceMessage, PROTOCOL_HANDLER_CAPACITY};
pub use session::{NetworkSession, Session};
pub use simulator::{SimNode, Simulator};
pub use swarm::{Swarm, SwarmError};
pub use transport::{handshake_initiator, handshake_responder, HandshakeOutcome};
