// cogs-api: Wire-level building blocks for the Cogswell Pub/Sub service

pub mod auth;
pub mod error;
pub mod protocol;
pub mod websocket;

pub use auth::{AuthPayload, KeySet, Permission, ProjectKey, SignedAuth};
pub use error::Error;
pub use protocol::{Inbound, MessageRecord, Request, Response};
pub use websocket::{
    Connector, Frame, TransportEvent, TransportLink, TransportPeer, WebSocketConnector,
};
