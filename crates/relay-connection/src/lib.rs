//! Client side of the mesh relay.
//!
//! Keeps one logical relay connection alive against a managed endpoint
//! that only accepts short-lived presigned URLs. Expired credentials are
//! refreshed through a federated-identity exchange before each connect.

pub mod manager;
mod pumps;
pub(crate) mod reconnection;
pub mod refresher;
pub mod signer;
pub mod store;
pub mod transport;
pub mod types;
pub mod ws_client;

pub use manager::{ConnectError, ConnectionManager, ManagerConfig};
pub use refresher::{CognitoRefresher, CredentialRefresher, RefreshError, RefreshFuture};
pub use signer::{PresignRequest, SignError, presign_url, sign};
pub use store::{ConfigStore, FileConfigStore, MemoryConfigStore, StoreError};
pub use transport::{
    ConnectFuture, ReconnectFuture, ReconnectProvider, RelayTransport, TransportError,
};
pub use types::{
    CognitoLink, ConnectionEvent, ConnectionState, Credentials, FederatedIdentity,
    ReconnectConfig, RelayEndpointConfig,
};
pub use ws_client::WsTransport;
