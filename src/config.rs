//! Engine configuration.
//!
//! A plain struct assembled by the embedding binary (see `main.rs`);
//! there is no config-file loading in the engine itself.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use uuid::Uuid;

/// Default WebSocket port for Resonate.
pub const DEFAULT_PORT: u16 = 8927;

/// Default WebSocket path.
pub const DEFAULT_PATH: &str = "/resonate";

/// The configuration of a Resonate endpoint (server or client).
#[derive(Clone, Debug)]
pub struct Config {
    /// Identifier sent in `server/hello` / `client/hello`.
    pub id: String,

    /// Friendly name shown to peers.
    pub name: String,

    /// Address the server binds to.
    pub bind_addr: IpAddr,

    /// TCP port for the WebSocket listener.
    pub port: u16,

    /// WebSocket upgrade path.
    pub path: String,

    /// Upper bound for reconnect backoff.
    pub max_backoff: Duration,

    /// Depth of each endpoint's outbound queue. Overflow closes the
    /// endpoint with `BufferOverrun`.
    pub send_queue_depth: usize,

    /// How long a closing endpoint waits for its writer to drain.
    pub drain_deadline: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "Resonate".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
            max_backoff: Duration::from_secs(30),
            send_queue_depth: 64,
            drain_deadline: Duration::from_millis(200),
        }
    }
}

impl Config {
    /// The `ws://` URL equivalent of this configuration's listener.
    #[must_use]
    pub fn local_url(&self) -> String {
        format!("ws://{}:{}{}", self.bind_addr, self.port, self.path)
    }
}
