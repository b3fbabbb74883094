use crate::error::Result;
use crate::sasl::{self, Mechanism};
use crate::transport::Transport;

use super::Connection;

enum BusKind {
    Session,
    System,
}

/// Builder of a [`Connection`]. Mirrors the fluent `&mut self -> &mut Self`
/// shape the underlying transport layer uses for its own builder, extended
/// with an `.address()` override for tests and non-standard bus locations.
pub struct ConnectionBuilder {
    bus: BusKind,
    address: Option<String>,
    auth: bool,
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            bus: BusKind::Session,
            address: None,
            auth: true,
        }
    }

    /// Connect to the session bus (default).
    pub fn session_bus(&mut self) -> &mut Self {
        self.bus = BusKind::Session;
        self
    }

    /// Connect to the system bus.
    pub fn system_bus(&mut self) -> &mut Self {
        self.bus = BusKind::System;
        self
    }

    /// Connect to an explicit D-Bus address string instead of resolving
    /// one of the well-known environment variables. Primarily useful in
    /// tests, which dial a `UnixListener` bound to a temporary socket.
    pub fn address(&mut self, address: impl Into<String>) -> &mut Self {
        self.address = Some(address.into());
        self
    }

    /// Skip SASL authentication entirely. Only meaningful against a test
    /// double that doesn't speak the SASL line protocol.
    pub fn no_auth(&mut self) -> &mut Self {
        self.auth = false;
        self
    }

    /// Dial, authenticate, send `Hello`, and spawn the receive/writer
    /// tasks.
    pub async fn build(&self) -> Result<Connection> {
        let mut transport = match &self.address {
            Some(address) => Transport::dial(address).await?,
            None => match self.bus {
                BusKind::Session => Transport::session_bus().await?,
                BusKind::System => Transport::system_bus().await?,
            },
        };

        if self.auth {
            sasl::authenticate(&mut transport, &[Mechanism::External, Mechanism::CookieSha1]).await?;
        }

        Connection::connect(transport).await
    }
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
