//! The `org.freedesktop.DBus` bus-daemon interface: spec §4.K, typed
//! wrappers grounded on the original client's `dbus.go` `Connect`,
//! `RequestName` and `ReleaseName` methods.

use crate::connection::Connection;
use crate::error::Result;
use crate::names::{request_name, watch_name, BusName, NameFlags, NameWatch};
use crate::object_path::ObjectPath;
use crate::value::{ToValue, Value};

pub const BUS_DAEMON_NAME: &str = "org.freedesktop.DBus";
pub const BUS_DAEMON_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_DAEMON_IFACE: &str = "org.freedesktop.DBus";

/// A thin, typed view over `org.freedesktop.DBus` for a given
/// [`Connection`]. Every method here is a direct wrapper around
/// [`Connection::bus_call`]; the dynamic `Value` calling convention
/// remains available for anything not wrapped here.
pub struct Bus<'a> {
    connection: &'a Connection,
}

impl<'a> Bus<'a> {
    pub fn new(connection: &'a Connection) -> Self {
        Self { connection }
    }

    /// `Hello`: the first call every connection must make, establishing
    /// its unique connection name. [`Connection::connect`] already calls
    /// this during setup; exposed here for callers building their own
    /// handshake sequence.
    pub async fn hello(&self) -> Result<String> {
        let reply = self.connection.bus_call("Hello", vec![]).await?;
        Ok(reply.body.first().and_then(Value::as_str).map(str::to_owned).unwrap_or_default())
    }

    pub async fn request_name(&self, name: &str, flags: NameFlags) -> Result<BusName> {
        request_name(self.connection, name, flags).await
    }

    pub async fn release_name(&self, name: &str) -> Result<()> {
        self.connection.bus_call("ReleaseName", vec![name.to_value()]).await?;
        Ok(())
    }

    pub async fn watch_name(&self, name: &str) -> Result<NameWatch> {
        watch_name(self.connection, name).await
    }

    pub async fn get_name_owner(&self, name: &str) -> Result<String> {
        let reply = self
            .connection
            .bus_call("GetNameOwner", vec![name.to_value()])
            .await?;
        Ok(reply.body.first().and_then(Value::as_str).map(str::to_owned).unwrap_or_default())
    }

    pub async fn name_has_owner(&self, name: &str) -> Result<bool> {
        let reply = self
            .connection
            .bus_call("NameHasOwner", vec![name.to_value()])
            .await?;
        Ok(matches!(reply.body.first(), Some(Value::Bool(true))))
    }

    pub async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.connection.bus_call("ListNames", vec![]).await?;
        match reply.body.into_iter().next() {
            Some(Value::Array { items, .. }) => Ok(items
                .into_iter()
                .filter_map(|v| match v {
                    Value::Str(s) => Some(s),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    /// `org.freedesktop.DBus.Peer.GetMachineId`, resolved locally without a
    /// round trip since the local machine id is always known: reads
    /// `/lib/dbus/machine-id`, falling back to `/var/lib/dbus/machine-id`.
    pub fn machine_id() -> String {
        for path in ["/lib/dbus/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(contents) = std::fs::read_to_string(path) {
                let trimmed = contents.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        "machine-id".to_string()
    }
}

pub(crate) fn daemon_path() -> ObjectPath {
    ObjectPath::new(BUS_DAEMON_PATH).expect("bus daemon path is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_never_empty() {
        assert!(!Bus::machine_id().is_empty());
    }
}
