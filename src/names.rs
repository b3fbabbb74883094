//! Bus-name ownership tracking: spec §4.J. Wraps
//! `org.freedesktop.DBus`'s `RequestName`/`ReleaseName`/`GetNameOwner` and
//! the `NameOwnerChanged`/`NameLost`/`NameAcquired` signals into a watch
//! API, grounded on the original client's `names.go`.

use std::sync::Arc;

use tokio::sync::watch;

use crate::bus::{BUS_DAEMON_IFACE, BUS_DAEMON_NAME, BUS_DAEMON_PATH};
use crate::connection::Connection;
use crate::error::Result;
use crate::signal::{MatchRule, SignalWatch};
use crate::value::{ToValue, Value};

const NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

/// Flags accepted by `RequestName`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameFlags(u32);

impl NameFlags {
    pub const NONE: NameFlags = NameFlags(0);
    pub const ALLOW_REPLACEMENT: NameFlags = NameFlags(0x1);
    pub const REPLACE_EXISTING: NameFlags = NameFlags(0x2);
    pub const DO_NOT_QUEUE: NameFlags = NameFlags(0x4);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for NameFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The result code `RequestName` replies with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameReply {
    /// The caller is now the primary owner of the name.
    PrimaryOwner,
    /// The name was already owned, and the caller has been placed in the
    /// queue for it.
    InQueue,
    /// The name already has an owner that will not give it up.
    Exists,
    /// The caller already owns the name.
    AlreadyOwner,
}

impl NameReply {
    fn from_code(code: u32) -> Option<NameReply> {
        Some(match code {
            1 => NameReply::PrimaryOwner,
            2 => NameReply::InQueue,
            3 => NameReply::Exists,
            4 => NameReply::AlreadyOwner,
            _ => return None,
        })
    }

    /// `true` for the two outcomes the original client treats as "we are
    /// now interested in `NameLost`/`NameAcquired` for this name" —
    /// `Exists`/`AlreadyOwner` never transition to owning the name later
    /// on their own.
    pub fn subscribes_to_ownership_signals(self) -> bool {
        matches!(self, NameReply::PrimaryOwner | NameReply::InQueue)
    }
}

/// The shared, reference-counted state behind every [`NameWatch`] for a
/// given bus name on a given [`Connection`]. `Connection` holds only a
/// [`std::sync::Weak`] to one of these; [`run_name_info`] holds the strong
/// `Arc` for as long as it runs, so the entry disappears once the last
/// `NameWatch` (and therefore the last `Receiver`) is dropped.
pub(crate) struct NameInfo {
    /// `None` until the first `GetNameOwner` seed or `NameOwnerChanged`
    /// update arrives; `Some("")` means seeded-and-currently-unowned.
    tx: watch::Sender<Option<String>>,
}

/// A watch on a bus name's current owner. Idempotent per `(connection,
/// name)` pair: every call to [`watch_name`] for the same name on the same
/// connection shares one underlying `AddMatch` subscription and `GetNameOwner`
/// seed, rather than installing a fresh one each time.
pub struct NameWatch {
    receiver: watch::Receiver<Option<String>>,
}

impl NameWatch {
    /// The next owner, including the seeded current owner on the first
    /// call regardless of whether it arrived before or after this watch was
    /// created: an empty string means the name is currently unowned.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            if let Some(owner) = self.receiver.borrow_and_update().clone() {
                return Some(owner);
            }
            if self.receiver.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// Watch `bus_name`'s owner over time via `NameOwnerChanged`, seeded with
/// its current owner via `GetNameOwner`. Calling this twice for the same
/// `bus_name` on the same connection attaches a second watcher to the same
/// underlying subscription rather than installing a new one.
pub async fn watch_name(connection: &Connection, bus_name: &str) -> Result<NameWatch> {
    let info = name_info_or_create(connection, bus_name);
    Ok(NameWatch {
        receiver: info.tx.subscribe(),
    })
}

fn name_info_or_create(connection: &Connection, bus_name: &str) -> Arc<NameInfo> {
    if let Some(info) = connection.name_slot(bus_name) {
        return info;
    }

    let (tx, _rx) = watch::channel(None);
    let info = Arc::new(NameInfo { tx });
    connection.set_name_slot(bus_name, &info);

    tokio::spawn(run_name_info(connection.clone(), bus_name.to_string(), info.clone()));

    info
}

/// Keeps a [`NameInfo`] current for as long as any [`NameWatch`] subscribes
/// to it: registers the server-side `AddMatch`, seeds the initial owner via
/// `GetNameOwner` (tolerating `NameHasNoOwner` as "currently unowned"), then
/// forwards every further `NameOwnerChanged` until the last subscriber
/// drops, at which point the match is removed and the connection's slot for
/// this name is cleared.
async fn run_name_info(connection: Connection, bus_name: String, info: Arc<NameInfo>) {
    let rule = MatchRule::new()
        .with_sender(BUS_DAEMON_NAME)
        .with_path(BUS_DAEMON_PATH)
        .with_interface(BUS_DAEMON_IFACE)
        .with_member("NameOwnerChanged")
        .with_arg0(&bus_name);

    let mut signal_watch = match connection.watch_signal(rule).await {
        Ok(watch) => watch,
        Err(_) => {
            drop(info);
            connection.clear_name_slot(&bus_name);
            return;
        }
    };

    let seed = match connection.bus_call("GetNameOwner", vec![bus_name.clone().to_value()]).await {
        Ok(reply) => reply.body.first().and_then(Value::as_str).map(str::to_owned).unwrap_or_default(),
        Err(err) if err.as_remote().map(|r| r.name == NAME_HAS_NO_OWNER).unwrap_or(false) => String::new(),
        Err(_) => {
            let _ = connection.unwatch_signal(signal_watch).await;
            drop(info);
            connection.clear_name_slot(&bus_name);
            return;
        }
    };
    let _ = info.tx.send(Some(seed));

    loop {
        tokio::select! {
            _ = info.tx.closed() => break,
            signal = signal_watch.recv() => {
                match signal {
                    Some(message) => {
                        let owner = match message.body.get(2) {
                            Some(Value::Str(owner)) => owner.clone(),
                            _ => String::new(),
                        };
                        let _ = info.tx.send(Some(owner));
                    }
                    None => break,
                }
            }
        }
    }

    let _ = connection.unwatch_signal(signal_watch).await;
    drop(info);
    connection.clear_name_slot(&bus_name);
}

/// An owned bus-name claim obtained via `RequestName`. Dropping this does
/// not release the name; call [`BusName::release`] explicitly.
pub struct BusName {
    name: String,
    reply: NameReply,
    lost_watch: Option<SignalWatch>,
    acquired_watch: Option<SignalWatch>,
}

impl BusName {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reply(&self) -> NameReply {
        self.reply
    }

    /// Wait for the next `NameAcquired` signal for this name.
    pub async fn acquired(&mut self) -> Option<()> {
        self.acquired_watch.as_mut()?.recv().await.map(|_| ())
    }

    /// Wait for the next `NameLost` signal for this name.
    pub async fn lost(&mut self) -> Option<()> {
        self.lost_watch.as_mut()?.recv().await.map(|_| ())
    }

    pub async fn release(&mut self, connection: &Connection) -> Result<()> {
        connection.bus_call("ReleaseName", vec![self.name.clone().to_value()]).await?;
        Ok(())
    }
}

/// Request ownership of `bus_name`, per spec §4.J. On `Exists`/`AlreadyOwner`
/// no ownership signals are subscribed to, matching the original client's
/// `request()`.
pub async fn request_name(connection: &Connection, bus_name: &str, flags: NameFlags) -> Result<BusName> {
    let reply_msg = connection
        .bus_call("RequestName", vec![bus_name.to_value(), flags.bits().to_value()])
        .await?;
    let code = reply_msg.body.first().and_then(Value::as_u32).unwrap_or(0);
    let reply = NameReply::from_code(code).unwrap_or(NameReply::Exists);

    let (lost_watch, acquired_watch) = if reply.subscribes_to_ownership_signals() {
        let lost_rule = MatchRule::new()
            .with_sender(BUS_DAEMON_NAME)
            .with_path(BUS_DAEMON_PATH)
            .with_interface(BUS_DAEMON_IFACE)
            .with_member("NameLost")
            .with_arg0(bus_name);
        let acquired_rule = MatchRule::new()
            .with_sender(BUS_DAEMON_NAME)
            .with_path(BUS_DAEMON_PATH)
            .with_interface(BUS_DAEMON_IFACE)
            .with_member("NameAcquired")
            .with_arg0(bus_name);
        (
            Some(connection.watch_signal(lost_rule).await?),
            Some(connection.watch_signal(acquired_rule).await?),
        )
    } else {
        (None, None)
    };

    Ok(BusName {
        name: bus_name.to_string(),
        reply,
        lost_watch,
        acquired_watch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_reply_codes() {
        assert_eq!(NameReply::from_code(1), Some(NameReply::PrimaryOwner));
        assert_eq!(NameReply::from_code(2), Some(NameReply::InQueue));
        assert_eq!(NameReply::from_code(3), Some(NameReply::Exists));
        assert_eq!(NameReply::from_code(4), Some(NameReply::AlreadyOwner));
        assert_eq!(NameReply::from_code(99), None);
    }

    #[test]
    fn only_owner_or_queued_subscribe_to_signals() {
        assert!(NameReply::PrimaryOwner.subscribes_to_ownership_signals());
        assert!(NameReply::InQueue.subscribes_to_ownership_signals());
        assert!(!NameReply::Exists.subscribes_to_ownership_signals());
        assert!(!NameReply::AlreadyOwner.subscribes_to_ownership_signals());
    }

    #[test]
    fn flags_combine_with_bitor() {
        let flags = NameFlags::ALLOW_REPLACEMENT | NameFlags::DO_NOT_QUEUE;
        assert_eq!(flags.bits(), 0x5);
    }

    // A minimal in-process fake bus daemon, just enough of `Hello`,
    // `AddMatch`, `GetNameOwner`, and `RequestName` to drive the
    // name-ownership-handoff scenario below across two real `Connection`s.
    mod fake_bus {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::{Arc, Mutex};

        use tokio::net::{UnixListener, UnixStream};
        use tokio::sync::mpsc;

        use crate::bus::{BUS_DAEMON_IFACE, BUS_DAEMON_NAME, BUS_DAEMON_PATH};
        use crate::message::{Message, MessageType};
        use crate::object_path::ObjectPath;
        use crate::value::{ToValue, Value};

        #[derive(Default)]
        struct State {
            next_unique: u32,
            owners: std::collections::HashMap<String, String>,
            broadcast: Vec<mpsc::UnboundedSender<Vec<u8>>>,
        }

        pub struct FakeBus {
            pub path: String,
        }

        pub fn spawn() -> FakeBus {
            let path = format!("/tmp/fdobus-test-{}-{}.sock", std::process::id(), unique_suffix());
            let _ = std::fs::remove_file(&path);
            let listener = UnixListener::bind(&path).expect("bind fake bus socket");
            let state = Arc::new(Mutex::new(State::default()));

            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(serve_connection(stream, state.clone()));
                }
            });

            FakeBus { path }
        }

        fn unique_suffix() -> u32 {
            static COUNTER: AtomicU32 = AtomicU32::new(0);
            COUNTER.fetch_add(1, Ordering::Relaxed)
        }

        async fn serve_connection(stream: UnixStream, state: Arc<Mutex<State>>) {
            let (mut read_half, write_half) = stream.into_split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
            state.lock().unwrap().broadcast.push(tx.clone());

            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let mut write_half = write_half;
                while let Some(bytes) = rx.recv().await {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
            });

            let unique_name = {
                let mut state = state.lock().unwrap();
                state.next_unique += 1;
                format!(":1.{}", state.next_unique)
            };

            use tokio::io::AsyncReadExt;
            loop {
                let mut fixed_bytes = [0u8; 16];
                if read_half.read_exact(&mut fixed_bytes).await.is_err() {
                    return;
                }
                let Ok(fixed) = Message::decode_fixed_header(&fixed_bytes) else {
                    return;
                };
                let mut rest = vec![0u8; fixed.remaining_len()];
                if read_half.read_exact(&mut rest).await.is_err() {
                    return;
                }
                let Ok(message) = Message::decode(&fixed, &fixed_bytes, &rest) else {
                    continue;
                };
                if message.message_type != MessageType::MethodCall {
                    continue;
                }

                let serial = message.serial.wrapping_add(1_000_000);
                let reply = match message.member.as_deref() {
                    Some("Hello") => Message::method_return(&message, serial)
                        .unwrap()
                        .with_sender(BUS_DAEMON_NAME)
                        .with_body(vec![unique_name.clone().to_value()]),
                    Some("AddMatch") | Some("RemoveMatch") => {
                        Message::method_return(&message, serial).unwrap().with_sender(BUS_DAEMON_NAME)
                    }
                    Some("GetNameOwner") => {
                        let name = message.body.first().and_then(Value::as_str).unwrap_or_default();
                        let owner = state.lock().unwrap().owners.get(name).cloned();
                        match owner {
                            Some(owner) => Message::method_return(&message, serial)
                                .unwrap()
                                .with_sender(BUS_DAEMON_NAME)
                                .with_body(vec![owner.to_value()]),
                            None => Message::error(
                                &message,
                                "org.freedesktop.DBus.Error.NameHasNoOwner",
                                serial,
                            )
                            .unwrap()
                            .with_sender(BUS_DAEMON_NAME),
                        }
                    }
                    Some("RequestName") => {
                        let name = message.body.first().and_then(Value::as_str).unwrap_or_default().to_string();
                        let old_owner = {
                            let mut state = state.lock().unwrap();
                            let old = state.owners.get(&name).cloned().unwrap_or_default();
                            state.owners.insert(name.clone(), unique_name.clone());
                            old
                        };

                        let changed = Message::signal(
                            ObjectPath::new(BUS_DAEMON_PATH).unwrap(),
                            BUS_DAEMON_IFACE,
                            "NameOwnerChanged",
                            serial + 1,
                        )
                        .with_sender(BUS_DAEMON_NAME)
                        .with_body(vec![name.to_value(), old_owner.to_value(), unique_name.clone().to_value()]);
                        broadcast(&state, changed);

                        Message::method_return(&message, serial)
                            .unwrap()
                            .with_sender(BUS_DAEMON_NAME)
                            .with_body(vec![1u32.to_value()])
                    }
                    _ => Message::method_return(&message, serial).unwrap().with_sender(BUS_DAEMON_NAME),
                };

                if let Ok(bytes) = reply.encode() {
                    let _ = tx.send(bytes);
                }
            }
        }

        fn broadcast(state: &Arc<Mutex<State>>, message: Message) {
            if let Ok(bytes) = message.encode() {
                for sender in &state.lock().unwrap().broadcast {
                    let _ = sender.send(bytes.clone());
                }
            }
        }
    }

    use std::time::Duration;

    use crate::connection::Connection;

    #[tokio::test]
    async fn name_ownership_handoff_between_two_connections() {
        let bus = fake_bus::spawn();

        let watcher = Connection::builder()
            .address(format!("unix:path={}", bus.path))
            .no_auth()
            .build()
            .await
            .expect("watcher connects");

        let mut watch = watch_name(&watcher, "com.example.Service").await.expect("watch_name");

        // Not yet owned: the seed should resolve to the empty-owner state.
        let first = tokio::time::timeout(Duration::from_secs(5), watch.recv())
            .await
            .expect("seed did not arrive")
            .expect("watch channel open");
        assert_eq!(first, "");

        let owner = Connection::builder()
            .address(format!("unix:path={}", bus.path))
            .no_auth()
            .build()
            .await
            .expect("owner connects");
        let claim = request_name(&owner, "com.example.Service", NameFlags::NONE)
            .await
            .expect("request_name");
        assert_eq!(claim.reply(), NameReply::PrimaryOwner);

        let handed_off = tokio::time::timeout(Duration::from_secs(5), watch.recv())
            .await
            .expect("handoff did not arrive")
            .expect("watch channel open");
        assert_eq!(handed_off, owner.unique_name().unwrap());
    }

    #[tokio::test]
    async fn watch_name_is_idempotent_per_bus_name() {
        let bus = fake_bus::spawn();
        let connection = Connection::builder()
            .address(format!("unix:path={}", bus.path))
            .no_auth()
            .build()
            .await
            .expect("connects");

        let first = name_info_or_create(&connection, "com.example.Shared");
        let second = name_info_or_create(&connection, "com.example.Shared");
        assert!(Arc::ptr_eq(&first, &second));
    }
}
