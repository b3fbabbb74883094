//! The connection actor: spec §5. A single receive task owns the socket's
//! read half and drives both reply correlation and signal dispatch; a
//! writer sub-task owns the write half and serializes outgoing frames fed
//! to it over an unbounded channel. [`Connection`] itself is just a cheap,
//! cloneable handle around these two tasks.

mod builder;

pub use builder::ConnectionBuilder;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::error::{Error, ErrorKind, Result};
use crate::message::{Message, MessageType, SerialAllocator};
use crate::names::NameInfo;
use crate::object_path::ObjectPath;
use crate::signal::{MatchRule, SignalRouter, SignalWatch};
use crate::transport::Transport;
use crate::value::Value;

/// A handler for incoming `MethodCall`s addressed to a given object path.
/// Returns the reply to send back, or `None` to leave the call unanswered
/// (e.g. it already replied asynchronously through some other channel).
pub type Handler = Box<dyn Fn(&Message) -> Option<Message> + Send + Sync>;

/// A connection-wide filter, run over every incoming message before
/// dispatch. Returning `None` drops the message; returning `Some` (possibly
/// a transformed message) lets it continue to reply correlation, signal
/// routing, or method dispatch.
pub type Filter = Box<dyn Fn(Message) -> Option<Message> + Send + Sync>;

/// `org.freedesktop.DBus.Error.UnknownObject`: sent back when a
/// `MethodCall` names a path with no registered handler, or no path at all.
const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

struct Inner {
    pending: HashMap<u32, oneshot::Sender<Result<Message>>>,
    handlers: HashMap<ObjectPath, Handler>,
    filters: Vec<Filter>,
    signals: SignalRouter,
    names: HashMap<String, Weak<NameInfo>>,
    unique_name: Option<String>,
}

struct Shared {
    inner: Mutex<Inner>,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    serials: SerialAllocator,
}

/// An asynchronous D-Bus connection.
///
/// Cloning a [`Connection`] is cheap and shares the same underlying
/// receive/writer tasks — this is the handle callers pass around, not the
/// tasks themselves.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    /// Finish bringing up a connection over an already-authenticated
    /// transport: spawn the writer and receive tasks, then call `Hello`.
    async fn connect(transport: Transport) -> Result<Connection> {
        let (reader, writer) = transport.into_split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                handlers: HashMap::new(),
                filters: Vec::new(),
                signals: SignalRouter::new(),
                names: HashMap::new(),
                unique_name: None,
            }),
            writer_tx,
            serials: SerialAllocator::new(),
        });

        tokio::spawn(run_writer(writer, writer_rx));
        tokio::spawn(run_receiver(shared.clone(), reader));

        let connection = Connection { shared };
        let unique_name = Bus::new(&connection).hello().await?;
        connection.shared.inner.lock().unwrap().unique_name = Some(unique_name);

        Ok(connection)
    }

    /// The unique connection name assigned by `Hello`, e.g. `:1.42`.
    pub fn unique_name(&self) -> Option<String> {
        self.shared.inner.lock().unwrap().unique_name.clone()
    }

    fn next_serial(&self) -> u32 {
        self.shared.serials.next_serial()
    }

    async fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        self.shared
            .writer_tx
            .send(bytes)
            .map_err(|_| Error::new(ErrorKind::ConnectionClosed))
    }

    /// Send a `MethodCall` and await its `MethodReturn`, converting an
    /// `Error` reply into `Err(Error::kind() == ErrorKind::Remote(_))`.
    pub async fn call(&self, mut message: Message) -> Result<Message> {
        message.serial = self.next_serial();
        message.validate()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.pending.insert(message.serial, tx);
        }

        let encoded = match message.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                self.shared.inner.lock().unwrap().pending.remove(&message.serial);
                return Err(err);
            }
        };

        if let Err(err) = self.send_bytes(encoded).await {
            self.shared.inner.lock().unwrap().pending.remove(&message.serial);
            return Err(err);
        }

        let reply = rx.await.map_err(|_| Error::new(ErrorKind::ConnectionClosed))??;

        if reply.message_type == MessageType::Error {
            let name = reply.error_name.clone().unwrap_or_default();
            let text = reply
                .body
                .first()
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_default();
            return Err(Error::new(ErrorKind::Remote(crate::error::RemoteError {
                name,
                message: text,
            })));
        }

        Ok(reply)
    }

    /// Convenience wrapper around [`Connection::call`] for calls to the
    /// bus daemon itself.
    pub async fn bus_call(&self, member: &str, args: Vec<Value>) -> Result<Message> {
        let mut message = Message::method_call(crate::bus::daemon_path(), member, 1)
            .with_destination(crate::bus::BUS_DAEMON_NAME)
            .with_body(args);
        message.interface = Some(crate::bus::BUS_DAEMON_IFACE.to_string());
        self.call(message).await
    }

    /// Send a `Signal` without waiting for any reply.
    pub async fn emit_signal(&self, mut message: Message) -> Result<()> {
        message.serial = self.next_serial();
        let encoded = message.encode()?;
        self.send_bytes(encoded).await
    }

    /// Register interest in signals matching `rule`, installing the match
    /// on the bus daemon first. If `rule.sender` names a well-known name
    /// (not a unique `:X.Y` name, and not the bus daemon itself), a
    /// background task keeps `rule.sender_owner` resolved to that name's
    /// current unique-name owner via [`crate::names::watch_name`], since
    /// the wire's `Sender` header is always a unique name and a rule that
    /// only knows the well-known name could otherwise never match.
    pub async fn watch_signal(&self, rule: MatchRule) -> Result<SignalWatch> {
        self.bus_call("AddMatch", vec![rule.to_match_string().into()]).await?;

        let owner_source = rule.sender.clone().filter(|sender| {
            !sender.starts_with(':') && sender != crate::bus::BUS_DAEMON_NAME
        });

        let (id, receiver) = self.shared.inner.lock().unwrap().signals.register(rule);

        if let Some(sender) = owner_source {
            let connection = self.clone();
            tokio::spawn(async move {
                let Ok(mut name_watch) = crate::names::watch_name(&connection, &sender).await else {
                    return;
                };
                loop {
                    let Some(owner) = name_watch.recv().await else {
                        break;
                    };
                    let owner = if owner.is_empty() { None } else { Some(owner) };
                    let mut inner = connection.shared.inner.lock().unwrap();
                    if inner.signals.rule_for(id).is_none() {
                        break;
                    }
                    inner.signals.set_sender_owner(id, owner);
                }
            });
        }

        Ok(SignalWatch { id, receiver })
    }

    /// Cancel a signal watch, removing the bus daemon's match rule.
    pub async fn unwatch_signal(&self, watch: SignalWatch) -> Result<()> {
        let rule = {
            let inner = self.shared.inner.lock().unwrap();
            inner.signals.rule_for(watch.id).cloned()
        };
        self.shared.inner.lock().unwrap().signals.unregister(watch.id);
        if let Some(rule) = rule {
            self.bus_call("RemoveMatch", vec![rule.to_match_string().into()]).await?;
        }
        Ok(())
    }

    /// Register a handler for `MethodCall`s addressed to `path`. Replaces
    /// any handler previously registered for the same path.
    pub fn add_handler(&self, path: ObjectPath, handler: Handler) {
        self.shared.inner.lock().unwrap().handlers.insert(path, handler);
    }

    pub fn remove_handler(&self, path: &ObjectPath) {
        self.shared.inner.lock().unwrap().handlers.remove(path);
    }

    /// Register a filter, run over every incoming message (in registration
    /// order) before reply correlation, signal routing, or method dispatch.
    /// Returning `None` from `filter` drops the message.
    pub fn add_filter(&self, filter: Filter) {
        self.shared.inner.lock().unwrap().filters.push(filter);
    }

    /// The shared [`NameInfo`] for `name`, if a [`crate::names::NameWatch`]
    /// is already tracking it on this connection.
    pub(crate) fn name_slot(&self, name: &str) -> Option<Arc<NameInfo>> {
        self.shared.inner.lock().unwrap().names.get(name).and_then(Weak::upgrade)
    }

    pub(crate) fn set_name_slot(&self, name: &str, info: &Arc<NameInfo>) {
        self.shared
            .inner
            .lock()
            .unwrap()
            .names
            .insert(name.to_string(), Arc::downgrade(info));
    }

    /// Remove `name`'s slot, but only if nothing upgraded it in the
    /// meantime (a fresh `NameWatch` may have raced this call).
    pub(crate) fn clear_name_slot(&self, name: &str) {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(weak) = inner.names.get(name) {
            if weak.strong_count() == 0 {
                inner.names.remove(name);
            }
        }
    }
}

async fn run_writer(mut writer: crate::transport::TransportWriter, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(err) = writer.send_all(&bytes).await {
            warn!(?err, "writer task exiting after send failure");
            return;
        }
    }
    debug!("writer task exiting: channel closed");
}

async fn run_receiver(shared: Arc<Shared>, mut reader: crate::transport::TransportReader) {
    loop {
        let mut fixed_bytes = [0u8; 16];
        if let Err(err) = reader.recv_exact(&mut fixed_bytes).await {
            debug!(?err, "receive loop exiting");
            break;
        }

        let fixed = match Message::decode_fixed_header(&fixed_bytes) {
            Ok(fixed) => fixed,
            Err(err) => {
                warn!(?err, "dropping connection: malformed fixed header");
                break;
            }
        };

        let mut rest = vec![0u8; fixed.remaining_len()];
        if let Err(err) = reader.recv_exact(&mut rest).await {
            debug!(?err, "receive loop exiting mid-message");
            break;
        }

        let message = match Message::decode(&fixed, &fixed_bytes, &rest) {
            Ok(message) => message,
            Err(err) => {
                warn!(?err, "dropping malformed message");
                continue;
            }
        };

        dispatch(&shared, message).await;
    }

    // Unblock every in-flight call rather than letting it hang forever.
    let pending = std::mem::take(&mut shared.inner.lock().unwrap().pending);
    for (_, tx) in pending {
        let _ = tx.send(Err(Error::new(ErrorKind::ConnectionClosed)));
    }
}

async fn dispatch(shared: &Arc<Shared>, message: Message) {
    let Some(message) = apply_filters(shared, message) else {
        return;
    };

    match message.message_type {
        MessageType::MethodReturn | MessageType::Error => {
            let Some(reply_serial) = message.reply_serial else {
                return;
            };
            let sender = shared.inner.lock().unwrap().pending.remove(&reply_serial);
            if let Some(sender) = sender {
                let _ = sender.send(Ok(message));
            }
        }
        MessageType::Signal => {
            shared.inner.lock().unwrap().signals.dispatch(&message);
        }
        MessageType::MethodCall => {
            if let Some(reply) = auto_reply(&message, shared.serials.next_serial()) {
                send_reply(shared, reply);
                return;
            }

            let handler_reply = message.path.as_ref().and_then(|path| {
                let inner = shared.inner.lock().unwrap();
                inner.handlers.get(path).and_then(|handler| handler(&message))
            });

            match handler_reply {
                Some(reply) => send_reply(shared, reply),
                None => {
                    if let Ok(reply) = Message::error(&message, UNKNOWN_OBJECT, shared.serials.next_serial()) {
                        send_reply(shared, reply);
                    }
                }
            }
        }
    }
}

/// Run every registered filter over `message`, in registration order.
/// A filter returning `None` drops the message before it reaches reply
/// correlation, signal routing, or method dispatch.
fn apply_filters(shared: &Arc<Shared>, message: Message) -> Option<Message> {
    let inner = shared.inner.lock().unwrap();
    inner.filters.iter().try_fold(message, |message, filter| filter(message))
}

fn send_reply(shared: &Arc<Shared>, reply: Message) {
    if let Ok(bytes) = reply.encode() {
        let _ = shared.writer_tx.send(bytes);
    }
}

/// Auto-handle `org.freedesktop.DBus.Peer` calls every object implicitly
/// supports, per spec §5: `Ping` and `GetMachineId`.
fn auto_reply(message: &Message, reply_serial: u32) -> Option<Message> {
    if message.message_type != MessageType::MethodCall {
        return None;
    }
    if message.interface.as_deref() != Some("org.freedesktop.DBus.Peer") {
        return None;
    }

    match message.member.as_deref() {
        Some("Ping") => Message::method_return(message, reply_serial).ok(),
        Some("GetMachineId") => {
            let reply = Message::method_return(message, reply_serial).ok()?;
            Some(reply.with_body(vec![Value::Str(Bus::machine_id())]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_reply_ignores_non_peer_interface() {
        let path = ObjectPath::new("/a").unwrap();
        let msg = Message::method_call(path, "Ping", 1).with_sender(":1.1");
        assert!(auto_reply(&msg, 2).is_none());
    }

    #[test]
    fn auto_reply_answers_ping() {
        let path = ObjectPath::new("/a").unwrap();
        let mut msg = Message::method_call(path, "Ping", 7);
        msg.interface = Some("org.freedesktop.DBus.Peer".to_string());
        let reply = auto_reply(&msg, 1).unwrap();
        assert_eq!(reply.message_type, MessageType::MethodReturn);
        assert_eq!(reply.reply_serial, Some(7));
    }

    fn test_shared() -> Arc<Shared> {
        let (writer_tx, _writer_rx) = mpsc::unbounded_channel();
        test_shared_with_writer(writer_tx)
    }

    fn test_shared_with_writer(writer_tx: mpsc::UnboundedSender<Vec<u8>>) -> Arc<Shared> {
        Arc::new(Shared {
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                handlers: HashMap::new(),
                filters: Vec::new(),
                signals: SignalRouter::new(),
                names: HashMap::new(),
                unique_name: None,
            }),
            writer_tx,
            serials: SerialAllocator::new(),
        })
    }

    #[test]
    fn filters_run_in_registration_order_and_can_transform() {
        let shared = test_shared();
        shared.inner.lock().unwrap().filters.push(Box::new(|mut msg: Message| {
            msg.member = Some("renamed".to_string());
            Some(msg)
        }));

        let path = ObjectPath::new("/a").unwrap();
        let msg = Message::method_call(path, "original", 1);
        let out = apply_filters(&shared, msg).unwrap();
        assert_eq!(out.member.as_deref(), Some("renamed"));
    }

    #[test]
    fn a_filter_returning_none_drops_the_message() {
        let shared = test_shared();
        shared.inner.lock().unwrap().filters.push(Box::new(|_: Message| None));

        let path = ObjectPath::new("/a").unwrap();
        let msg = Message::method_call(path, "Ping", 1);
        assert!(apply_filters(&shared, msg).is_none());
    }

    #[tokio::test]
    async fn unhandled_method_call_gets_unknown_object_error() {
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel();
        let shared = test_shared_with_writer(writer_tx);

        let path = ObjectPath::new("/no/such/object").unwrap();
        let msg = Message::method_call(path, "DoThing", 5);
        dispatch(&shared, msg).await;

        let bytes = writer_rx.recv().await.expect("a reply was sent");
        let mut fixed_bytes = [0u8; 16];
        fixed_bytes.copy_from_slice(&bytes[..16]);
        let fixed = Message::decode_fixed_header(&fixed_bytes).unwrap();
        let reply = Message::decode(&fixed, &fixed_bytes, &bytes[16..]).unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert_eq!(reply.error_name.as_deref(), Some(UNKNOWN_OBJECT));
        assert_eq!(reply.reply_serial, Some(5));
    }
}
