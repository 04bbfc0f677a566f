use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::message::Message;
use crate::proto::MessageType;
use crate::value::Value;

/// A predicate over messages, in the form the message bus daemon accepts for
/// `AddMatch` and `RemoveMatch`.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::MatchRule;
///
/// let rule = MatchRule::signal()
///     .with_sender("se.tedro.Example")
///     .with_interface("se.tedro.Example")
///     .with_path("/se/tedro/Example");
///
/// assert_eq!(
///     rule.to_string(),
///     "type='signal',sender='se.tedro.Example',interface='se.tedro.Example',path='/se/tedro/Example'",
/// );
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    message_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    arg0: Option<String>,
}

impl MatchRule {
    /// A rule matching signal messages.
    pub fn signal() -> Self {
        Self {
            message_type: Some(MessageType::SIGNAL),
            ..Self::default()
        }
    }

    /// Restrict the rule to the given sender.
    #[must_use]
    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    /// Restrict the rule to the given interface.
    #[must_use]
    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_owned());
        self
    }

    /// Restrict the rule to the given member.
    #[must_use]
    pub fn with_member(mut self, member: &str) -> Self {
        self.member = Some(member.to_owned());
        self
    }

    /// Restrict the rule to the given path.
    #[must_use]
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    /// Restrict the rule to messages whose first body argument is the given
    /// string.
    #[must_use]
    pub fn with_arg0(mut self, arg0: &str) -> Self {
        self.arg0 = Some(arg0.to_owned());
        self
    }

    /// Test if a message matches this rule.
    ///
    /// The sender is compared for exact equality. Resolution of well-known
    /// sender names against the owner cache is the business of the bus, which
    /// tries the exact comparison first.
    pub fn matches(&self, message: &Message) -> bool {
        if let Some(message_type) = self.message_type {
            if message.message_type() != message_type {
                return false;
            }
        }

        if let Some(sender) = &self.sender {
            if message.sender() != Some(sender.as_str()) {
                return false;
            }
        }

        if let Some(interface) = &self.interface {
            if message.interface() != Some(interface.as_str()) {
                return false;
            }
        }

        if let Some(member) = &self.member {
            if message.member() != Some(member.as_str()) {
                return false;
            }
        }

        if let Some(path) = &self.path {
            if message.path() != Some(path.as_str()) {
                return false;
            }
        }

        if let Some(arg0) = &self.arg0 {
            let matches = match message.body().first() {
                Some(Value::String(value)) => value == arg0,
                _ => false,
            };

            if !matches {
                return false;
            }
        }

        true
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;

        let mut write = |f: &mut fmt::Formatter<'_>, key: &str, value: &str| {
            if !first {
                f.write_str(",")?;
            }

            first = false;
            write!(f, "{key}='{value}'")
        };

        if let Some(message_type) = self.message_type {
            let name = match message_type {
                MessageType::METHOD_CALL => "method_call",
                MessageType::METHOD_RETURN => "method_return",
                MessageType::ERROR => "error",
                _ => "signal",
            };

            write(f, "type", name)?;
        }

        if let Some(sender) = &self.sender {
            write(f, "sender", sender)?;
        }

        if let Some(interface) = &self.interface {
            write(f, "interface", interface)?;
        }

        if let Some(member) = &self.member {
            write(f, "member", member)?;
        }

        if let Some(path) = &self.path {
            write(f, "path", path)?;
        }

        if let Some(arg0) = &self.arg0 {
            write(f, "arg0", arg0)?;
        }

        Ok(())
    }
}

/// The handler of a subscribed signal.
pub type SignalHandler = Box<dyn FnMut(&Message) + Send>;

/// Identifies a signal subscription for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) sender: String,
    pub(crate) path: String,
    pub(crate) interface: String,
    pub(crate) member: String,
    pub(crate) signature: String,
    pub(crate) handler: Arc<Mutex<SignalHandler>>,
}

impl Subscription {
    /// The rule asked of the daemon for this subscription. All subscriptions
    /// over the same `(sender, interface, path)` triple share one rule.
    fn rule(&self) -> String {
        MatchRule::signal()
            .with_sender(&self.sender)
            .with_interface(&self.interface)
            .with_path(&self.path)
            .to_string()
    }
}

/// The signal subscription table, along with the refcounts of the match
/// rules installed at the daemon.
#[derive(Default)]
pub(crate) struct Subscriptions {
    next_id: u64,
    pub(crate) entries: Vec<Subscription>,
    rules: HashMap<String, usize>,
}

impl Subscriptions {
    /// Add a subscription. Returns its id, the shared rule string, and
    /// whether this is the first subscriber of that rule.
    pub(crate) fn add(
        &mut self,
        sender: &str,
        path: &str,
        interface: &str,
        member: &str,
        signature: &str,
        handler: SignalHandler,
    ) -> (SubscriptionId, String, bool) {
        let id = self.next_id;
        self.next_id += 1;

        let subscription = Subscription {
            id,
            sender: sender.to_owned(),
            path: path.to_owned(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            signature: signature.to_owned(),
            handler: Arc::new(Mutex::new(handler)),
        };

        let rule = subscription.rule();
        self.entries.push(subscription);

        let count = self.rules.entry(rule.clone()).or_insert(0);
        *count += 1;

        (SubscriptionId(id), rule, *count == 1)
    }

    /// Remove a subscription. Returns the shared rule string and whether the
    /// last subscriber of that rule is now gone.
    pub(crate) fn remove(&mut self, id: SubscriptionId) -> Option<(String, bool)> {
        let at = self.entries.iter().position(|entry| entry.id == id.0)?;
        let subscription = self.entries.remove(at);
        let rule = subscription.rule();

        let Some(count) = self.rules.get_mut(&rule) else {
            return Some((rule, false));
        };

        *count -= 1;

        if *count == 0 {
            self.rules.remove(&rule);
            return Some((rule, true));
        }

        Some((rule, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;

    #[test]
    fn test_rule_rendering() {
        let rule = MatchRule::signal()
            .with_sender("org.freedesktop.DBus")
            .with_interface("org.freedesktop.DBus")
            .with_path("/org/freedesktop/DBus")
            .with_member("NameOwnerChanged");

        assert_eq!(
            rule.to_string(),
            "type='signal',sender='org.freedesktop.DBus',interface='org.freedesktop.DBus',\
             member='NameOwnerChanged',path='/org/freedesktop/DBus'"
        );
    }

    #[test]
    fn test_rule_matching() {
        let signal = Message::new_signal(
            "/se/tedro/Example",
            "se.tedro.Example",
            "ValueChanged",
            "s",
            vec![Value::from("first")],
        )
        .unwrap()
        .with_serial(1);

        assert!(MatchRule::signal().matches(&signal));
        assert!(MatchRule::signal()
            .with_interface("se.tedro.Example")
            .with_path("/se/tedro/Example")
            .with_member("ValueChanged")
            .matches(&signal));
        assert!(MatchRule::signal().with_arg0("first").matches(&signal));

        assert!(!MatchRule::signal().with_arg0("second").matches(&signal));
        assert!(!MatchRule::signal().with_member("Other").matches(&signal));

        let call = Message::method_call("/se/tedro/Example", "ValueChanged")
            .unwrap()
            .with_serial(2);

        assert!(!MatchRule::signal().matches(&call));
    }

    #[test]
    fn test_subscription_refcount() {
        let mut subscriptions = Subscriptions::default();

        let (a, rule_a, first_a) = subscriptions.add(
            "se.tedro.Example",
            "/p",
            "se.tedro.Example",
            "SomeSignal",
            "",
            Box::new(|_| {}),
        );

        let (b, rule_b, first_b) = subscriptions.add(
            "se.tedro.Example",
            "/p",
            "se.tedro.Example",
            "OtherSignal",
            "",
            Box::new(|_| {}),
        );

        assert_eq!(rule_a, rule_b);
        assert!(first_a);
        assert!(!first_b);

        let (_, last) = subscriptions.remove(a).unwrap();
        assert!(!last);

        let (_, last) = subscriptions.remove(b).unwrap();
        assert!(last);

        assert!(subscriptions.remove(b).is_none());
    }
}
