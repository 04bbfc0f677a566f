use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::{HandlerResult, MessageBus};
use crate::error::DBusError;
use crate::introspection::PropertyAccess;
use crate::service::{MethodDef, PropertyDef, ServiceInterface, SignalDef};
use crate::unmarshal::{Progress, Unmarshaller};
use crate::utils::lock;
use crate::{Message, Value, Variant};

/// A bus that is never connected. Everything it sends lands in the
/// pre-ready buffer, which the tests decode to observe the wire traffic.
fn test_bus() -> MessageBus {
    MessageBus::from_address("unix:path=/tmp/test-bus-that-does-not-exist").unwrap()
}

fn drain_frames(bus: &MessageBus) -> Vec<Message> {
    let frames = std::mem::take(&mut lock(&bus.inner().state).buffered);
    let mut messages = Vec::new();

    for (bytes, fds) in frames {
        let mut unmarshaller = Unmarshaller::new();
        unmarshaller.feed(&bytes);
        unmarshaller.feed_fds(fds);

        match unmarshaller.try_advance().unwrap() {
            Progress::Done(message) => messages.push(message),
            progress => panic!("expected a complete frame, got {progress:?}"),
        }
    }

    messages
}

fn echo_interface() -> Arc<ServiceInterface> {
    ServiceInterface::builder("se.tedro.Example")
        .method(MethodDef::new("Echo", "s", "s", |body| Ok(body.to_vec())))
        .signal(SignalDef::new("SomeSignal", "s"))
        .build()
        .unwrap()
}

fn incoming_call(path: &str, interface: &str, member: &str) -> Message {
    Message::method_call(path, member)
        .unwrap()
        .with_interface(interface)
        .unwrap()
        .with_sender(":1.99")
        .unwrap()
        .with_serial(1)
}

#[test]
fn test_serial_monotonicity() {
    let bus = test_bus();
    let mut last = 0;

    for _ in 0..100 {
        let serial = bus.next_serial();
        assert!(serial > last);
        last = serial;
    }
}

#[test]
fn test_send_stamps_serials_in_order() {
    let bus = test_bus();

    for _ in 0..3 {
        bus.send(
            Message::method_call("/org", "Something")
                .unwrap()
                .with_destination("org.freedesktop.DBus")
                .unwrap(),
        )
        .unwrap();
    }

    let serials = drain_frames(&bus)
        .into_iter()
        .map(|m| m.serial())
        .collect::<Vec<_>>();

    assert_eq!(serials, [1, 2, 3]);
}

#[test]
fn test_send_after_disconnect_fails() {
    let bus = test_bus();
    bus.disconnect();

    let error = bus
        .send(Message::method_call("/org", "Something").unwrap())
        .unwrap_err();

    assert!(error.is_disconnected());
}

#[tokio::test]
async fn test_pending_call_fails_once_on_disconnect() {
    let bus = test_bus();

    let call = {
        let bus = bus.clone();

        tokio::spawn(async move {
            bus.call(
                Message::method_call("/org", "Something")
                    .unwrap()
                    .with_destination("org.freedesktop.DBus")
                    .unwrap(),
            )
            .await
        })
    };

    // Give the call a chance to register its pending entry.
    tokio::task::yield_now().await;
    bus.disconnect();

    let result = call.await.unwrap();
    assert!(result.unwrap_err().is_disconnected());
    assert!(lock(&bus.inner().replies).is_empty());
}

#[test]
fn test_unknown_method_reply() {
    let bus = test_bus();
    bus.export("/se/tedro/Example", &echo_interface()).unwrap();

    let call = incoming_call("/se/tedro/Example", "se.tedro.Example", "Missing");
    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert_eq!(reply.error_name(), Some(DBusError::UNKNOWN_METHOD));
    assert_eq!(reply.destination(), Some(":1.99"));
}

#[test]
fn test_exported_method_dispatch() {
    let bus = test_bus();
    bus.export("/se/tedro/Example", &echo_interface()).unwrap();

    let call = incoming_call("/se/tedro/Example", "se.tedro.Example", "Echo")
        .with_body("s", vec![Value::from("hello world")])
        .unwrap();

    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert_eq!(reply.signature().signature(), "s");
    assert_eq!(reply.body(), [Value::from("hello world")]);
    assert_eq!(reply.reply_serial().map(|s| s.get()), Some(1));
}

#[test]
fn test_exported_method_echoes_containers() {
    let bus = test_bus();

    let interface = ServiceInterface::builder("se.tedro.Example")
        .method(MethodDef::new(
            "EchoContainers",
            "asva{sv}(s(s(v)))",
            "asva{sv}(s(s(v)))",
            |body| Ok(body.to_vec()),
        ))
        .build()
        .unwrap();

    bus.export("/se/tedro/Example", &interface).unwrap();

    let body = vec![
        Value::Array(vec![Value::from("hello"), Value::from("world")]),
        Value::Variant(
            Variant::new(
                "(ss)",
                Value::Struct(vec![Value::from("hi"), Value::from("there")]),
            )
            .unwrap(),
        ),
        Value::Dict(vec![(
            Value::from("foo"),
            Value::Variant(Variant::new("t", Value::Uint64(100)).unwrap()),
        )]),
        Value::Struct(vec![
            Value::from("one"),
            Value::Struct(vec![
                Value::from("two"),
                Value::Struct(vec![Value::Variant(
                    Variant::new("s", Value::from("three")).unwrap(),
                )]),
            ]),
        ]),
    ];

    let call = incoming_call("/se/tedro/Example", "se.tedro.Example", "EchoContainers")
        .with_body("asva{sv}(s(s(v)))", body.clone())
        .unwrap();

    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert_eq!(reply.signature().signature(), "asva{sv}(s(s(v)))");
    assert_eq!(reply.body(), body);
}

#[test]
fn test_method_signature_must_match() {
    let bus = test_bus();
    bus.export("/se/tedro/Example", &echo_interface()).unwrap();

    let call = incoming_call("/se/tedro/Example", "se.tedro.Example", "Echo")
        .with_body("u", vec![Value::Uint32(2)])
        .unwrap();

    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert_eq!(reply.error_name(), Some(DBusError::UNKNOWN_METHOD));
}

#[test]
fn test_ping() {
    let bus = test_bus();
    bus.export("/se/tedro/Example", &echo_interface()).unwrap();

    let call = incoming_call("/se/tedro/Example", "org.freedesktop.DBus.Peer", "Ping");
    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert!(reply.signature().is_empty());
    assert!(reply.error_name().is_none());
}

#[test]
fn test_get_machine_id_cached() {
    let bus = test_bus();
    *lock(&bus.inner().machine_id) = Some("cafe00000000000000000000000000001".to_owned());

    let call = incoming_call("/se/tedro/Example", "org.freedesktop.DBus.Peer", "GetMachineId");
    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert_eq!(
        reply.body(),
        [Value::from("cafe00000000000000000000000000001")]
    );
}

fn property_interface(value: Arc<Mutex<String>>) -> Arc<ServiceInterface> {
    let get = value.clone();
    let set = value;

    ServiceInterface::builder("se.tedro.Example")
        .property(
            PropertyDef::new("StringProp", "s", PropertyAccess::ReadWrite, move || {
                Ok(Value::String(lock(&get).clone()))
            })
            .with_setter(move |value| {
                if let Value::String(value) = value {
                    *lock(&set) = value;
                }

                Ok(())
            }),
        )
        .property(PropertyDef::new(
            "Fixed",
            "u",
            PropertyAccess::Read,
            || Ok(Value::Uint32(7)),
        ))
        .build()
        .unwrap()
}

#[test]
fn test_property_get_and_set() {
    let bus = test_bus();
    let value = Arc::new(Mutex::new("kevin".to_owned()));
    bus.export("/se/tedro/Example", &property_interface(value.clone()))
        .unwrap();

    let get = |bus: &MessageBus| {
        let call = incoming_call(
            "/se/tedro/Example",
            "org.freedesktop.DBus.Properties",
            "Get",
        )
        .with_body(
            "ss",
            vec![Value::from("se.tedro.Example"), Value::from("StringProp")],
        )
        .unwrap();

        bus.inner().dispatch(call);

        let [reply] = &drain_frames(bus)[..] else {
            panic!("expected a single reply");
        };

        assert_eq!(reply.signature().signature(), "v");
        reply.body()[0].as_variant().unwrap().value().clone()
    };

    assert_eq!(get(&bus), Value::from("kevin"));

    let set = incoming_call(
        "/se/tedro/Example",
        "org.freedesktop.DBus.Properties",
        "Set",
    )
    .with_body(
        "ssv",
        vec![
            Value::from("se.tedro.Example"),
            Value::from("StringProp"),
            Value::Variant(Variant::new("s", Value::from("bob")).unwrap()),
        ],
    )
    .unwrap();

    bus.inner().dispatch(set);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert!(reply.error_name().is_none());
    assert!(reply.signature().is_empty());

    assert_eq!(get(&bus), Value::from("bob"));
    assert_eq!(lock(&value).as_str(), "bob");
}

#[test]
fn test_property_errors() {
    let bus = test_bus();
    let value = Arc::new(Mutex::new("kevin".to_owned()));
    bus.export("/se/tedro/Example", &property_interface(value)).unwrap();

    let cases = [
        // Unknown interface.
        (
            "Get",
            "ss",
            vec![Value::from("se.tedro.Missing"), Value::from("StringProp")],
            DBusError::UNKNOWN_INTERFACE,
        ),
        // Unknown property.
        (
            "Get",
            "ss",
            vec![Value::from("se.tedro.Example"), Value::from("Missing")],
            DBusError::UNKNOWN_PROPERTY,
        ),
        // Read-only property.
        (
            "Set",
            "ssv",
            vec![
                Value::from("se.tedro.Example"),
                Value::from("Fixed"),
                Value::Variant(Variant::new("u", Value::Uint32(1)).unwrap()),
            ],
            DBusError::PROPERTY_READ_ONLY,
        ),
        // Wrong value type.
        (
            "Set",
            "ssv",
            vec![
                Value::from("se.tedro.Example"),
                Value::from("StringProp"),
                Value::Variant(Variant::new("u", Value::Uint32(1)).unwrap()),
            ],
            DBusError::INVALID_SIGNATURE,
        ),
        // Empty interface names are not supported.
        (
            "Get",
            "ss",
            vec![Value::from(""), Value::from("StringProp")],
            DBusError::NOT_SUPPORTED,
        ),
    ];

    for (member, signature, body, expected) in cases {
        let call = incoming_call(
            "/se/tedro/Example",
            "org.freedesktop.DBus.Properties",
            member,
        )
        .with_body(signature, body)
        .unwrap();

        bus.inner().dispatch(call);

        let [reply] = &drain_frames(&bus)[..] else {
            panic!("expected a single reply");
        };

        assert_eq!(reply.error_name(), Some(expected));
    }
}

#[test]
fn test_property_get_all() {
    let bus = test_bus();
    let value = Arc::new(Mutex::new("kevin".to_owned()));
    bus.export("/se/tedro/Example", &property_interface(value)).unwrap();

    let call = incoming_call(
        "/se/tedro/Example",
        "org.freedesktop.DBus.Properties",
        "GetAll",
    )
    .with_body("s", vec![Value::from("se.tedro.Example")])
    .unwrap();

    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert_eq!(reply.signature().signature(), "a{sv}");

    let entries = reply.body()[0].as_dict().unwrap();
    assert_eq!(entries.len(), 2);
}

#[test]
fn test_introspect_and_children() {
    let bus = test_bus();
    bus.export("/se/tedro/Example", &echo_interface()).unwrap();

    let other = ServiceInterface::builder("se.tedro.Other")
        .method(MethodDef::new("Nothing", "", "", |_| Ok(Vec::new())))
        .build()
        .unwrap();

    bus.export("/se/tedro/Example/child", &other).unwrap();

    let call = incoming_call(
        "/se/tedro/Example",
        "org.freedesktop.DBus.Introspectable",
        "Introspect",
    );

    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    let Some(Value::String(document)) = reply.body().first() else {
        panic!("expected an introspection document");
    };

    assert!(document.contains("se.tedro.Example"));
    assert!(document.contains("<node name=\"child\"/>"));
    assert!(document.contains("org.freedesktop.DBus.Properties"));
}

#[test]
fn test_export_unexport_symmetry() {
    let bus = test_bus();
    let interface = echo_interface();

    bus.export("/se/tedro/Example", &interface).unwrap();
    assert!(bus.export("/se/tedro/Example", &interface).is_err());

    bus.unexport("/se/tedro/Example").unwrap();

    let call = incoming_call(
        "/se/tedro/Example",
        "org.freedesktop.DBus.Introspectable",
        "Introspect",
    );

    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    let Some(Value::String(document)) = reply.body().first() else {
        panic!("expected an introspection document");
    };

    assert!(!document.contains("se.tedro.Example"));

    // A signal on the unexported interface fans out to no bus.
    interface
        .emit_signal("SomeSignal", vec![Value::from("x")])
        .unwrap();

    assert!(drain_frames(&bus).is_empty());
}

#[test]
fn test_aliased_export_emits_on_every_path() {
    let bus = test_bus();
    let interface = echo_interface();

    bus.export("/se/tedro/A", &interface).unwrap();
    bus.export("/se/tedro/B", &interface).unwrap();

    interface
        .emit_signal("SomeSignal", vec![Value::from("x")])
        .unwrap();

    let paths = drain_frames(&bus)
        .into_iter()
        .map(|m| m.path().unwrap_or_default().to_owned())
        .collect::<Vec<_>>();

    assert_eq!(paths, ["/se/tedro/A", "/se/tedro/B"]);
}

#[test]
fn test_properties_changed_emission() {
    let bus = test_bus();
    let value = Arc::new(Mutex::new("kevin".to_owned()));
    let interface = property_interface(value);

    bus.export("/se/tedro/Example", &interface).unwrap();

    interface
        .emit_properties_changed(&[("StringProp", Value::from("bob"))], &["Fixed"])
        .unwrap();

    let [signal] = &drain_frames(&bus)[..] else {
        panic!("expected a single signal");
    };

    assert_eq!(signal.interface(), Some("org.freedesktop.DBus.Properties"));
    assert_eq!(signal.member(), Some("PropertiesChanged"));
    assert_eq!(signal.signature().signature(), "sa{sv}as");
    assert_eq!(signal.body()[0], Value::from("se.tedro.Example"));
}

#[test]
fn test_get_managed_objects() {
    let bus = test_bus();
    let value = Arc::new(Mutex::new("kevin".to_owned()));

    bus.export("/se/tedro", &echo_interface()).unwrap();
    bus.export("/se/tedro/child", &property_interface(value)).unwrap();

    let call = incoming_call(
        "/se/tedro",
        "org.freedesktop.DBus.ObjectManager",
        "GetManagedObjects",
    );

    bus.inner().dispatch(call);

    let [reply] = &drain_frames(&bus)[..] else {
        panic!("expected a single reply");
    };

    assert_eq!(reply.signature().signature(), "a{oa{sa{sv}}}");

    let objects = reply.body()[0].as_dict().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0].0, Value::ObjectPath("/se/tedro/child".into()));
}

#[test]
fn test_user_message_handlers() {
    let bus = test_bus();
    bus.export("/se/tedro/Example", &echo_interface()).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let observed = seen.clone();

    let id = bus.add_message_handler(move |message| {
        observed.fetch_add(1, Ordering::Relaxed);

        if message.member() == Some("Intercepted") {
            return Ok(HandlerResult::Handled);
        }

        Ok(HandlerResult::Pass)
    });

    // An intercepted method call gets no UnknownMethod reply.
    let call = incoming_call("/se/tedro/Example", "se.tedro.Example", "Intercepted");
    bus.inner().dispatch(call);
    assert!(drain_frames(&bus).is_empty());

    // A passed-through unknown method still errors.
    let call = incoming_call("/se/tedro/Example", "se.tedro.Example", "Missing");
    bus.inner().dispatch(call);
    assert_eq!(drain_frames(&bus).len(), 1);

    assert_eq!(seen.load(Ordering::Relaxed), 2);

    bus.remove_message_handler(id);

    let call = incoming_call("/se/tedro/Example", "se.tedro.Example", "Missing");
    bus.inner().dispatch(call);
    assert_eq!(seen.load(Ordering::Relaxed), 2);
}

#[test]
fn test_handler_dbus_error_becomes_reply() {
    let bus = test_bus();

    bus.add_message_handler(|_| {
        Err(DBusError::new("se.tedro.Error.Denied", "not allowed")?.into())
    });

    let call = incoming_call("/se/tedro/Example", "se.tedro.Example", "Anything");
    bus.inner().dispatch(call);

    let replies = drain_frames(&bus);

    // The handler error reply plus the UnknownMethod reply for the
    // unhandled call.
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].error_name(), Some("se.tedro.Error.Denied"));
    assert_eq!(replies[1].error_name(), Some(DBusError::UNKNOWN_METHOD));
}

fn name_owner_changed(name: &str, old: &str, new: &str) -> Message {
    Message::new_signal(
        "/org/freedesktop/DBus",
        "org.freedesktop.DBus",
        "NameOwnerChanged",
        "sss",
        vec![Value::from(name), Value::from(old), Value::from(new)],
    )
    .unwrap()
    .with_sender("org.freedesktop.DBus")
    .unwrap()
    .with_serial(100)
}

fn example_signal(sender: &str, body: &str) -> Message {
    Message::new_signal(
        "/se/tedro/Example",
        "se.tedro.Example",
        "SomeSignal",
        "s",
        vec![Value::from(body)],
    )
    .unwrap()
    .with_sender(sender)
    .unwrap()
    .with_serial(101)
}

#[test]
fn test_signal_routing_follows_name_owner() {
    let bus = test_bus();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();

    bus.inner()
        .add_signal_subscription(
            "se.tedro.Example",
            "/se/tedro/Example",
            "se.tedro.Example",
            "SomeSignal",
            "s",
            Box::new(move |message| {
                if let Some(Value::String(value)) = message.body().first() {
                    lock(&sink).push(value.clone());
                }
            }),
        )
        .unwrap();

    // First subscription asks the daemon for the owner and installs the
    // match rule.
    let requests = drain_frames(&bus);
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].member(), Some("GetNameOwner"));
    assert_eq!(requests[1].member(), Some("AddMatch"));

    // The owner is learned from NameOwnerChanged.
    bus.inner().dispatch(name_owner_changed("se.tedro.Example", "", ":1.10"));
    bus.inner().dispatch(example_signal(":1.10", "first"));

    // The name moves to a new owner, signals from the stale owner are no
    // longer delivered.
    bus.inner().dispatch(name_owner_changed("se.tedro.Example", ":1.10", ":1.20"));
    bus.inner().dispatch(example_signal(":1.10", "stale"));
    bus.inner().dispatch(example_signal(":1.20", "second"));

    // A signal whose sender is the well-known name itself matches exactly.
    bus.inner().dispatch(example_signal("se.tedro.Example", "direct"));

    // Signals with an unexpected signature are dropped.
    let odd = Message::new_signal(
        "/se/tedro/Example",
        "se.tedro.Example",
        "SomeSignal",
        "u",
        vec![Value::Uint32(1)],
    )
    .unwrap()
    .with_sender(":1.20")
    .unwrap()
    .with_serial(102);

    bus.inner().dispatch(odd);

    assert_eq!(lock(&received).as_slice(), ["first", "second", "direct"]);
}

#[test]
fn test_match_rule_refcount() {
    let bus = test_bus();

    let first = bus
        .inner()
        .add_signal_subscription(
            "se.tedro.Example",
            "/se/tedro/Example",
            "se.tedro.Example",
            "SomeSignal",
            "s",
            Box::new(|_| {}),
        )
        .unwrap();

    let second = bus
        .inner()
        .add_signal_subscription(
            "se.tedro.Example",
            "/se/tedro/Example",
            "se.tedro.Example",
            "OtherSignal",
            "",
            Box::new(|_| {}),
        )
        .unwrap();

    let add_matches = drain_frames(&bus)
        .into_iter()
        .filter(|m| m.member() == Some("AddMatch"))
        .count();

    assert_eq!(add_matches, 1);

    bus.inner().remove_signal_subscription(first);
    assert!(drain_frames(&bus).is_empty());

    bus.inner().remove_signal_subscription(second);

    let remove_matches = drain_frames(&bus)
        .into_iter()
        .filter(|m| m.member() == Some("RemoveMatch"))
        .count();

    assert_eq!(remove_matches, 1);
}
