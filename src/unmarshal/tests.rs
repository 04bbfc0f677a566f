use std::fs::File;
use std::os::fd::OwnedFd;

use super::{Progress, Unmarshaller};
use crate::proto::Endianness;
use crate::{Flags, Message, Value, Variant};

fn complex_message() -> Message {
    let dict = Value::Dict(vec![(
        Value::from("foo"),
        Value::Variant(Variant::new("t", Value::Uint64(100)).unwrap()),
    )]);

    let nested = Value::Struct(vec![
        Value::from("one"),
        Value::Struct(vec![
            Value::from("two"),
            Value::Struct(vec![Value::Variant(
                Variant::new("s", Value::from("three")).unwrap(),
            )]),
        ]),
    ]);

    Message::method_call("/se/tedro/Example", "Frobnicate")
        .unwrap()
        .with_destination("se.tedro.Example")
        .unwrap()
        .with_interface("se.tedro.Example")
        .unwrap()
        .with_body(
            "yxd(nq)asa{sv}(s(s(v)))ay",
            vec![
                Value::Byte(3),
                Value::Int64(-2),
                Value::Double(0.5),
                Value::Struct(vec![Value::Int16(-1), Value::Uint16(2)]),
                Value::Array(vec![Value::from("hello"), Value::from("world")]),
                dict,
                nested,
                Value::ByteArray(vec![1, 2, 3, 4, 5]),
            ],
        )
        .unwrap()
        .with_serial(42)
}

fn decode_one(bytes: &[u8]) -> Message {
    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.feed(bytes);

    match unmarshaller.try_advance().unwrap() {
        Progress::Done(message) => message,
        progress => panic!("expected a complete message, got {progress:?}"),
    }
}

#[test]
fn test_round_trip() {
    let m = complex_message();
    let decoded = decode_one(&m.marshal().unwrap());
    assert_eq!(decoded, m);
}

#[test]
fn test_round_trip_big_endian() {
    let m = complex_message();
    let decoded = decode_one(&m.marshal_with(Endianness::BIG).unwrap());
    assert_eq!(decoded, m);
}

#[test]
fn test_round_trip_all_kinds() {
    let call = Message::method_call("/org", "Hello").unwrap().with_serial(1);
    assert_eq!(decode_one(&call.marshal().unwrap()), call);

    let ret = Message::new_method_return(&call, "s", vec![Value::from("ok")])
        .unwrap()
        .with_serial(2);
    assert_eq!(decode_one(&ret.marshal().unwrap()), ret);

    let error = Message::new_error(&call, "org.example.Error.Failed", "nope")
        .unwrap()
        .with_serial(3);
    assert_eq!(decode_one(&error.marshal().unwrap()), error);

    let signal = Message::new_signal("/org", "org.example.Iface", "Changed", "u", vec![
        Value::Uint32(1),
    ])
    .unwrap()
    .with_serial(4);
    assert_eq!(decode_one(&signal.marshal().unwrap()), signal);
}

#[test]
fn test_round_trip_flags() {
    let m = Message::method_call("/org", "Hello")
        .unwrap()
        .with_flags(Flags::NO_REPLY_EXPECTED | Flags::NO_AUTO_START)
        .with_serial(1);

    let decoded = decode_one(&m.marshal().unwrap());
    assert!(decoded.flags() & Flags::NO_REPLY_EXPECTED);
    assert!(decoded.flags() & Flags::NO_AUTO_START);
}

#[test]
fn test_byte_at_a_time() {
    let m = complex_message();
    let bytes = m.marshal().unwrap();

    let mut unmarshaller = Unmarshaller::new();

    for (n, byte) in bytes.iter().enumerate() {
        match unmarshaller.try_advance().unwrap() {
            Progress::NeedMore(need) => {
                assert!(need > 0);
                assert!(need <= bytes.len() - n);
            }
            progress => panic!("unexpected progress {progress:?}"),
        }

        unmarshaller.feed(std::slice::from_ref(byte));
    }

    let Progress::Done(decoded) = unmarshaller.try_advance().unwrap() else {
        panic!("expected a complete message");
    };

    assert_eq!(decoded, m);
}

#[test]
fn test_multiple_frames_in_one_feed() {
    let first = Message::method_call("/org", "First").unwrap().with_serial(1);
    let second = Message::method_call("/org", "Second").unwrap().with_serial(2);

    let mut bytes = first.marshal().unwrap();
    bytes.extend(second.marshal().unwrap());

    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.feed(&bytes);

    let Progress::Done(a) = unmarshaller.try_advance().unwrap() else {
        panic!("expected first message");
    };

    let Progress::Done(b) = unmarshaller.try_advance().unwrap() else {
        panic!("expected second message");
    };

    assert_eq!(a, first);
    assert_eq!(b, second);

    assert!(matches!(
        unmarshaller.try_advance().unwrap(),
        Progress::NeedMore(..)
    ));
}

#[test]
fn test_eof_between_frames() {
    let m = Message::method_call("/org", "Hello").unwrap().with_serial(1);

    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.feed(&m.marshal().unwrap());

    let Progress::Done(..) = unmarshaller.try_advance().unwrap() else {
        panic!("expected a complete message");
    };

    unmarshaller.feed_eof();
    assert!(matches!(unmarshaller.try_advance().unwrap(), Progress::Eof));
}

#[test]
fn test_eof_mid_frame_is_an_error() {
    let m = Message::method_call("/org", "Hello").unwrap().with_serial(1);
    let bytes = m.marshal().unwrap();

    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.feed(&bytes[..bytes.len() / 2]);
    unmarshaller.feed_eof();

    assert!(unmarshaller.try_advance().is_err());
}

#[test]
fn test_invalid_endianness_marker() {
    let m = Message::method_call("/org", "Hello").unwrap().with_serial(1);
    let mut bytes = m.marshal().unwrap();
    bytes[0] = b'x';

    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.feed(&bytes);
    assert!(unmarshaller.try_advance().is_err());
}

#[test]
fn test_invalid_protocol_version() {
    let m = Message::method_call("/org", "Hello").unwrap().with_serial(1);
    let mut bytes = m.marshal().unwrap();
    bytes[3] = 2;

    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.feed(&bytes);
    assert!(unmarshaller.try_advance().is_err());
}

#[test]
fn test_fds_attached_to_message() {
    let fd = OwnedFd::from(File::open("/dev/null").unwrap());

    let m = Message::method_call("/org", "TakeFd")
        .unwrap()
        .with_body("h", vec![Value::UnixFd(0)])
        .unwrap()
        .with_unix_fds(vec![fd])
        .with_serial(1);

    let bytes = m.marshal().unwrap();

    let mut unmarshaller = Unmarshaller::new();
    unmarshaller.feed(&bytes);
    unmarshaller.feed_fds(vec![OwnedFd::from(File::open("/dev/null").unwrap())]);

    let Progress::Done(mut decoded) = unmarshaller.try_advance().unwrap() else {
        panic!("expected a complete message");
    };

    assert_eq!(decoded.body(), [Value::UnixFd(0)]);
    assert_eq!(decoded.take_unix_fds().len(), 1);
}

#[test]
fn test_big_body_round_trip() {
    let m = Message::method_call("/org", "Big")
        .unwrap()
        .with_body("ay", vec![Value::ByteArray(vec![0x62; 2 * 1024 * 1024])])
        .unwrap()
        .with_serial(1);

    let decoded = decode_one(&m.marshal().unwrap());
    assert_eq!(decoded, m);
}
