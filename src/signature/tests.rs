use crate::{SignatureTree, SignatureType, Value, Variant};

#[test]
fn test_signature_round_trip() {
    let signatures = [
        "",
        "s",
        "ybnqiuxtdsogh",
        "as",
        "ay",
        "a{sv}",
        "a{s(ii)}",
        "(s)",
        "(s(s(v)))",
        "aaaai",
        "v",
        "a(yv)",
        "sa{sv}as",
    ];

    for signature in signatures {
        let tree = SignatureTree::new(signature).unwrap();
        assert_eq!(tree.signature(), signature);

        let collected = tree
            .types()
            .iter()
            .map(|t| t.signature())
            .collect::<String>();

        assert_eq!(collected, signature);
    }
}

#[test]
fn test_type_counts() {
    let tree = SignatureTree::new("sa{sv}(ii)").unwrap();
    assert_eq!(tree.types().len(), 3);

    let tree = SignatureTree::new("ybnqiuxtd").unwrap();
    assert_eq!(tree.types().len(), 9);

    let tree = SignatureTree::new("").unwrap();
    assert!(tree.is_empty());
}

#[test]
fn test_container_children() {
    let ty = SignatureType::new("a{s(iv)}").unwrap();
    assert_eq!(ty.token(), 'a');

    let entry = &ty.children()[0];
    assert_eq!(entry.token(), '{');
    assert_eq!(entry.children()[0].token(), 's');
    assert_eq!(entry.children()[1].token(), '(');
    assert_eq!(entry.children()[1].signature(), "(iv)");
}

#[test]
fn test_invalid_signatures() {
    let invalid = [
        "e",
        "a",
        "a{s}",
        "a{sss}",
        "a{vs}",
        "()",
        "(s",
        "s)",
        "{sv}",
        "a{(s)v}",
    ];

    for signature in invalid {
        assert!(
            SignatureTree::new(signature).is_err(),
            "expected `{signature}` to be rejected"
        );
    }
}

#[test]
fn test_too_long_rejected() {
    let signature = "i".repeat(256);
    assert!(SignatureTree::new(&signature).is_err());

    let signature = "i".repeat(255);
    assert!(SignatureTree::new(&signature).is_ok());
}

#[test]
fn test_excessive_nesting_rejected() {
    let signature = "a".repeat(64) + "i";
    assert!(SignatureTree::new(&signature).is_err());
}

#[test]
fn test_dict_key_must_be_basic() {
    assert!(SignatureTree::new("a{sv}").is_ok());
    assert!(SignatureTree::new("a{ys}").is_ok());
    assert!(SignatureTree::new("a{vv}").is_err());
    assert!(SignatureTree::new("a{av}").is_err());
}

#[test]
fn test_verify_basic() {
    let ty = SignatureType::new("u").unwrap();
    assert!(ty.verify(&Value::Uint32(10)).is_ok());
    assert!(ty.verify(&Value::Int32(10)).is_err());

    let ty = SignatureType::new("d").unwrap();
    assert!(ty.verify(&Value::Double(1.5)).is_ok());
    assert!(ty.verify(&Value::Double(f64::NAN)).is_err());

    let ty = SignatureType::new("o").unwrap();
    assert!(ty.verify(&Value::ObjectPath("/org".into())).is_ok());
    assert!(ty.verify(&Value::ObjectPath("org".into())).is_err());
}

#[test]
fn test_verify_containers() {
    let ty = SignatureType::new("as").unwrap();
    assert!(ty.verify(&Value::Array(vec![Value::from("hello")])).is_ok());
    assert!(ty.verify(&Value::Array(vec![Value::Uint32(1)])).is_err());
    assert!(ty.verify(&Value::ByteArray(vec![1, 2])).is_err());

    let ty = SignatureType::new("ay").unwrap();
    assert!(ty.verify(&Value::ByteArray(vec![1, 2, 3])).is_ok());
    assert!(ty.verify(&Value::Array(vec![Value::Byte(1)])).is_err());

    let ty = SignatureType::new("a{su}").unwrap();

    let dict = Value::Dict(vec![(Value::from("a"), Value::Uint32(1))]);
    assert!(ty.verify(&dict).is_ok());

    let dict = Value::Dict(vec![(Value::Uint32(1), Value::Uint32(1))]);
    assert!(ty.verify(&dict).is_err());

    let ty = SignatureType::new("(su)").unwrap();

    let st = Value::Struct(vec![Value::from("a"), Value::Uint32(1)]);
    assert!(ty.verify(&st).is_ok());

    let st = Value::Struct(vec![Value::from("a")]);
    assert!(ty.verify(&st).is_err());
}

#[test]
fn test_verify_body() {
    let tree = SignatureTree::new("sv").unwrap();

    let body = vec![
        Value::from("hello"),
        Value::Variant(Variant::new("u", Value::Uint32(1)).unwrap()),
    ];

    assert!(tree.verify_body(&body).is_ok());
    assert!(tree.verify_body(&body[..1]).is_err());
}
