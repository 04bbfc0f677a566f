//! Syntactic validation of the names used in the D-Bus protocol.

use crate::error::{Error, ErrorKind, Result};

/// The maximum length in bytes of a bus name, interface name or member name.
const MAX_NAME_LENGTH: usize = 255;

/// Test if `name` is a valid bus name.
///
/// Unique names start with `:` and are assigned by the message bus, well-known
/// names are sequences of dot-separated elements.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::validators::is_bus_name_valid;
///
/// assert!(is_bus_name_valid("org.freedesktop.DBus"));
/// assert!(is_bus_name_valid(":1.131"));
/// assert!(!is_bus_name_valid("org"));
/// assert!(!is_bus_name_valid(".org.freedesktop.DBus"));
/// ```
pub fn is_bus_name_valid(name: &str) -> bool {
    let bytes = name.as_bytes();

    if bytes.is_empty() || bytes.len() > MAX_NAME_LENGTH {
        return false;
    }

    if let [b':', ..] = bytes {
        return true;
    }

    if let [b'.', ..] = bytes {
        return false;
    }

    if !bytes.contains(&b'.') {
        return false;
    }

    name.split('.').all(is_bus_name_element)
}

fn is_bus_name_element(element: &str) -> bool {
    let [first, rest @ ..] = element.as_bytes() else {
        return false;
    };

    matches!(first, b'A'..=b'Z' | b'a'..=b'z' | b'_' | b'-')
        && rest
            .iter()
            .all(|b| matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

/// Test if `path` is a valid object path.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::validators::is_object_path_valid;
///
/// assert!(is_object_path_valid("/"));
/// assert!(is_object_path_valid("/org/freedesktop/DBus"));
/// assert!(!is_object_path_valid("/org//DBus"));
/// assert!(!is_object_path_valid("/org/freedesktop/DBus/"));
/// ```
pub fn is_object_path_valid(path: &str) -> bool {
    let [b'/', rest @ ..] = path.as_bytes() else {
        return false;
    };

    if rest.is_empty() {
        return true;
    }

    let mut component = false;

    for b in rest {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' => {
                component = true;
            }
            b'/' => {
                if !component {
                    return false;
                }

                component = false;
            }
            _ => {
                return false;
            }
        }
    }

    component
}

/// Test if `name` is a valid interface name.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::validators::is_interface_name_valid;
///
/// assert!(is_interface_name_valid("org.freedesktop.DBus"));
/// assert!(!is_interface_name_valid("org"));
/// assert!(!is_interface_name_valid("org.freedesktop.4DBus"));
/// ```
pub fn is_interface_name_valid(name: &str) -> bool {
    let bytes = name.as_bytes();

    if bytes.is_empty() || bytes.len() > MAX_NAME_LENGTH {
        return false;
    }

    if let [b'.', ..] = bytes {
        return false;
    }

    if !bytes.contains(&b'.') {
        return false;
    }

    name.split('.').all(is_member_name_valid)
}

/// Test if `name` is a valid member name.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::validators::is_member_name_valid;
///
/// assert!(is_member_name_valid("ListNames"));
/// assert!(is_member_name_valid("_private"));
/// assert!(!is_member_name_valid("0StartsWithDigit"));
/// assert!(!is_member_name_valid("has.dot"));
/// ```
pub fn is_member_name_valid(name: &str) -> bool {
    let bytes = name.as_bytes();

    if bytes.len() > MAX_NAME_LENGTH {
        return false;
    }

    let [first, rest @ ..] = bytes else {
        return false;
    };

    matches!(first, b'A'..=b'Z' | b'a'..=b'z' | b'_')
        && rest
            .iter()
            .all(|b| matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_'))
}

/// Validate a bus name, raising an error if it is invalid.
pub fn assert_bus_name_valid(name: &str) -> Result<()> {
    if !is_bus_name_valid(name) {
        return Err(Error::new(ErrorKind::InvalidBusName(name.into())));
    }

    Ok(())
}

/// Validate an object path, raising an error if it is invalid.
pub fn assert_object_path_valid(path: &str) -> Result<()> {
    if !is_object_path_valid(path) {
        return Err(Error::new(ErrorKind::InvalidObjectPath(path.into())));
    }

    Ok(())
}

/// Validate an interface name, raising an error if it is invalid.
pub fn assert_interface_name_valid(name: &str) -> Result<()> {
    if !is_interface_name_valid(name) {
        return Err(Error::new(ErrorKind::InvalidInterfaceName(name.into())));
    }

    Ok(())
}

/// Validate a member name, raising an error if it is invalid.
pub fn assert_member_name_valid(name: &str) -> Result<()> {
    if !is_member_name_valid(name) {
        return Err(Error::new(ErrorKind::InvalidMemberName(name.into())));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_names() {
        assert!(is_bus_name_valid("org.freedesktop.DBus"));
        assert!(is_bus_name_valid("com.example.with-dash"));
        assert!(is_bus_name_valid(":1.0"));
        assert!(is_bus_name_valid("a.b"));

        assert!(!is_bus_name_valid(""));
        assert!(!is_bus_name_valid("org"));
        assert!(!is_bus_name_valid(".org.freedesktop.DBus"));
        assert!(!is_bus_name_valid("org..freedesktop"));
        assert!(!is_bus_name_valid("org.freedesktop.4DBus"));
        assert!(!is_bus_name_valid("org.freedesktop.DBus "));
    }

    #[test]
    fn test_object_paths() {
        assert!(is_object_path_valid("/"));
        assert!(is_object_path_valid("/org"));
        assert!(is_object_path_valid("/org/freedesktop/DBus"));
        assert!(is_object_path_valid("/with_underscore/and/1digit"));

        assert!(!is_object_path_valid(""));
        assert!(!is_object_path_valid("org"));
        assert!(!is_object_path_valid("/org/"));
        assert!(!is_object_path_valid("//org"));
        assert!(!is_object_path_valid("/org/free desktop"));
        assert!(!is_object_path_valid("/org/free-desktop"));
    }

    #[test]
    fn test_interface_names() {
        assert!(is_interface_name_valid("org.freedesktop.DBus"));
        assert!(is_interface_name_valid("a.b"));

        assert!(!is_interface_name_valid(""));
        assert!(!is_interface_name_valid("org"));
        assert!(!is_interface_name_valid(".org.freedesktop"));
        assert!(!is_interface_name_valid("org.free-desktop"));
        assert!(!is_interface_name_valid("org.freedesktop.4DBus"));
    }

    #[test]
    fn test_member_names() {
        assert!(is_member_name_valid("ListNames"));
        assert!(is_member_name_valid("_private"));
        assert!(is_member_name_valid("Name1"));

        assert!(!is_member_name_valid(""));
        assert!(!is_member_name_valid("0name"));
        assert!(!is_member_name_valid("has.dot"));
        assert!(!is_member_name_valid("has-dash"));
    }

    #[test]
    fn test_long_names_rejected() {
        let long = format!("a.{}", "b".repeat(300));
        assert!(!is_bus_name_valid(&long));
        assert!(!is_interface_name_valid(&long));
        assert!(!is_member_name_valid(&"m".repeat(300)));
    }
}
