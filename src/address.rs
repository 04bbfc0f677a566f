//! Parsing of D-Bus server address strings.

use std::collections::HashMap;
use std::env;

use crate::error::{Error, ErrorKind, Result};

const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
const DEFAULT_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// The two well-known buses of a desktop session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    /// The per-user session bus.
    Session,
    /// The system-wide bus.
    System,
}

/// A single parsed server address: a transport name and its options.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::address::parse_address;
///
/// let addresses = parse_address("unix:path=/tmp/dbus%20test")?;
/// assert_eq!(addresses[0].transport(), "unix");
/// assert_eq!(addresses[0].option("path"), Some("/tmp/dbus test"));
/// # Ok::<_, tokio_dbus_next::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    transport: String,
    options: HashMap<String, String>,
}

impl BusAddress {
    /// The transport of the address, such as `unix` or `tcp`.
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Look up an option by key.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

#[inline]
fn invalid(message: impl Into<Box<str>>) -> Error {
    Error::new(ErrorKind::InvalidAddress(message.into()))
}

/// Parse a D-Bus address string into its list of server addresses.
///
/// An address takes the form `transport:key=value[,key=value]*`, and multiple
/// addresses separated by `;` are tried in order when connecting. Option
/// values may contain `%HH` hex escapes.
pub fn parse_address(address: &str) -> Result<Vec<BusAddress>> {
    if address.is_empty() {
        return Err(invalid("address must not be empty"));
    }

    let mut addresses = Vec::new();

    for part in address.split(';') {
        if part.is_empty() {
            continue;
        }

        let Some((transport, options)) = part.split_once(':') else {
            return Err(invalid(format!(
                "address `{part}` must take the form `transport:options`"
            )));
        };

        if transport.is_empty() {
            return Err(invalid(format!("address `{part}` is missing a transport")));
        }

        let mut parsed = HashMap::new();

        for option in options.split(',') {
            if option.is_empty() {
                continue;
            }

            let Some((key, value)) = option.split_once('=') else {
                return Err(invalid(format!(
                    "option `{option}` must take the form `key=value`"
                )));
            };

            parsed.insert(key.to_owned(), unescape(value)?);
        }

        addresses.push(BusAddress {
            transport: transport.to_owned(),
            options: parsed,
        });
    }

    if addresses.is_empty() {
        return Err(invalid("address contains no entries"));
    }

    Ok(addresses)
}

/// Determine the address of the given bus from the environment.
///
/// The session bus address comes from `DBUS_SESSION_BUS_ADDRESS`, the system
/// bus from `DBUS_SYSTEM_BUS_ADDRESS` with a fallback to the well-known
/// address `unix:path=/var/run/dbus/system_bus_socket`.
pub fn get_bus_address(bus_type: BusType) -> Result<String> {
    match bus_type {
        BusType::Session => match env::var(ENV_SESSION_BUS) {
            Ok(address) => Ok(address),
            Err(..) => Err(Error::new(ErrorKind::MissingBus)),
        },
        BusType::System => match env::var(ENV_SYSTEM_BUS) {
            Ok(address) => Ok(address),
            Err(..) => Ok(DEFAULT_SYSTEM_BUS.to_owned()),
        },
    }
}

/// Decode `%HH` hex escapes in an option value.
fn unescape(value: &str) -> Result<String> {
    let mut out = Vec::with_capacity(value.len());
    let mut bytes = value.bytes();

    while let Some(b) = bytes.next() {
        if b != b'%' {
            out.push(b);
            continue;
        }

        let (Some(hi), Some(lo)) = (bytes.next(), bytes.next()) else {
            return Err(invalid(format!("truncated hex escape in `{value}`")));
        };

        let (Some(hi), Some(lo)) = ((hi as char).to_digit(16), (lo as char).to_digit(16)) else {
            return Err(invalid(format!("invalid hex escape in `{value}`")));
        };

        out.push((hi * 16 + lo) as u8);
    }

    match String::from_utf8(out) {
        Ok(out) => Ok(out),
        Err(..) => Err(invalid(format!("option value `{value}` is not valid UTF-8"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_path() {
        let addresses = parse_address("unix:path=/run/user/1000/bus").unwrap();
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].transport(), "unix");
        assert_eq!(addresses[0].option("path"), Some("/run/user/1000/bus"));
        assert_eq!(addresses[0].option("abstract"), None);
    }

    #[test]
    fn test_unix_abstract() {
        let addresses = parse_address("unix:abstract=/tmp/dbus-mrBNOcgHzz").unwrap();
        assert_eq!(addresses[0].option("abstract"), Some("/tmp/dbus-mrBNOcgHzz"));
    }

    #[test]
    fn test_tcp() {
        let addresses = parse_address("tcp:host=127.0.0.1,port=55556").unwrap();
        assert_eq!(addresses[0].transport(), "tcp");
        assert_eq!(addresses[0].option("host"), Some("127.0.0.1"));
        assert_eq!(addresses[0].option("port"), Some("55556"));
    }

    #[test]
    fn test_multiple_addresses() {
        let addresses =
            parse_address("unix:path=/tmp/one;tcp:host=localhost,port=1234").unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0].transport(), "unix");
        assert_eq!(addresses[1].transport(), "tcp");
    }

    #[test]
    fn test_hex_escapes() {
        let addresses = parse_address("unix:path=/tmp/with%20space%2c%41").unwrap();
        assert_eq!(addresses[0].option("path"), Some("/tmp/with space,A"));
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(parse_address("").is_err());
        assert!(parse_address(";").is_err());
        assert!(parse_address("unix").is_err());
        assert!(parse_address(":path=/tmp").is_err());
        assert!(parse_address("unix:path").is_err());
        assert!(parse_address("unix:path=/tmp/%4").is_err());
        assert!(parse_address("unix:path=/tmp/%zz").is_err());
    }

    #[test]
    fn test_system_bus_fallback() {
        // Only exercise the fallback when the variable is not set, the test
        // runner environment is not ours to mutate.
        if env::var(ENV_SYSTEM_BUS).is_err() {
            assert_eq!(get_bus_address(BusType::System).unwrap(), DEFAULT_SYSTEM_BUS);
        }
    }
}
