//! The D-Bus type system, as described by signature strings.

#[cfg(test)]
mod tests;

use std::fmt;

use crate::error::{Error, ErrorKind, Result};
use crate::validators::is_object_path_valid;
use crate::value::Value;

/// The maximum length in bytes of a signature.
const MAX_SIGNATURE_LENGTH: usize = 255;

/// The maximum nesting of container types inside a single complete type.
const MAX_CONTAINER_DEPTH: usize = 32;

#[inline]
fn invalid(message: impl Into<Box<str>>) -> Error {
    Error::new(ErrorKind::InvalidSignature(message.into()))
}

#[inline]
fn mismatch(message: impl Into<Box<str>>) -> Error {
    Error::new(ErrorKind::SignatureBodyMismatch(message.into()))
}

/// A single complete type in a signature.
///
/// This is a node in the parse tree of a [`SignatureTree`]. Basic types have
/// no children, `a` has exactly one, `(` one or more, and `{` exactly two of
/// which the first is basic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SignatureType {
    token: char,
    children: Vec<SignatureType>,
    signature: String,
}

impl SignatureType {
    /// Parse a single complete type.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio_dbus_next::SignatureType;
    ///
    /// let ty = SignatureType::new("a{sv}")?;
    /// assert_eq!(ty.token(), 'a');
    /// assert_eq!(ty.signature(), "a{sv}");
    /// # Ok::<_, tokio_dbus_next::Error>(())
    /// ```
    pub fn new(signature: &str) -> Result<Self> {
        let tree = SignatureTree::new(signature)?;

        let [ty] = tree.types.as_slice() else {
            return Err(invalid(format!(
                "expected a single complete type, got `{signature}`"
            )));
        };

        Ok(ty.clone())
    }

    /// The token which introduces this type.
    pub fn token(&self) -> char {
        self.token
    }

    /// Child types of a container type.
    pub fn children(&self) -> &[SignatureType] {
        &self.children
    }

    /// The signature string of this type.
    ///
    /// This reproduces the exact substring this type was parsed from.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The wire alignment of this type in bytes.
    pub(crate) fn alignment(&self) -> usize {
        match self.token {
            'y' | 'g' | 'v' => 1,
            'n' | 'q' => 2,
            'b' | 'i' | 'u' | 'h' | 's' | 'o' | 'a' => 4,
            'x' | 't' | 'd' | '(' | '{' => 8,
            _ => 1,
        }
    }

    /// Test if this is a basic (non-container) type.
    pub(crate) fn is_basic(&self) -> bool {
        !matches!(self.token, 'a' | '(' | '{' | 'v')
    }

    /// Verify that a value conforms to this type.
    ///
    /// # Examples
    ///
    /// ```
    /// use tokio_dbus_next::{SignatureType, Value};
    ///
    /// let ty = SignatureType::new("as")?;
    /// assert!(ty.verify(&Value::Array(vec![Value::from("hello")])).is_ok());
    /// assert!(ty.verify(&Value::from(10u32)).is_err());
    /// # Ok::<_, tokio_dbus_next::Error>(())
    /// ```
    pub fn verify(&self, value: &Value) -> Result<()> {
        match (self.token, value) {
            ('y', Value::Byte(..)) => Ok(()),
            ('b', Value::Bool(..)) => Ok(()),
            ('n', Value::Int16(..)) => Ok(()),
            ('q', Value::Uint16(..)) => Ok(()),
            ('i', Value::Int32(..)) => Ok(()),
            ('u', Value::Uint32(..)) => Ok(()),
            ('x', Value::Int64(..)) => Ok(()),
            ('t', Value::Uint64(..)) => Ok(()),
            ('h', Value::UnixFd(..)) => Ok(()),
            ('d', Value::Double(value)) => {
                if !value.is_finite() {
                    return Err(mismatch("DOUBLE type `d` must be a finite number"));
                }

                Ok(())
            }
            ('s', Value::String(..)) => Ok(()),
            ('o', Value::ObjectPath(path)) => {
                if !is_object_path_valid(path) {
                    return Err(mismatch(format!(
                        "OBJECT_PATH type `o` must be a valid object path, got `{path}`"
                    )));
                }

                Ok(())
            }
            ('g', Value::Signature(signature)) => {
                if signature.len() > MAX_SIGNATURE_LENGTH {
                    return Err(mismatch(
                        "SIGNATURE type `g` must be less than 256 bytes",
                    ));
                }

                Ok(())
            }
            ('a', value) => self.verify_array(value),
            ('(', Value::Struct(fields)) => {
                if fields.len() != self.children.len() {
                    return Err(mismatch(format!(
                        "STRUCT type `{}` expects {} fields, got {}",
                        self.signature,
                        self.children.len(),
                        fields.len()
                    )));
                }

                for (child, field) in self.children.iter().zip(fields) {
                    child.verify(field)?;
                }

                Ok(())
            }
            // A variant is type checked on construction.
            ('v', Value::Variant(..)) => Ok(()),
            (token, value) => Err(mismatch(format!(
                "expected a value matching type `{token}`, got {}",
                value.type_name()
            ))),
        }
    }

    fn verify_array(&self, value: &Value) -> Result<()> {
        let child = &self.children[0];

        match (child.token, value) {
            ('{', Value::Dict(entries)) => {
                for (key, entry) in entries {
                    child.children[0].verify(key)?;
                    child.children[1].verify(entry)?;
                }

                Ok(())
            }
            // Byte arrays are carried as opaque buffers.
            ('y', Value::ByteArray(..)) => Ok(()),
            ('{' | 'y', value) | (_, value @ (Value::Dict(..) | Value::ByteArray(..))) => {
                Err(mismatch(format!(
                    "ARRAY type `{}` does not accept {}",
                    self.signature,
                    value.type_name()
                )))
            }
            (_, Value::Array(values)) => {
                for value in values {
                    child.verify(value)?;
                }

                Ok(())
            }
            (_, value) => Err(mismatch(format!(
                "ARRAY type `{}` does not accept {}",
                self.signature,
                value.type_name()
            ))),
        }
    }
}

impl fmt::Display for SignatureType {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.signature.fmt(f)
    }
}

/// An ordered sequence of single complete types parsed from a signature
/// string.
///
/// Equality is determined by the signature string.
///
/// # Examples
///
/// ```
/// use tokio_dbus_next::SignatureTree;
///
/// let tree = SignatureTree::new("sa{sv}(ii)")?;
/// assert_eq!(tree.types().len(), 3);
/// assert_eq!(tree.signature(), "sa{sv}(ii)");
/// # Ok::<_, tokio_dbus_next::Error>(())
/// ```
#[derive(Debug, Clone, Hash)]
pub struct SignatureTree {
    signature: String,
    types: Vec<SignatureType>,
}

impl SignatureTree {
    /// Parse a signature string into a tree.
    pub fn new(signature: &str) -> Result<Self> {
        if signature.len() > MAX_SIGNATURE_LENGTH {
            return Err(invalid("a signature must be less than 256 bytes"));
        }

        let bytes = signature.as_bytes();
        let mut types = Vec::new();
        let mut at = 0;

        while at < bytes.len() {
            let (ty, next) = parse_next(signature, at, 0)?;
            types.push(ty);
            at = next;
        }

        Ok(Self {
            signature: signature.to_owned(),
            types,
        })
    }

    /// The empty signature.
    pub fn empty() -> Self {
        Self {
            signature: String::new(),
            types: Vec::new(),
        }
    }

    /// The signature string this tree was parsed from.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// The top-level types of this signature.
    pub fn types(&self) -> &[SignatureType] {
        &self.types
    }

    /// Test if this is the empty signature.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Verify that a body conforms to this signature, value by value.
    pub fn verify_body(&self, body: &[Value]) -> Result<()> {
        if body.len() != self.types.len() {
            return Err(mismatch(format!(
                "the body has the wrong number of values (got {}, expected {})",
                body.len(),
                self.types.len()
            )));
        }

        for (ty, value) in self.types.iter().zip(body) {
            ty.verify(value)?;
        }

        Ok(())
    }
}

impl PartialEq for SignatureTree {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.signature == other.signature
    }
}

impl Eq for SignatureTree {}

impl fmt::Display for SignatureTree {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.signature.fmt(f)
    }
}

/// Parse the single complete type starting at `at`, returning it and the
/// position just past it.
fn parse_next(signature: &str, at: usize, depth: usize) -> Result<(SignatureType, usize)> {
    if depth > MAX_CONTAINER_DEPTH {
        return Err(invalid("exceeded maximum container recursion"));
    }

    let bytes = signature.as_bytes();

    let Some(&token) = bytes.get(at) else {
        return Err(invalid("expected a type token, got the end of the signature"));
    };

    match token {
        b'a' => {
            let (child, next) = parse_next(signature, at + 1, depth + 1)?;

            Ok((
                SignatureType {
                    token: 'a',
                    signature: signature[at..next].to_owned(),
                    children: vec![child],
                },
                next,
            ))
        }
        b'(' => {
            let mut children = Vec::new();
            let mut next = at + 1;

            loop {
                match bytes.get(next) {
                    Some(b')') => break,
                    Some(..) => {
                        let (child, n) = parse_next(signature, next, depth + 1)?;
                        children.push(child);
                        next = n;
                    }
                    None => return Err(invalid("missing closing `)` for struct")),
                }
            }

            if children.is_empty() {
                return Err(invalid("struct must have at least one type"));
            }

            Ok((
                SignatureType {
                    token: '(',
                    signature: signature[at..next + 1].to_owned(),
                    children,
                },
                next + 1,
            ))
        }
        b'{' => {
            let (key, next) = parse_next(signature, at + 1, depth + 1)?;

            if !key.is_basic() {
                return Err(invalid("expected a basic type for the dict entry key"));
            }

            let (value, next) = parse_next(signature, next, depth + 1)?;

            if bytes.get(next) != Some(&b'}') {
                return Err(invalid("missing closing `}` for dict entry"));
            }

            Ok((
                SignatureType {
                    token: '{',
                    signature: signature[at..next + 1].to_owned(),
                    children: vec![key, value],
                },
                next + 1,
            ))
        }
        b'y' | b'b' | b'n' | b'q' | b'i' | b'u' | b'x' | b't' | b'd' | b'h' | b's' | b'o'
        | b'g' | b'v' => Ok((
            SignatureType {
                token: token as char,
                signature: signature[at..at + 1].to_owned(),
                children: Vec::new(),
            },
            at + 1,
        )),
        token => Err(invalid(format!(
            "got unexpected token `{}`",
            token as char
        ))),
    }
}
