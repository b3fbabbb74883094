use std::fmt;
use std::io;
use std::str::Utf8Error;

/// Result alias using [`Error`] as the error type by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised by this crate.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Self { kind }
    }

    /// The error kind, for callers that want to match on broad categories.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// If this is a [`RemoteError`] (a `MethodReturn` of type `Error`),
    /// return it.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match &self.kind {
            ErrorKind::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Self::new(ErrorKind::Io(error))
    }
}

impl From<Utf8Error> for Error {
    fn from(error: Utf8Error) -> Self {
        Self::new(ErrorKind::Utf8(error))
    }
}

/// A remote method-return of type `Error`, surfaced to the awaiting caller.
#[derive(Debug, Clone)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// The kind of error raised by this crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    // -- codec --
    /// Attempted to read past the end of the available data.
    BufferOverrun,
    /// Attempted to read past the end of the signature.
    SignatureOverrun,
    /// Encountered a type code that doesn't belong where the target
    /// expected it.
    UnexpectedCode { code: u8, target: &'static str },
    /// A `{` appeared outside of `a{...}`, or a dict-entry struct held
    /// something other than exactly two types.
    ExpectedDictEntry,
    /// An unknown D-Bus type code.
    UnknownTypeCode(u8),
    /// A signature is syntactically invalid (mismatched parens/braces,
    /// truncated container, empty signature where one is required).
    InvalidSignature(&'static str),
    /// Signature exceeds the protocol's maximum nesting depth (32).
    SignatureTooDeep,
    /// A message's first byte was neither `'l'` nor `'B'`.
    InvalidEndianness(u8),
    /// The host value has no representable D-Bus signature.
    SignatureUnsupported,
    /// An object path failed validation.
    InvalidObjectPath,
    /// A string used as a D-Bus string/path/signature contained an
    /// embedded or missing NUL terminator.
    NotNullTerminated,
    /// A UTF-8 string failed to decode.
    Utf8(Utf8Error),

    // -- transport --
    /// Failed to dial the transport's address.
    Io(io::Error),
    /// No known bus address: neither `DBUS_SESSION_BUS_ADDRESS` nor
    /// `DBUS_SYSTEM_BUS_ADDRESS` (nor a compiled-in default) was set.
    MissingBus,
    /// A bus address string could not be parsed.
    InvalidAddress,
    /// An address used a scheme this crate doesn't implement
    /// (`nonce-tcp`, `launchd`, `systemd`, `unixexec`, or anything else
    /// unrecognized).
    UnknownTransport(String),
    /// A transport option required by its scheme (e.g. `path=` or
    /// `abstract=` for `unix:`) was missing.
    MissingTransportOption(&'static str),
    /// `unix:abstract=` was requested but this build has no `libc`
    /// feature, which the abstract-namespace socket needs for raw
    /// `sockaddr_un` construction.
    AbstractSocketUnavailable,

    // -- auth --
    /// No SASL mechanism was accepted by the server.
    AuthFailed,
    /// The server sent a SASL line this client doesn't understand.
    MalformedSaslLine,
    /// The server sent `ERROR` during SASL negotiation.
    SaslError(String),
    /// A mechanism received `DATA` it doesn't know how to process.
    UnexpectedSaslData,
    /// `DBUS_COOKIE_SHA1`: the referenced cookie file or cookie id could
    /// not be found.
    MissingCookie,

    // -- message / protocol --
    /// A `MethodCall` is missing its required `PATH` header.
    MissingPath,
    /// A `MethodCall` or `Signal` is missing its required `MEMBER`
    /// header.
    MissingMember,
    /// A `MethodReturn` or `Error` is missing its required
    /// `REPLY_SERIAL` header.
    MissingReplySerial,
    /// An `Error` message is missing its required `ERROR_NAME` header.
    MissingErrorName,
    /// A `Signal` is missing its required `INTERFACE` header.
    MissingInterface,
    /// The message's serial field was zero (serials are 1-based; 0 means
    /// unset).
    ZeroSerial,
    /// Attempted to assign a serial to a message that already has one.
    SerialAlreadySet,
    /// The connection was closed, or the receive loop terminated.
    ConnectionClosed,
    /// A remote method call returned a message of type `Error`.
    Remote(RemoteError),
    /// Violated an internal precondition (e.g. building a `MethodReturn`
    /// from a message that isn't a `MethodCall`). Never returned for
    /// malformed remote input; only for misuse of this crate's own API.
    Programming(&'static str),

    // -- introspection --
    /// The introspection XML failed to parse.
    InvalidIntrospectionXml(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::BufferOverrun => write!(f, "buffer overrun"),
            ErrorKind::SignatureOverrun => write!(f, "signature overrun"),
            ErrorKind::UnexpectedCode { code, target } => {
                write!(f, "unexpected type code {:?} for {target}", *code as char)
            }
            ErrorKind::ExpectedDictEntry => write!(f, "expected a dict entry"),
            ErrorKind::UnknownTypeCode(code) => {
                write!(f, "unknown type code {:?}", *code as char)
            }
            ErrorKind::InvalidSignature(why) => write!(f, "invalid signature: {why}"),
            ErrorKind::SignatureTooDeep => write!(f, "signature nesting too deep"),
            ErrorKind::InvalidEndianness(code) => {
                write!(f, "invalid endianness byte {:?}", *code as char)
            }
            ErrorKind::SignatureUnsupported => {
                write!(f, "value has no representable D-Bus signature")
            }
            ErrorKind::InvalidObjectPath => write!(f, "invalid object path"),
            ErrorKind::NotNullTerminated => write!(f, "string is not null terminated"),
            ErrorKind::Utf8(error) => write!(f, "UTF-8 error: {error}"),
            ErrorKind::Io(error) => write!(f, "I/O error: {error}"),
            ErrorKind::MissingBus => write!(f, "no D-Bus address configured"),
            ErrorKind::InvalidAddress => write!(f, "invalid D-Bus address"),
            ErrorKind::UnknownTransport(scheme) => {
                write!(f, "unknown or unsupported transport {scheme:?}")
            }
            ErrorKind::MissingTransportOption(name) => {
                write!(f, "transport is missing required option {name:?}")
            }
            ErrorKind::AbstractSocketUnavailable => {
                write!(f, "unix:abstract= requires the libc feature")
            }
            ErrorKind::AuthFailed => write!(f, "could not authenticate with any mechanism"),
            ErrorKind::MalformedSaslLine => write!(f, "malformed SASL line from server"),
            ErrorKind::SaslError(text) => write!(f, "SASL error from server: {text}"),
            ErrorKind::UnexpectedSaslData => write!(f, "unexpected SASL DATA"),
            ErrorKind::MissingCookie => write!(f, "DBUS_COOKIE_SHA1 cookie not found"),
            ErrorKind::MissingPath => write!(f, "missing required PATH header"),
            ErrorKind::MissingMember => write!(f, "missing required MEMBER header"),
            ErrorKind::MissingReplySerial => write!(f, "missing required REPLY_SERIAL header"),
            ErrorKind::MissingErrorName => write!(f, "missing required ERROR_NAME header"),
            ErrorKind::MissingInterface => write!(f, "missing required INTERFACE header"),
            ErrorKind::ZeroSerial => write!(f, "zero serial"),
            ErrorKind::SerialAlreadySet => write!(f, "message already has a serial"),
            ErrorKind::ConnectionClosed => write!(f, "connection closed"),
            ErrorKind::Remote(remote) => write!(f, "remote error: {remote}"),
            ErrorKind::Programming(why) => write!(f, "programming error: {why}"),
            ErrorKind::InvalidIntrospectionXml(why) => {
                write!(f, "invalid introspection XML: {why}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ErrorKind::Io(error) => Some(error),
            ErrorKind::Utf8(error) => Some(error),
            _ => None,
        }
    }
}
