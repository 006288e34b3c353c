//! Fixed values shared by the responder, the recorder and the lifecycle.

/// Every record emitted by this server carries this protocol name.
pub const INTERACTION_PROTOCOL: &str = "ldap";

/// Width of a correlation identifier as it appears in a probe's base DN.
pub const UNIQUE_ID_LENGTH: usize = 33;
/// Prefix of the identifier used as the storage lookup key. The remaining
/// characters are a nonce that only the storage layer cares about.
pub const CORRELATION_KEY_LENGTH: usize = 20;

pub const DEFAULT_LDAP_ADDRESS: &str = "0.0.0.0:389";

pub const OID_STARTTLS: &str = "1.3.6.1.4.1.1466.20037";
pub const OID_WHOAMI: &str = "1.3.6.1.4.1.4203.1.11.3";

pub const DIAG_DEFAULT_BIND: &str = "Default binding behavior set to return Success";
pub const DIAG_NOT_IMPLEMENTED: &str = "Operation not implemented by server";

/// Attributes of the synthetic entry returned for every search, in order.
pub const SYNTHETIC_ENTRY_CN: &str = "ldapcatch";
pub const SYNTHETIC_ENTRY_ATTRS: &[(&str, &[&str])] = &[
    ("mail", &["catch@ldap.invalid", "catch@ldap.invalid"]),
    ("company", &["aaa"]),
    ("department", &["bbbb"]),
    ("l", &["cccc"]),
    ("mobile", &["123456789"]),
    ("telephoneNumber", &["123456789"]),
    ("cn", &["catch"]),
];
