use crate::error::Error;
use std::fmt;
use std::str::FromStr;

const INPROC_SCHEME: &str = "inproc://";
const TCP_SCHEME: &str = "tcp://";

/// Which transport an endpoint names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Same-process handoff, no OS networking involved.
    InProc,
    /// Length-framed TCP stream.
    Tcp,
}

/// An endpoint address: transport kind plus target.
///
/// Parsed from strings such as `inproc://quotes` or `tcp://127.0.0.1:5555`.
/// For TCP the target is anything [`std::net::ToSocketAddrs`] resolves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    kind: TransportKind,
    address: String,
}

impl Endpoint {
    pub fn inproc(name: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::InProc,
            address: name.into(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Tcp,
            address: address.into(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The target without the scheme prefix.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, address) = if let Some(rest) = s.strip_prefix(INPROC_SCHEME) {
            (TransportKind::InProc, rest)
        } else if let Some(rest) = s.strip_prefix(TCP_SCHEME) {
            (TransportKind::Tcp, rest)
        } else {
            return Err(Error::InvalidEndpoint(s.to_string()));
        };

        if address.is_empty() {
            return Err(Error::InvalidEndpoint(s.to_string()));
        }
        if kind == TransportKind::Tcp && !address.contains(':') {
            return Err(Error::InvalidEndpoint(s.to_string()));
        }

        Ok(Self {
            kind,
            address: address.to_string(),
        })
    }
}

/// Conversion into an [`Endpoint`], accepted by every bind and connect call.
pub trait IntoEndpoint {
    fn into_endpoint(self) -> Result<Endpoint, Error>;
}

impl IntoEndpoint for Endpoint {
    fn into_endpoint(self) -> Result<Endpoint, Error> {
        Ok(self)
    }
}

impl IntoEndpoint for &Endpoint {
    fn into_endpoint(self) -> Result<Endpoint, Error> {
        Ok(self.clone())
    }
}

impl IntoEndpoint for &str {
    fn into_endpoint(self) -> Result<Endpoint, Error> {
        self.parse()
    }
}

impl IntoEndpoint for String {
    fn into_endpoint(self) -> Result<Endpoint, Error> {
        self.parse()
    }
}

impl IntoEndpoint for &String {
    fn into_endpoint(self) -> Result<Endpoint, Error> {
        self.parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::InProc => write!(f, "{INPROC_SCHEME}{}", self.address),
            TransportKind::Tcp => write!(f, "{TCP_SCHEME}{}", self.address),
        }
    }
}
