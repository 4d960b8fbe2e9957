//! The extended request line.
//!
//! A superset of the standard `git-proto-request`: after the pathname any
//! number of NUL-terminated `name=value` parameters may follow, and a double
//! NUL may introduce a second parameter block (protocol-version 2 options).
//! A request carrying only `host` is indistinguishable from the stock
//! protocol.
use std::collections::BTreeMap;
use std::fmt;

use bstr::BStr;

/// Parameters accepted from anonymous clients.
pub const SAFE_PARAMS: &[&str] = &[params::HOST, params::VERSION];

/// Well-known parameter names.
pub mod params {
    pub const HOST: &str = "host";
    pub const VERSION: &str = "version";
    pub const STATELESS_RPC: &str = "turnip-stateless-rpc";
    pub const ADVERTISE_REFS: &str = "turnip-advertise-refs";
    pub const REQUEST_ID: &str = "turnip-request-id";
    pub const CAN_AUTHENTICATE: &str = "turnip-can-authenticate";
    pub const AUTHENTICATED_USER: &str = "turnip-authenticated-user";
    pub const AUTHENTICATED_UID: &str = "turnip-authenticated-uid";
    pub const CLONE_FROM: &str = "clone_from";
}

/// Named request parameters, sorted by name.
pub type Params = BTreeMap<String, Vec<u8>>;

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid git-proto-request")]
    Invalid,
    #[error("Parameters must have values")]
    MissingValue,
    #[error("Parameters must not be repeated")]
    Repeated,
    #[error("Metacharacter in arguments")]
    Metacharacter,
}

/// A request command.
///
/// `Other` carries commands this process does not implement, so that proxies
/// can forward them for the backend to reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    UploadPack,
    ReceivePack,
    SetSymbolicRef,
    CreateRepo,
    Other(Vec<u8>),
}

impl Command {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            b"git-upload-pack" => Command::UploadPack,
            b"git-receive-pack" => Command::ReceivePack,
            b"turnip-set-symbolic-ref" => Command::SetSymbolicRef,
            b"turnip-create-repo" => Command::CreateRepo,
            other => Command::Other(other.to_vec()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Command::UploadPack => b"git-upload-pack",
            Command::ReceivePack => b"git-receive-pack",
            Command::SetSymbolicRef => b"turnip-set-symbolic-ref",
            Command::CreateRepo => b"turnip-create-repo",
            Command::Other(bytes) => bytes,
        }
    }

    /// Everything except `git-upload-pack` requires write access.
    pub fn is_write(&self) -> bool {
        !matches!(self, Command::UploadPack)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BStr::new(self.as_bytes()))
    }
}

/// A decoded request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub pathname: Vec<u8>,
    pub params: Params,
}

impl Request {
    pub fn new(command: Command, pathname: impl Into<Vec<u8>>, params: Params) -> Self {
        Self {
            command,
            pathname: pathname.into(),
            params,
        }
    }

    /// The request id assigned by the frontend, if any.
    pub fn request_id(&self) -> Option<String> {
        self.params
            .get(params::REQUEST_ID)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Encode into the wire form `command SP pathname NUL (name=value NUL)*`,
    /// parameters sorted by name.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let command = self.command.as_bytes();
        if command.contains(&b' ') || self.pathname.contains(&0) {
            return Err(Error::Metacharacter);
        }
        let mut out = Vec::with_capacity(command.len() + self.pathname.len() + 2);
        out.extend_from_slice(command);
        out.push(b' ');
        out.extend_from_slice(&self.pathname);
        out.push(0);
        for (name, value) in &self.params {
            if name.contains('=') || name.contains('\0') || value.contains(&0) {
                return Err(Error::Metacharacter);
            }
            out.extend_from_slice(name.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value);
            out.push(0);
        }
        Ok(out)
    }

    /// Decode a request line, accepting the optional double-NUL second
    /// parameter block and merging it into the parameter set.
    pub fn decode(data: &[u8]) -> Result<Self, Error> {
        let sp = data.iter().position(|b| *b == b' ').ok_or(Error::Invalid)?;
        let command = Command::from_bytes(&data[..sp]);
        let rest = &data[sp + 1..];

        // The pathname and every parameter are NUL-terminated, so the final
        // byte must be a NUL and the split ends with an empty piece.
        let mut bits: Vec<&[u8]> = rest.split(|b| *b == 0).collect();
        if bits.len() < 2 || !bits.last().unwrap().is_empty() {
            return Err(Error::Invalid);
        }
        bits.pop();
        let pathname = bits[0].to_vec();

        let mut params = Params::new();
        let mut second_block = false;
        let mut second_block_len = 0;
        for bit in &bits[1..] {
            if bit.is_empty() {
                // A double NUL opens the second parameter block; at most one
                // is allowed.
                if second_block {
                    return Err(Error::Invalid);
                }
                second_block = true;
                continue;
            }
            if second_block {
                second_block_len += 1;
            }
            let eq = bit.iter().position(|b| *b == b'=').ok_or(Error::MissingValue)?;
            let name =
                String::from_utf8(bit[..eq].to_vec()).map_err(|_| Error::Invalid)?;
            let value = bit[eq + 1..].to_vec();
            if params.insert(name, value).is_some() {
                return Err(Error::Repeated);
            }
        }
        if second_block && second_block_len == 0 {
            return Err(Error::Invalid);
        }
        Ok(Request {
            command,
            pathname,
            params,
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.command, BStr::new(&self.pathname))
    }
}
