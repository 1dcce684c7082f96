//! Access-policy request framing and response rendering.
//!
//! A request is a sequence of `name=value` lines terminated by an empty
//! line; the value may itself contain `=`, so a line is split on the first
//! one only. The response is a single `action=<verb> [arg]` line followed
//! by an empty line. One request, one response, then the connection closes.

use std::collections::HashMap;
use thiserror::Error;

/// The only request type the daemon understands.
pub const POLICY_REQUEST: &str = "smtpd_access_policy";

/// The neutral verb: the MTA makes its own decision.
pub const NEUTRAL_ACTION: &str = "DUNNO";

/// The verb that asks the MTA to prepend a header to the message.
pub const PREPEND_ACTION: &str = "PREPEND";

/// Maximum accepted length of a single request line, in bytes.
pub const MAX_LINE_LEN: usize = 4096;

/// Maximum number of attributes accepted in one request.
pub const MAX_ATTRS: usize = 64;

/// Attribute names that are semantically significant to the policy engine.
pub mod attr {
    /// Request type discriminator; must equal [`super::POLICY_REQUEST`].
    pub const REQUEST: &str = "request";
    /// Textual client IP address, v4 or v6.
    pub const CLIENT_ADDRESS: &str = "client_address";
    /// Reverse-DNS-derived client host name.
    pub const CLIENT_NAME: &str = "client_name";
    /// Envelope sender address.
    pub const SENDER: &str = "sender";
    /// Envelope recipient address.
    pub const RECIPIENT: &str = "recipient";
}

/// Errors raised while framing a request from the line stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A line contained no `=` separator.
    #[error("request line without '=' separator")]
    BareLine,
    /// A line exceeded [`MAX_LINE_LEN`].
    #[error("request line too long: max {max}, got {actual}")]
    LineTooLong {
        /// Maximum accepted line length.
        max: usize,
        /// Actual line length received.
        actual: usize,
    },
    /// The request carried more than [`MAX_ATTRS`] attributes.
    #[error("too many request attributes: max {0}")]
    TooManyAttrs(usize),
}

/// One parsed policy request: an unordered attribute map.
///
/// Attributes other than the ones in [`attr`] are accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    attrs: HashMap<String, String>,
}

impl Request {
    /// Creates an empty request to be fed lines via [`Request::push_line`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one `name=value` line to the request.
    ///
    /// The caller is expected to strip the line terminator first and to
    /// treat an empty line as end-of-request rather than pushing it.
    pub fn push_line(&mut self, line: &str) -> Result<(), FrameError> {
        if line.len() > MAX_LINE_LEN {
            return Err(FrameError::LineTooLong {
                max: MAX_LINE_LEN,
                actual: line.len(),
            });
        }
        let (name, value) = line.split_once('=').ok_or(FrameError::BareLine)?;
        if self.attrs.len() >= MAX_ATTRS {
            return Err(FrameError::TooManyAttrs(MAX_ATTRS));
        }
        self.attrs.insert(name.to_owned(), value.to_owned());
        Ok(())
    }

    /// Builds a request from an iterator of already-framed lines.
    pub fn from_lines<'a, I>(lines: I) -> Result<Self, FrameError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut request = Self::new();
        for line in lines {
            request.push_line(line)?;
        }
        Ok(request)
    }

    /// Looks up an attribute value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// The textual client IP address, if present.
    #[must_use]
    pub fn client_address(&self) -> Option<&str> {
        self.get(attr::CLIENT_ADDRESS)
    }

    /// The client host name, if present.
    #[must_use]
    pub fn client_name(&self) -> Option<&str> {
        self.get(attr::CLIENT_NAME)
    }

    /// The envelope sender, if present.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.get(attr::SENDER)
    }

    /// The envelope recipient, if present.
    #[must_use]
    pub fn recipient(&self) -> Option<&str> {
        self.get(attr::RECIPIENT)
    }

    /// Whether this request can be fed to the policy engine.
    ///
    /// True iff `request` equals [`POLICY_REQUEST`] and all four significant
    /// attributes are present and non-empty.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.get(attr::REQUEST) == Some(POLICY_REQUEST)
            && [
                attr::CLIENT_ADDRESS,
                attr::CLIENT_NAME,
                attr::SENDER,
                attr::RECIPIENT,
            ]
            .into_iter()
            .all(|name| self.get(name).is_some_and(|v| !v.is_empty()))
    }

    /// Number of attributes in the request.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Whether the request holds no attributes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

/// A single policy response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    action: String,
}

impl Response {
    /// The neutral no-opinion response.
    #[must_use]
    pub fn dunno() -> Self {
        Self::verb(NEUTRAL_ACTION)
    }

    /// A response carrying a bare verb.
    #[must_use]
    pub fn verb(verb: &str) -> Self {
        Self {
            action: verb.to_owned(),
        }
    }

    /// A response carrying a verb and an argument, e.g. defer text.
    #[must_use]
    pub fn with_arg(verb: &str, arg: &str) -> Self {
        Self {
            action: format!("{verb} {arg}"),
        }
    }

    /// A `PREPEND` response asking the MTA to add the given header.
    #[must_use]
    pub fn prepend(header: &str) -> Self {
        Self::with_arg(PREPEND_ACTION, header)
    }

    /// The action string without framing, for logging.
    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Serializes the response for the wire.
    #[must_use]
    pub fn render(&self) -> String {
        format!("action={}\n\n", self.action)
    }
}
