use super::RuntimeContext;
use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Addressable identity of a context.
///
/// Per-tab kinds carry a resolved `tab_id` once they have passed through the
/// relay. Before that, a tab-less per-tab destination means "in the sender's
/// tab". Global kinds never carry a tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// The context kind.
    pub context: RuntimeContext,
    /// Tab the context lives in, for per-tab kinds.
    #[serde(default)]
    pub tab_id: Option<u32>,
    /// Frame within the tab. `0` is the top frame.
    #[serde(default)]
    pub frame_id: Option<u32>,
}

impl Endpoint {
    /// An endpoint with no tab or frame.
    pub fn new(context: RuntimeContext) -> Self {
        Self {
            context,
            tab_id: None,
            frame_id: None,
        }
    }

    /// An endpoint in the given tab. The tab is ignored for global kinds.
    pub fn in_tab(context: RuntimeContext, tab_id: u32) -> Self {
        Self {
            context,
            tab_id: context.is_per_tab().then_some(tab_id),
            frame_id: None,
        }
    }

    /// Set the frame id.
    pub fn with_frame(mut self, frame_id: u32) -> Self {
        self.frame_id = Some(frame_id);
        self
    }

    /// Soft-parse an endpoint string.
    ///
    /// Unrecognized input yields a [`ParsedEndpoint`] without a context;
    /// validate it with [`ParsedEndpoint::into_endpoint`].
    pub fn parse(input: &str) -> ParsedEndpoint {
        let unknown = || ParsedEndpoint {
            raw: input.to_string(),
            context: None,
            tab_id: None,
            frame_id: None,
        };

        let (kind, suffix) = match input.split_once('@') {
            Some((kind, suffix)) => (kind, Some(suffix)),
            None => (input, None),
        };
        let Some(context) = RuntimeContext::from_name(kind) else {
            return unknown();
        };

        let (tab_id, frame_id) = match suffix {
            None => (None, None),
            Some(_) if !context.is_per_tab() => return unknown(),
            Some(suffix) => {
                let (tab, frame) = match suffix.split_once('.') {
                    Some((tab, frame)) => (tab, Some(frame)),
                    None => (suffix, None),
                };
                let Some(tab) = parse_id(tab) else {
                    return unknown();
                };
                let frame = match frame {
                    Some(frame) => match parse_id(frame) {
                        Some(frame) => Some(frame),
                        None => return unknown(),
                    },
                    None => None,
                };
                (Some(tab), frame)
            }
        };

        ParsedEndpoint {
            raw: input.to_string(),
            context: Some(context),
            tab_id,
            frame_id,
        }
    }

    /// Key under which the relay tracks this endpoint's connection.
    ///
    /// The page context holds no connection of its own, so `window` resolves
    /// to the content script hosting it.
    pub fn connection_id(&self) -> String {
        let context = match self.context {
            RuntimeContext::Window => RuntimeContext::ContentScript,
            other => other,
        };
        Endpoint {
            context,
            tab_id: self.tab_id,
            frame_id: self.frame_id,
        }
        .to_string()
    }

    /// Whether this is the bare identity of `context` (no tab, no frame).
    pub fn is_bare(&self, context: RuntimeContext) -> bool {
        self.context == context && self.tab_id.is_none() && self.frame_id.is_none()
    }
}

fn parse_id(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.context.name())?;
        if !self.context.is_per_tab() {
            return Ok(());
        }
        if let Some(tab_id) = self.tab_id {
            write!(f, "@{tab_id}")?;
            if let Some(frame_id) = self.frame_id.filter(|frame| *frame != 0) {
                write!(f, ".{frame_id}")?;
            }
        }
        Ok(())
    }
}

/// Result of soft-parsing an endpoint string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEndpoint {
    /// The input string.
    pub raw: String,
    /// The context kind, `None` when the string was not recognized.
    pub context: Option<RuntimeContext>,
    /// Parsed tab id.
    pub tab_id: Option<u32>,
    /// Parsed frame id.
    pub frame_id: Option<u32>,
}

impl ParsedEndpoint {
    /// Whether the string named a known context.
    pub fn is_valid(&self) -> bool {
        self.context.is_some()
    }

    /// Validate into an [`Endpoint`].
    pub fn into_endpoint(self) -> Result<Endpoint, BridgeError> {
        match self.context {
            Some(context) => Ok(Endpoint {
                context,
                tab_id: self.tab_id,
                frame_id: self.frame_id,
            }),
            None => Err(BridgeError::InvalidDestination {
                destination: self.raw,
            }),
        }
    }
}

/// Where a message should go, as given by the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// An endpoint string such as `content-script@12`.
    Named(String),
    /// An already-built endpoint.
    Endpoint(Endpoint),
}

impl Destination {
    /// Validate into an endpoint.
    pub fn resolve(self) -> Result<Endpoint, BridgeError> {
        match self {
            Destination::Named(name) => Endpoint::parse(&name).into_endpoint(),
            Destination::Endpoint(endpoint) => Ok(endpoint),
        }
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Destination::Named(name.to_string())
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Destination::Named(name)
    }
}

impl From<Endpoint> for Destination {
    fn from(endpoint: Endpoint) -> Self {
        Destination::Endpoint(endpoint)
    }
}

impl From<RuntimeContext> for Destination {
    fn from(context: RuntimeContext) -> Self {
        Destination::Endpoint(Endpoint::new(context))
    }
}
