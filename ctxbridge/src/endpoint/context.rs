use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution environments that can take part in messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeContext {
    /// The coordinator (background page or service worker). Hosts the relay.
    #[serde(rename = "background")]
    Background,
    /// A devtools panel, bound to the inspected tab.
    #[serde(rename = "devtools")]
    Devtools,
    /// The toolbar popup.
    #[serde(rename = "popup")]
    Popup,
    /// The options page.
    #[serde(rename = "options")]
    Options,
    /// A content script injected in a tab (and possibly a sub-frame).
    #[serde(rename = "content-script")]
    ContentScript,
    /// The untrusted page context, reachable through its content script.
    #[serde(rename = "window")]
    Window,
    /// An offscreen document.
    #[serde(rename = "offscreen")]
    Offscreen,
    /// The side panel.
    #[serde(rename = "sidepanel")]
    SidePanel,
}

impl RuntimeContext {
    /// All known contexts.
    pub const ALL: [RuntimeContext; 8] = [
        RuntimeContext::Background,
        RuntimeContext::Devtools,
        RuntimeContext::Popup,
        RuntimeContext::Options,
        RuntimeContext::ContentScript,
        RuntimeContext::Window,
        RuntimeContext::Offscreen,
        RuntimeContext::SidePanel,
    ];

    /// The canonical name used in endpoint strings.
    pub fn name(self) -> &'static str {
        match self {
            RuntimeContext::Background => "background",
            RuntimeContext::Devtools => "devtools",
            RuntimeContext::Popup => "popup",
            RuntimeContext::Options => "options",
            RuntimeContext::ContentScript => "content-script",
            RuntimeContext::Window => "window",
            RuntimeContext::Offscreen => "offscreen",
            RuntimeContext::SidePanel => "sidepanel",
        }
    }

    /// Look up a context by its canonical name.
    pub fn from_name(name: &str) -> Option<RuntimeContext> {
        Self::ALL.into_iter().find(|context| context.name() == name)
    }

    /// Whether endpoints of this kind are addressed per tab.
    pub fn is_per_tab(self) -> bool {
        matches!(
            self,
            RuntimeContext::Devtools | RuntimeContext::ContentScript | RuntimeContext::Window
        )
    }

    /// Whether this context runs with extension privileges.
    pub fn is_internal(self) -> bool {
        self != RuntimeContext::Window
    }
}

impl fmt::Display for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
