//! Server-advertised capabilities and the predicates features test them with.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Capabilities from the `initialize` response, kept as raw JSON.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct ServerCapabilities(Value);

impl ServerCapabilities {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Extract `result.capabilities` from an `initialize` result.
    pub fn from_initialize_result(result: &Value) -> Self {
        Self(result.get("capabilities").cloned().unwrap_or(Value::Null))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// A provider is advertised when its key exists and is neither `null` nor `false`.
    pub fn has_provider(&self, key: &str) -> bool {
        match self.0.get(key) {
            None | Some(Value::Null | Value::Bool(false)) => false,
            Some(_) => true,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.has_provider(capability.provider_key())
    }

    /// `codeLensProvider.resolveProvider` and similar nested flags.
    pub fn provider_flag(&self, key: &str, flag: &str) -> bool {
        self.0.get(key).and_then(|p| p.get(flag)).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// The editor features a fanout is typically issued for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Completion,
    CodeLens,
    CodeAction,
    Definition,
    DocumentHighlight,
    DocumentLink,
    DocumentSymbol,
    Formatting,
    Hover,
    InlayHint,
    References,
}

impl Capability {
    pub const ALL: [Self; 11] = [
        Self::Completion,
        Self::CodeLens,
        Self::CodeAction,
        Self::Definition,
        Self::DocumentHighlight,
        Self::DocumentLink,
        Self::DocumentSymbol,
        Self::Formatting,
        Self::Hover,
        Self::InlayHint,
        Self::References,
    ];

    pub fn provider_key(self) -> &'static str {
        match self {
            Self::Completion => "completionProvider",
            Self::CodeLens => "codeLensProvider",
            Self::CodeAction => "codeActionProvider",
            Self::Definition => "definitionProvider",
            Self::DocumentHighlight => "documentHighlightProvider",
            Self::DocumentLink => "documentLinkProvider",
            Self::DocumentSymbol => "documentSymbolProvider",
            Self::Formatting => "documentFormattingProvider",
            Self::Hover => "hoverProvider",
            Self::InlayHint => "inlayHintProvider",
            Self::References => "referencesProvider",
        }
    }

    pub fn method(self) -> &'static str {
        match self {
            Self::Completion => "textDocument/completion",
            Self::CodeLens => "textDocument/codeLens",
            Self::CodeAction => "textDocument/codeAction",
            Self::Definition => "textDocument/definition",
            Self::DocumentHighlight => "textDocument/documentHighlight",
            Self::DocumentLink => "textDocument/documentLink",
            Self::DocumentSymbol => "textDocument/documentSymbol",
            Self::Formatting => "textDocument/formatting",
            Self::Hover => "textDocument/hover",
            Self::InlayHint => "textDocument/inlayHint",
            Self::References => "textDocument/references",
        }
    }

    /// Map an LSP method back to the capability guarding it.
    pub fn for_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.method() == method)
    }
}
