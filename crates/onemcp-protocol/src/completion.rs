//! Completion (argument autocompletion) types.

use serde::{Deserialize, Serialize};

/// Reference to the prompt whose argument is being completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptReference {
    pub name: String,
}

/// Reference to the resource template whose argument is being completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTemplateReference {
    pub uri: String,
}

/// What a completion request refers to, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompletionReference {
    #[serde(rename = "ref/prompt")]
    Prompt(PromptReference),
    #[serde(rename = "ref/resource")]
    ResourceTemplate(ResourceTemplateReference),
}

impl CompletionReference {
    pub fn prompt(name: impl Into<String>) -> Self {
        CompletionReference::Prompt(PromptReference { name: name.into() })
    }

    pub fn resource(uri: impl Into<String>) -> Self {
        CompletionReference::ResourceTemplate(ResourceTemplateReference { uri: uri.into() })
    }
}

/// The argument being completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequestArgument {
    pub name: String,
    pub value: String,
}

/// Parameters for `completion/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteParams {
    #[serde(rename = "ref")]
    pub reference: CompletionReference,
    pub argument: CompleteRequestArgument,
}

impl CompleteParams {
    pub fn new(reference: CompletionReference, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            reference,
            argument: CompleteRequestArgument {
                name: name.into(),
                value: value.into(),
            },
        }
    }
}

/// Candidate values for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionValues {
    pub values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
}

impl CompletionValues {
    pub fn new(values: Vec<String>) -> Self {
        Self {
            values,
            total: None,
            has_more: None,
        }
    }
}

/// Result of `completion/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteResult {
    pub completion: CompletionValues,
}

impl CompleteResult {
    pub fn new(values: Vec<String>) -> Self {
        Self {
            completion: CompletionValues::new(values),
        }
    }

    /// An empty completion, used when nothing matches.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}
