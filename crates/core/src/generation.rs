//! Backend-neutral shape of a generation turn.

use crate::error::GenerationError;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ModelEventStream = BoxStream<'static, Result<ModelEvent, GenerationError>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TurnMessage {
    User(String),
    Model(String),
    ToolCall(ToolCall),
    ToolResult {
        name: String,
        content: String,
        is_error: bool,
    },
}

/// One retrieved passage as presented to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceBlock {
    pub marker: usize,
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationTurn {
    pub system: String,
    pub question: String,
    pub sources: Vec<SourceBlock>,
    pub messages: Vec<TurnMessage>,
    pub tools: Vec<ToolSchema>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl GenerationTurn {
    pub fn tool_results(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        self.messages.iter().filter_map(|message| match message {
            TurnMessage::ToolResult {
                name,
                content,
                is_error,
            } => Some((name.as_str(), content.as_str(), *is_error)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    Text(String),
    ToolCall(ToolCall),
}
