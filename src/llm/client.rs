use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::prompts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// JSON schema the response is expected to conform to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: String,
    pub schema: Value,
}

/// One call to a generation backend: role-tagged messages plus an optional target schema.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub schema: Option<ResponseSchema>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: ResponseSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Concatenated system messages, or None when there are none.
    pub fn system_text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }

    /// Non-system messages in order.
    pub fn conversation(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter().filter(|m| m.role != Role::System)
    }

    pub fn user_text(&self) -> String {
        self.conversation()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Canned responses for `--dry-run`, one per stage.
pub struct MockLlmClient;

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let prompt = request.user_text();

        if prompt.contains(prompts::STACK_MARKER) {
            Ok(r#"{"languages": ["Python"], "frameworks": []}"#.to_string())
        } else if prompt.contains(prompts::UNITS_MARKER) {
            Ok(r#"{
  "snippets": [
    {
      "id": "add-1",
      "path": "calculator.py",
      "name": "add",
      "type": "function",
      "code": "def add(a, b):\n    return a + b"
    }
  ]
}"#
            .to_string())
        } else if prompt.contains(prompts::CASES_MARKER) {
            Ok(r#"{
  "test_cases_result": [
    {
      "function": "add",
      "function_id": "add-1",
      "function_path": "calculator.py",
      "test_cases": [
        {
          "test_case_id": "tc-1",
          "category": "Functional Cases > Core functionality",
          "test_name": "test_add_positive_numbers",
          "description": "Adding two positive integers returns their sum",
          "test_data": {"a": 2, "b": 3},
          "expected_output": 5,
          "is_regression": false
        },
        {
          "test_case_id": "tc-2",
          "category": "Edge Cases > Boundary value analysis",
          "test_name": "test_add_zero",
          "description": "Adding zero is the identity",
          "test_data": {"a": 0, "b": 7},
          "expected_output": 7,
          "is_regression": false
        }
      ]
    }
  ]
}"#
            .to_string())
        } else if prompt.contains(prompts::CODE_MARKER) {
            Ok(r#"{
  "test_code_result": [
    {
      "unit_test_code": "from calculator import add\n\n\ndef test_add_positive_numbers():\n    assert add(2, 3) == 5\n\n\ndef test_add_zero():\n    assert add(0, 7) == 7\n",
      "test_library": "pytest",
      "name_unit_test_file": "test_add.py",
      "path": "tests/test_add.py",
      "category": "Functional Cases > Core functionality",
      "project_root_path": null
    }
  ]
}"#
            .to_string())
        } else {
            Ok(r#"{"status": "mock"}"#.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_text_joins_system_messages_only() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("You are a tester."),
            ChatMessage::user("Write tests."),
            ChatMessage::system("Answer in JSON."),
        ]);
        assert_eq!(
            request.system_text().as_deref(),
            Some("You are a tester.\n\nAnswer in JSON.")
        );
        assert_eq!(request.user_text(), "Write tests.");
        assert_eq!(request.conversation().count(), 1);
    }

    #[test]
    fn test_no_system_messages() {
        let request = CompletionRequest::new(vec![ChatMessage::user("hi")]);
        assert!(request.system_text().is_none());
        assert!(request.schema.is_none());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_value(ChatMessage::system("x")).unwrap();
        assert_eq!(json["role"], "system");
    }

    #[tokio::test]
    async fn test_mock_answers_each_stage() {
        let mock = MockLlmClient::new();
        for marker in [
            prompts::STACK_MARKER,
            prompts::UNITS_MARKER,
            prompts::CASES_MARKER,
            prompts::CODE_MARKER,
        ] {
            let request = CompletionRequest::new(vec![ChatMessage::user(format!("... {} ...", marker))]);
            let response = mock.complete(&request).await.unwrap();
            let value: Value = serde_json::from_str(&response).unwrap();
            assert!(value.is_object());
            assert!(value.get("status").is_none(), "no canned response for {}", marker);
        }
    }
}
