// Chat completion request types (OpenAI wire shape).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One element of a multimodal message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    /// An image given as an `https://` or `data:` URL.
    pub fn image(url: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: None,
            },
        }
    }

    pub fn image_with_detail(url: impl Into<String>, detail: impl Into<String>) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: Some(detail.into()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }

    /// Plain text of the message; multimodal parts contribute their text.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A chat completion request, built fluently:
///
/// ```
/// use aidevs_llm::ChatRequest;
/// let request = ChatRequest::new("gpt-4o-mini")
///     .system("Odpowiadaj krótko.")
///     .user("Stolica Polski?")
///     .max_tokens(50);
/// assert_eq!(request.messages.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            max_tokens: None,
            temperature: None,
            response_format: None,
        }
    }

    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn messages(mut self, messages: impl IntoIterator<Item = ChatMessage>) -> Self {
        self.messages.extend(messages);
        self
    }

    pub fn system(self, text: impl Into<String>) -> Self {
        self.message(ChatMessage::system(text))
    }

    pub fn user(self, text: impl Into<String>) -> Self {
        self.message(ChatMessage::user(text))
    }

    pub fn user_parts(self, parts: Vec<ContentPart>) -> Self {
        self.message(ChatMessage::user_parts(parts))
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Ask for a JSON object reply.
    pub fn json_mode(mut self) -> Self {
        self.response_format = Some(json!({ "type": "json_object" }));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_request_serializes_to_openai_shape() {
        let request = ChatRequest::new("gpt-4")
            .system("sys")
            .user("pytanie")
            .temperature(0.0);
        let v = serde_json::to_value(&request).unwrap();
        assert_eq!(
            v,
            json!({
                "model": "gpt-4",
                "messages": [
                    {"role": "system", "content": "sys"},
                    {"role": "user", "content": "pytanie"}
                ],
                "temperature": 0.0
            })
        );
    }

    #[test]
    fn multimodal_parts_are_tagged() {
        let request = ChatRequest::new("gpt-4o").user_parts(vec![
            ContentPart::text("Co widać?"),
            ContentPart::image_with_detail("data:image/png;base64,AA==", "high"),
        ]);
        let v = serde_json::to_value(&request).unwrap();
        assert_eq!(
            v["messages"][0]["content"],
            json!([
                {"type": "text", "text": "Co widać?"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AA==", "detail": "high"}}
            ])
        );
    }

    #[test]
    fn message_text_skips_images() {
        let m = ChatMessage::user_parts(vec![
            ContentPart::text("a"),
            ContentPart::image("https://x/y.png"),
            ContentPart::text("b"),
        ]);
        assert_eq!(m.text(), "a\nb");
    }

    #[test]
    fn json_mode_sets_response_format() {
        let v = serde_json::to_value(ChatRequest::new("m").json_mode()).unwrap();
        assert_eq!(v["response_format"], json!({"type": "json_object"}));
    }
}
