use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// System instruction that opens every session transcript. It pins the
/// assistant to the four-trait vocabulary payload and nothing else.
pub const ATTRIBUTE_INSTRUCTION: &str = r#"You will identify a theme based on the user input, and you will generate a list of values related to that theme. Generate 2 values for each trait. For ALL of your responses, do not include anything other than the data model.

{
  "head": ["..."],
  "glasses": ["..."],
  "body": ["..."],
  "accessories": ["..."]
}

The response should NEVER include anything outside the curly braces. DO NOT WRITE ANYTHING OUTSIDE THE CURLY BRACES. DO NOT REPEAT THE INPUT.

Example: correct output for input of "materials type of nft":
{
  "head": ["yarn", "string"],
  "glasses": ["beans", "beads"],
  "body": ["paper art", "plush"],
  "accessories": ["construction paper", "playdoh"]
}
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Ordered, append-only message log for one session.
///
/// Always begins with exactly one system message. Messages are appended and
/// never mutated or removed; a new session starts a fresh transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::with_system(ATTRIBUTE_INSTRUCTION)
    }

    pub fn with_system(instruction: &str) -> Self {
        Self {
            messages: vec![ChatMessage {
                role: ChatRole::System,
                content: instruction.to_string(),
            }],
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            role: ChatRole::User,
            content: content.into(),
        });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: content.into(),
        });
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.messages.as_slice()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Wire shape for the chat-completions `messages` field.
    pub fn to_payload(&self) -> Vec<Value> {
        self.messages
            .iter()
            .map(|message| {
                json!({
                    "role": message.role,
                    "content": message.content,
                })
            })
            .collect()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}
