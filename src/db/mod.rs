pub mod conversations;
pub mod models;

pub use conversations::{ConversationPatch, ConversationStore};
pub use models::{Conversation, ConversationStats, ConversationStatus, Message, MessageRole};
