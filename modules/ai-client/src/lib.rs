pub mod chat;
pub mod error;
pub mod provider;
pub mod schema;
pub mod traits;
pub mod util;

pub use chat::ChatClient;
pub use error::{AiError, Result};
pub use provider::Provider;
pub use schema::StructuredOutput;
pub use traits::{ChatModel, Message, MessageRole};
