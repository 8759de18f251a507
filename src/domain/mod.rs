//! Domain models - message envelope and topic rules
//!
//! - `message` - the `Message` envelope carried on every channel
//! - `topic` - publish topic generation and validation
//! - `payload` - will payload decoding (`\xHH` escapes)

pub mod message;
pub mod payload;
pub mod topic;

// Re-export commonly used types at module level
pub use message::{Direction, Message};
pub use topic::Topic;
