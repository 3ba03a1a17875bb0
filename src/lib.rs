//! Terminal chat client for the Gemini generateContent API.
//!
//! The interesting part is [`controller::ResponseController`], which owns the
//! lifecycle of the single request in flight: timeout, cancellation,
//! retry-on-overload and the typing effect that reveals each reply.

pub mod commands;
pub mod config;
pub mod controller;
pub mod events;
pub mod history;
pub mod llm;
pub mod proxy;
pub mod retry;
pub mod streaming;

pub use controller::{LifecycleState, ResponseController, SubmitError};
pub use events::{ChatEvent, UiCommand};
pub use history::{ConversationHistory, InlineAttachment, Role, Turn};
pub use llm::{CompletionClient, CompletionTransport, HttpTransport, RemoteError};
pub use retry::{RetryDecision, RetryPolicy};
pub use streaming::{DisplaySink, RenderHandle, TypingRenderer};
