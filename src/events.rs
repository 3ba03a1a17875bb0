use crate::history::{InlineAttachment, Turn};
use crate::streaming::DisplaySink;
use tokio::sync::mpsc;

/// Events the UI feeds into the controller
#[derive(Debug, Clone)]
pub enum UiCommand {
    /// User submitted a prompt, optionally with one attachment
    Submit {
        text: String,
        attachment: Option<InlineAttachment>,
    },

    /// User pressed stop
    CancelRequested,

    /// User asked for a fresh conversation
    ClearHistory,
}

/// Callbacks the controller emits towards the UI
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A user turn was accepted and should be shown
    UserTurnRendered(Turn),

    /// The visible model response now reads `partial`
    DisplayUpdate(String),

    /// A submission ended in a failure the user should see
    TerminalError(String),

    /// Busy indicator toggled
    BusyStateChanged(bool),
}

/// Display sink that forwards revealed text as `ChatEvent::DisplayUpdate`
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<ChatEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ChatEvent>) -> Self {
        Self { tx }
    }
}

impl DisplaySink for EventSink {
    fn show(&self, partial: &str) {
        let _ = self.tx.send(ChatEvent::DisplayUpdate(partial.to_string()));
    }
}
