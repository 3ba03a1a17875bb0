//! Response lifecycle controller.
//!
//! Owns the conversation history and the state of the single in-flight
//! submission. Network attempts, retry timers and the typing renderer run as
//! spawned tasks that only post messages back; every state change happens in
//! `&mut self` methods on the controller's own execution context.

use crate::events::{ChatEvent, EventSink, UiCommand};
use crate::history::{ConversationHistory, InlineAttachment, Turn};
use crate::llm::{CompletionClient, RemoteError};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::streaming::{RenderStatus, TypingRenderer, strip_bold_markup};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const TIMEOUT_MESSAGE: &str = "Request timed out. Please try again.";
pub const STILL_OVERLOADED_MESSAGE: &str = "The model is still overloaded. Please try again later.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("a response is already in progress")]
    RejectedBusy,
    #[error("prompt is empty")]
    EmptyPrompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Overloaded,
    Rejected,
    Network,
}

impl FailureKind {
    fn of(error: &RemoteError) -> Self {
        match error {
            RemoteError::Timeout => FailureKind::Timeout,
            RemoteError::NetworkFailure(_) => FailureKind::Network,
            e if e.is_overloaded() => FailureKind::Overloaded,
            _ => FailureKind::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, strum::IntoStaticStr)]
pub enum LifecycleState {
    Idle,
    Submitting,
    /// `attempt` counts reissues made so far; the first call is attempt 0.
    AwaitingResponse { attempt: u32 },
    RetryScheduled { attempt: u32, after: Duration },
    Rendering,
    /// Resting state after a terminal error; not busy.
    Failed { kind: FailureKind, message: String },
}

impl LifecycleState {
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            LifecycleState::Submitting
                | LifecycleState::AwaitingResponse { .. }
                | LifecycleState::RetryScheduled { .. }
                | LifecycleState::Rendering
        )
    }

    fn name(&self) -> &'static str {
        self.into()
    }
}

/// Work finished on a spawned task, waiting to be applied by the controller
#[derive(Debug)]
pub struct ControllerMessage(Message);

#[derive(Debug)]
enum Message {
    Settled {
        generation: u64,
        attempt: u32,
        result: Result<String, RemoteError>,
    },
    RetryDue {
        generation: u64,
        attempt: u32,
    },
    RenderFinished {
        generation: u64,
        status: RenderStatus,
    },
}

struct Submission {
    id: Uuid,
    cancel: CancellationToken,
    attachment: Option<InlineAttachment>,
}

pub struct ResponseController {
    history: ConversationHistory,
    client: CompletionClient,
    policy: RetryPolicy,
    renderer: TypingRenderer,
    state: LifecycleState,
    /// Bumped on every submit and cancel; messages from older generations are dropped.
    generation: u64,
    submission: Option<Submission>,
    inbox_tx: mpsc::UnboundedSender<ControllerMessage>,
    inbox_rx: mpsc::UnboundedReceiver<ControllerMessage>,
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl ResponseController {
    pub fn new(
        client: CompletionClient,
        policy: RetryPolicy,
        renderer: TypingRenderer,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let controller = Self {
            history: ConversationHistory::new(),
            client,
            policy,
            renderer,
            state: LifecycleState::Idle,
            generation: 0,
            submission: None,
            inbox_tx,
            inbox_rx,
            events,
        };

        (controller, events_rx)
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Attachment riding on the unsettled submission, if any
    pub fn in_flight_attachment(&self) -> Option<&InlineAttachment> {
        self.submission.as_ref().and_then(|s| s.attachment.as_ref())
    }

    /// Route a UI event
    pub fn handle_command(&mut self, command: UiCommand) -> Result<(), SubmitError> {
        match command {
            UiCommand::Submit { text, attachment } => self.submit(&text, attachment).map(|_| ()),
            UiCommand::CancelRequested => {
                self.cancel();
                Ok(())
            }
            UiCommand::ClearHistory => {
                self.clear();
                Ok(())
            }
        }
    }

    /// Append a user turn and start the first attempt.
    ///
    /// Rejected synchronously while another submission is in progress;
    /// history and state are left untouched in that case.
    pub fn submit(
        &mut self,
        text: &str,
        attachment: Option<InlineAttachment>,
    ) -> Result<Uuid, SubmitError> {
        if self.state.is_busy() {
            tracing::warn!(state = self.state.name(), "submission rejected while busy");
            return Err(SubmitError::RejectedBusy);
        }

        let text = text.trim();
        if text.is_empty() {
            return Err(SubmitError::EmptyPrompt);
        }

        self.renderer.stop();
        self.generation += 1;

        let id = Uuid::new_v4();
        let turn = Turn::user(text, attachment.clone());
        self.history.push(turn.clone());
        self.submission = Some(Submission {
            id,
            cancel: CancellationToken::new(),
            attachment,
        });

        tracing::info!(submission = %id, turns = self.history.len(), "submitting prompt");
        self.transition(LifecycleState::Submitting);
        self.emit(ChatEvent::UserTurnRendered(turn));
        self.emit(ChatEvent::BusyStateChanged(true));

        self.start_attempt(0);
        Ok(id)
    }

    /// Abort the in-flight request or reveal and return to Idle. No-op when idle.
    pub fn cancel(&mut self) {
        if self.state == LifecycleState::Idle {
            return;
        }
        if matches!(self.state, LifecycleState::Failed { .. }) {
            self.transition(LifecycleState::Idle);
            return;
        }

        if let Some(submission) = self.submission.take() {
            tracing::info!(submission = %submission.id, state = self.state.name(), "cancelling");
            submission.cancel.cancel();
        }
        self.renderer.stop();
        self.generation += 1;

        self.transition(LifecycleState::Idle);
        self.emit(ChatEvent::BusyStateChanged(false));
    }

    /// Cancel anything in flight and start a fresh conversation
    pub fn clear(&mut self) {
        self.cancel();
        self.history.clear();
        tracing::info!("conversation history cleared");
    }

    /// Wait for the next message from a spawned task
    pub async fn next_message(&mut self) -> Option<ControllerMessage> {
        self.inbox_rx.recv().await
    }

    /// Apply every message that is already queued, without waiting
    pub fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(message) = self.inbox_rx.try_recv() {
            self.handle_message(message);
            applied += 1;
        }
        applied
    }

    /// Wait for and apply one message
    pub async fn step(&mut self) -> bool {
        match self.next_message().await {
            Some(message) => {
                self.handle_message(message);
                true
            }
            None => false,
        }
    }

    /// Drive the current submission until the controller is no longer busy
    pub async fn settle(&mut self) {
        while self.state.is_busy() {
            if !self.step().await {
                break;
            }
        }
    }

    pub fn handle_message(&mut self, message: ControllerMessage) {
        match message.0 {
            Message::Settled {
                generation,
                attempt,
                result,
            } => {
                if generation != self.generation
                    || self.state != (LifecycleState::AwaitingResponse { attempt })
                {
                    tracing::debug!(generation, attempt, "dropping stale response");
                    return;
                }
                match result {
                    Ok(text) => self.on_response(text),
                    Err(error) => self.on_failure(attempt, error),
                }
            }
            Message::RetryDue {
                generation,
                attempt,
            } => {
                let scheduled = matches!(
                    self.state,
                    LifecycleState::RetryScheduled { attempt: pending, .. } if pending == attempt
                );
                if generation != self.generation || !scheduled {
                    tracing::debug!(generation, attempt, "suppressing stale retry");
                    return;
                }
                self.start_attempt(attempt);
            }
            Message::RenderFinished { generation, status } => {
                if generation != self.generation || self.state != LifecycleState::Rendering {
                    return;
                }
                tracing::debug!(?status, "typing effect finished");
                self.submission = None;
                self.transition(LifecycleState::Idle);
                self.emit(ChatEvent::BusyStateChanged(false));
            }
        }
    }

    fn start_attempt(&mut self, attempt: u32) {
        let Some(submission) = &self.submission else {
            return;
        };

        let client = self.client.clone();
        let history = self.history.clone();
        let cancel = submission.cancel.clone();
        let tx = self.inbox_tx.clone();
        let generation = self.generation;
        tracing::debug!(submission = %submission.id, attempt, "starting attempt");

        self.transition(LifecycleState::AwaitingResponse { attempt });

        tokio::spawn(async move {
            let result = client.send(&history, &cancel).await;
            let _ = tx.send(ControllerMessage(Message::Settled {
                generation,
                attempt,
                result,
            }));
        });
    }

    fn on_response(&mut self, raw: String) {
        let display = strip_bold_markup(&raw);
        // History keeps the raw text; markup stripping is display only.
        self.history.push(Turn::model(raw));
        self.release_attachment();
        self.transition(LifecycleState::Rendering);

        let sink = Arc::new(EventSink::new(self.events.clone()));
        let handle = self.renderer.render(&display, sink);

        let tx = self.inbox_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let status = handle.finished().await;
            let _ = tx.send(ControllerMessage(Message::RenderFinished { generation, status }));
        });
    }

    fn on_failure(&mut self, attempt: u32, error: RemoteError) {
        if error == RemoteError::Cancelled {
            // Cancellation is a normal exit, never retried and never shown.
            self.submission = None;
            self.transition(LifecycleState::Idle);
            self.emit(ChatEvent::BusyStateChanged(false));
            return;
        }

        match self.policy.decide(&error, attempt) {
            RetryDecision::Retry { after } => {
                let Some(submission) = &self.submission else {
                    return;
                };
                let next = attempt + 1;
                tracing::warn!(
                    submission = %submission.id,
                    retry = next,
                    max = self.policy.max_retries,
                    "model overloaded, retrying in {:?}",
                    after
                );

                let cancel = submission.cancel.clone();
                let tx = self.inbox_tx.clone();
                let generation = self.generation;
                self.transition(LifecycleState::RetryScheduled {
                    attempt: next,
                    after,
                });

                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(after) => {
                            let _ = tx.send(ControllerMessage(Message::RetryDue {
                                generation,
                                attempt: next,
                            }));
                        }
                    }
                });
            }
            RetryDecision::GiveUp => {
                let kind = FailureKind::of(&error);
                let message = terminal_message(&error);
                tracing::warn!(?kind, attempt, "request failed: {}", error);

                self.submission = None;
                self.transition(LifecycleState::Failed {
                    kind,
                    message: message.clone(),
                });
                self.emit(ChatEvent::TerminalError(message));
                self.emit(ChatEvent::BusyStateChanged(false));
            }
        }
    }

    fn release_attachment(&mut self) {
        if let Some(submission) = &mut self.submission {
            submission.attachment = None;
        }
    }

    fn transition(&mut self, next: LifecycleState) {
        tracing::debug!(from = self.state.name(), to = next.name(), "state transition");
        self.state = next;
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

/// Text shown to the user when a submission gives up
pub fn terminal_message(error: &RemoteError) -> String {
    match error {
        RemoteError::Timeout => TIMEOUT_MESSAGE.to_string(),
        e if e.is_overloaded() => STILL_OVERLOADED_MESSAGE.to_string(),
        other => other.to_string(),
    }
}
