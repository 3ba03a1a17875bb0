use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

static BOLD_MARKUP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("valid regex"));

/// Display form of a response: `**text**` becomes `text`, outer whitespace trimmed.
pub fn strip_bold_markup(text: &str) -> String {
    BOLD_MARKUP.replace_all(text, "$1").trim().to_string()
}

/// Receives each revealed prefix of a response
pub trait DisplaySink: Send + Sync {
    /// Replace the visible text with `partial`
    fn show(&self, partial: &str);

    /// Called after every revealed increment
    fn scroll_to_bottom(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    Running,
    Completed,
    Stopped,
}

/// Handle to one reveal. Cloning shares the same reveal.
#[derive(Clone)]
pub struct RenderHandle {
    token: CancellationToken,
    status: watch::Receiver<RenderStatus>,
}

impl RenderHandle {
    /// Halt mid-reveal; the sink keeps whatever prefix it already shows.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn status(&self) -> RenderStatus {
        *self.status.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.status() != RenderStatus::Running
    }

    /// Wait until the reveal completes or is stopped
    pub async fn finished(&self) -> RenderStatus {
        let mut status = self.status.clone();
        match status.wait_for(|s| *s != RenderStatus::Running).await {
            Ok(s) => *s,
            Err(_) => RenderStatus::Stopped,
        }
    }
}

/// Timer-driven typing effect over an already received string.
///
/// At most one reveal is active; starting a new one stops the previous.
pub struct TypingRenderer {
    chars_per_tick: usize,
    tick_interval: Duration,
    active: Option<RenderHandle>,
}

impl TypingRenderer {
    pub fn new(chars_per_tick: usize, tick_interval: Duration) -> Self {
        Self {
            chars_per_tick: chars_per_tick.max(1),
            tick_interval,
            active: None,
        }
    }

    pub fn from_config(config: &crate::config::TypingConfig) -> Self {
        Self::new(config.chars_per_tick, config.tick_interval())
    }

    /// Reveal `text` into `sink`, `chars_per_tick` characters per tick.
    ///
    /// Text of L characters finishes after ceil(L / chars_per_tick) ticks.
    pub fn render(&mut self, text: &str, sink: Arc<dyn DisplaySink>) -> RenderHandle {
        self.stop();

        let token = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RenderStatus::Running);
        let handle = RenderHandle {
            token: token.clone(),
            status: status_rx,
        };

        let text = text.to_string();
        let stops = reveal_points(&text, self.chars_per_tick);
        let tick_interval = self.tick_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + tick_interval, tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            if stops.is_empty() {
                sink.show("");
            }

            for end in stops {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        let _ = status_tx.send(RenderStatus::Stopped);
                        return;
                    }
                    _ = ticker.tick() => {
                        sink.show(&text[..end]);
                        sink.scroll_to_bottom();
                    }
                }
            }

            let _ = status_tx.send(RenderStatus::Completed);
        });

        self.active = Some(handle.clone());
        handle
    }

    /// Stop the active reveal, if any
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.stop();
        }
    }

    pub fn is_rendering(&self) -> bool {
        self.active.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

/// Byte offsets at which each increment ends
fn reveal_points(text: &str, chars_per_tick: usize) -> Vec<usize> {
    let ends: Vec<usize> = text
        .char_indices()
        .map(|(idx, ch)| idx + ch.len_utf8())
        .collect();

    ends.chunks(chars_per_tick)
        .filter_map(|chunk| chunk.last().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        scrolls: AtomicUsize,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }

        fn last(&self) -> Option<String> {
            self.frames.lock().unwrap().last().cloned()
        }
    }

    impl DisplaySink for RecordingSink {
        fn show(&self, partial: &str) {
            self.frames.lock().unwrap().push(partial.to_string());
        }

        fn scroll_to_bottom(&self) {
            self.scrolls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn strips_bold_markup_for_display() {
        assert_eq!(strip_bold_markup("**hi**"), "hi");
        assert_eq!(strip_bold_markup("**Hi** there"), "Hi there");
        assert_eq!(strip_bold_markup("  a **b** c **d**\n"), "a b c d");
        assert_eq!(strip_bold_markup("2 ** 3"), "2 ** 3");
    }

    #[test]
    fn reveal_points_respect_char_boundaries() {
        assert_eq!(reveal_points("héllo", 1), vec![1, 3, 4, 5, 6]);
        assert_eq!(reveal_points("abcde", 2), vec![2, 4, 5]);
        assert!(reveal_points("", 1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reveals_one_char_per_tick() {
        let sink = Arc::new(RecordingSink::default());
        let mut renderer = TypingRenderer::new(1, Duration::from_millis(10));
        let started = Instant::now();

        let handle = renderer.render(&strip_bold_markup("**hi**"), sink.clone());
        assert_eq!(handle.finished().await, RenderStatus::Completed);

        assert_eq!(sink.frames(), vec!["h".to_string(), "hi".to_string()]);
        assert_eq!(sink.scrolls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(20));
        assert!(!renderer.is_rendering());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_keeps_revealed_prefix() {
        let sink = Arc::new(RecordingSink::default());
        let mut renderer = TypingRenderer::new(1, Duration::from_millis(10));

        let handle = renderer.render("abcdef", sink.clone());
        tokio::time::sleep(Duration::from_millis(35)).await;
        renderer.stop();

        assert_eq!(handle.finished().await, RenderStatus::Stopped);
        assert_eq!(sink.last().as_deref(), Some("abc"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.last().as_deref(), Some("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn new_render_stops_previous() {
        let first_sink = Arc::new(RecordingSink::default());
        let second_sink = Arc::new(RecordingSink::default());
        let mut renderer = TypingRenderer::new(1, Duration::from_millis(10));

        let first = renderer.render("first response", first_sink.clone());
        tokio::time::sleep(Duration::from_millis(25)).await;
        let second = renderer.render("ok", second_sink.clone());

        assert_eq!(first.finished().await, RenderStatus::Stopped);
        assert_eq!(second.finished().await, RenderStatus::Completed);
        assert_eq!(first_sink.last().as_deref(), Some("fi"));
        assert_eq!(second_sink.last().as_deref(), Some("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_completes_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let mut renderer = TypingRenderer::new(1, Duration::from_millis(10));

        let handle = renderer.render("", sink.clone());
        assert_eq!(handle.finished().await, RenderStatus::Completed);
        assert_eq!(sink.frames(), vec![String::new()]);
    }
}
