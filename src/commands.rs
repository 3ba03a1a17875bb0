use crate::config::Config;
use crate::controller::{ResponseController, SubmitError};
use crate::events::{ChatEvent, UiCommand};
use crate::history::{InlineAttachment, Role};
use crate::llm::CompletionClient;
use crate::proxy::{self, ProxyState};
use crate::retry::RetryPolicy;
use crate::streaming::TypingRenderer;
use anyhow::{Context, Result};
use base64::Engine;
use crossterm::style::Stylize;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use strum::{EnumIter, EnumString, IntoEnumIterator, IntoStaticStr};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Commands typed at the prompt with a leading slash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum SlashCommand {
    /// Attach a file to the next prompt
    Attach,
    /// Stop the response in progress
    Stop,
    /// Start a new conversation
    Clear,
    /// Show help
    Help,
    /// Exit
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: SlashCommand,
    pub argument: Option<String>,
}

impl SlashCommand {
    pub fn description(self) -> &'static str {
        match self {
            SlashCommand::Attach => "attach a file to the next prompt: /attach <path>",
            SlashCommand::Stop => "stop the response in progress",
            SlashCommand::Clear => "clear the conversation",
            SlashCommand::Help => "show available commands",
            SlashCommand::Quit => "exit",
        }
    }

    pub fn command(self) -> &'static str {
        self.into()
    }
}

/// Parse a slash command from user input
pub fn parse_slash_command(input: &str) -> Option<ParsedCommand> {
    let rest = input.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let head = parts.next()?;

    let command = SlashCommand::from_str(head)
        .ok()
        .or_else(|| match head.to_lowercase().as_str() {
            "q" | "exit" | "bye" => Some(SlashCommand::Quit),
            "cancel" => Some(SlashCommand::Stop),
            "new" => Some(SlashCommand::Clear),
            _ => None,
        })?;

    let argument = parts
        .next()
        .map(str::trim)
        .filter(|arg| !arg.is_empty())
        .map(str::to_string);

    Some(ParsedCommand { command, argument })
}

pub fn get_help_text() -> String {
    let mut help = String::from("Available commands:\n");
    for command in SlashCommand::iter() {
        help.push_str(&format!("  /{} - {}\n", command.command(), command.description()));
    }
    help.push_str("Anything else is sent as a prompt.");
    help
}

/// Read a file into an inline attachment
pub fn load_attachment(path: &Path) -> Result<InlineAttachment> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read attachment {}", path.display()))?;
    let data = base64::engine::general_purpose::STANDARD.encode(bytes);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(InlineAttachment::new(mime_type_for(path), data).with_display_name(name))
}

fn mime_type_for(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Terminal side of the display: prints only what the typing effect adds
struct TerminalView {
    shown: String,
}

impl TerminalView {
    fn new() -> Self {
        Self {
            shown: String::new(),
        }
    }

    fn apply(&mut self, event: ChatEvent) -> io::Result<()> {
        let mut out = io::stdout();
        match event {
            ChatEvent::UserTurnRendered(turn) => {
                let stamp = turn.timestamp().format("%H:%M:%S");
                let label = match turn.role() {
                    Role::User => "You",
                    Role::Model => "Gemini",
                };
                write!(
                    out,
                    "{} {} {}",
                    stamp.to_string().dark_grey(),
                    label.blue().bold(),
                    turn.content()
                )?;
                if let Some(attachment) = turn.attachment() {
                    let name = attachment.display_name.as_deref().unwrap_or(&attachment.mime_type);
                    write!(out, " {}", format!("[{name}]").dark_grey())?;
                }
                writeln!(out)?;
            }
            ChatEvent::BusyStateChanged(true) => {
                self.shown.clear();
                writeln!(out, "{}", "Just a sec...".dark_grey())?;
            }
            ChatEvent::BusyStateChanged(false) => {
                if !self.shown.is_empty() {
                    writeln!(out)?;
                }
                self.shown.clear();
            }
            ChatEvent::DisplayUpdate(partial) => {
                if self.shown.is_empty() && !partial.is_empty() {
                    write!(out, "{} ", "Gemini".green().bold())?;
                }
                match partial.strip_prefix(self.shown.as_str()) {
                    Some(added) => write!(out, "{added}")?,
                    None => write!(out, "\n{partial}")?,
                }
                self.shown = partial;
            }
            ChatEvent::TerminalError(message) => {
                writeln!(out, "{}", message.red())?;
            }
        }
        out.flush()
    }
}

enum Input {
    Line(String),
    Eof,
}

/// Interactive chat loop on stdin/stdout
pub async fn run_chat(config: Config, attach: Option<&Path>) -> Result<()> {
    let client = CompletionClient::from_config(&config)?;
    let (mut controller, mut events) = ResponseController::new(
        client,
        RetryPolicy::from(&config.request),
        TypingRenderer::from_config(&config.typing),
    );

    let mut staged = attach.map(load_attachment).transpose()?;
    let mut view = TerminalView::new();

    println!("{}", "Gemini chat. Type /help for commands.".green());
    if let Some(attachment) = &staged {
        println!("Attached {}", attachment.display_name.as_deref().unwrap_or("file"));
    }

    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if input_tx.send(Input::Line(line)).is_err() {
                        break;
                    }
                }
                _ => {
                    let _ = input_tx.send(Input::Eof);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                view.apply(event)?;
            }
            Some(message) = controller.next_message() => {
                controller.handle_message(message);
            }
            input = input_rx.recv() => {
                let line = match input {
                    Some(Input::Line(line)) => line,
                    Some(Input::Eof) | None => break,
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                if let Some(parsed) = parse_slash_command(line) {
                    match parsed.command {
                        SlashCommand::Attach => match parsed.argument.as_deref() {
                            Some(path) => match load_attachment(Path::new(path)) {
                                Ok(attachment) => {
                                    println!("Attached {}", attachment.display_name.as_deref().unwrap_or(path));
                                    staged = Some(attachment);
                                }
                                Err(e) => println!("{}", format!("{e:#}").red()),
                            },
                            None => println!("Usage: /attach <path>"),
                        },
                        SlashCommand::Stop => controller.handle_command(UiCommand::CancelRequested)?,
                        SlashCommand::Clear => {
                            staged = None;
                            controller.handle_command(UiCommand::ClearHistory)?;
                            println!("{}", "Conversation cleared.".dark_grey());
                        }
                        SlashCommand::Help => println!("{}", get_help_text()),
                        SlashCommand::Quit => break,
                    }
                    continue;
                }

                let command = UiCommand::Submit {
                    text: line.to_string(),
                    attachment: staged.clone(),
                };
                match controller.handle_command(command) {
                    Ok(()) => staged = None,
                    Err(SubmitError::RejectedBusy) => {
                        println!("{}", "Still answering. Use /stop to cancel.".yellow());
                    }
                    Err(SubmitError::EmptyPrompt) => {}
                }
            }
        }
    }

    controller.cancel();
    while let Ok(event) = events.try_recv() {
        view.apply(event)?;
    }
    Ok(())
}

/// Run the proxy server
pub async fn run_server(config: Config, port: Option<u16>) -> Result<()> {
    if !config.has_api_key() {
        tracing::warn!(
            "no API key configured; set {} before serving",
            crate::config::API_KEY_ENV
        );
    }
    let addr = SocketAddr::from(([127, 0, 0, 1], port.unwrap_or(config.server.port)));
    proxy::serve(ProxyState::from_config(&config), addr).await
}

/// Store the API key in the config file
pub fn save_api_key(mut config: Config, key: &str) -> Result<()> {
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("API key cannot be empty");
    }
    config.set_api_key(key.to_string());
    config.save()?;
    println!("Saved API key to {}", config.config_path().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_aliases() {
        assert_eq!(
            parse_slash_command("/attach ./cat photo.png"),
            Some(ParsedCommand {
                command: SlashCommand::Attach,
                argument: Some("./cat photo.png".to_string()),
            })
        );
        assert_eq!(
            parse_slash_command("/q").map(|p| p.command),
            Some(SlashCommand::Quit)
        );
        assert_eq!(
            parse_slash_command("/cancel").map(|p| p.command),
            Some(SlashCommand::Stop)
        );
        assert_eq!(parse_slash_command("/stop").and_then(|p| p.argument), None);
        assert_eq!(parse_slash_command("hello"), None);
        assert_eq!(parse_slash_command("/unknown"), None);
    }

    #[test]
    fn help_lists_every_command() {
        let help = get_help_text();
        for command in SlashCommand::iter() {
            assert!(help.contains(&format!("/{}", command.command())));
        }
    }

    #[test]
    fn attachment_is_base64_with_guessed_mime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.TXT");
        std::fs::write(&path, "hello").unwrap();

        let attachment = load_attachment(&path).unwrap();
        assert_eq!(attachment.mime_type, "text/plain");
        assert_eq!(attachment.data_base64, "aGVsbG8=");
        assert_eq!(attachment.display_name.as_deref(), Some("notes.TXT"));

        let audio = dir.path().join("clip.mp3");
        std::fs::write(&audio, [0xffu8, 0xfb]).unwrap();
        assert_eq!(load_attachment(&audio).unwrap().mime_type, "audio/mpeg");

        assert_eq!(mime_type_for(Path::new("a.wav")), "audio/wav");
        assert_eq!(mime_type_for(Path::new("a.mp4")), "video/mp4");
        assert_eq!(mime_type_for(Path::new("a.html")), "text/html");
        assert_eq!(mime_type_for(Path::new("a.PNG")), "image/png");
        assert_eq!(mime_type_for(Path::new("x.unknownext")), "application/octet-stream");
        assert!(load_attachment(&dir.path().join("missing.png")).is_err());
    }
}
