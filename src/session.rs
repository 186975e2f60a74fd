//! The chat screen: transcript, input field, clipboard poller and sends.

use crate::clipboard::{self, ClipboardWatcher, SystemClipboard};
use crate::config::ClipboardConfig;
use crate::ollama::OllamaClient;
use crate::transcript::{Speaker, Transcript};
use iced::futures::{SinkExt, Stream, StreamExt};
use iced::{
    alignment,
    widget::{button, column, container, row, scrollable, text, text_input},
    Element, Length, Subscription, Task,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Message {
    InputChanged(String),
    ClipboardChanged(String),
    Submit,
    Reply(ReplyEvent),
}

/// What a streaming send reports back to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyEvent {
    Fragment(String),
    Finished,
    Failed(String),
}

pub struct ChatSession {
    model: String,
    client: OllamaClient,
    clipboard: ClipboardConfig,
    input: String,
    transcript: Transcript,
    /// Reply text received so far while a send is in flight.
    pending: Option<String>,
    input_id: text_input::Id,
    transcript_id: scrollable::Id,
}

impl ChatSession {
    pub fn new(model: String, client: OllamaClient, clipboard: ClipboardConfig) -> Self {
        ChatSession {
            model,
            client,
            clipboard,
            input: String::new(),
            transcript: Transcript::default(),
            pending: None,
            input_id: text_input::Id::unique(),
            transcript_id: scrollable::Id::unique(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[allow(dead_code)]
    pub fn input(&self) -> &str {
        &self.input
    }

    #[allow(dead_code)]
    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn is_waiting(&self) -> bool {
        self.pending.is_some()
    }

    pub fn focus_input(&self) -> Task<Message> {
        text_input::focus(self.input_id.clone())
    }

    /// The poller always wins: whatever the user had typed is replaced.
    pub fn apply_clipboard(&mut self, input: String) {
        self.input = input;
    }

    /// Takes the input as the prompt and records it. Empty prompts are
    /// allowed. Returns `None` while a previous reply is still streaming.
    pub fn begin_send(&mut self) -> Option<String> {
        if self.pending.is_some() {
            return None;
        }

        let prompt = std::mem::take(&mut self.input);
        self.transcript.push(Speaker::User, prompt.clone());
        self.pending = Some(String::new());
        Some(prompt)
    }

    pub fn apply_reply(&mut self, event: ReplyEvent) {
        let Some(pending) = self.pending.as_mut() else {
            tracing::debug!("dropping reply event with no send in flight");
            return;
        };

        match event {
            ReplyEvent::Fragment(fragment) => pending.push_str(&fragment),
            ReplyEvent::Finished => {
                let response = self.pending.take().unwrap_or_default();
                tracing::debug!("reply finished ({} chars)", response.chars().count());
                self.transcript.push(Speaker::Model, response);
            }
            ReplyEvent::Failed(error) => {
                tracing::warn!("send to {} failed: {}", self.model, error);
                self.pending = None;
                self.transcript.push(Speaker::Error, error);
            }
        }
    }

    pub fn update(&mut self, message: Message) -> Task<Message> {
        match message {
            Message::InputChanged(value) => {
                self.input = value;
                Task::none()
            }
            Message::ClipboardChanged(value) => {
                self.apply_clipboard(value);
                Task::none()
            }
            Message::Submit => {
                let Some(prompt) = self.begin_send() else {
                    return Task::none();
                };

                let reply = stream_reply(self.client.clone(), self.model.clone(), prompt);
                Task::batch([self.scroll_to_end(), Task::run(reply, Message::Reply)])
            }
            Message::Reply(event) => {
                self.apply_reply(event);
                self.scroll_to_end()
            }
        }
    }

    fn scroll_to_end(&self) -> Task<Message> {
        scrollable::snap_to(self.transcript_id.clone(), scrollable::RelativeOffset::END)
    }

    pub fn subscription(&self) -> Subscription<Message> {
        let interval = self.clipboard.poll_interval();
        let suffix = self.clipboard.suffix.clone();

        Subscription::run_with_id(
            ("clipboard-poll", interval, suffix.clone()),
            iced::stream::channel(1, move |output| async move {
                clipboard::poll_loop(
                    Arc::new(SystemClipboard),
                    ClipboardWatcher::new(suffix),
                    interval,
                    output,
                )
                .await
            }),
        )
        .map(Message::ClipboardChanged)
    }

    pub fn view(&self) -> Element<'_, Message> {
        let mut lines = column![].spacing(12);

        for entry in self.transcript.entries() {
            lines = lines.push(text(entry.to_string()).size(15));
        }

        if let Some(partial) = &self.pending {
            let shown = if partial.is_empty() { "..." } else { partial.as_str() };
            lines = lines.push(text(format!("{}: {}", Speaker::Model.label(), shown)).size(15));
        }

        let transcript = scrollable(container(lines).padding(15).width(Length::Fill))
            .id(self.transcript_id.clone())
            .height(Length::Fill);

        let input = text_input("Type a message or copy some text...", &self.input)
            .on_input(Message::InputChanged)
            .on_submit(Message::Submit)
            .padding(10)
            .size(16)
            .id(self.input_id.clone());

        let send = button(text("Send").size(14))
            .on_press_maybe((!self.is_waiting()).then_some(Message::Submit))
            .padding(10);

        column![
            text(format!("Chatting with {}", self.model)).size(13),
            transcript,
            row![input, send]
                .spacing(10)
                .align_y(alignment::Vertical::Center),
        ]
        .spacing(10)
        .padding(10)
        .into()
    }
}

/// Runs one send and reports fragments as they arrive, then exactly one
/// `Finished` or `Failed`.
fn stream_reply(client: OllamaClient, model: String, prompt: String) -> impl Stream<Item = ReplyEvent> {
    iced::stream::channel(16, move |mut output| async move {
        let mut fragments = match client.chat_stream(&model, &prompt).await {
            Ok(fragments) => fragments,
            Err(e) => {
                let _ = output.send(ReplyEvent::Failed(format!("{:#}", e))).await;
                return;
            }
        };

        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => {
                    if output.send(ReplyEvent::Fragment(text)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = output.send(ReplyEvent::Failed(format!("{:#}", e))).await;
                    return;
                }
            }
        }

        let _ = output.send(ReplyEvent::Finished).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ChatSession {
        ChatSession::new(
            "llama3.2".to_string(),
            OllamaClient::with_config("http://127.0.0.1:9".to_string()),
            ClipboardConfig::default(),
        )
    }

    #[test]
    fn test_clipboard_overwrites_typed_text() {
        let mut session = session();
        let _ = session.update(Message::InputChanged("half-typed".into()));
        let _ = session.update(Message::ClipboardChanged("copied explain".into()));
        assert_eq!(session.input(), "copied explain");
    }

    #[test]
    fn test_user_edit_after_clipboard_wins() {
        let mut session = session();
        session.apply_clipboard("copied".into());
        let _ = session.update(Message::InputChanged("copied, but shorter".into()));
        assert_eq!(session.input(), "copied, but shorter");
    }

    #[test]
    fn test_send_clears_input_and_records_prompt() {
        let mut session = session();
        session.apply_clipboard("what is rust".into());

        assert_eq!(session.begin_send(), Some("what is rust".to_string()));
        assert_eq!(session.input(), "");
        assert!(session.is_waiting());
        assert_eq!(session.transcript().entries()[0].to_string(), "You: what is rust");
    }

    #[test]
    fn test_fragments_accumulate_into_one_entry() {
        let mut session = session();
        session.begin_send();

        session.apply_reply(ReplyEvent::Fragment("Hel".into()));
        session.apply_reply(ReplyEvent::Fragment("lo".into()));
        assert_eq!(session.transcript().len(), 1);

        session.apply_reply(ReplyEvent::Finished);
        assert!(!session.is_waiting());
        assert_eq!(session.transcript().len(), 2);
        assert_eq!(session.transcript().last().unwrap().to_string(), "Model: Hello");
    }

    #[test]
    fn test_empty_send_produces_one_pair() {
        let mut session = session();

        assert_eq!(session.begin_send(), Some(String::new()));
        session.apply_reply(ReplyEvent::Finished);

        let entries = session.transcript().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].speaker, Speaker::User);
        assert_eq!(entries[0].text, "");
        assert_eq!(entries[1].speaker, Speaker::Model);
        assert_eq!(session.input(), "");
    }

    #[test]
    fn test_failure_adds_error_and_keeps_history() {
        let mut session = session();
        session.apply_clipboard("first".into());
        session.begin_send();
        session.apply_reply(ReplyEvent::Fragment("ok".into()));
        session.apply_reply(ReplyEvent::Finished);
        let before = session.transcript().entries().to_vec();

        session.apply_clipboard("second".into());
        session.begin_send();
        session.apply_reply(ReplyEvent::Fragment("partial".into()));
        session.apply_reply(ReplyEvent::Failed("connection refused".into()));

        let entries = session.transcript().entries();
        assert_eq!(&entries[..2], &before[..]);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[3].speaker, Speaker::Error);
        assert!(entries[3].to_string().contains("Error"));
        assert!(entries[3].text.contains("connection refused"));
        assert!(!session.is_waiting());
    }

    #[test]
    fn test_second_send_ignored_while_waiting() {
        let mut session = session();
        session.begin_send();
        session.apply_clipboard("queued".into());

        assert_eq!(session.begin_send(), None);
        assert_eq!(session.input(), "queued");
        assert_eq!(session.transcript().len(), 1);
    }

    #[test]
    fn test_reply_without_send_is_ignored() {
        let mut session = session();
        session.apply_reply(ReplyEvent::Finished);
        assert!(session.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_model_reports_single_failure() {
        let client = OllamaClient::with_config("http://127.0.0.1:9".to_string());
        let events: Vec<ReplyEvent> = stream_reply(client, "llama3.2".into(), String::new())
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ReplyEvent::Failed(e) if e.contains("could not reach Ollama")));
    }
}
