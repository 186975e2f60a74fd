//! The model selector screen shown at startup.

use crate::models::ModelCli;
use crate::ollama::{OllamaClient, PullProgress};
use crate::progress::PullTracker;
use iced::futures::{SinkExt, Stream, StreamExt};
use iced::{
    alignment,
    widget::{button, column, container, pick_list, progress_bar, row, text},
    Element, Length, Task,
};

#[derive(Debug, Clone)]
pub enum Message {
    ModelsListed(Vec<String>),
    Pull(PullEvent),
    ModelSelected(String),
    Confirm,
    WarmedUp(String, Result<(), String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullEvent {
    Progress(PullProgress),
    Finished,
    Failed(String),
}

/// What the application should do after a selector update.
pub enum Action {
    None,
    Run(Task<Message>),
    OpenChat(String),
}

#[derive(Debug, Clone)]
enum Phase {
    Listing,
    Pulling(PullTracker),
    Ready,
    WarmingUp(String),
}

pub struct ModelSelector {
    cli: ModelCli,
    client: OllamaClient,
    default_model: String,
    models: Vec<String>,
    selected: Option<String>,
    phase: Phase,
    pulled: bool,
}

impl ModelSelector {
    pub fn new(cli: ModelCli, client: OllamaClient, default_model: String) -> (Self, Task<Message>) {
        let selector = ModelSelector {
            cli,
            client,
            default_model,
            models: Vec::new(),
            selected: None,
            phase: Phase::Listing,
            pulled: false,
        };
        let task = selector.list_models();
        (selector, task)
    }

    #[allow(dead_code)]
    pub fn models(&self) -> &[String] {
        &self.models
    }

    #[allow(dead_code)]
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.phase, Phase::Ready)
    }

    fn list_models(&self) -> Task<Message> {
        let cli = self.cli.clone();
        Task::perform(async move { cli.list().await }, Message::ModelsListed)
    }

    pub fn update(&mut self, message: Message) -> Action {
        match message {
            Message::ModelsListed(models) => {
                if models.is_empty() && !self.pulled {
                    self.pulled = true;
                    self.phase = Phase::Pulling(PullTracker::new());
                    tracing::info!("no local models, pulling {}", self.default_model);

                    let events = pull_events(self.client.clone(), self.default_model.clone());
                    return Action::Run(Task::run(events, Message::Pull));
                }

                if models.is_empty() {
                    tracing::warn!("still no models available");
                }
                self.selected = models.first().cloned();
                self.models = models;
                self.phase = Phase::Ready;
                Action::None
            }
            Message::Pull(event) => {
                let Phase::Pulling(tracker) = &mut self.phase else {
                    return Action::None;
                };

                match event {
                    PullEvent::Progress(progress) => {
                        tracker.apply(&progress);
                        Action::None
                    }
                    PullEvent::Finished => {
                        tracker.finish();
                        tracing::info!("pulled {}", self.default_model);
                        self.phase = Phase::Listing;
                        Action::Run(self.list_models())
                    }
                    PullEvent::Failed(error) => {
                        tracing::error!("pulling {} failed: {}", self.default_model, error);
                        self.models.clear();
                        self.selected = None;
                        self.phase = Phase::Ready;
                        Action::None
                    }
                }
            }
            Message::ModelSelected(model) => {
                self.selected = Some(model);
                Action::None
            }
            Message::Confirm => {
                if self.is_busy() {
                    return Action::None;
                }
                let Some(model) = self.selected.clone() else {
                    return Action::None;
                };

                tracing::info!("selected {}", model);
                self.phase = Phase::WarmingUp(model.clone());

                let cli = self.cli.clone();
                Action::Run(Task::perform(
                    async move {
                        let result = cli.warm_up(&model).await.map_err(|e| format!("{:#}", e));
                        (model, result)
                    },
                    |(model, result)| Message::WarmedUp(model, result),
                ))
            }
            Message::WarmedUp(model, Ok(())) => Action::OpenChat(model),
            Message::WarmedUp(model, Err(error)) => {
                tracing::error!("could not start {}: {}", model, error);
                self.phase = Phase::Ready;
                Action::None
            }
        }
    }

    pub fn view(&self) -> Element<'_, Message> {
        let picker = pick_list(
            self.models.as_slice(),
            self.selected.as_ref(),
            Message::ModelSelected,
        )
        .placeholder("No models available")
        .width(Length::Fill);

        let can_confirm = !self.is_busy() && self.selected.is_some();
        let confirm = button(text("Confirm").size(14))
            .on_press_maybe(can_confirm.then_some(Message::Confirm))
            .padding(10);

        let status: Element<'_, Message> = match &self.phase {
            Phase::Listing => text("Looking for local models...").size(13).into(),
            Phase::Ready => text("").into(),
            Phase::WarmingUp(model) => text(format!("Loading {}...", model)).size(13).into(),
            Phase::Pulling(tracker) => {
                let mut lines = column![text(format!("Downloading {}", self.default_model)).size(13)]
                    .spacing(6);

                for chunk in tracker.chunks() {
                    lines = lines.push(
                        row![
                            text(format!("pulling {}", chunk.label())).size(12),
                            progress_bar(0.0..=1.0, chunk.fraction()).height(Length::Fixed(10.0)),
                            text(if chunk.finished {
                                format!("{} done", format_bytes(chunk.total))
                            } else {
                                format!(
                                    "{} / {}",
                                    format_bytes(chunk.completed),
                                    format_bytes(chunk.total)
                                )
                            })
                            .size(12),
                        ]
                        .spacing(8)
                        .align_y(alignment::Vertical::Center),
                    );
                }

                for status in tracker.status_lines() {
                    lines = lines.push(text(status.to_string()).size(12));
                }
                lines.into()
            }
        };

        container(
            column![text("Choose a model").size(18), picker, confirm, status]
                .spacing(16)
                .padding(40)
                .align_x(alignment::Horizontal::Center),
        )
        .width(Length::Fill)
        .height(Length::Fill)
        .align_x(alignment::Horizontal::Center)
        .align_y(alignment::Vertical::Center)
        .into()
    }
}

/// Pulls `model` and reports every progress record, then exactly one
/// `Finished` or `Failed`.
fn pull_events(client: OllamaClient, model: String) -> impl Stream<Item = PullEvent> {
    iced::stream::channel(32, move |mut output| async move {
        let mut records = match client.pull_stream(&model).await {
            Ok(records) => records,
            Err(e) => {
                let _ = output.send(PullEvent::Failed(format!("{:#}", e))).await;
                return;
            }
        };

        while let Some(record) = records.next().await {
            match record {
                Ok(progress) => {
                    if output.send(PullEvent::Progress(progress)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = output.send(PullEvent::Failed(format!("{:#}", e))).await;
                    return;
                }
            }
        }

        let _ = output.send(PullEvent::Finished).await;
    })
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
