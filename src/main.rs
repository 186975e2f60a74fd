mod clipboard;
mod config;
mod models;
mod ollama;
mod progress;
mod selector;
mod session;
mod transcript;

use clap::Parser;
use iced::{
    window::{self, Level},
    Element, Subscription, Task, Theme,
};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat with a local model, fed from the clipboard")]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Config file to use instead of ~/.config/clipchat/config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "clipchat=debug" } else { "clipchat=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> iced::Result {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match &args.config {
        Some(path) => config::Config::load_from(path),
        None => config::Config::load(),
    };
    tracing::info!("clipchat v{} starting", env!("CARGO_PKG_VERSION"));

    let window_settings = window::Settings {
        size: iced::Size::new(config.window.width as f32, config.window.height as f32),
        position: window::Position::Centered,
        ..Default::default()
    };

    iced::application(App::title, App::update, App::view)
        .theme(App::theme)
        .subscription(App::subscription)
        .window(window_settings)
        .run_with(move || App::new(config))
}

#[derive(Debug, Clone)]
enum Message {
    Selector(selector::Message),
    Chat(session::Message),
}

enum Screen {
    Selector(selector::ModelSelector),
    Chat(session::ChatSession),
}

struct App {
    config: config::Config,
    client: ollama::OllamaClient,
    screen: Screen,
}

impl App {
    fn new(config: config::Config) -> (Self, Task<Message>) {
        let host = config.ollama.resolved_host();
        tracing::info!("using Ollama at {}", host);

        let client = ollama::OllamaClient::with_config(host);
        let cli = models::ModelCli::new(config.ollama.cli.clone());

        let (selector, task) = selector::ModelSelector::new(
            cli,
            client.clone(),
            config.ollama.default_model.clone(),
        );

        let app = App {
            config,
            client,
            screen: Screen::Selector(selector),
        };

        (app, task.map(Message::Selector))
    }

    fn title(&self) -> String {
        match &self.screen {
            Screen::Selector(_) => "clipchat - choose a model".to_string(),
            Screen::Chat(session) => format!("clipchat - {}", session.model()),
        }
    }

    fn update(&mut self, message: Message) -> Task<Message> {
        // Messages for a screen that is already gone are dropped.
        match message {
            Message::Selector(message) => {
                let Screen::Selector(selector) = &mut self.screen else {
                    return Task::none();
                };

                match selector.update(message) {
                    selector::Action::None => Task::none(),
                    selector::Action::Run(task) => task.map(Message::Selector),
                    selector::Action::OpenChat(model) => self.open_chat(model),
                }
            }
            Message::Chat(message) => {
                let Screen::Chat(session) = &mut self.screen else {
                    return Task::none();
                };
                session.update(message).map(Message::Chat)
            }
        }
    }

    /// Swaps the selector out for a chat session on `model`. Closing the
    /// window from here on ends the program.
    fn open_chat(&mut self, model: String) -> Task<Message> {
        tracing::info!("opening chat with {}", model);

        let session = session::ChatSession::new(model, self.client.clone(), self.config.clipboard.clone());
        let focus = session.focus_input().map(Message::Chat);
        self.screen = Screen::Chat(session);

        if self.config.window.always_on_top {
            let raise = window::get_latest().and_then(|id| window::change_level(id, Level::AlwaysOnTop));
            Task::batch([focus, raise])
        } else {
            focus
        }
    }

    fn subscription(&self) -> Subscription<Message> {
        match &self.screen {
            Screen::Selector(_) => Subscription::none(),
            Screen::Chat(session) => session.subscription().map(Message::Chat),
        }
    }

    fn view(&self) -> Element<'_, Message> {
        match &self.screen {
            Screen::Selector(selector) => selector.view().map(Message::Selector),
            Screen::Chat(session) => session.view().map(Message::Chat),
        }
    }

    fn theme(&self) -> Theme {
        Theme::TokyoNight
    }
}
