use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;

use chatline_lib::ai::init_endpoint_config;
use chatline_lib::chat::{ChatEvent, ChatHandler, EventSink, ToastLevel};
use chatline_lib::db::connection::{get_image_dir, init_pool, init_pool_at_path};
use chatline_lib::db::LocalImageStore;
use chatline_lib::models::{LlmModel, ModelProvider, Plan, Profile};

#[derive(Parser, Debug)]
#[command(name = "chatline", about = "Send a chat message and stream the answer")]
struct Cli {
    /// SQLite database file (defaults to the platform data directory)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Model ID; defaults to the opened chat's model
    #[arg(long)]
    model: Option<String>,

    /// Provider serving the model (openai, anthropic, google, ollama, ...)
    #[arg(long, default_value = "openai")]
    provider: String,

    /// Continue an existing chat
    #[arg(long)]
    chat_id: Option<String>,

    #[arg(long, default_value_t = 0.5)]
    temperature: f32,

    /// Use a pro plan profile
    #[arg(long)]
    pro: bool,

    /// Generate the last answer of the chat again
    #[arg(long)]
    regenerate: bool,

    /// Message to send
    message: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    chatline_lib::init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let provider = ModelProvider::from_str(&cli.provider)
        .ok_or_else(|| format!("Unknown provider: {}", cli.provider))?;

    let (pool, image_dir) = match &cli.db {
        Some(path) => {
            let dir = path
                .parent()
                .map(|p| p.join("message_images"))
                .unwrap_or_else(|| PathBuf::from("message_images"));
            (init_pool_at_path(path)?, dir)
        }
        None => (init_pool()?, get_image_dir()?),
    };
    let config = {
        let conn = pool.get()?;
        init_endpoint_config(&conn)?
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let mut handler = ChatHandler::from_config(
        pool,
        config,
        Arc::new(LocalImageStore::new(image_dir)),
        sink,
    )?;

    if let Some(chat_id) = &cli.chat_id {
        handler.open_chat(chat_id)?;
    }

    let context = &mut handler.session_mut().context;
    let mut settings = context.settings.clone().unwrap_or_default();
    if let Some(model) = &cli.model {
        settings.model = model.clone();
    }
    if settings.model.is_empty() {
        return Err("No model given; pass --model".into());
    }
    if cli.chat_id.is_none() {
        settings.temperature = cli.temperature;
    }
    context.model = Some(LlmModel {
        model_id: settings.model.clone(),
        model_name: settings.model.clone(),
        image_input: provider != ModelProvider::Ollama,
        provider,
        hosted_id: None,
        paid: false,
        supports_streaming: true,
    });
    context.settings = Some(settings);
    context.profile = Profile {
        user_id: "local".to_string(),
        username: "local".to_string(),
        plan: if cli.pro { Plan::Pro } else { Plan::Free },
        ..Profile::default()
    };

    let printer = tokio::spawn(print_events(rx));

    let stop = handler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let result = if cli.regenerate {
        handler.regenerate().await
    } else {
        let message = cli.message.as_deref().unwrap_or_default();
        handler.send_message(message, false).await
    };

    // Dropping the handler closes the event channel
    drop(handler);
    let _ = printer.await;
    println!();

    let reconciled = result?;
    log::info!("Saved to chat {} ({})", reconciled.chat.id, reconciled.chat.name);
    Ok(())
}

/// Print assistant text as it streams, and toasts to stderr
async fn print_events(mut rx: mpsc::UnboundedReceiver<ChatEvent>) {
    use std::io::Write;

    let mut current: Option<(String, usize)> = None;
    while let Some(event) = rx.recv().await {
        match event {
            ChatEvent::TurnUpdated { turn } => {
                let printed = match &current {
                    Some((id, printed)) if *id == turn.id => *printed,
                    _ => 0,
                };
                if let Some(delta) = turn.content.get(printed..) {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                current = Some((turn.id, turn.content.len()));
            }
            ChatEvent::Toast { level, message } => {
                let label = match level {
                    ToastLevel::Info => "info",
                    ToastLevel::Warning => "warning",
                    ToastLevel::Error => "error",
                };
                eprintln!("[{}] {}", label, message);
            }
            _ => {}
        }
    }
}
