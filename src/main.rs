use std::process::ExitCode;

use clap::Parser;
use streamchat_rs::auth::Credential;
use streamchat_rs::client::{ChatClient, StreamEvent};
use streamchat_rs::config::{load_config, AppConfig};
use streamchat_rs::observability::init_tracing;
use streamchat_rs::protocol::ModelSelector;
use streamchat_rs::session::ChatSession;
use tokio::io::AsyncWriteExt;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Stream a chat completion to stdout.
#[derive(Parser, Debug)]
#[command(name = "streamchat", about = "Stream a chat completion to stdout")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Model override, `persona` or `persona/llm`.
    #[arg(long)]
    model: Option<String>,

    /// List the backend's models and exit.
    #[arg(long)]
    list_models: bool,

    /// Prompt words, joined with spaces.
    #[arg(required_unless_present = "list_models")]
    prompt: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.features.log_level);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(config, cli))
}

async fn run(config: AppConfig, cli: Cli) -> ExitCode {
    let credential = match Credential::resolve(&config.auth) {
        Ok(credential) => credential,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let client = match ChatClient::new(&config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if cli.list_models {
        return list_models(&client, &credential).await;
    }
    let mut session = ChatSession::new(client, credential, &config.chat);
    if let Some(model) = cli.model {
        session.set_model(model);
    }
    chat(&mut session, cli.prompt.join(" ")).await
}

async fn list_models(client: &ChatClient, credential: &Credential) -> ExitCode {
    match client.list_models(credential).await {
        Ok(models) => {
            for model in models.data {
                let selector = ModelSelector::parse(&model.id);
                match selector.llm_model {
                    Some(llm) => println!("{}\tpersona={} llm={llm}", model.id, selector.persona_id),
                    None => println!("{}\tpersona={}", model.id, selector.persona_id),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn chat(session: &mut ChatSession, prompt: String) -> ExitCode {
    let selector = ModelSelector::parse(session.model());
    tracing::info!(
        persona = selector.persona_id,
        llm = selector.llm_model.unwrap_or("default"),
        "sending prompt"
    );

    let mut stdout = tokio::io::stdout();
    session.send(prompt).await;
    while let Some(event) = session.next_event().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                let Some(text) = chunk
                    .primary_choice()
                    .and_then(|choice| choice.delta.content.as_deref())
                else {
                    continue;
                };
                if stdout.write_all(text.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                    session.cancel().await;
                    return ExitCode::FAILURE;
                }
            }
            StreamEvent::Complete(_) => {
                let _ = stdout.write_all(b"\n").await;
                let _ = stdout.flush().await;
                if let Some(tool_calls) = session.last_message().and_then(|m| m.tool_calls.as_ref()) {
                    for call in tool_calls {
                        println!(
                            "[tool call {}] {}({})",
                            call.id, call.function.name, call.function.arguments
                        );
                    }
                }
                return ExitCode::SUCCESS;
            }
            StreamEvent::Error(e) => {
                let _ = stdout.flush().await;
                eprintln!("\nstream failed: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::FAILURE
}
