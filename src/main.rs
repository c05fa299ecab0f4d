use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use log::{debug, error, info};
use serde_json::json;

use gemini_live::audio::spawn_volume_ticker;
use gemini_live::logging::LogStore;
use gemini_live::session::LiveSession;
use gemini_live::transport::WebSocketTransportFactory;
use gemini_live::types::config::{
    FunctionDeclaration, GenerationConfig, LiveConfig, ParameterSchema, Tool,
};
use gemini_live::types::events::Event;
use gemini_live::types::protocol::{Content, FunctionResponse};

// Voice console for a live session: microphone in, model audio out.
//
// Usage:
//   cargo run -- --api-key KEY
//   GEMINI_API_KEY=KEY cargo run
//   cargo run -- --say "draw me a chart of rainfall by month"
//   cargo run -- --muted --no-playback     # no audio devices touched

#[derive(Parser)]
#[command(name = "gemini-live")]
struct Args {
    /// API key; falls back to the GEMINI_API_KEY environment variable
    #[arg(long)]
    api_key: Option<String>,

    #[arg(long, default_value = "models/gemini-2.0-flash-exp")]
    model: String,

    #[arg(long, default_value = "Aoede")]
    voice: String,

    /// System instruction for the session
    #[arg(long)]
    system_instruction: Option<String>,

    /// Start with the microphone off
    #[arg(long)]
    muted: bool,

    /// Do not attach the speaker pipeline
    #[arg(long)]
    no_playback: bool,

    /// Send one text turn right after connecting
    #[arg(long)]
    say: Option<String>,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Utc::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    rt.block_on(run(args));
}

fn build_config(args: &Args) -> LiveConfig {
    let mut config = LiveConfig::new(args.model.clone())
        .with_generation_config(GenerationConfig::audio_with_voice(args.voice.clone()))
        .with_tools(vec![
            Tool::google_search(),
            Tool::functions(vec![FunctionDeclaration {
                name: "render_altair".to_string(),
                description: "Displays an altair graph in json format.".to_string(),
                parameters: Some(
                    ParameterSchema::object()
                        .property(
                            "json_graph",
                            "string",
                            "JSON STRING representation of the graph to render. \
                             Must be a string, not a json object",
                        )
                        .require("json_graph"),
                ),
            }]),
        ]);
    if let Some(instruction) = &args.system_instruction {
        config = config.with_system_instruction(instruction.clone());
    }
    config
}

async fn run(args: Args) {
    let Some(api_key) = args
        .api_key
        .clone()
        .or_else(|| std::env::var("GEMINI_API_KEY").ok())
    else {
        error!("No API key: pass --api-key or set GEMINI_API_KEY");
        return;
    };

    let config = build_config(&args);
    let session = LiveSession::new(Arc::new(WebSocketTransportFactory::new(&api_key)));

    let log_store = Arc::new(LogStore::new());
    let _log_subscription = session.subscribe(log_store.clone());

    let tool_session = session.clone();
    let _event_subscription = session.subscribe_fn(move |event: &Event| match event {
        Event::Content(content) => {
            if let Some(turn) = &content.model_turn {
                for part in &turn.parts {
                    if let Some(text) = &part.text {
                        info!("model: {text}");
                    }
                }
            }
        }
        Event::ToolCall(call) => {
            let names: Vec<&str> = call
                .function_calls
                .iter()
                .map(|fc| fc.name.as_str())
                .collect();
            info!("tool call: {}", names.join(", "));
            for fc in &call.function_calls {
                if fc.name == "render_altair" {
                    info!("altair graph: {}", fc.args["json_graph"]);
                }
            }
            let responses: Vec<FunctionResponse> = call
                .function_calls
                .iter()
                .map(|fc| FunctionResponse {
                    id: fc.id.clone(),
                    response: json!({ "output": { "success": true } }),
                })
                .collect();
            let session = tool_session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.send_tool_response(responses).await {
                    error!("Failed to send tool response: {e}");
                }
            });
        }
        Event::Interrupted => info!("-- interrupted --"),
        Event::TurnComplete => info!("-- turn complete --"),
        Event::Close { reason } => info!("Session closed: {reason:?}"),
        _ => {}
    });

    if let Err(e) = session.connect(config).await {
        error!("Connect failed: {e}");
        return;
    }
    info!("Connected");

    if !args.no_playback {
        match session.enable_playback() {
            Ok(()) => {
                if let Some(meter) = session.output_meter() {
                    let mut level = spawn_volume_ticker(meter, Duration::from_millis(250));
                    tokio::spawn(async move {
                        while level.changed().await.is_ok() {
                            let value = *level.borrow();
                            if value > 0.01 {
                                debug!("output level: {value:.3}");
                            }
                        }
                    });
                }
            }
            Err(e) => error!("Playback unavailable: {e}"),
        }
    }

    if !args.muted {
        match session.start_microphone() {
            Ok(()) => {
                let mut volume = session.input_volume();
                tokio::spawn(async move {
                    while volume.changed().await.is_ok() {
                        let value = *volume.borrow();
                        if value > 0.01 {
                            debug!("input level: {value:.3}");
                        }
                    }
                });
            }
            Err(e) => error!("Microphone unavailable: {e}"),
        }
    }

    if let Some(text) = &args.say {
        if let Err(e) = session
            .send_client_content(vec![Content::user_text(text.clone())], true)
            .await
        {
            error!("Failed to send text turn: {e}");
        }
    }

    info!("Press Ctrl+C to hang up");
    let _ = tokio::signal::ctrl_c().await;

    session.disconnect().await;
    info!("Done; {} log entries captured", log_store.len());
}
