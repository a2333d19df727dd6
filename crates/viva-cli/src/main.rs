use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use viva_agent::HttpAgentClient;
use viva_client::{Speaker, StreamConsumer};
use viva_relay::config::{db_path, load_config};
use viva_relay::{SessionManager, SqliteStore, Store, TurnRelay};
use viva_types::record::Persona;
use viva_types::relay::{RelayFrame, TurnRequest};
use viva_types::wire::encode_frame;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,hyper_util=warn,hyper=warn,reqwest=warn,h2=warn,rustls=warn")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let persona_id = find_arg(&args, "--persona").unwrap_or_else(|| "elder".to_string());
    let resume_id = find_arg(&args, "--resume");
    let batch = args.iter().any(|a| a == "--batch");

    let config = load_config().context("Failed to load config")?;
    let store: Arc<SqliteStore> = Arc::new(
        SqliteStore::open(&config.storage.db_path.clone().unwrap_or_else(db_path))
            .context("Failed to open store")?,
    );
    seed_default_persona(store.as_ref())?;

    let gateway = Arc::new(
        HttpAgentClient::new(
            config.upstream.base_url.clone(),
            Duration::from_secs(config.upstream.request_timeout_secs),
        )
        .context("Failed to build agent client")?,
    );

    let manager = SessionManager::new(
        store.clone(),
        gateway.clone(),
        config.upstream.app_name.clone(),
    );
    let relay = Arc::new(TurnRelay::new(
        store.clone(),
        gateway,
        config.upstream.app_name.clone(),
        Duration::from_secs(config.upstream.idle_timeout_secs),
    ));

    let user_id = whoami();
    let handle = match resume_id {
        Some(id) => {
            let interview_id: Uuid = id.parse().context("--resume takes an interview id")?;
            manager.resume_interview(&user_id, interview_id).await?
        }
        None => manager.start_interview(&user_id, &persona_id).await?,
    };
    println!(
        "Interview {} with persona '{}'. Type your questions; Ctrl-D to finish.",
        handle.interview.id, handle.interview.persona_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        let request = TurnRequest {
            message: message.to_string(),
            user_id: user_id.clone(),
            session_id: handle.session.id.to_string(),
            upstream_session_id: handle.upstream.id.clone(),
            interview_id: handle.interview.id.to_string(),
            streaming: !batch,
        };
        if batch {
            match relay.send_turn(&request).await {
                Ok(outcome) => {
                    println!("{}", outcome.reply);
                    if let Some(usage) = outcome.usage {
                        println!("  [{} in / {} out tokens]", usage.input, usage.output);
                    }
                }
                Err(e) => eprintln!("turn failed: {e}"),
            }
            continue;
        }
        if let Err(e) = run_streaming_turn(&relay, &request).await {
            eprintln!("turn failed: {e}");
        }
    }

    manager
        .end_session(&user_id, handle.session.id, Some(&handle.upstream.id))
        .await?;
    manager.complete_interview(handle.interview.id)?;
    println!("Interview {} completed and saved.", handle.interview.id);
    Ok(())
}

/// One streaming turn: drive the relay into a channel and render frames as
/// they arrive, going through the same wire encoding a browser client sees.
async fn run_streaming_turn(relay: &Arc<TurnRelay>, request: &TurnRequest) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<RelayFrame>(16);
    let relay = relay.clone();
    let req = request.clone();
    let turn = tokio::spawn(async move { relay.stream_turn(&req, tx).await });

    let mut consumer = StreamConsumer::new();
    let mut printed = 0usize;
    while let Some(frame) = rx.recv().await {
        consumer.push_bytes(encode_frame(&frame)?.as_bytes());
        let transcript = consumer.transcript();
        if let Some(entry) = transcript.entries.last() {
            match entry.speaker {
                Speaker::Interviewee => {
                    print!("{}", &entry.text[printed.min(entry.text.len())..]);
                    printed = entry.text.len();
                    std::io::stdout().flush()?;
                }
                Speaker::System => {
                    println!("\n{}", entry.text);
                    printed = 0;
                }
            }
        }
    }
    println!();

    let transcript = consumer.into_transcript();
    if transcript.stats.answered > 0 {
        println!(
            "  [{} in / {} out tokens]",
            transcript.stats.usage.input, transcript.stats.usage.output
        );
    }
    turn.await.context("turn task panicked")??;
    Ok(())
}

fn seed_default_persona(store: &SqliteStore) -> Result<()> {
    if store.persona("elder")?.is_none() {
        store.upsert_persona(&Persona {
            id: "elder".to_string(),
            name: "Village elder".to_string(),
            prompt: "You are a retired schoolteacher in a small rural town, being \
                     interviewed about how the community has changed over fifty years."
                .to_string(),
        })?;
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "student".to_string())
}

fn find_arg(args: &[String], flag: &str) -> Option<String> {
    args.windows(2)
        .find(|w| w[0] == flag)
        .map(|w| w[1].clone())
}
