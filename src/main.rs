use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use chorus_client::WsTransport;
use chorus_core::ids::{ThreadId, UserId};
use chorus_core::messages::{Author, Message};
use chorus_core::transport::Transport;
use chorus_engine::{ChorusController, EngineEvent};
use chorus_store::ThreadStore;

/// Terminal client for a chorus cycle server.
#[derive(Parser, Debug)]
#[command(name = "chorus", version, about)]
struct Args {
    /// WebSocket endpoint of the chorus server
    #[arg(long, env = "CHORUS_WS_URL", default_value = "ws://localhost:8000/ws")]
    ws_url: String,

    /// User identity passed through to the server
    #[arg(long, env = "CHORUS_USER_ID", default_value = "anonymous")]
    user_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let user_id = UserId::from_raw(args.user_id);

    let transport = Arc::new(
        WsTransport::connect(&args.ws_url)
            .await
            .with_context(|| format!("connecting to {}", args.ws_url))?,
    );
    info!(url = %args.ws_url, "connected");

    let store = Arc::new(ThreadStore::new());
    let thread = store.create_thread("scratch");
    store.set_current_thread(&thread.id);

    let controller = Arc::new(ChorusController::new(
        Arc::clone(&store),
        Arc::clone(&transport) as Arc<dyn Transport>,
    ));
    let _pump = Arc::clone(&controller).attach(transport.subscribe());

    if let Err(err) = controller.create_thread(&thread.name, &user_id).await {
        warn!(error = %err, "server did not accept thread registration");
    }

    // Print engine outcomes as they arrive
    let printer = {
        let store = Arc::clone(&store);
        let mut events = controller.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    EngineEvent::PhaseAdvanced { phase, .. } => {
                        info!(phase = %phase, "phase");
                    }
                    EngineEvent::PriorsUpdated { count, .. } => {
                        info!(count, "priors cited");
                    }
                    EngineEvent::CycleCompleted { thread_id, .. } => {
                        let reply = store
                            .messages(&thread_id)
                            .into_iter()
                            .rev()
                            .find(|m| m.author == Author::Ai && !m.content.is_empty());
                        if let Some(reply) = reply {
                            println!("ai> {}", reply.content);
                        }
                    }
                    EngineEvent::CycleError { detail, .. } => {
                        eprintln!("cycle error: {detail}");
                    }
                    EngineEvent::ServerError { message } => {
                        eprintln!("server error: {message}");
                    }
                }
            }
        })
    };

    println!("connected to {}. Type a prompt, or /help.", args.ws_url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut status = transport.connection_status();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(command) = line.strip_prefix('/') {
                    run_command(command, &controller, &store, &user_id).await;
                    continue;
                }
                let Some(thread_id) = store.current_thread() else {
                    eprintln!("no current thread; /new <name> first");
                    continue;
                };
                let message = Message::user(line, thread_id);
                store.add_message(message.clone());
                if let Err(err) = controller.process_cycle(&message).await {
                    eprintln!("send failed: {err}");
                }
            }
            changed = status.changed() => {
                if changed.is_err() || !*status.borrow() {
                    eprintln!("connection lost");
                    break;
                }
            }
        }
    }

    printer.abort();
    Ok(())
}

async fn run_command(
    command: &str,
    controller: &ChorusController,
    store: &ThreadStore,
    user_id: &UserId,
) {
    let mut parts = command.splitn(2, ' ');
    let verb = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match verb {
        "help" => {
            println!("/threads        list known threads");
            println!("/new <name>     create a thread and switch to it");
            println!("/switch <id>    make a thread current");
            println!("/history        fetch the current thread's messages");
        }
        "threads" => {
            let current = store.current_thread();
            for thread in store.threads() {
                let marker = if Some(&thread.id) == current.as_ref() { "*" } else { " " };
                println!("{marker} {} {}", thread.id, thread.name);
            }
        }
        "new" => {
            if rest.is_empty() {
                eprintln!("usage: /new <name>");
                return;
            }
            let thread = store.create_thread(rest);
            store.set_current_thread(&thread.id);
            if let Err(err) = controller.create_thread(rest, user_id).await {
                warn!(error = %err, "server did not accept thread registration");
            }
            println!("now on {}", thread.id);
        }
        "switch" => {
            if rest.is_empty() {
                eprintln!("usage: /switch <id>");
                return;
            }
            let thread_id = ThreadId::from_raw(rest);
            store.set_current_thread(&thread_id);
            println!("now on {thread_id}");
        }
        "history" => {
            let Some(thread_id) = store.current_thread() else {
                eprintln!("no current thread");
                return;
            };
            match controller.request_thread_messages(&thread_id, user_id).await {
                Ok(()) => println!("history requested for {thread_id}"),
                Err(err) => eprintln!("request failed: {err}"),
            }
        }
        other => eprintln!("unknown command: /{other}"),
    }
}
