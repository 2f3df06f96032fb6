use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use vpin_data::{
    Broadcaster, EngineConfig, FeedConfig, StatusSnapshot, StreamConfig, VpinService,
    anomaly::{AnomalyPublisher, WebhookAgent, spawn_dispatcher},
    feed::{backoff::ExponentialBackoff, source::WebSocketSource},
};

type LiveService = VpinService<WebSocketSource, ExponentialBackoff>;

/// Control command sent by a client, eg/ `{"command":"reset","resume_streaming":true}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ControlCommand {
    Start,
    Stop,
    Status,
    Reset {
        #[serde(default)]
        resume_streaming: bool,
    },
}

/// Reply to a [`ControlCommand`], in the same `{"type": ..., "data": ...}` shape as stream
/// messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
enum ControlReply {
    Status {
        command: &'static str,
        accepted: bool,
        status: StatusSnapshot,
    },
    Error {
        message: String,
    },
}

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting vpin-data WebSocket server");

    let (engine, stream, feed) = match (
        EngineConfig::from_env(),
        StreamConfig::from_env(),
        FeedConfig::from_env(),
    ) {
        (Ok(engine), Ok(stream), Ok(feed)) => (engine, stream, feed),
        (Err(error), _, _) | (_, Err(error), _) | (_, _, Err(error)) => {
            error!(%error, "invalid configuration");
            std::process::exit(1);
        }
    };

    info!(
        bucket_volume = %engine.bucket_volume,
        window_size = engine.window_size,
        history_capacity = stream.history_capacity,
        feed = %feed.url,
        "configuration loaded"
    );

    let broadcaster = Broadcaster::new(&stream);
    let service = match LiveService::from_feed_config(&feed, engine, broadcaster.clone()) {
        Ok(service) => service,
        Err(error) => {
            error!(%error, "failed to construct VPIN service");
            std::process::exit(1);
        }
    };

    // Optional external agent investigating alert escalations
    let service = match WebhookAgent::from_env() {
        Some(agent) => {
            info!("anomaly agent webhook configured");
            let (publisher, events) = AnomalyPublisher::new(stream.anomaly_queue);
            spawn_dispatcher(Arc::new(agent), events, broadcaster, stream.agent_timeout);
            service.with_anomalies(publisher)
        }
        None => service,
    };
    let service = Arc::new(service);

    // Configurable via WS_ADDR env var (default: 0.0.0.0:9001)
    let server_addr_str = std::env::var("WS_ADDR").unwrap_or_else(|_| "0.0.0.0:9001".to_string());
    let server_addr = server_addr_str
        .parse::<SocketAddr>()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 9001)));

    let listener = match TcpListener::bind(&server_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%server_addr, %error, "failed to bind WebSocket server");
            std::process::exit(1);
        }
    };
    info!("WebSocket server listening on ws://{}", server_addr);

    service.start().await;

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&service)) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(error) = result {
                error!(%error, "failed to listen for shutdown signal");
            }
            info!("shutdown signal received");
        }
    }

    service.stop().await;
    info!("vpin-data WebSocket server stopped");
}

async fn accept_loop(listener: TcpListener, service: Arc<LiveService>) {
    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("New WebSocket connection from {}", peer_addr);
        tokio::spawn(handle_client(stream, peer_addr, Arc::clone(&service)));
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(stream: TcpStream, peer_addr: SocketAddr, service: Arc<LiveService>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    info!("WebSocket handshake completed for {}", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let Some(mut subscription) = service.broadcaster().on_subscribe() else {
        error!("Failed to register subscriber for {}", peer_addr);
        return;
    };
    let subscriber_id = subscription.id;
    let (reply_tx, mut reply_rx) = mpsc::channel::<ControlReply>(8);

    // Send welcome message
    let welcome = serde_json::json!({
        "type": "welcome",
        "message": "Connected to vpin-data stream",
        "timestamp": Utc::now()
    });
    if let Ok(msg) = serde_json::to_string(&welcome) {
        let _ = ws_sender.send(Message::Text(msg.into())).await;
    }

    // Forward stream messages and control replies to this client
    let mut send_task = tokio::spawn(async move {
        loop {
            let json = tokio::select! {
                message = subscription.receiver.recv() => match message {
                    Some(message) => serde_json::to_string(&message),
                    None => {
                        // Dropped by the broadcaster, eg/ queue full
                        warn!("Client {} dropped by broadcaster", peer_addr);
                        break;
                    }
                },
                Some(reply) = reply_rx.recv() => serde_json::to_string(&reply),
            };

            match json {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(error) => warn!(%error, "failed to serialise message for {}", peer_addr),
            }
        }
    });

    // Handle incoming control commands from client
    let control_service = Arc::clone(&service);
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!("Received ping from {}", peer_addr);
                }
                Ok(Message::Text(text)) => {
                    let reply = handle_command(&control_service, text.as_str()).await;
                    if reply_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            info!("Send task completed for {}", peer_addr);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            info!("Receive task completed for {}", peer_addr);
            send_task.abort();
        }
    }

    service.broadcaster().on_unsubscribe(subscriber_id);
    info!("WebSocket connection closed for {}", peer_addr);
}

async fn handle_command(service: &LiveService, text: &str) -> ControlReply {
    let command = match serde_json::from_str::<ControlCommand>(text) {
        Ok(command) => command,
        Err(error) => {
            debug!(%error, "ignoring invalid control command");
            return ControlReply::Error {
                message: format!("invalid command: {error}"),
            };
        }
    };

    info!(?command, "control command received");

    let (command, accepted, status) = match command {
        ControlCommand::Start => ("start", service.start().await, service.status()),
        ControlCommand::Stop => ("stop", service.stop().await, service.status()),
        ControlCommand::Status => ("status", true, service.status()),
        ControlCommand::Reset { resume_streaming } => {
            ("reset", true, service.reset(resume_streaming).await)
        }
    };

    ControlReply::Status {
        command,
        accepted,
        status,
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_command_de() {
        struct TestCase {
            input: &'static str,
            expected: Result<&'static str, ()>,
        }

        let tests = vec![
            TestCase {
                // TC0
                input: r#"{"command":"start"}"#,
                expected: Ok("Start"),
            },
            TestCase {
                // TC1: resume_streaming defaults to false
                input: r#"{"command":"reset"}"#,
                expected: Ok("Reset { resume_streaming: false }"),
            },
            TestCase {
                // TC2
                input: r#"{"command":"reset","resume_streaming":true}"#,
                expected: Ok("Reset { resume_streaming: true }"),
            },
            TestCase {
                // TC3: unknown command
                input: r#"{"command":"shutdown"}"#,
                expected: Err(()),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<ControlCommand>(test.input);
            match (actual, test.expected) {
                (Ok(actual), Ok(expected)) => {
                    assert_eq!(format!("{actual:?}"), expected, "TC{} failed", index)
                }
                (Err(_), Err(_)) => {
                    // Test passed
                }
                (actual, expected) => {
                    // Test failed
                    panic!(
                        "TC{index} failed because actual != expected. \nActual: {actual:?}\nExpected: {expected:?}\n"
                    );
                }
            }
        }
    }
}
