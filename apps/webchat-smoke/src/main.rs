use std::{env, time::Duration};

use tracing_subscriber::EnvFilter;
use webchat_client::WebchatClient;
use webchat_core::{ConnectOn, WebchatConfig, WebchatEvent};

const DEFAULT_FILTER: &str = "info,webchat_client=debug,webchat_socket=debug";

/// Initialize tracing with severity gating from the environment.
///
/// Precedence: `RUST_LOG`, then `WEBCHAT_LOG`, then the internal default.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            env::var("WEBCHAT_LOG")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(EnvFilter::try_new)
                .unwrap_or_else(|| EnvFilter::try_new(DEFAULT_FILTER))
        })
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter)
        .try_init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let Some(socket_url) = env::var("WEBCHAT_SOCKET_URL").ok() else {
        println!("Set WEBCHAT_SOCKET_URL and WEBCHAT_CHANNEL_UUID to run the live smoke.");
        println!("Optional: WEBCHAT_HOST, WEBCHAT_TOKEN, WEBCHAT_TEXT.");
        return;
    };
    let channel_uuid = env::var("WEBCHAT_CHANNEL_UUID").unwrap_or_default();

    let mut config = WebchatConfig::new(socket_url, channel_uuid);
    config.host = env::var("WEBCHAT_HOST").unwrap_or_default();
    config.session_token = env::var("WEBCHAT_TOKEN").ok();
    config.connect_on = ConnectOn::Manual;

    let client = match WebchatClient::new(config) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("Failed to initialize client: {err}");
            std::process::exit(1);
        }
    };

    let mut events = client.subscribe();
    if let Err(err) = client.connect().await {
        eprintln!("Failed to connect: {err}");
        std::process::exit(1);
    }
    println!(
        "Connected as {}",
        client.session_id().unwrap_or_else(|| "<no session>".to_owned())
    );

    if let Ok(text) = env::var("WEBCHAT_TEXT") {
        let message = client.send_text(text).await.expect("smoke send failed");
        println!("Sent message {} ({:?})", message.id, message.status);
    }

    // Echo events for a short observation window, then shut down.
    let window = tokio::time::sleep(Duration::from_secs(15));
    tokio::pin!(window);
    loop {
        tokio::select! {
            _ = &mut window => break,
            event = events.recv() => match event {
                Ok(WebchatEvent::StateChanged { .. }) => {}
                Ok(event) => println!("event: {}", event.name()),
                Err(_) => break,
            }
        }
    }

    client.destroy();
    println!("Done.");
}
