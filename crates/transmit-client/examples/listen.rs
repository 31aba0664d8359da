//! Listen on a Transmit channel and print every payload.
//!
//! ```sh
//! cargo run -p transmit-client --example listen -- <BASE_URL> <CHANNEL> [XSRF_TOKEN]
//! ```
//!
//! Payloads are printed to stdout as JSON (pipe to `jq` for formatting);
//! lifecycle events go to stderr.

use transmit_client::{HookEvent, HookKind, Transmit, TransmitConfig, XsrfToken};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let base_url = args
        .first()
        .ok_or("usage: listen <BASE_URL> <CHANNEL> [XSRF_TOKEN]")?;
    let channel = args
        .get(1)
        .ok_or("usage: listen <BASE_URL> <CHANNEL> [XSRF_TOKEN]")?;

    let mut config = TransmitConfig::new(base_url.as_str());
    config.heartbeat_timeout_ms = Some(30_000);

    let mut builder = Transmit::builder(config)
        .hook(HookKind::StatusChange, |event| {
            if let HookEvent::StatusChange { status } = event {
                eprintln!("[status] {status}");
            }
        })
        .hook(HookKind::ReconnectAttempt, |event| {
            if let HookEvent::ReconnectAttempt { attempt } = event {
                eprintln!("[reconnect] attempt {attempt}");
            }
        })
        .hook(HookKind::ReconnectFailed, |_| {
            eprintln!("[reconnect] giving up");
        });
    if let Some(token) = args.get(2) {
        builder = builder.credentials(XsrfToken(token.clone()));
    }
    let client = builder.build()?;

    eprintln!("subscribing to '{channel}' as {} ...", client.uid());
    client
        .subscribe(channel, |payload| println!("{payload}"))
        .await?;
    eprintln!("[subscribed]");

    let mut status = client.watch_status();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => eprintln!("interrupted"),
        _ = async {
            while status.changed().await.is_ok() {
                if client.is_closed() {
                    break;
                }
            }
        } => eprintln!("[closed] last status: {}", client.status()),
    }

    client.close();
    Ok(())
}
