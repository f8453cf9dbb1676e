//! Minimal echo server: answers every JSON query with its own document.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send 127.0.0.1:7400 --json '{"hello":"world"}' --query

use std::sync::mpsc;

use wirelink::frame::{JsonMessage, JsonRequest, JsonResponse};
use wirelink::peer::{ConnectionEvent, Identity, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let builder = Server::builder()
        .with_identity(Identity::new("echo-server"))
        .on_connection(|event, conn| match event {
            ConnectionEvent::Authenticated => eprintln!("Peer connected: {conn}"),
            ConnectionEvent::Disconnected => eprintln!("Peer disconnected: {conn}"),
        });

    builder
        .transmitter()
        .respond::<JsonRequest, _>("echo", |request| JsonResponse {
            document: request.document.clone(),
        });

    // A plain message with a `"stop"` document shuts the server down.
    let (stop, stopped) = mpsc::channel();
    builder
        .transmitter()
        .listen::<JsonMessage, _>("stop", move |_, message| {
            if message.document == Some(serde_json::json!("stop")) {
                let _ = stop.send(());
            }
        });

    let server = builder.bind("127.0.0.1:7400")?;
    eprintln!("Listening on {}", server.local_addr());

    let _ = stopped.recv();
    server.shutdown();
    Ok(())
}
