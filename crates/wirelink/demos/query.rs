//! Server and client in one process, querying each other.
//!
//! Run with:
//!   cargo run --example query

use std::time::Duration;

use wirelink::frame::{JsonRequest, JsonResponse};
use wirelink::peer::{require_property, Client, Identity, Server};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::builder()
        .with_filter(require_property("token", "demo"))
        .bind("127.0.0.1:0")?;
    server
        .transmitter()
        .respond::<JsonRequest, _>("sum", |request| {
            let sum: i64 = request
                .document
                .as_ref()
                .and_then(|doc| doc.as_array())
                .map(|items| items.iter().filter_map(|item| item.as_i64()).sum())
                .unwrap_or_default();
            JsonResponse::new(serde_json::json!(sum))
        });

    let client = Client::builder(Identity::new("calculator"))
        .with_property("token", "demo")
        .connect(server.local_addr())?;
    client
        .transmitter()
        .respond::<JsonRequest, _>("whoami", |_| {
            JsonResponse::new(serde_json::json!("calculator client"))
        });

    let response = client.query_blocking(&JsonRequest::new(serde_json::json!([1, 2, 3, 4])))?;
    println!("client asked for a sum, server said {:?}", response.document);

    // Wait for the handshake to land, then ask the other way round.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let conn = loop {
        if let Some(conn) = server.first_named("calculator") {
            break conn;
        }
        if std::time::Instant::now() >= deadline {
            return Err("client never authenticated".into());
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    let response = conn.query_blocking(&JsonRequest::empty(), Duration::from_secs(5))?;
    println!("server asked who is there, client said {:?}", response.document);

    client.close();
    server.shutdown();
    Ok(())
}
