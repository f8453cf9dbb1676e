use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use wirelink_frame::{JsonMessage, JsonRequest, JsonResponse, Message};
use wirelink_peer::{
    require_property, ConnectionEvent, HandshakeConfig, Identity, RejectPolicy, Server,
};

use crate::cmd::ServeArgs;
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{now_unix_seconds, print_event, Event, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let reject_policy = if args.close_rejected {
        RejectPolicy::Close
    } else {
        RejectPolicy::KeepOpen
    };

    let mut builder = Server::builder()
        .with_identity(Identity::new(args.name.as_str()))
        .with_handshake_config(HandshakeConfig {
            reject_policy,
            ..HandshakeConfig::default()
        })
        .on_connection(move |event, conn| {
            let peer = conn.name();
            let id = conn.id().to_string();
            let event = match event {
                ConnectionEvent::Authenticated => Event::Connected { peer, id },
                ConnectionEvent::Disconnected => Event::Disconnected { peer, id },
            };
            print_event(&event, format);
        });
    if let Some(token) = &args.token {
        builder = builder.with_filter(require_property("token", token.as_str()));
    }

    builder
        .transmitter()
        .respond::<JsonRequest, _>("echo", |request| {
            tracing::debug!(type_tag = JsonRequest::TYPE_TAG, "echoing query");
            JsonResponse {
                document: request.document.clone(),
            }
        });

    let (tx, rx) = mpsc::channel();
    builder
        .transmitter()
        .listen::<JsonMessage, _>("print", move |source, message| {
            let peer = source.map_or_else(String::new, |conn| conn.name().to_string());
            let _ = tx.send((peer, message.document.clone()));
        });

    let server = builder
        .bind(args.addr.as_str())
        .map_err(|err| peer_error("bind failed", err))?;
    print_event(
        &Event::Listening {
            addr: server.local_addr(),
        },
        format,
    );

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let (peer, document) = match rx.recv_timeout(POLL_INTERVAL) {
            Ok(received) => received,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        print_event(
            &Event::Message {
                type_tag: JsonMessage::TYPE_TAG,
                peer: &peer,
                document: document.as_ref(),
                timestamp: now_unix_seconds(),
            },
            format,
        );
        printed = printed.saturating_add(1);

        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    server.shutdown();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
