use std::time::Instant;

use serde_json::Value;
use wirelink_frame::{JsonMessage, JsonRequest, JsonResponse, Message};
use wirelink_peer::{ClientBuilder, Identity, PeerConfig};

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{peer_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_event, Event, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let document = parse_document(&args.json)?;
    let query_timeout = parse_duration(&args.timeout)?;

    let mut builder = ClientBuilder::new(Identity::new(args.name.as_str())).with_config(PeerConfig {
        query_timeout,
        ..PeerConfig::default()
    });
    if let Some(token) = &args.token {
        builder = builder.with_property("token", token.as_str());
    }
    let client = builder
        .connect(args.addr.as_str())
        .map_err(|err| peer_error("connect failed", err))?;

    if args.query {
        let started = Instant::now();
        let response: JsonResponse = client
            .query_blocking(&JsonRequest::new(document))
            .map_err(|err| peer_error("query failed", err))?;
        print_event(
            &Event::Response {
                type_tag: JsonResponse::TYPE_TAG,
                document: response.document.as_ref(),
                elapsed_ms: started.elapsed().as_millis(),
            },
            format,
        );
    } else {
        client
            .send(&JsonMessage::new(document))
            .map_err(|err| peer_error("send failed", err))?;
        print_event(
            &Event::Sent {
                type_tag: JsonMessage::TYPE_TAG,
                addr: &args.addr,
            },
            format,
        );
    }

    client.close();
    Ok(SUCCESS)
}

fn parse_document(json: &str) -> CliResult<Value> {
    serde_json::from_str(json)
        .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))
}
