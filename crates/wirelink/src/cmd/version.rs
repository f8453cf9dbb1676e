use wirelink_frame::{DEFAULT_MAX_FRAME, LENGTH_PREFIX_SIZE};
use wirelink_peer::{default_registry, PeerConfig};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("wirelink {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: wirelink");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("WIRELINK_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "features: peer={}, async={}, cli=true",
        cfg!(feature = "peer"),
        cfg!(feature = "async")
    );

    // Wire parameters a peer must agree on.
    println!("length_prefix_bytes: {LENGTH_PREFIX_SIZE}");
    println!("max_frame_bytes: {DEFAULT_MAX_FRAME}");
    let config = PeerConfig::default();
    println!("query_timeout: {:?}", config.query_timeout);
    match config.frame.write_timeout {
        Some(timeout) => println!("write_timeout: {timeout:?}"),
        None => println!("write_timeout: none"),
    }
    println!("builtin_types: {}", builtin_types().join(", "));

    Ok(SUCCESS)
}

/// Type tags every server and client registers before any user types.
fn builtin_types() -> Vec<&'static str> {
    default_registry().tags()
}

#[cfg(test)]
mod tests {
    use wirelink_frame::{JsonRequest, Message};
    use wirelink_peer::{Handshake, QueryError};

    use super::*;

    #[test]
    fn builtin_types_cover_handshake_and_json() {
        let tags = builtin_types();
        assert!(tags.contains(&Handshake::TYPE_TAG));
        assert!(tags.contains(&QueryError::TYPE_TAG));
        assert!(tags.contains(&JsonRequest::TYPE_TAG));
        assert!(tags.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
