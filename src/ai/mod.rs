pub mod describe;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use tracing::debug;

/// Build an async-openai client against an OpenAI-compatible server.
///
/// The scheme defaults to plain http for localhost and private-network
/// hosts (a local inference server is the common case) and https for
/// anything public; `secure` overrides the guess.
#[tracing::instrument(name = "Connecting to model server", level = "debug", skip(api_key))]
pub fn build_client(
    host: &str,
    port: u16,
    api_version: &str,
    secure: Option<bool>,
    api_key: Option<&str>,
) -> Client<OpenAIConfig> {
    let scheme = if let Some(secure) = secure {
        if secure { "https" } else { "http" }
    } else if is_private_host(host) {
        "http"
    } else {
        "https"
    };

    let mut config = OpenAIConfig::default()
        .with_api_base(format!("{scheme}://{host}:{port}/{api_version}"));
    if let Some(key) = api_key {
        config = config.with_api_key(key);
    }
    debug!("Model server base url: {scheme}://{host}:{port}/{api_version}");
    Client::with_config(config)
}

fn is_private_host(host: &str) -> bool {
    host == "localhost"
        || host.ends_with(".local")
        || host.ends_with(".internal")
        || host.ends_with(".lan")
        || host.ends_with(".home.arpa")
        || host
            .parse::<std::net::Ipv4Addr>()
            .is_ok_and(|ip| ip.is_loopback() || ip.is_private() || ip.is_link_local())
        || host.parse::<std::net::Ipv6Addr>().is_ok_and(|ip| {
            ip.is_loopback() || ip.is_unique_local() || ip.is_unicast_link_local()
        })
}

/// Extract the first complete JSON object or array from model output.
///
/// Local models wrap JSON in prose or code fences often enough that
/// deserializing the raw text is a coin flip. This walks the text for the
/// first brace/bracket and returns the balanced span, string-literal aware.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let bytes = text.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_object_from_surrounding_prose() {
        let raw = "Sure! Here is the summary:\n```json\n{\"theme\": \"parking\"}\n```\nHope that helps.";
        assert_eq!(extract_json(raw), Some("{\"theme\": \"parking\"}"));
    }

    #[test]
    fn handles_braces_inside_string_literals() {
        let raw = "{\"theme\": \"use {braces} wisely\", \"n\": 2}";
        assert_eq!(extract_json(raw), Some(raw));
    }

    #[test]
    fn handles_escaped_quotes() {
        let raw = "noise {\"theme\": \"she said \\\"hi\\\"\"} trailing";
        assert_eq!(extract_json(raw), Some("{\"theme\": \"she said \\\"hi\\\"\"}"));
    }

    #[test]
    fn no_json_yields_none() {
        assert_eq!(extract_json("nothing to see here"), None);
        assert_eq!(extract_json("{unclosed"), None);
    }

    #[test]
    fn private_hosts_default_to_http() {
        assert!(is_private_host("localhost"));
        assert!(is_private_host("127.0.0.1"));
        assert!(is_private_host("10.0.0.8"));
        assert!(is_private_host("inference.lan"));
        assert!(!is_private_host("api.example.com"));
    }
}
