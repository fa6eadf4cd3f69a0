use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::jsonc;

const LOOPBACK: &str = "127.0.0.1";
const WILDCARD_HOSTS: [&str; 3] = ["0.0.0.0", "::", "[::]"];

/// Listener the system proxy should point at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MixedInboundProxy {
    pub host: String,
    pub port: u16,
}

/// Finds the first `mixed` inbound of a config file.
///
/// `Ok(None)` means the config has no mixed inbound. A mixed inbound without a
/// usable port is `Error::InvalidPort`.
pub fn inspect(config_path: &Path) -> Result<Option<MixedInboundProxy>> {
    let text = fs::read_to_string(config_path).map_err(|_| Error::config_missing(config_path))?;
    let document = jsonc::parse(&text)?;
    inspect_value(&document)
}

pub fn inspect_value(document: &Value) -> Result<Option<MixedInboundProxy>> {
    let Some(inbounds) = document.get("inbounds").and_then(Value::as_array) else {
        return Ok(None);
    };

    let mixed = inbounds.iter().filter(|inbound| inbound.is_object()).find(|inbound| {
        inbound
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|kind| kind.eq_ignore_ascii_case("mixed"))
    });
    let Some(mixed) = mixed else {
        return Ok(None);
    };

    let port = port_field(mixed, "listen_port")
        .or_else(|| port_field(mixed, "port"))
        .ok_or(Error::InvalidPort)?;
    let host = mixed
        .get("listen")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .unwrap_or(LOOPBACK);

    Ok(Some(MixedInboundProxy {
        host: normalize_host(host),
        port,
    }))
}

/// Integer or numeric string in 1..=65535.
fn port_field(inbound: &Value, name: &str) -> Option<u16> {
    let raw = match inbound.get(name)? {
        Value::Number(number) => number.as_i64()?,
        Value::String(text) => text.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    u16::try_from(raw).ok().filter(|port| *port != 0)
}

fn normalize_host(host: &str) -> String {
    if WILDCARD_HOSTS.iter().any(|wildcard| host.eq_ignore_ascii_case(wildcard)) {
        LOOPBACK.to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn port_accepts_numeric_strings() {
        let doc = json!({"inbounds": [{"type": "mixed", "listen_port": " 7890 "}]});
        assert_eq!(inspect_value(&doc).unwrap().unwrap().port, 7890);
    }

    #[test]
    fn out_of_range_listen_port_falls_back_to_port() {
        let doc = json!({"inbounds": [{"type": "mixed", "listen_port": 70000, "port": 1080}]});
        assert_eq!(inspect_value(&doc).unwrap().unwrap().port, 1080);
    }

    #[test]
    fn zero_and_missing_ports_are_invalid() {
        for inbound in [json!({"type": "mixed", "listen_port": 0}), json!({"type": "mixed"})] {
            let doc = json!({ "inbounds": [inbound] });
            assert!(matches!(inspect_value(&doc), Err(Error::InvalidPort)));
        }
    }

    #[test]
    fn wildcard_hosts_become_loopback() {
        for listen in ["0.0.0.0", "::", "[::]", "  "] {
            let doc = json!({"inbounds": [{"type": "Mixed", "listen": listen, "listen_port": 1}]});
            assert_eq!(inspect_value(&doc).unwrap().unwrap().host, "127.0.0.1");
        }
        let doc = json!({"inbounds": [{"type": "mixed", "listen": "192.168.1.2", "listen_port": 1}]});
        assert_eq!(inspect_value(&doc).unwrap().unwrap().host, "192.168.1.2");
    }

    #[test]
    fn type_must_match_exactly_apart_from_case() {
        let doc = json!({"inbounds": [{"type": " mixed", "listen_port": 1080}]});
        assert_eq!(inspect_value(&doc).unwrap(), None);
    }

    #[test]
    fn documents_without_mixed_inbound_yield_none() {
        assert_eq!(inspect_value(&json!({})).unwrap(), None);
        assert_eq!(inspect_value(&json!({"inbounds": {}})).unwrap(), None);
        assert_eq!(inspect_value(&json!({"inbounds": [{"type": "tun"}]})).unwrap(), None);
    }
}
