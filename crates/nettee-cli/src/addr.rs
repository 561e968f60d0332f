//! Connection specification: `[bind_address:]port:host:hostport`.
//!
//! IPv6 literals must be bracketed (`[::1]:8080:[::1]:80`). An omitted bind
//! address listens on all IPv4 interfaces.

use anyhow::{bail, Context, Result};
use nettee_core::Endpoint;

/// Bind host used when the connection string omits one.
const ANY_HOST: &str = "0.0.0.0";

/// Parse a connection specification into `(bind, remote)` endpoints.
pub fn parse_connection_spec(spec: &str) -> Result<(Endpoint, Endpoint)> {
    let fields = split_fields(spec).with_context(|| bad_spec(spec))?;

    let (bind_host, bind_port, host, host_port) = match fields.as_slice() {
        [port, host, host_port] => ("", *port, *host, *host_port),
        [bind, port, host, host_port] => (*bind, *port, *host, *host_port),
        _ => bail!(bad_spec(spec)),
    };

    let bind_host = match unbracket(bind_host) {
        "" => ANY_HOST,
        h => h,
    };
    let host = unbracket(host);
    if host.is_empty() {
        bail!("{}: empty remote host", bad_spec(spec));
    }

    let bind = Endpoint::new(bind_host, parse_port(bind_port, spec)?);
    let remote = Endpoint::new(host, parse_port(host_port, spec)?);
    Ok((bind, remote))
}

fn bad_spec(spec: &str) -> String {
    format!("bad connection specification '{spec}'")
}

fn parse_port(field: &str, spec: &str) -> Result<u16> {
    field
        .parse::<u16>()
        .with_context(|| format!("{}: invalid port '{field}'", bad_spec(spec)))
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Split on `:` outside of `[...]`.
fn split_fields(spec: &str) -> Result<Vec<&str>> {
    let mut fields = Vec::new();
    let mut depth = 0u32;
    let mut start = 0;

    for (i, c) in spec.char_indices() {
        match c {
            '[' if depth == 0 => depth = 1,
            ']' if depth == 1 => depth = 0,
            '[' | ']' => bail!("unbalanced brackets"),
            ':' if depth == 0 => {
                fields.push(&spec[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        bail!("unbalanced brackets");
    }
    fields.push(&spec[start..]);
    Ok(fields)
}
