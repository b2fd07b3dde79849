//! HTTP routing peek and host rewrite
//!
//! The multiplexer only needs the request line and headers: enough to learn
//! Host and Path. Everything is read through the tee-capturing wrapper so
//! the bytes can be replayed (possibly with a rewritten Host) to the
//! service that wins the route.

use crate::VhostError;
use backhaul_connection::SharedConnection;

/// What routing needs from a peeked HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Raw authority, port suffix included when the client sent one
    pub host: String,
    pub path: String,
}

/// Read the request line and headers, leaving them in the capture buffer.
///
/// Host resolution follows standard precedence: an absolute-URI request
/// line (`CONNECT host:port`, `GET http://host/path`) wins over the `Host`
/// header. A request with neither is unroutable.
pub async fn peek_http_request(
    shared: &mut SharedConnection,
) -> Result<RequestHead, VhostError> {
    let request_line = shared
        .read_line()
        .await?
        .ok_or_else(|| VhostError::MalformedRequest("empty request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| VhostError::MalformedRequest("missing method".to_string()))?
        .to_string();
    let uri = parts
        .next()
        .ok_or_else(|| VhostError::MalformedRequest("missing request target".to_string()))?
        .to_string();

    let (uri_host, path) = split_request_target(&method, &uri);

    let mut header_host = None;
    loop {
        let line = shared
            .read_line()
            .await?
            .ok_or_else(|| VhostError::MalformedRequest("EOF in headers".to_string()))?;
        if line.is_empty() {
            break;
        }
        if header_host.is_none() {
            if let Some((key, value)) = line.split_once(':') {
                if key.trim().eq_ignore_ascii_case("host") {
                    header_host = Some(value.trim().to_string());
                }
            }
        }
    }

    let host = uri_host.or(header_host).ok_or(VhostError::MissingHost)?;
    Ok(RequestHead { method, host, path })
}

/// Split a request target into (authority-from-uri, path).
fn split_request_target(method: &str, uri: &str) -> (Option<String>, String) {
    if method.eq_ignore_ascii_case("CONNECT") {
        return (Some(uri.to_string()), String::new());
    }
    if let Some(scheme_end) = uri.find("://") {
        let rest = &uri[scheme_end + 3..];
        return match rest.find('/') {
            Some(slash) => (
                Some(rest[..slash].to_string()),
                rest[slash..].to_string(),
            ),
            None => (Some(rest.to_string()), "/".to_string()),
        };
    }
    (None, uri.to_string())
}

/// Rewrite the host a peeked request addresses, preserving everything else
/// byte-for-byte.
///
/// An absolute-URI request line is rewritten in place (and any `Host`
/// header left alone, matching lookup precedence); otherwise the first
/// `Host` header before the blank line is rewritten. The original port
/// suffix is kept unless `target` carries its own.
pub fn rewrite_host_header(head: &[u8], target: &str) -> Result<Vec<u8>, VhostError> {
    let mut lines = head.split_inclusive(|&b| b == b'\n');
    let first = lines
        .next()
        .ok_or_else(|| VhostError::MalformedRequest("empty head".to_string()))?;

    let mut out = Vec::with_capacity(head.len() + target.len());

    let first_str = String::from_utf8_lossy(first);
    let terminator = line_terminator(&first_str);
    let trimmed = first_str.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.split_whitespace();
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), v) => (m, u, v),
        _ => return Err(VhostError::MalformedRequest("bad request line".to_string())),
    };

    let absolute = method.eq_ignore_ascii_case("CONNECT") || uri.contains("://");
    if absolute {
        let new_uri = rewrite_target_authority(method, uri, target);
        out.extend_from_slice(method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(new_uri.as_bytes());
        if let Some(v) = version {
            out.push(b' ');
            out.extend_from_slice(v.as_bytes());
        }
        out.extend_from_slice(terminator.as_bytes());
        // absolute form took precedence: headers pass through verbatim
        for line in lines {
            out.extend_from_slice(line);
        }
        return Ok(out);
    }

    out.extend_from_slice(first);

    let mut in_headers = true;
    let mut rewritten = false;
    for line in lines {
        if !in_headers {
            out.extend_from_slice(line);
            continue;
        }
        let text = String::from_utf8_lossy(line);
        let body = text.trim_end_matches(['\r', '\n']);
        if body.is_empty() {
            in_headers = false;
            out.extend_from_slice(line);
            continue;
        }
        if !rewritten {
            if let Some((key, value)) = body.split_once(':') {
                if key.trim().eq_ignore_ascii_case("host") {
                    let new_value = apply_target(value.trim(), target);
                    out.extend_from_slice(key.as_bytes());
                    out.extend_from_slice(b": ");
                    out.extend_from_slice(new_value.as_bytes());
                    out.extend_from_slice(line_terminator(&text).as_bytes());
                    rewritten = true;
                    continue;
                }
            }
        }
        out.extend_from_slice(line);
    }

    Ok(out)
}

/// Swap the host in an absolute-form request target.
fn rewrite_target_authority(method: &str, uri: &str, target: &str) -> String {
    if method.eq_ignore_ascii_case("CONNECT") {
        return apply_target(uri, target);
    }
    match uri.find("://") {
        Some(scheme_end) => {
            let (scheme, rest) = uri.split_at(scheme_end + 3);
            match rest.find('/') {
                Some(slash) => format!(
                    "{}{}{}",
                    scheme,
                    apply_target(&rest[..slash], target),
                    &rest[slash..]
                ),
                None => format!("{}{}", scheme, apply_target(rest, target)),
            }
        }
        None => uri.to_string(),
    }
}

/// Replace the host in `original`, keeping its port unless `target` brings
/// one of its own.
fn apply_target(original: &str, target: &str) -> String {
    if target.contains(':') {
        return target.to_string();
    }
    match original.rsplit_once(':') {
        Some((_, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{}:{}", target, port)
        }
        _ => target.to_string(),
    }
}

fn line_terminator(line: &str) -> &'static str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}
