use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TargetError {
    #[error("empty target")]
    Empty,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("target has no host: {0}")]
    NoHost(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Bare host of a target, with any scheme, port and path removed.
/// IPv6 literals are returned without brackets.
pub fn host_of(target: &str) -> Result<String, TargetError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(TargetError::Empty);
    }
    if target.contains("://") {
        let url = parse_url(target)?;
        return url_host(&url, target);
    }
    let without_path = target.split('/').next().unwrap_or(target);
    let host = if let Some(bracketed) = without_path.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or(bracketed)
    } else if without_path.matches(':').count() == 1 {
        without_path.split(':').next().unwrap_or(without_path)
    } else {
        without_path
    };
    if host.is_empty() {
        return Err(TargetError::NoHost(target.to_string()));
    }
    Ok(host.to_string())
}

/// Absolute URL for a target, `http` is assumed if no scheme is given.
pub fn http_url(target: &str) -> Result<Url, TargetError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(TargetError::Empty);
    }
    if target.contains("://") {
        parse_url(target)
    } else {
        parse_url(&format!("http://{}", target))
    }
}

/// Host and port to dial for a TCP target. Explicit ports win; URLs fall back to the scheme
/// default and then to `default_port`, as do bare hosts.
pub fn socket_target(target: &str, default_port: &str) -> Result<(String, u16), TargetError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(TargetError::Empty);
    }
    if target.contains("://") {
        let url = parse_url(target)?;
        let host = url_host(&url, target)?;
        let port = match (url.port(), url.scheme()) {
            (Some(port), _) => port,
            (None, "https") => 443,
            (None, "http") => 80,
            (None, _) => parse_port(default_port)?,
        };
        return Ok((host, port));
    }
    if let Some(rest) = target.strip_prefix('[') {
        return match rest.split_once("]:") {
            Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
            None => Ok((rest.trim_end_matches(']').to_string(), parse_port(default_port)?)),
        };
    }
    match target.matches(':').count() {
        0 => Ok((target.to_string(), parse_port(default_port)?)),
        1 => {
            let (host, port) = target.split_once(':').unwrap_or((target, default_port));
            Ok((host.to_string(), parse_port(port)?))
        }
        // bare IPv6 literal
        _ => Ok((target.to_string(), parse_port(default_port)?)),
    }
}

fn parse_url(raw: &str) -> Result<Url, TargetError> {
    Url::parse(raw).map_err(|e| TargetError::InvalidUrl(format!("{}: {}", raw, e)))
}

fn url_host(url: &Url, raw: &str) -> Result<String, TargetError> {
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(host.trim_start_matches('[').trim_end_matches(']').to_string()),
        _ => Err(TargetError::NoHost(raw.to_string())),
    }
}

fn parse_port(raw: &str) -> Result<u16, TargetError> {
    raw.trim()
        .parse()
        .map_err(|_| TargetError::InvalidPort(raw.to_string()))
}
