use std::fmt;
use std::io::Write;
use std::time::Duration;

use curl::easy::Easy;

const USER_AGENT: &str = concat!("symboldb/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
// Fairly low throughput floor, enough to catch dead connections.
const LOW_SPEED_LIMIT: u32 = 500;
const LOW_SPEED_TIME: Duration = Duration::from_secs(60);

/// Transport-level failure, carrying enough endpoint detail for a useful
/// diagnostic: the URL, the effective URL after redirects, the response
/// status, and the remote address.
#[derive(Debug)]
pub struct NetworkError {
    pub message: String,
    pub url: String,
    pub original_url: Option<String>,
    pub status: Option<u32>,
    pub remote: Option<String>,
}

impl NetworkError {
    pub fn new(url: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            url: url.to_owned(),
            original_url: None,
            status: None,
            remote: None,
        }
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.url)?;
        if let Some(original) = &self.original_url {
            write!(f, " (redirected from {})", original)?;
        }
        if let Some(status) = self.status {
            write!(f, ": status {}", status)?;
        }
        if let Some(remote) = &self.remote {
            write!(f, " [{}]", remote)?;
        }
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for NetworkError {}

/// Connection metadata observed while performing a transfer.
#[derive(Debug, Default)]
pub struct FetchMeta {
    pub status: u32,
    pub effective_url: String,
    pub last_modified: Option<i64>,
    pub content_length: Option<u64>,
}

fn configure(easy: &mut Easy, url: &str) -> Result<(), NetworkError> {
    let set = |r: Result<(), curl::Error>| r.map_err(|e| NetworkError::new(url, e.to_string()));
    set(easy.url(url))?;
    set(easy.follow_location(true))?;
    set(easy.useragent(USER_AGENT))?;
    set(easy.connect_timeout(CONNECT_TIMEOUT))?;
    set(easy.low_speed_limit(LOW_SPEED_LIMIT))?;
    set(easy.low_speed_time(LOW_SPEED_TIME))?;
    Ok(())
}

fn parse_http_date(value: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|t| t.timestamp())
}

fn collect_meta(easy: &mut Easy, url: &str, last_modified: Option<i64>) -> FetchMeta {
    let effective_url = easy
        .effective_url()
        .ok()
        .flatten()
        .unwrap_or(url)
        .to_owned();
    let content_length = easy
        .content_length_download()
        .ok()
        .filter(|len| *len >= 0.0)
        .map(|len| len as u64);
    FetchMeta {
        status: easy.response_code().unwrap_or(0),
        effective_url,
        last_modified,
        content_length,
    }
}

fn status_error(easy: &mut Easy, url: &str, meta: &FetchMeta) -> NetworkError {
    let ip = easy.primary_ip().ok().flatten().map(str::to_owned);
    let port = easy.primary_port().ok();
    let remote = match (ip, port) {
        (Some(ip), Some(port)) => Some(format!("{}:{}", ip, port)),
        (Some(ip), None) => Some(ip),
        _ => None,
    };
    let mut err = NetworkError::new(&meta.effective_url, "");
    if meta.effective_url != url {
        err.original_url = Some(url.to_owned());
    }
    err.status = Some(meta.status);
    err.remote = remote;
    err
}

fn perform(
    easy: &mut Easy,
    url: &str,
    sink: Option<&mut dyn Write>,
) -> Result<FetchMeta, NetworkError> {
    let mut last_modified = None;
    let mut write_error: Option<std::io::Error> = None;
    let performed = {
        let mut sink = sink;
        let mut transfer = easy.transfer();
        transfer
            .header_function(|header| {
                if let Ok(line) = std::str::from_utf8(header) {
                    if let Some(value) = line
                        .split_once(':')
                        .filter(|(name, _)| name.eq_ignore_ascii_case("last-modified"))
                        .map(|(_, value)| value)
                    {
                        last_modified = parse_http_date(value);
                    }
                }
                true
            })
            .map_err(|e| NetworkError::new(url, e.to_string()))?;
        transfer
            .write_function(|data| {
                if let Some(sink) = sink.as_deref_mut() {
                    if let Err(err) = sink.write_all(data) {
                        write_error = Some(err);
                        return Ok(0);
                    }
                }
                Ok(data.len())
            })
            .map_err(|e| NetworkError::new(url, e.to_string()))?;
        transfer.perform()
    };
    if let Err(err) = performed {
        if let Some(io_err) = write_error {
            return Err(NetworkError::new(url, io_err.to_string()));
        }
        return Err(NetworkError::new(url, err.to_string()));
    }
    let meta = collect_meta(easy, url, last_modified);
    // A response code of 0 is used by protocols without response codes.
    if meta.status != 200 && meta.status != 0 {
        return Err(status_error(easy, url, &meta));
    }
    Ok(meta)
}

/// GET the URL, streaming the body into SINK.
pub fn http_get(url: &str, sink: &mut dyn Write) -> Result<FetchMeta, NetworkError> {
    let mut easy = Easy::new();
    configure(&mut easy, url)?;
    perform(&mut easy, url, Some(sink))
}

/// HEAD-style request: headers only, no body transfer.
pub fn http_head(url: &str) -> Result<FetchMeta, NetworkError> {
    let mut easy = Easy::new();
    configure(&mut easy, url)?;
    easy.nobody(true)
        .map_err(|e| NetworkError::new(url, e.to_string()))?;
    perform(&mut easy, url, None)
}

#[test]
fn test_parse_http_date() {
    assert_eq!(
        parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT"),
        Some(784887151)
    );
    assert_eq!(parse_http_date("yesterday"), None);
}

#[test]
fn test_network_error_display() {
    let mut err = NetworkError::new("http://mirror/x", "");
    err.status = Some(404);
    err.remote = Some("192.0.2.1:80".to_owned());
    err.original_url = Some("http://example/x".to_owned());
    let text = err.to_string();
    assert!(text.contains("http://mirror/x"));
    assert!(text.contains("redirected from http://example/x"));
    assert!(text.contains("status 404"));
    assert!(text.contains("192.0.2.1:80"));
}
