//! `http` layer.
//!
//! tshark keys the request and status lines by their own text
//! (`"GET / HTTP/1.1\r\n": {...}`), so both are recovered from the key.

use super::contract::{integer, text, Contract};
use crate::error::MapError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequestLine {
    pub method: String,
    pub uri: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpStatusLine {
    pub version: String,
    pub code: u16,
    pub phrase: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpLayer {
    pub request: Option<HttpRequestLine>,
    pub response: Option<HttpStatusLine>,
    /// Raw header lines without the trailing CRLF.
    pub headers: Vec<String>,
    pub host: Option<String>,
    pub full_uri: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub user_agent: Option<String>,
    pub server: Option<String>,
}

impl HttpLayer {
    pub fn is_request(&self) -> bool {
        self.request.is_some()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

/// Drops the line terminator, escaped or real.
fn strip_crlf(line: &str) -> &str {
    let line = line.strip_suffix("\\r\\n").unwrap_or(line);
    line.trim_end_matches(['\r', '\n'])
}

fn parse_request_line(key: &str) -> Result<HttpRequestLine, MapError> {
    let line = strip_crlf(key);
    let mut parts = line.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(version)) if version.starts_with("HTTP/") => {
            Ok(HttpRequestLine {
                method: method.to_owned(),
                uri: uri.to_owned(),
                version: version.to_owned(),
            })
        }
        _ => Err(MapError::InvalidValue {
            field: "http.request.line".to_owned(),
            value: key.to_owned(),
            expected: "`<METHOD> <URI> HTTP/<version>`",
        }),
    }
}

fn parse_status_line(key: &str) -> Result<HttpStatusLine, MapError> {
    let line = strip_crlf(key);
    let bad = || MapError::InvalidValue {
        field: "http.response.line".to_owned(),
        value: key.to_owned(),
        expected: "`HTTP/<version> <code> <phrase>`",
    };
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().filter(|v| v.starts_with("HTTP/")).ok_or_else(bad)?;
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(bad)?;
    Ok(HttpStatusLine {
        version: version.to_owned(),
        code,
        phrase: parts.next().unwrap_or_default().to_owned(),
    })
}

fn optional_text(v: &crate::tree::Node, field: &str) -> Result<Option<String>, MapError> {
    Ok(Some(strip_crlf(&text(v, field)?).to_owned()))
}

pub fn contract() -> Contract<HttpLayer> {
    Contract::new("http")
        .aggregate("http.request.line", |h: &mut HttpLayer, v| {
            h.headers.push(strip_crlf(&text(v, "http.request.line")?).to_owned());
            Ok(())
        })
        .aggregate("http.response.line", |h: &mut HttpLayer, v| {
            h.headers.push(strip_crlf(&text(v, "http.response.line")?).to_owned());
            Ok(())
        })
        .plain("http.host", |h: &mut HttpLayer, v| {
            h.host = optional_text(v, "http.host")?;
            Ok(())
        })
        .plain("http.request.full_uri", |h: &mut HttpLayer, v| {
            h.full_uri = optional_text(v, "http.request.full_uri")?;
            Ok(())
        })
        .plain("http.content_type", |h: &mut HttpLayer, v| {
            h.content_type = optional_text(v, "http.content_type")?;
            Ok(())
        })
        .plain("http.content_length", |h: &mut HttpLayer, v| {
            h.content_length = Some(integer(v, "http.content_length")?);
            Ok(())
        })
        .plain("http.user_agent", |h: &mut HttpLayer, v| {
            h.user_agent = optional_text(v, "http.user_agent")?;
            Ok(())
        })
        .plain("http.server", |h: &mut HttpLayer, v| {
            h.server = optional_text(v, "http.server")?;
            Ok(())
        })
        .dynamic("HTTP/*", |h: &mut HttpLayer, key, _| {
            h.response = Some(parse_status_line(key)?);
            Ok(())
        })
        .dynamic("* * HTTP/*", |h: &mut HttpLayer, key, _| {
            h.request = Some(parse_request_line(key)?);
            Ok(())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::build;

    #[test]
    fn maps_a_request() {
        let json = r#"{
            "GET /index.html HTTP/1.1\\r\\n": {
                "http.request.method": "GET",
                "http.request.uri": "/index.html",
                "http.request.version": "HTTP/1.1"
            },
            "http.host": "example.com",
            "http.request.line": "Host: example.com\r\n",
            "http.user_agent": "curl/8.5.0",
            "http.request.line": "User-Agent: curl/8.5.0\r\n",
            "http.request.line": "Accept: */*\r\n",
            "\\r\\n": "",
            "http.request.full_uri": "http://example.com/index.html"
        }"#;
        let node = build(json).unwrap().remove(0);
        let http = contract().map(&node).unwrap();
        assert_eq!(
            http.request,
            Some(HttpRequestLine {
                method: "GET".into(),
                uri: "/index.html".into(),
                version: "HTTP/1.1".into(),
            })
        );
        assert!(http.is_request());
        assert_eq!(http.headers.len(), 3);
        assert_eq!(http.header("user-agent"), Some("curl/8.5.0"));
        assert_eq!(http.host.as_deref(), Some("example.com"));
        assert_eq!(http.full_uri.as_deref(), Some("http://example.com/index.html"));
        assert!(http.response.is_none());
    }

    #[test]
    fn maps_a_response() {
        let json = r#"{
            "HTTP/1.1 404 Not Found\r\n": {"http.response.code": "404"},
            "http.server": "nginx",
            "http.response.line": "Server: nginx\r\n",
            "http.content_length": "153",
            "http.response.line": "Content-Length: 153\r\n"
        }"#;
        let node = build(json).unwrap().remove(0);
        let http = contract().map(&node).unwrap();
        let status = http.response.unwrap();
        assert_eq!(status.code, 404);
        assert_eq!(status.phrase, "Not Found");
        assert_eq!(http.content_length, Some(153));
        assert_eq!(http.headers, ["Server: nginx", "Content-Length: 153"]);
    }

    #[test]
    fn line_parsers() {
        assert!(parse_request_line("GET /").is_err());
        assert!(parse_status_line("HTTP/1.1 abc").is_err());
        assert_eq!(parse_status_line("HTTP/2 204").unwrap().phrase, "");
    }
}
