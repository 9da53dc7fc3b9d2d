//! Client request and response objects
//!
//! A [`Request`] is built from the `connect` command (tcUrl, pageUrl) and
//! completed during identification with the stream name the client wants to
//! publish or play. Query parameters on either the tcUrl or the stream name
//! may carry a `vhost` (or `domain`) override.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::ProtocolError;
use crate::registry::StreamKey;

/// Default RTMP port
pub const DEFAULT_PORT: u16 = 1935;

/// How a publishing client announced itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishKind {
    /// FMLE-style: releaseStream, FCPublish, publish
    Fmle,
    /// Flash-style: createStream, publish
    Flash,
    /// Haivision encoders: FCPublish without releaseStream
    Haivision,
}

/// What the client wants to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Unknown,
    Play,
    Publish(PublishKind),
}

impl ConnType {
    pub fn is_publish(&self) -> bool {
        matches!(self, ConnType::Publish(_))
    }

    pub fn is_play(&self) -> bool {
        matches!(self, ConnType::Play)
    }

    /// Name used in logs and security rules
    pub fn action(&self) -> &'static str {
        match self {
            ConnType::Unknown => "unknown",
            ConnType::Play => "play",
            ConnType::Publish(_) => "publish",
        }
    }
}

/// Result of the identification exchange
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub conn_type: ConnType,
    /// Raw stream name, possibly with a query string
    pub stream_name: String,
    /// Requested play duration, if any
    pub duration: Option<Duration>,
}

/// Parsed client request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Client address
    pub ip: IpAddr,
    pub tc_url: String,
    pub page_url: String,
    pub swf_url: String,
    pub schema: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub app: String,
    pub stream: String,
    /// Query string without the leading `?`
    pub param: String,
    /// Requested play duration
    pub duration: Option<Duration>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tc_url: String::new(),
            page_url: String::new(),
            swf_url: String::new(),
            schema: "rtmp".to_string(),
            host: String::new(),
            port: DEFAULT_PORT,
            vhost: String::new(),
            app: String::new(),
            stream: String::new(),
            param: String::new(),
            duration: None,
        }
    }
}

impl Request {
    /// Create a request from a tcUrl
    pub fn from_tc_url(tc_url: &str) -> Result<Self, ProtocolError> {
        let mut req = Request {
            tc_url: tc_url.to_string(),
            ..Default::default()
        };
        req.discover_tc_url()?;
        Ok(req)
    }

    /// Parse `tc_url` into schema, host, port, vhost, app and param
    pub fn discover_tc_url(&mut self) -> Result<(), ProtocolError> {
        let invalid = || ProtocolError::InvalidTcUrl(self.tc_url.clone());

        let url = self.tc_url.trim();
        let (schema, rest) = url.split_once("://").ok_or_else(invalid)?;
        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        if authority.is_empty() {
            return Err(invalid());
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, DEFAULT_PORT),
        };

        let (app, query) = path.split_once('?').unwrap_or((path, ""));
        let app = app.trim_matches('/');

        self.schema = schema.to_string();
        self.host = host.to_string();
        self.port = port;
        self.vhost = host.to_string();
        self.app = app.to_string();
        self.param = query.to_string();

        if let Some(vhost) = vhost_from_query(query) {
            self.vhost = vhost.to_string();
        }

        Ok(())
    }

    /// Apply the stream name from identification
    ///
    /// The name may carry a query string; its `vhost` overrides the one from
    /// the tcUrl and its parameters replace the tcUrl's.
    pub fn apply_stream_name(&mut self, raw: &str) -> Result<(), ProtocolError> {
        let raw = raw.trim();
        let (stream, query) = raw.split_once('?').unwrap_or((raw, ""));

        if !is_valid_stream_name(stream) {
            return Err(ProtocolError::InvalidStreamName(raw.to_string()));
        }

        self.stream = stream.to_string();
        if !query.is_empty() {
            self.param = query.to_string();
            if let Some(vhost) = vhost_from_query(query) {
                self.vhost = vhost.to_string();
            }
        }

        Ok(())
    }

    /// Key of the media source this request targets
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.vhost, &self.app, &self.stream)
    }

    /// Stream url without the vhost, e.g. `live/livestream`
    pub fn stream_url(&self) -> String {
        format!("{}/{}", self.app, self.stream)
    }

    /// Look up a query parameter
    pub fn query_value(&self, key: &str) -> Option<&str> {
        query_pairs(&self.param).find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// Negotiated response fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Message stream id for play/publish
    pub stream_id: u32,
}

impl Default for Response {
    fn default() -> Self {
        // Stream 0 is the NetConnection, media uses 1
        Self { stream_id: 1 }
    }
}

fn query_pairs(query: &str) -> impl Iterator<Item = (&str, &str)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
}

fn vhost_from_query(query: &str) -> Option<&str> {
    query_pairs(query)
        .find(|(k, v)| (*k == "vhost" || *k == "domain") && !v.is_empty())
        .map(|(_, v)| v)
}

fn is_valid_stream_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| !c.is_control() && !c.is_whitespace() && c != '/' && c != '\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_tc_url() {
        let req = Request::from_tc_url("rtmp://example.com:1936/live").unwrap();
        assert_eq!(req.schema, "rtmp");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 1936);
        assert_eq!(req.vhost, "example.com");
        assert_eq!(req.app, "live");
        assert!(req.param.is_empty());
    }

    #[test]
    fn test_discover_tc_url_default_port_and_vhost_param() {
        let req = Request::from_tc_url("rtmp://127.0.0.1/live?vhost=demo.local").unwrap();
        assert_eq!(req.port, DEFAULT_PORT);
        assert_eq!(req.host, "127.0.0.1");
        assert_eq!(req.vhost, "demo.local");
        assert_eq!(req.param, "vhost=demo.local");
    }

    #[test]
    fn test_invalid_tc_url() {
        assert!(matches!(
            Request::from_tc_url("example.com/live"),
            Err(ProtocolError::InvalidTcUrl(_))
        ));
        assert!(matches!(
            Request::from_tc_url("rtmp://host:notaport/live"),
            Err(ProtocolError::InvalidTcUrl(_))
        ));
    }

    #[test]
    fn test_stream_name_with_query() {
        let mut req = Request::from_tc_url("rtmp://host/live").unwrap();
        req.apply_stream_name("test?vhost=other&token=abc").unwrap();

        assert_eq!(req.stream, "test");
        assert_eq!(req.vhost, "other");
        assert_eq!(req.query_value("token"), Some("abc"));
        assert_eq!(req.stream_key(), StreamKey::new("other", "live", "test"));
        assert_eq!(req.stream_url(), "live/test");
    }

    #[test]
    fn test_malformed_stream_name() {
        let mut req = Request::from_tc_url("rtmp://host/live").unwrap();
        assert!(req.apply_stream_name("").is_err());
        assert!(req.apply_stream_name("?vhost=x").is_err());
        assert!(req.apply_stream_name("a/b").is_err());
        assert!(req.apply_stream_name("bad name").is_err());
    }

    #[test]
    fn test_conn_type() {
        assert!(ConnType::Publish(PublishKind::Fmle).is_publish());
        assert!(ConnType::Play.is_play());
        assert_eq!(ConnType::Publish(PublishKind::Haivision).action(), "publish");
        assert_eq!(ConnType::Unknown.action(), "unknown");
    }
}
