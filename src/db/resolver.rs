//! Multi-host connection failover.
//!
//! A database URL either names its host inline (`postgres://u:p@db1:5432/app`) or leaves
//! the host empty and lists candidates as repeated `host` query parameters
//! (`postgres://u:p@/app?host=db1:5432&host=db2:5432`). The resolver expands the latter
//! into one URL per candidate and [`establish`] connects to the first one that answers.

use crate::config::EngineOptions;
use crate::db::engine::Engine;
use crate::error::{DbError, DbResult};
use tracing::{debug, info, warn};
use url::{ParseError, Url};

/// Query parameter carrying failover candidates.
pub const HOST_PARAM: &str = "host";

/// A URL split into the part before `?` and its raw `key=value` query pairs.
///
/// Pairs are kept exactly as written so that rewriting a URL never re-encodes the
/// parameters it does not touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub base: String,
    pub query: Vec<String>,
}

impl UrlParts {
    pub fn parse(raw: &str) -> Self {
        let (base, query) = match raw.split_once('?') {
            Some((base, query)) => (base, query),
            None => (raw, ""),
        };
        Self {
            base: base.to_string(),
            query: query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    pub fn render(&self) -> String {
        if self.query.is_empty() {
            self.base.clone()
        } else {
            format!("{}?{}", self.base, self.query.join("&"))
        }
    }
}

/// Decoded key of a raw `key=value` query pair.
pub fn query_key(pair: &str) -> String {
    url::form_urlencoded::parse(pair.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default()
}

/// Scheme put in front of schemeless input so it parses as a URL.
const SCHEMELESS_PREFIX: &str = "ambient://";

/// Host written into URLs whose authority has credentials but no host, which the URL
/// parser rejects. It never survives into a candidate.
const STAND_IN_HOST: &str = "failover.invalid";

/// A database URL parsed for rewriting.
struct ParsedUrl {
    url: Url,
    schemeless: bool,
    /// False when the authority was empty and the stand-in host fills it.
    has_host: bool,
}

impl ParsedUrl {
    fn parse(raw: &str) -> DbResult<Self> {
        let schemeless = !raw.contains("://");
        let text = if schemeless {
            format!("{}{}", SCHEMELESS_PREFIX, raw)
        } else {
            raw.to_string()
        };

        match Url::parse(&text) {
            Ok(url) => {
                let has_host = url.host_str().is_some_and(|host| !host.is_empty());
                Ok(Self {
                    url,
                    schemeless,
                    has_host,
                })
            }
            Err(ParseError::EmptyHost) => {
                let url = Url::parse(&with_stand_in_host(&text)).map_err(invalid_url)?;
                Ok(Self {
                    url,
                    schemeless,
                    has_host: false,
                })
            }
            Err(e) => Err(invalid_url(e)),
        }
    }

    /// Serialize `url` back into the shape of the input.
    fn render(&self, url: &Url) -> String {
        let text = url.as_str();
        let text = if self.schemeless {
            text.strip_prefix(SCHEMELESS_PREFIX).unwrap_or(text)
        } else {
            text
        };
        if self.has_host || url.host_str() != Some(STAND_IN_HOST) {
            text.to_string()
        } else {
            text.replacen(STAND_IN_HOST, "", 1)
        }
    }
}

fn invalid_url(err: ParseError) -> DbError {
    DbError::configuration(format!("Invalid database URL: {}", err))
}

/// Insert the stand-in host where the authority of `text` ends.
fn with_stand_in_host(text: &str) -> String {
    let authority_start = text.find("://").map_or(0, |idx| idx + 3);
    let authority_end = text[authority_start..]
        .find(['/', '?', '#'])
        .map_or(text.len(), |idx| authority_start + idx);
    format!(
        "{}{}{}",
        &text[..authority_end],
        STAND_IN_HOST,
        &text[authority_end..]
    )
}

/// SQLite URLs name a file, not a host.
fn is_file_based(raw: &str) -> bool {
    raw.get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("sqlite:"))
}

/// Split a `host:port` candidate. Bracketed IPv6 literals keep their brackets.
fn split_host_port(candidate: &str) -> DbResult<(&str, Option<u16>)> {
    let (host, port) = if candidate.starts_with('[') {
        match candidate.find(']') {
            Some(end) => {
                let rest = &candidate[end + 1..];
                (&candidate[..=end], rest.strip_prefix(':'))
            }
            None => {
                return Err(DbError::configuration(format!(
                    "Unterminated IPv6 host: {}",
                    candidate
                )));
            }
        }
    } else {
        match candidate.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (candidate, None),
        }
    };

    if host.is_empty() {
        return Err(DbError::configuration(format!(
            "Empty host in candidate '{}'",
            candidate
        )));
    }
    let port = port
        .map(|p| {
            p.parse::<u16>().map_err(|_| {
                DbError::configuration(format!("Invalid port '{}' for host {}", p, host))
            })
        })
        .transpose()?;
    Ok((host, port))
}

/// Expand `raw_url` into the ordered list of candidate connection URLs.
///
/// A URL with an inline host (or a SQLite file URL) is its own single candidate.
/// Otherwise every `host` query parameter yields one URL with that host and port
/// substituted and all `host` parameters removed; the remaining parameters are kept
/// verbatim and in order.
pub fn engine_urls(raw_url: &str) -> DbResult<Vec<String>> {
    if is_file_based(raw_url) {
        return Ok(vec![raw_url.to_string()]);
    }

    let parsed = ParsedUrl::parse(raw_url)?;
    if parsed.has_host {
        return Ok(vec![raw_url.to_string()]);
    }

    let hosts: Vec<String> = parsed
        .url
        .query_pairs()
        .filter(|(key, _)| key == HOST_PARAM)
        .map(|(_, value)| value.into_owned())
        .collect();
    if hosts.is_empty() {
        return Err(DbError::configuration(
            "Cannot connect to database - no host specified",
        ));
    }

    let mut base = parsed.url.clone();
    let kept: Vec<&str> = parsed
        .url
        .query()
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty() && query_key(pair) != HOST_PARAM)
        .collect();
    if kept.is_empty() {
        base.set_query(None);
    } else {
        base.set_query(Some(&kept.join("&")));
    }

    hosts
        .iter()
        .map(|candidate| {
            let (host, port) = split_host_port(candidate)?;
            let mut url = base.clone();
            url.set_host(Some(host)).map_err(invalid_url)?;
            url.set_port(port).map_err(|_| {
                DbError::configuration(format!("Cannot set port for host {}", host))
            })?;
            Ok(parsed.render(&url))
        })
        .collect()
}

/// Replace the password of a URL with `***` so it can be logged or printed.
pub fn mask_password(url: &str) -> String {
    if is_file_based(url) {
        return url.to_string();
    }
    let Ok(mut parsed) = ParsedUrl::parse(url) else {
        return url.to_string();
    };
    if parsed.url.password().is_none() || parsed.url.set_password(Some("***")).is_err() {
        return url.to_string();
    }
    parsed.render(&parsed.url)
}

/// Append transport-level overrides to a candidate URL.
fn with_connect_args(url: &str, connect_args: &[(String, String)]) -> String {
    if connect_args.is_empty() {
        return url.to_string();
    }
    let encoded = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(connect_args.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish();
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, encoded)
}

/// Connect to the first reachable candidate of `raw_url`.
///
/// Per-candidate failures are logged and skipped; only when every candidate fails is a
/// connection error returned, carrying the last driver failure as its source.
pub async fn establish(raw_url: &str, options: &EngineOptions) -> DbResult<Engine> {
    let candidates = engine_urls(raw_url)?;
    let total = candidates.len();
    let mut last_error: Option<DbError> = None;

    for (idx, candidate) in candidates.iter().enumerate() {
        let url = with_connect_args(candidate, &options.connect_args);
        debug!(
            candidate = %mask_password(candidate),
            attempt = idx + 1,
            total = total,
            "Trying database host"
        );

        match Engine::connect(&url, options).await {
            Ok(engine) => {
                info!(
                    url = %mask_password(candidate),
                    dialect = %engine.dialect(),
                    "Engine established"
                );
                return Ok(engine);
            }
            Err(e) => {
                warn!(
                    candidate = %mask_password(candidate),
                    error = %e,
                    "Database host unavailable"
                );
                last_error = Some(e);
            }
        }
    }

    let message = format!("Cannot connect to any of {} database host(s)", total);
    let suggestion = "Check that at least one listed host is reachable and accepts the credentials";
    Err(match last_error {
        Some(DbError::Connection {
            source: Some(source),
            ..
        }) => DbError::connection_with_source(message, suggestion, *source),
        Some(DbError::Configuration { message }) => DbError::configuration(message),
        _ => DbError::connection(message, suggestion),
    })
}
