//! Parsed inbound protocol requests.
//!
//! The wire protocol is line oriented: one request per newline-terminated
//! line. Data points arrive as `put <metric> <timestamp> <value> [tags...]`
//! and are forwarded verbatim; anything else the balancer understands is an
//! administrative probe.

use thiserror::Error;

/// One parsed line of the inbound protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpRequest {
    /// A data point. The raw line is preserved for forwarding.
    Put { metric: String, line: String },
    /// A `version` probe.
    Version,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty request line")]
    Empty,
    #[error("unrecognized operation: {0}")]
    UnknownOp(String),
}

/// Parse one inbound line.
///
/// The metric name of a `put` may come back empty when the line carries no
/// second token; the resolver routes unnamed traffic without pinning it.
pub fn parse_line(line: &str) -> Result<TcpRequest, ParseError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut tokens = trimmed.split_whitespace();
    match tokens.next() {
        None => Err(ParseError::Empty),
        Some("put") => Ok(TcpRequest::Put {
            metric: tokens.next().unwrap_or_default().to_string(),
            line: trimmed.to_string(),
        }),
        Some("version") => Ok(TcpRequest::Version),
        Some(op) => Err(ParseError::UnknownOp(op.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_put() {
        let request = parse_line("put sys.cpu.user 1447767561 42.2 host=web01\n").unwrap();
        assert_eq!(
            request,
            TcpRequest::Put {
                metric: "sys.cpu.user".to_string(),
                line: "put sys.cpu.user 1447767561 42.2 host=web01".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_put_without_metric() {
        let request = parse_line("put\n").unwrap();
        assert_eq!(
            request,
            TcpRequest::Put {
                metric: String::new(),
                line: "put".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_line("version\n").unwrap(), TcpRequest::Version);
        assert_eq!(parse_line("version").unwrap(), TcpRequest::Version);
    }

    #[test]
    fn test_parse_crlf() {
        let request = parse_line("put sys.cpu.user 1 2\r\n").unwrap();
        assert_eq!(
            request,
            TcpRequest::Put {
                metric: "sys.cpu.user".to_string(),
                line: "put sys.cpu.user 1 2".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_unknown_operation() {
        assert_eq!(
            parse_line("get sys.cpu.user\n").unwrap_err(),
            ParseError::UnknownOp("get".to_string())
        );
    }

    #[test]
    fn test_parse_empty() {
        assert_eq!(parse_line("\n").unwrap_err(), ParseError::Empty);
        assert_eq!(parse_line("   \n").unwrap_err(), ParseError::Empty);
    }
}
