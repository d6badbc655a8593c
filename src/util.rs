//! Small filesystem and parsing helpers.

use crate::error::{Error, ErrorKind, Result};

/// Read a whole file into a string.
pub fn read_to_string(path: &str) -> Result<String> {
    std::fs::read_to_string(path).map_err(|_| {
        Error::with_message(ErrorKind::IOError, format!("Unable to open '{path}' for reading."))
    })
}

/// Parse the node id from a `KEY=<id>` line (the `/etc/vlink.conf` format).
pub fn parse_node_id(content: &str) -> Result<u8> {
    let line = content.lines().next().unwrap_or("");
    let value = line
        .split_once('=')
        .map(|(_, value)| value.trim())
        .ok_or_else(|| {
            Error::with_message(ErrorKind::IOError, format!("Malformed node id line '{line}'."))
        })?;
    value.parse::<u8>().map_err(|_| {
        Error::with_message(ErrorKind::IOError, format!("Malformed node id value '{value}'."))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_line() {
        assert_eq!(parse_node_id("NODE_ID=7").unwrap(), 7);
        assert_eq!(parse_node_id("NODE_ID= 42 \n").unwrap(), 42);
    }

    #[test]
    fn only_first_line_counts() {
        assert_eq!(parse_node_id("NODE_ID=3\nNODE_ID=9").unwrap(), 3);
    }

    #[test]
    fn rejects_missing_assignment() {
        assert_eq!(parse_node_id("just text").unwrap_err().kind(), ErrorKind::IOError);
        assert_eq!(parse_node_id("").unwrap_err().kind(), ErrorKind::IOError);
    }

    #[test]
    fn rejects_non_numeric_or_oversized_values() {
        assert_eq!(parse_node_id("NODE_ID=abc").unwrap_err().kind(), ErrorKind::IOError);
        assert_eq!(parse_node_id("NODE_ID=256").unwrap_err().kind(), ErrorKind::IOError);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = read_to_string("/nonexistent/vlink.conf").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IOError);
        assert!(err.message().unwrap_or_default().contains("/nonexistent/vlink.conf"));
    }
}
