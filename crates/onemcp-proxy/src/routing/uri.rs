//! The composite name scheme at the inbound boundary.
//!
//! Every tool name, resource uri, resource template and prompt name a client
//! sees is `{connectionName}{SEP}{upstreamName}`. Splitting happens on the
//! first separator occurrence, so upstream names may themselves contain it.

/// Separator between the connection name and the upstream name.
pub const NAME_SEPARATOR: &str = "_1mcp_";

/// Reserved connection name routed to the internal tools provider.
pub const INTERNAL_SERVER_NAME: &str = "1mcp";

/// A split composite name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri<'a> {
    pub server: &'a str,
    pub name: &'a str,
}

impl ParsedUri<'_> {
    pub fn is_internal(&self) -> bool {
        self.server == INTERNAL_SERVER_NAME
    }
}

/// Split a composite name on the first separator.
pub fn parse_uri(composite: &str) -> Option<ParsedUri<'_>> {
    let (server, name) = composite.split_once(NAME_SEPARATOR)?;
    if server.is_empty() || name.is_empty() {
        return None;
    }
    Some(ParsedUri { server, name })
}

/// Assemble a composite name.
pub fn build_uri(server: &str, name: &str) -> String {
    format!("{server}{NAME_SEPARATOR}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let composite = build_uri("fs", "read_file");
        assert_eq!(composite, "fs_1mcp_read_file");
        let parsed = parse_uri(&composite).unwrap();
        assert_eq!(parsed.server, "fs");
        assert_eq!(parsed.name, "read_file");
        assert_eq!(build_uri(parsed.server, parsed.name), composite);
    }

    #[test]
    fn splits_on_first_separator_only() {
        let parsed = parse_uri("a_1mcp_b_1mcp_c").unwrap();
        assert_eq!(parsed.server, "a");
        assert_eq!(parsed.name, "b_1mcp_c");
    }

    #[test]
    fn unprefixed_names_do_not_parse() {
        assert!(parse_uri("read_file").is_none());
        assert!(parse_uri("_1mcp_x").is_none());
        assert!(parse_uri("x_1mcp_").is_none());
    }

    #[test]
    fn internal_prefix_is_recognised() {
        let parsed = parse_uri("1mcp_1mcp_mcp_install").unwrap();
        assert!(parsed.is_internal());
        assert_eq!(parsed.name, "mcp_install");
    }
}
