use std::fmt;

/// A parsed `host[:port]` pair. `port` is `None` when the input carried no
/// usable port and no default was supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bracket = self.host.contains(':');
        match (bracket, self.port) {
            (true, Some(port)) => write!(f, "[{}]:{}", self.host, port),
            (false, Some(port)) => write!(f, "{}:{}", self.host, port),
            (_, None) => f.write_str(&self.host),
        }
    }
}

/// Parses `host:port` or `[v6]:port`.
///
/// Never fails: anything that does not look like a host/port pair is returned
/// whole as the host, with `default_port` as the port. Strings with more than
/// one colon and no brackets are treated as bare (IPv6-looking) hostnames.
pub fn parse_address(address: &str, default_port: Option<u16>) -> Endpoint {
    let bare = || Endpoint {
        host: address.to_string(),
        port: default_port,
    };

    if let Some(rest) = address.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return bare();
        };
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(digits) => parse_port(digits).or(default_port),
            None => default_port,
        };
        return Endpoint { host, port };
    }

    if address.matches(':').count() > 1 {
        return bare();
    }

    if let Some((host, suffix)) = address.rsplit_once(':') {
        if let Some(port) = parse_port(suffix) {
            return Endpoint {
                host: host.to_string(),
                port: Some(port),
            };
        }
    }

    bare()
}

// Leading decimal digits only, so "443/" still yields 443.
fn parse_port(s: &str) -> Option<u16> {
    let end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(s.len(), |(i, _)| i);
    s[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str, port: Option<u16>) -> Endpoint {
        Endpoint {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn host_and_port() {
        assert_eq!(parse_address("example.com:443", None), ep("example.com", Some(443)));
    }

    #[test]
    fn bracketed_ipv6() {
        assert_eq!(parse_address("[::1]:8080", None), ep("::1", Some(8080)));
        assert_eq!(parse_address("[::1]", Some(53)), ep("::1", Some(53)));
        assert_eq!(parse_address("[::1]:http", Some(80)), ep("::1", Some(80)));
        assert_eq!(parse_address("[::1]x", None), ep("::1", None));
    }

    #[test]
    fn unterminated_bracket_is_opaque() {
        assert_eq!(parse_address("[::1:80", Some(1)), ep("[::1:80", Some(1)));
    }

    #[test]
    fn multiple_colons_left_unparsed() {
        assert_eq!(parse_address("a:b:c", Some(7)), ep("a:b:c", Some(7)));
        assert_eq!(parse_address("2001:db8::1", None), ep("2001:db8::1", None));
    }

    #[test]
    fn default_port_applies_to_bare_host() {
        assert_eq!(parse_address("example.com", Some(80)), ep("example.com", Some(80)));
        assert_eq!(parse_address("example.com", None), ep("example.com", None));
    }

    #[test]
    fn non_numeric_port_keeps_whole_string() {
        assert_eq!(parse_address("example.com:https", Some(443)), ep("example.com:https", Some(443)));
        assert_eq!(parse_address("example.com:99999", None), ep("example.com:99999", None));
    }

    #[test]
    fn port_takes_leading_digits() {
        assert_eq!(parse_address("example.com:8443/", None), ep("example.com", Some(8443)));
    }

    #[test]
    fn display_round_trips_brackets() {
        assert_eq!(ep("::1", Some(80)).to_string(), "[::1]:80");
        assert_eq!(ep("example.com", Some(80)).to_string(), "example.com:80");
        assert_eq!(ep("example.com", None).to_string(), "example.com");
    }
}
