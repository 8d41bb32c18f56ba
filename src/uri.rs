//! URL parsing, just enough for the HTTP client.
//!
//! `scheme://userinfo@host:port/path?query#fragment`, all parts except the
//! path optional. No percent-decoding; components are kept as written.

use std::fmt;

use crate::address::Address;
use crate::error::Error;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Uri {
    scheme: String,
    userinfo: String,
    host: String,
    port: u16,
    path: String,
    query: String,
    fragment: String,
}

impl Uri {
    pub fn parse(input: &str) -> crate::Result<Uri> {
        if input.is_empty() {
            return Err(Error::InvalidArgument("empty uri".into()));
        }
        let mut uri = Uri::default();
        let mut rest = input;

        if let Some(pos) = rest.find("://") {
            uri.scheme = rest[..pos].to_ascii_lowercase();
            rest = &rest[pos + 3..];

            let authority_end = rest
                .find(|c| c == '/' || c == '?' || c == '#')
                .unwrap_or(rest.len());
            let authority = &rest[..authority_end];
            rest = &rest[authority_end..];

            let host_part = match authority.rfind('@') {
                Some(at) => {
                    uri.userinfo = authority[..at].to_string();
                    &authority[at + 1..]
                }
                None => authority,
            };
            let (host, port) = split_host_port(host_part)?;
            uri.host = host.to_string();
            uri.port = port;
        }

        let path_end = rest.find(|c| c == '?' || c == '#').unwrap_or(rest.len());
        uri.path = rest[..path_end].to_string();
        rest = &rest[path_end..];

        if let Some(after) = rest.strip_prefix('?') {
            let query_end = after.find('#').unwrap_or(after.len());
            uri.query = after[..query_end].to_string();
            rest = &after[query_end..];
        }
        if let Some(after) = rest.strip_prefix('#') {
            uri.fragment = after.to_string();
        }

        Ok(uri)
    }

    #[inline(always)]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    #[inline(always)]
    pub fn userinfo(&self) -> &str {
        &self.userinfo
    }

    #[inline(always)]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The explicit port, 0 when none was written.
    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn port_or_default(&self) -> u16 {
        if self.port != 0 {
            return self.port;
        }
        match self.scheme.as_str() {
            "https" | "wss" => 443,
            _ => 80,
        }
    }

    fn is_default_port(&self) -> bool {
        self.port == 0 || self.port == self.port_or_default()
    }

    /// The path, `/` when empty.
    pub fn path(&self) -> &str {
        if self.path.is_empty() {
            "/"
        } else {
            &self.path
        }
    }

    #[inline(always)]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[inline(always)]
    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    /// Path plus query and fragment, the request-target form.
    pub fn path_and_query(&self) -> String {
        let mut out = self.path().to_string();
        if !self.query.is_empty() {
            out.push('?');
            out.push_str(&self.query);
        }
        if !self.fragment.is_empty() {
            out.push('#');
            out.push_str(&self.fragment);
        }
        out
    }

    /// Resolves the authority into a socket address.
    pub fn create_address(&self) -> crate::Result<Address> {
        if self.host.is_empty() {
            return Err(Error::InvalidAddress("uri without a host".into()));
        }
        let mut addr = Address::lookup_any(&self.host)?;
        addr.set_port(self.port_or_default());
        Ok(addr)
    }
}

fn split_host_port(host_part: &str) -> crate::Result<(&str, u16)> {
    if let Some(rest) = host_part.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| Error::InvalidArgument(format!("unclosed '[' in {:?}", host_part)))?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None => 0,
        };
        return Ok((host, port));
    }
    match host_part.find(':') {
        Some(pos) => Ok((&host_part[..pos], parse_port(&host_part[pos + 1..])?)),
        None => Ok((host_part, 0)),
    }
}

fn parse_port(s: &str) -> crate::Result<u16> {
    s.parse::<u16>()
        .map_err(|_| Error::InvalidArgument(format!("invalid port: {:?}", s)))
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{}://", self.scheme)?;
            if !self.userinfo.is_empty() {
                write!(f, "{}@", self.userinfo)?;
            }
            if self.host.contains(':') {
                write!(f, "[{}]", self.host)?;
            } else {
                write!(f, "{}", self.host)?;
            }
            if !self.is_default_port() {
                write!(f, ":{}", self.port)?;
            }
        }
        write!(f, "{}", self.path())?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn full_uri() {
        let uri = Uri::parse("http://admin@www.example.com:8080/page?id=10&v=20#fr").unwrap();
        assert_eq!(uri.scheme(), "http");
        assert_eq!(uri.userinfo(), "admin");
        assert_eq!(uri.host(), "www.example.com");
        assert_eq!(uri.port(), 8080);
        assert_eq!(uri.path(), "/page");
        assert_eq!(uri.query(), "id=10&v=20");
        assert_eq!(uri.fragment(), "fr");
        assert_eq!(
            uri.to_string(),
            "http://admin@www.example.com:8080/page?id=10&v=20#fr"
        );
    }

    #[test]
    fn default_ports() {
        assert_eq!(Uri::parse("http://a.com/x").unwrap().port_or_default(), 80);
        assert_eq!(Uri::parse("https://a.com/x").unwrap().port_or_default(), 443);
        assert_eq!(
            Uri::parse("https://a.com:8443/").unwrap().port_or_default(),
            8443
        );
    }

    #[test]
    fn empty_path_renders_as_root() {
        let uri = Uri::parse("http://a.com").unwrap();
        assert_eq!(uri.path(), "/");
        assert_eq!(uri.to_string(), "http://a.com/");
    }

    #[test]
    fn bracketed_v6_authority() {
        let uri = Uri::parse("http://[::1]:8080/x").unwrap();
        assert_eq!(uri.host(), "::1");
        assert_eq!(uri.port(), 8080);
        assert_eq!(uri.to_string(), "http://[::1]:8080/x");
    }

    #[test]
    fn path_only() {
        let uri = Uri::parse("/ping?x=1").unwrap();
        assert_eq!(uri.scheme(), "");
        assert_eq!(uri.path(), "/ping");
        assert_eq!(uri.query(), "x=1");
        assert_eq!(uri.path_and_query(), "/ping?x=1");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Uri::parse("").is_err());
        assert!(Uri::parse("http://host:notaport/").is_err());
    }
}
