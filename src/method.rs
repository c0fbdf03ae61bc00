//! HTTP method as a typed enum.
//!
//! Only the eight methods the router dispatches on. Anything else (CONNECT,
//! WebDAV verbs, ...) never matches a route and is answered with 404.

use std::fmt;
use std::str::FromStr;

/// A routable HTTP method.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Options,
    Head,
    Patch,
    Trace,
}

impl Method {
    /// Every routable method, in `App::any` registration order.
    pub const ALL: [Method; 8] = [
        Self::Post,
        Self::Get,
        Self::Put,
        Self::Delete,
        Self::Options,
        Self::Head,
        Self::Patch,
        Self::Trace,
    ];

    /// Returns the uppercase wire representation (e.g. `"GET"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delete  => "DELETE",
            Self::Get     => "GET",
            Self::Head    => "HEAD",
            Self::Options => "OPTIONS",
            Self::Patch   => "PATCH",
            Self::Post    => "POST",
            Self::Put     => "PUT",
            Self::Trace   => "TRACE",
        }
    }

    /// Maps a wire method onto a routable one.
    pub fn from_http(method: &http::Method) -> Option<Self> {
        method.as_str().parse().ok()
    }

    pub fn to_http(self) -> http::Method {
        match self {
            Self::Delete  => http::Method::DELETE,
            Self::Get     => http::Method::GET,
            Self::Head    => http::Method::HEAD,
            Self::Options => http::Method::OPTIONS,
            Self::Patch   => http::Method::PATCH,
            Self::Post    => http::Method::POST,
            Self::Put     => http::Method::PUT,
            Self::Trace   => http::Method::TRACE,
        }
    }

    /// `false` for methods that must not carry a request body.
    ///
    /// Data arriving for one of these is a malformed request.
    pub fn carries_body(self) -> bool {
        !matches!(self, Self::Get | Self::Head | Self::Options | Self::Trace)
    }
}

/// Parses an uppercase method string (e.g. `"GET"`). Case-sensitive per RFC 9110 §9.1.
impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DELETE"  => Ok(Self::Delete),
            "GET"     => Ok(Self::Get),
            "HEAD"    => Ok(Self::Head),
            "OPTIONS" => Ok(Self::Options),
            "PATCH"   => Ok(Self::Patch),
            "POST"    => Ok(Self::Post),
            "PUT"     => Ok(Self::Put),
            "TRACE"   => Ok(Self::Trace),
            _         => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for m in Method::ALL {
            assert_eq!(m.as_str().parse::<Method>(), Ok(m));
            assert_eq!(Method::from_http(&m.to_http()), Some(m));
        }
        assert!("get".parse::<Method>().is_err());
        assert_eq!(Method::from_http(&http::Method::CONNECT), None);
    }

    #[test]
    fn bodyless_methods() {
        assert!(!Method::Get.carries_body());
        assert!(!Method::Trace.carries_body());
        assert!(Method::Post.carries_body());
        assert!(Method::Delete.carries_body());
    }
}
