//! Request-target and urlencoded-pair parsing.
//!
//! Targets are origin-form (`/a/b?x=1`). Repeated keys accumulate in arrival
//! order, and a malformed percent escape keeps its raw text.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::Serialize;

/// Parsed query or form pairs. Repeated keys accumulate in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Query(HashMap<String, Vec<String>>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Appends `value` under `key`.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// Replaces every value under `key` with `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), vec![value.into()]);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// A request target split into its parts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedUrl {
    pub path: String,
    pub query: Query,
    pub hash: String,
}

/// Splits a request target into path, query pairs and fragment.
///
/// Absolute-form targets (`http://host/p?q`) lose their scheme and authority.
/// With `fast_mode` a repeated key keeps its last value; otherwise values
/// accumulate. At most `max_args` distinct keys are kept (0 = unlimited).
pub fn parse_url(target: &str, auto_decode: bool, fast_mode: bool, max_args: usize) -> ParsedUrl {
    let mut parsed = ParsedUrl { path: "/".to_owned(), ..ParsedUrl::default() };

    let target = match target.split_once('#') {
        Some((head, hash)) => {
            parsed.hash = hash.to_owned();
            head
        }
        None => target,
    };

    let (path, search) = match target.split_once('?') {
        Some((path, search)) => (path, Some(search)),
        None => (target, None),
    };

    parsed.path = strip_origin(path);

    if let Some(search) = search {
        parse_pairs(search, &mut parsed.query, max_args, |query, key, value| {
            let value = if auto_decode { decode(value) } else { Cow::Borrowed(value) };
            if fast_mode {
                query.set(key, value);
            } else {
                query.append(key, value);
            }
        });
    }

    parsed
}

/// Parses an `application/x-www-form-urlencoded` body.
///
/// Values are always decoded and repeated keys always accumulate.
pub fn parse_form(body: &str, max_args: usize) -> Query {
    let mut query = Query::new();
    parse_pairs(body, &mut query, max_args, |query, key, value| {
        query.append(key, decode(value));
    });
    query
}

fn strip_origin(path: &str) -> String {
    if path.is_empty() {
        return "/".to_owned();
    }
    if path.starts_with('/') {
        return path.to_owned();
    }
    let rest = path
        .strip_prefix("http://")
        .or_else(|| path.strip_prefix("https://"));
    match rest {
        Some(rest) => match rest.find('/') {
            Some(i) => rest[i..].to_owned(),
            None => "/".to_owned(),
        },
        None => path.to_owned(),
    }
}

fn parse_pairs<F>(search: &str, query: &mut Query, max_args: usize, mut store: F)
where
    F: FnMut(&mut Query, &str, &str),
{
    for pair in search.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key.is_empty() {
            continue;
        }
        if max_args > 0 && query.len() >= max_args && !query.contains_key(key) {
            break;
        }
        store(query, key, value);
    }
}

/// Percent-decodes `value` only when it holds a well-formed `%XX` escape and
/// no malformed one. A decode that yields invalid UTF-8 keeps the raw text.
fn decode(value: &str) -> Cow<'_, str> {
    if !is_encoded(value) {
        return Cow::Borrowed(value);
    }
    urlencoding::decode(value).unwrap_or(Cow::Borrowed(value))
}

fn is_encoded(value: &str) -> bool {
    let bytes = value.as_bytes();
    let mut found = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let well_formed = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !well_formed {
                return false;
            }
            found = true;
            i += 3;
        } else {
            i += 1;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_query_and_hash() {
        let url = parse_url("/a/b?x=1&y=two#top", true, false, 0);
        assert_eq!(url.path, "/a/b");
        assert_eq!(url.query.get("x"), Some("1"));
        assert_eq!(url.query.get("y"), Some("two"));
        assert_eq!(url.hash, "top");
    }

    #[test]
    fn absolute_form_loses_origin() {
        assert_eq!(parse_url("http://example.com/p?q=1", true, false, 0).path, "/p");
        assert_eq!(parse_url("https://example.com", true, false, 0).path, "/");
        assert_eq!(parse_url("?q=1", true, false, 0).path, "/");
    }

    #[test]
    fn repeated_keys_accumulate_unless_fast() {
        let slow = parse_url("/?k=1&k=2", true, false, 0);
        assert_eq!(slow.query.get_all("k"), ["1", "2"]);

        let fast = parse_url("/?k=1&k=2", true, true, 0);
        assert_eq!(fast.query.get_all("k"), ["2"]);
    }

    #[test]
    fn empty_pairs_and_missing_keys_are_skipped() {
        let url = parse_url("/?&&=v&flag&a=", true, false, 0);
        assert_eq!(url.query.len(), 2);
        assert_eq!(url.query.get("flag"), Some(""));
        assert_eq!(url.query.get("a"), Some(""));
    }

    #[test]
    fn decoding_is_conditional() {
        let url = parse_url("/?a=%E4%BD%A0&b=100%&c=%zz&d=%FF", true, false, 0);
        assert_eq!(url.query.get("a"), Some("你"));
        assert_eq!(url.query.get("b"), Some("100%"));
        assert_eq!(url.query.get("c"), Some("%zz"));
        // not valid UTF-8 once decoded
        assert_eq!(url.query.get("d"), Some("%FF"));

        let raw = parse_url("/?a=%41", false, false, 0);
        assert_eq!(raw.query.get("a"), Some("%41"));
    }

    #[test]
    fn max_args_bounds_distinct_keys() {
        let url = parse_url("/?a=1&b=2&a=3&c=4", true, false, 2);
        assert_eq!(url.query.len(), 2);
        assert!(!url.query.contains_key("c"));
        assert_eq!(url.query.get_all("a"), ["1", "3"]);
    }

    #[test]
    fn form_bodies_always_decode() {
        let form = parse_form("name=a%20b&tag=x&tag=y", 0);
        assert_eq!(form.get("name"), Some("a b"));
        assert_eq!(form.get_all("tag"), ["x", "y"]);
    }
}
