//! Route table.
//!
//! Two lookup paths. Literal routes live in a per-method hash table and
//! resolve in O(1). Routes with `:param` segments or a trailing `*` live in a
//! per-method list that is sorted once at startup and scanned in order; the
//! first structural match wins.
//!
//! Precedence in the scan:
//!
//! - parameter routes before wildcard routes
//! - among parameter routes, fewer parameters first
//! - among wildcard routes, more segments first
//! - otherwise registration order
//!
//! Two parameter routes of the same shape (`/p/:a/:b` and `/p/:x/:y`) can
//! never coexist for one method; registration rejects the second.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::context::Params;
use crate::error::RouteError;
use crate::handler::BoxedHandler;
use crate::method::Method;

const MAX_PATH_LENGTH: usize = 1000;
const MAX_DEPTH: usize = 13;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Star,
}

/// A registered `(method, path)` binding.
pub struct Route {
    pub path: String,
    pub method: Method,
    pub name: String,
    pub group: String,
    pub is_args: bool,
    pub is_star: bool,
    pub args_count: usize,
    pub route_arr: Vec<String>,
    segments: Vec<Segment>,
    /// Bytes of the path before the `/*` tail.
    star_len: usize,
    pub(crate) handler: BoxedHandler,
}

impl Route {
    fn is_pattern(&self) -> bool {
        self.is_args || self.is_star
    }

    fn shape(&self) -> String {
        let mut n = 0;
        self.route_arr
            .iter()
            .map(|seg| {
                if seg.starts_with(':') {
                    n += 1;
                    format!(":x{n}")
                } else {
                    seg.clone()
                }
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("name", &self.name)
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone)]
pub struct Matched {
    pub route: Arc<Route>,
    pub params: Params,
    pub star_path: Option<String>,
}

/// Optional route metadata.
#[derive(Debug, Clone, Default)]
pub struct RouteOptions {
    pub name: Option<String>,
    pub group: Option<String>,
}

impl RouteOptions {
    pub fn name(name: impl Into<String>) -> Self {
        Self { name: Some(name.into()), group: None }
    }

    pub fn group(group: impl Into<String>) -> Self {
        Self { name: None, group: Some(group.into()) }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

impl From<()> for RouteOptions {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

/// `"@admin"` tags the route with group `admin`; anything else is a name.
impl From<&str> for RouteOptions {
    fn from(s: &str) -> Self {
        match s.strip_prefix('@') {
            Some(group) => Self::group(group),
            None if s.is_empty() => Self::default(),
            None => Self::name(s),
        }
    }
}

/// The application route table.
pub struct Router {
    ignore_slash: bool,
    table: HashMap<Method, HashMap<String, Arc<Route>>>,
    patterns: HashMap<Method, Vec<Arc<Route>>>,
    names: HashMap<String, String>,
    groups: HashMap<String, Vec<(Method, String)>>,
    count: usize,
}

impl Router {
    pub fn new(ignore_slash: bool) -> Self {
        Self {
            ignore_slash,
            table: HashMap::new(),
            patterns: HashMap::new(),
            names: HashMap::new(),
            groups: HashMap::new(),
            count: 0,
        }
    }

    /// Number of registered `(method, path)` pairs.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Registers `handler` for `method` + `path`.
    pub fn add(
        &mut self,
        path: &str,
        method: Method,
        handler: BoxedHandler,
        opts: RouteOptions,
    ) -> Result<(), RouteError> {
        let path = self.normalize(path)?;

        let is_args = path.contains("/:");
        let mut is_star = false;
        if path.contains("/*") {
            if path.contains("/*/") {
                return Err(RouteError::StarNotLast(path));
            }
            is_star = path.ends_with('*');
        }
        if is_args && is_star {
            return Err(RouteError::MixedParamAndStar(path));
        }

        let name = opts.name.unwrap_or_default();
        if !name.is_empty() && self.names.contains_key(&name) {
            return Err(RouteError::DuplicateName(name));
        }

        if self.table.get(&method).is_some_and(|t| t.contains_key(&path)) {
            return Err(RouteError::DuplicatePath { method: method.as_str(), path });
        }

        let route_arr: Vec<String> =
            path.split('/').filter(|s| !s.is_empty()).map(str::to_owned).collect();

        let mut route = Route {
            path: path.clone(),
            method,
            name: name.clone(),
            group: opts.group.unwrap_or_default(),
            is_args,
            is_star,
            args_count: 0,
            route_arr,
            segments: Vec::new(),
            star_len: 0,
            handler,
        };

        if is_args {
            self.parse_params(&mut route)?;
        } else if is_star {
            if path.matches('*').count() > 1 {
                return Err(RouteError::MultipleStar(path));
            }
            route.segments = route
                .route_arr
                .iter()
                .map(|s| if s == "*" { Segment::Star } else { Segment::Literal(s.clone()) })
                .collect();
            route.star_len = path.len() - 2;
        }

        let route = Arc::new(route);
        if route.is_pattern() {
            self.patterns.entry(method).or_default().push(Arc::clone(&route));
        }
        if !name.is_empty() {
            self.names.insert(name, path.clone());
        }
        if !route.group.is_empty() {
            self.groups.entry(route.group.clone()).or_default().push((method, path.clone()));
        }
        self.table.entry(method).or_default().insert(path, route);
        self.count += 1;
        Ok(())
    }

    fn normalize(&self, path: &str) -> Result<String, RouteError> {
        let trimmed = path.trim();
        let mut norm = String::with_capacity(trimmed.len() + 1);
        for ch in trimmed.chars() {
            if ch == '/' && norm.ends_with('/') {
                continue;
            }
            norm.push(ch);
        }
        if norm.is_empty() {
            norm.push('/');
        }

        let legal = norm.len() <= MAX_PATH_LENGTH
            && norm.bytes().all(|b| b.is_ascii_alphanumeric() || b"-_:*/.@".contains(&b));
        if !legal {
            return Err(RouteError::IllegalPath(path.to_owned()));
        }

        if !norm.starts_with('/') {
            norm.insert(0, '/');
        }
        if norm.len() > 1 && norm.ends_with('/') {
            norm.pop();
        }
        Ok(norm)
    }

    fn parse_params(&self, route: &mut Route) -> Result<(), RouteError> {
        let mut segments = Vec::with_capacity(route.route_arr.len());
        for seg in &route.route_arr {
            match seg.strip_prefix(':') {
                Some("") => return Err(RouteError::EmptyParamName(route.path.clone())),
                Some(name) => {
                    route.args_count += 1;
                    segments.push(Segment::Param(name.to_owned()));
                }
                None => segments.push(Segment::Literal(seg.clone())),
            }
        }
        route.segments = segments;

        let shape = route.shape();
        let same_shape = self.patterns.get(&route.method).and_then(|list| {
            list.iter().find(|r| {
                r.is_args && r.route_arr.len() == route.route_arr.len() && r.shape() == shape
            })
        });
        if let Some(existing) = same_shape {
            return Err(RouteError::Conflict {
                path: route.path.clone(),
                existing: existing.path.clone(),
            });
        }
        Ok(())
    }

    /// Orders the pattern lists for scanning. Called once before serving.
    pub fn sort_patterns(&mut self) {
        for list in self.patterns.values_mut() {
            // stable: equal keys keep registration order
            list.sort_by_key(|r| {
                if r.is_star {
                    (1, -(r.route_arr.len() as isize))
                } else {
                    (0, r.args_count as isize)
                }
            });
        }
    }

    /// Resolves `path` for `method`. Never fails; absence means 404.
    pub fn find(&self, path: &str, method: Method) -> Option<Matched> {
        if path.len() > MAX_PATH_LENGTH {
            return None;
        }
        let path = if self.ignore_slash && path.len() > 1 && path.ends_with('/') {
            &path[..path.len() - 1]
        } else {
            path
        };

        if let Some(route) = self.table.get(&method).and_then(|t| t.get(path)) {
            if !route.is_pattern() {
                return Some(Matched {
                    route: Arc::clone(route),
                    params: Params::new(),
                    star_path: None,
                });
            }
        }

        self.scan(path, method)
    }

    fn scan(&self, path: &str, method: Method) -> Option<Matched> {
        let split: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if split.len() > MAX_DEPTH {
            return None;
        }

        'routes: for route in self.patterns.get(&method)? {
            if route.is_star {
                if route.segments.len() > split.len() + 1 {
                    continue;
                }
            } else if route.segments.len() != split.len() {
                continue;
            }

            let mut params = Params::new();
            for (i, seg) in route.segments.iter().enumerate() {
                match seg {
                    Segment::Star => {}
                    Segment::Literal(lit) => {
                        if split.get(i) != Some(&lit.as_str()) {
                            continue 'routes;
                        }
                    }
                    Segment::Param(name) => {
                        if let Some(value) = split.get(i) {
                            params.insert(name.clone(), (*value).to_owned());
                        }
                    }
                }
            }

            let star_path = route
                .is_star
                .then(|| path.get(route.star_len..).unwrap_or_default().to_owned());
            return Some(Matched { route: Arc::clone(route), params, star_path });
        }
        None
    }

    /// Path registered under `name`.
    pub fn url_for(&self, name: &str) -> Option<&str> {
        self.names.get(name).map(String::as_str)
    }

    /// `(method, path)` pairs tagged with `group`.
    pub fn group_routes(&self, group: &str) -> &[(Method, String)] {
        self.groups.get(group).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Human-readable table of every registered route, sorted.
    pub fn table(&self) -> String {
        let mut rows: Vec<(&str, Method)> = self
            .table
            .iter()
            .flat_map(|(m, t)| t.keys().map(move |p| (p.as_str(), *m)))
            .collect();
        rows.sort();
        let mut out = String::new();
        for (path, method) in rows {
            let _ = writeln!(out, "{:<8} ----  {}", method.as_str(), path);
        }
        out
    }

    /// Forgets every route.
    pub fn clear(&mut self) {
        self.table.clear();
        self.patterns.clear();
        self.names.clear();
        self.groups.clear();
        self.count = 0;
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Noop;

    fn noop() -> BoxedHandler {
        Arc::new(Noop)
    }

    fn router(routes: &[(&str, Method)]) -> Router {
        let mut r = Router::default();
        for (path, method) in routes {
            r.add(path, *method, noop(), RouteOptions::default()).unwrap();
        }
        r.sort_patterns();
        r
    }

    #[test]
    fn literal_routes_match_exactly_with_empty_params() {
        let r = router(&[("/", Method::Get), ("/a/b", Method::Get), ("/a/b", Method::Post)]);
        for (path, method) in [("/", Method::Get), ("/a/b", Method::Get), ("/a/b", Method::Post)] {
            let m = r.find(path, method).unwrap();
            assert_eq!(m.route.path, path);
            assert_eq!(m.route.method, method);
            assert!(m.params.is_empty());
        }
        assert!(r.find("/a/b", Method::Put).is_none());
        assert!(r.find("/a", Method::Get).is_none());
    }

    #[test]
    fn trailing_slash_is_ignored() {
        let r = router(&[("/a/b/", Method::Get)]);
        assert_eq!(r.find("/a/b/", Method::Get).unwrap().route.path, "/a/b");
        assert_eq!(r.find("/a/b", Method::Get).unwrap().route.path, "/a/b");
    }

    #[test]
    fn parameters_are_extracted() {
        let r = router(&[("/users/:id/posts/:postId", Method::Get)]);
        let m = r.find("/users/42/posts/7", Method::Get).unwrap();
        assert_eq!(m.params.get("id").map(String::as_str), Some("42"));
        assert_eq!(m.params.get("postId").map(String::as_str), Some("7"));
        assert!(r.find("/users/42/posts", Method::Get).is_none());
        assert!(r.find("/users/42/comments/7", Method::Get).is_none());
    }

    #[test]
    fn wildcard_captures_remainder() {
        let r = router(&[("/static/*", Method::Get)]);
        let m = r.find("/static/css/a.css", Method::Get).unwrap();
        assert_eq!(m.star_path.as_deref(), Some("/css/a.css"));

        let root = router(&[("/*", Method::Get)]);
        let m = root.find("/x/y", Method::Get).unwrap();
        assert_eq!(m.star_path.as_deref(), Some("/x/y"));
    }

    #[test]
    fn same_shape_parameter_routes_conflict() {
        let mut r = Router::default();
        r.add("/p/:a/:b", Method::Get, noop(), ().into()).unwrap();
        let err = r.add("/p/:x/:y", Method::Get, noop(), ().into()).unwrap_err();
        assert!(matches!(err, RouteError::Conflict { .. }));
        r.add("/p/:a/:b/:c", Method::Get, noop(), ().into()).unwrap();
        // other methods have their own tables
        r.add("/p/:x/:y", Method::Post, noop(), ().into()).unwrap();
    }

    #[test]
    fn registration_errors() {
        let mut r = Router::default();
        let cases = [
            ("/a b", RouteError::IllegalPath("/a b".into())),
            ("/a/*/b", RouteError::StarNotLast("/a/*/b".into())),
            ("/a/:id/*", RouteError::MixedParamAndStar("/a/:id/*".into())),
            ("/a/:", RouteError::EmptyParamName("/a/:".into())),
            ("/a*/*", RouteError::MultipleStar("/a*/*".into())),
        ];
        for (path, want) in cases {
            assert_eq!(r.add(path, Method::Get, noop(), ().into()).unwrap_err(), want);
        }

        r.add("/x", Method::Get, noop(), "home".into()).unwrap();
        assert_eq!(
            r.add("/y", Method::Get, noop(), "home".into()).unwrap_err(),
            RouteError::DuplicateName("home".into())
        );
        assert!(matches!(
            r.add("//x/", Method::Get, noop(), ().into()),
            Err(RouteError::DuplicatePath { .. })
        ));
    }

    #[test]
    fn parameter_routes_beat_wildcards() {
        let r = router(&[("/a/*", Method::Get), ("/a/:id", Method::Get)]);
        assert_eq!(r.find("/a/1", Method::Get).unwrap().route.path, "/a/:id");
        assert_eq!(r.find("/a/1/2", Method::Get).unwrap().route.path, "/a/*");
    }

    #[test]
    fn deeper_wildcards_win() {
        let r = router(&[("/*", Method::Get), ("/a/*", Method::Get), ("/a/b/*", Method::Get)]);
        assert_eq!(r.find("/a/b/c", Method::Get).unwrap().route.path, "/a/b/*");
        assert_eq!(r.find("/a/x", Method::Get).unwrap().route.path, "/a/*");
        assert_eq!(r.find("/z", Method::Get).unwrap().route.path, "/*");
    }

    #[test]
    fn fewer_parameters_first() {
        let r = router(&[("/:a/:b", Method::Get), ("/x/:b", Method::Get)]);
        assert_eq!(r.find("/x/1", Method::Get).unwrap().route.path, "/x/:b");
        assert_eq!(r.find("/y/1", Method::Get).unwrap().route.path, "/:a/:b");
    }

    #[test]
    fn literal_beats_patterns() {
        let r = router(&[("/a/:id", Method::Get), ("/a/new", Method::Get)]);
        assert_eq!(r.find("/a/new", Method::Get).unwrap().route.path, "/a/new");
    }

    #[test]
    fn too_deep_paths_miss() {
        let r = router(&[("/*", Method::Get)]);
        let deep = "/s".repeat(MAX_DEPTH + 1);
        assert!(r.find(&deep, Method::Get).is_none());
    }

    #[test]
    fn names_groups_and_table() {
        let mut r = Router::default();
        r.add("/login", Method::Post, noop(), "login".into()).unwrap();
        r.add("/admin/users", Method::Get, noop(), "@admin".into()).unwrap();
        assert_eq!(r.url_for("login"), Some("/login"));
        assert_eq!(r.group_routes("admin"), [(Method::Get, "/admin/users".to_owned())]);
        let table = r.table();
        assert!(table.contains("POST     ----  /login"));
        assert_eq!(r.count(), 2);

        r.clear();
        assert_eq!(r.count(), 0);
        assert!(r.find("/login", Method::Post).is_none());
    }
}
