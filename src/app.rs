//! The application aggregate.
//!
//! [`App`] owns the route table, the middleware chains under construction,
//! services, config and logging hooks. Everything is registered up front;
//! [`App::listen`] freezes it and starts serving.
//!
//! ```rust,no_run
//! use strata::{App, Method};
//! use strata::middleware::{MidOptions, from_fn};
//!
//! # async fn run() -> Result<(), strata::Error> {
//! let mut app = App::new();
//! app.get("/hello", |c| Box::pin(async move {
//!     c.send("world");
//!     Ok(())
//! }))?;
//!
//! app.group("api", true, |api| {
//!     api.get("/users/:id", |c| Box::pin(async move {
//!         let id = c.param("id").unwrap_or_default().to_owned();
//!         c.json(&serde_json::json!({ "id": id }))?;
//!         Ok(())
//!     }))?;
//!     Ok(())
//! })?;
//!
//! app.use_mid(from_fn(|c, next| Box::pin(async move {
//!     next.run(c).await?;
//!     c.set_header("x-powered-by", "strata");
//!     Ok(())
//! })), MidOptions::new().method(Method::Get));
//!
//! app.listen("0.0.0.0:3000").await
//! # }
//! ```

use std::any::Any;
use std::sync::Arc;

use crate::bodyparser::BodyParser;
use crate::config::Config;
use crate::context::{Context, Services};
use crate::error::{Error, RouteError};
use crate::handler::{self, BoxFuture, BoxedHandler};
use crate::log::{AccessLogger, ErrorHandler};
use crate::method::Method;
use crate::middleware::{BoxedMiddleware, ChainBuilder, FinalSink, MidFactory, MidOptions, MidSource, Middleware};
use crate::router::{RouteOptions, Router};
use crate::server::{BodyReader, ContextPool, Server, Service};

/// Groups nest at most this deep.
pub const MAX_GROUP_DEPTH: usize = 10;

const HOME_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head>\
<body><h1>strata</h1><p>No routes are registered yet.</p></body></html>";

macro_rules! verbs {
    ($($name:ident => $method:ident),* $(,)?) => {$(
        #[doc = concat!("Registers a `", stringify!($method), "` route.")]
        pub fn $name<F>(&mut self, path: &str, f: F) -> Result<&mut Self, RouteError>
        where
            F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, Result<(), Error>> + Send + Sync + 'static,
        {
            self.route(Method::$method, path, f, ())
        }
    )*};
}

/// A web application under construction.
pub struct App {
    router: Router,
    chains: ChainBuilder,
    pre: Vec<(MidSource, MidOptions)>,
    services: Services,
    config: Config,
    errors: ErrorHandler,
    logger: AccessLogger,
}

impl App {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            router: Router::new(config.ignore_slash),
            chains: ChainBuilder::new(),
            pre: Vec::new(),
            services: Services::default(),
            config,
            errors: ErrorHandler::default(),
            logger: AccessLogger::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Only settings read at serve time take effect here; `ignore_slash`
    /// must be chosen through [`with_config`](Self::with_config).
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Routes ────────────────────────────────────────────────────────────────

    verbs! {
        get => Get,
        post => Post,
        put => Put,
        delete => Delete,
        patch => Patch,
        options => Options,
        head => Head,
        trace => Trace,
    }

    /// Registers `f` for every method.
    pub fn any<F>(&mut self, path: &str, f: F) -> Result<&mut Self, RouteError>
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, Result<(), Error>> + Send + Sync + 'static,
    {
        self.map(&Method::ALL, path, f, ())
    }

    /// Registers one handler for several methods.
    pub fn map<F>(
        &mut self,
        methods: &[Method],
        path: &str,
        f: F,
        opts: impl Into<RouteOptions>,
    ) -> Result<&mut Self, RouteError>
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, Result<(), Error>> + Send + Sync + 'static,
    {
        self.add_route(methods, path, handler::boxed(f), opts.into())?;
        Ok(self)
    }

    /// Registers a route with a name or group: `"user"` names it,
    /// `"@admin"` tags it with group `admin`.
    pub fn route<F>(
        &mut self,
        method: Method,
        path: &str,
        f: F,
        opts: impl Into<RouteOptions>,
    ) -> Result<&mut Self, RouteError>
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, Result<(), Error>> + Send + Sync + 'static,
    {
        self.map(&[method], path, f, opts)
    }

    pub(crate) fn add_route(
        &mut self,
        methods: &[Method],
        path: &str,
        handler: BoxedHandler,
        opts: RouteOptions,
    ) -> Result<(), RouteError> {
        for method in methods {
            self.router.add(path, *method, Arc::clone(&handler), opts.clone())?;
        }
        Ok(())
    }

    /// Opens route group `name`. With `prefix`, a name that looks like a path
    /// (`api`, `/v1/admin`) is prepended to every route inside.
    pub fn group<F>(&mut self, name: &str, prefix: bool, f: F) -> Result<&mut Self, RouteError>
    where
        F: FnOnce(&mut Group<'_>) -> Result<(), RouteError>,
    {
        let scope = Scope::open(self, None, name, prefix, Vec::new())?;
        f(&mut Group { app: &mut *self, scope })?;
        Ok(self)
    }

    /// Attaches `mids` to the group opened by the returned builder's
    /// [`group`](MiddlewareGroup::group).
    pub fn middleware(&mut self, mids: Vec<BoxedMiddleware>, opts: impl Into<MidOptions>) -> MiddlewareGroup<'_> {
        let opts = opts.into();
        MiddlewareGroup {
            app: self,
            parent: None,
            mids: mids.into_iter().map(|m| (m, opts.clone())).collect(),
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn clear_routes(&mut self) {
        self.router.clear();
    }

    /// Printable `(method, path)` table.
    pub fn route_table(&self) -> String {
        self.router.table()
    }

    /// Path of the route registered under `name`.
    pub fn url_for(&self, name: &str) -> Option<&str> {
        self.router.url_for(name)
    }

    // ── Middleware ────────────────────────────────────────────────────────────

    /// Composes `mid` right away. Wraps everything composed before it.
    pub fn add(&mut self, mid: impl Middleware, opts: impl Into<MidOptions>) -> &mut Self {
        self.chains.add(Arc::new(mid), opts.into());
        self
    }

    /// Stages `mid`; staged middleware is composed at startup in
    /// registration order, the first registered running outermost.
    pub fn use_mid(&mut self, mid: impl Middleware, opts: impl Into<MidOptions>) -> &mut Self {
        self.stage(MidSource::Direct(Arc::new(mid)), opts.into())
    }

    /// Stages a middleware built by `factory`.
    pub fn use_factory(&mut self, factory: impl MidFactory + Send + 'static, opts: impl Into<MidOptions>) -> &mut Self {
        self.stage(MidSource::Factory(Box::new(factory)), opts.into())
    }

    /// Registers `mid` to run before body ingestion, outside every staged
    /// middleware.
    pub fn pre(&mut self, mid: impl Middleware, opts: impl Into<MidOptions>) -> &mut Self {
        self.pre.push((MidSource::Direct(Arc::new(mid)), opts.into()));
        self
    }

    fn stage(&mut self, mid: MidSource, opts: MidOptions) -> &mut Self {
        if opts.pre {
            self.pre.push((mid, opts));
        } else {
            self.chains.stage(mid, opts);
        }
        self
    }

    // ── Hooks and services ────────────────────────────────────────────────────

    /// Replaces the error handler.
    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&(dyn std::error::Error + 'static), &str) + Send + Sync + 'static,
    {
        self.errors = ErrorHandler::new(f);
        self
    }

    /// Replaces the access-log sink and turns access logging on.
    pub fn access_log<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(crate::log::AccessRecord) + Send + Sync + 'static,
    {
        self.logger = AccessLogger::new(f);
        self.config.global_log = true;
        self
    }

    pub fn add_service<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> &mut Self {
        self.services.insert(key, value);
        self
    }

    pub fn get_service<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.services.get(key)
    }

    // ── Startup ───────────────────────────────────────────────────────────────

    /// Freezes routes and chains.
    ///
    /// Outermost to innermost the chain ends up as: final sink, `pre`
    /// entries, body ingestion, body parser, staged entries, entries added
    /// with [`add`](Self::add), route handler.
    pub(crate) fn build(mut self) -> Result<Arc<Service>, Error> {
        self.config.validate()?;

        if self.router.count() == 0 {
            self.router.add("/*", Method::Get, handler::boxed(home), RouteOptions::default())?;
        }
        self.router.sort_patterns();

        self.chains.flush();
        if self.config.parse_body {
            self.chains.add(Arc::new(BodyParser::new(self.config.max_form_keys)), MidOptions::new());
        }
        let reader = BodyReader::new(self.config.bad_request.clone(), self.config.request_timeout());
        self.chains.add(Arc::new(reader), MidOptions::new());
        while let Some((mid, opts)) = self.pre.pop() {
            self.chains.add(mid.resolve(), opts);
        }
        self.chains.add(Arc::new(FinalSink), MidOptions::new());

        let logger = self.config.global_log.then_some(self.logger);
        Ok(Arc::new(Service {
            router: self.router,
            chains: self.chains.freeze(),
            pool: ContextPool::new(self.config.max_pool),
            config: self.config,
            errors: self.errors,
            logger,
            services: Arc::new(self.services),
        }))
    }

    /// Binds `addr` and serves until SIGTERM or Ctrl-C.
    pub async fn listen(self, addr: &str) -> Result<(), Error> {
        Server::bind(addr)?.serve(self).await
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

fn home(c: &mut Context) -> BoxFuture<'_, Result<(), Error>> {
    Box::pin(async move {
        c.html(HOME_PAGE);
        Ok(())
    })
}

// ── Groups ────────────────────────────────────────────────────────────────────

type ScopedMids = Vec<(BoxedMiddleware, MidOptions)>;

/// Name, path prefix and inherited middleware of an open group.
#[derive(Clone)]
struct Scope {
    name: String,
    prefix: String,
    mids: ScopedMids,
    depth: usize,
}

impl Scope {
    /// Opens `local` under `parent` and stages every inherited middleware
    /// for it.
    fn open(
        app: &mut App,
        parent: Option<&Scope>,
        local: &str,
        use_prefix: bool,
        extra: ScopedMids,
    ) -> Result<Self, RouteError> {
        let local = local.trim();
        let depth = parent.map_or(1, |p| p.depth + 1);
        if depth > MAX_GROUP_DEPTH {
            return Err(RouteError::GroupTooDeep(local.to_owned()));
        }

        let name = match parent {
            Some(p) if p.name.ends_with('/') || local.starts_with('/') => format!("{}{local}", p.name),
            Some(p) => format!("{}/{local}", p.name),
            None => local.to_owned(),
        };

        let mut prefix = parent.map(|p| p.prefix.clone()).unwrap_or_default();
        if use_prefix && is_prefix(local) {
            prefix = collapse_slashes(&format!("{prefix}/{local}"));
            if prefix.ends_with('/') {
                prefix.pop();
            }
        }

        let mut mids = parent.map(|p| p.mids.clone()).unwrap_or_default();
        mids.extend(extra);
        for (mid, opts) in &mids {
            app.chains.stage(MidSource::Direct(Arc::clone(mid)), opts.clone().group(name.clone()));
        }

        Ok(Self { name, prefix, mids, depth })
    }
}

/// `^/?[a-z0-9_\-/]{1,500}$`, case-insensitive.
fn is_prefix(name: &str) -> bool {
    let body = name.strip_prefix('/').unwrap_or(name);
    (1..=500).contains(&body.len())
        && body.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'/'))
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for ch in path.chars() {
        if ch == '/' && out.ends_with('/') {
            continue;
        }
        out.push(ch);
    }
    out
}

/// Routes and middleware registered inside [`App::group`].
///
/// Every route is tagged with the group name and, when prefixing is on,
/// mounted under the group's path. Middleware added here applies to this
/// group only.
pub struct Group<'a> {
    app: &'a mut App,
    scope: Scope,
}

impl Group<'_> {
    verbs! {
        get => Get,
        post => Post,
        put => Put,
        delete => Delete,
        patch => Patch,
        options => Options,
        head => Head,
        trace => Trace,
    }

    /// Full group name, `parent/child` when nested.
    pub fn name(&self) -> &str {
        &self.scope.name
    }

    pub fn prefix(&self) -> &str {
        &self.scope.prefix
    }

    pub fn any<F>(&mut self, path: &str, f: F) -> Result<&mut Self, RouteError>
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, Result<(), Error>> + Send + Sync + 'static,
    {
        self.map(&Method::ALL, path, f, ())
    }

    pub fn map<F>(
        &mut self,
        methods: &[Method],
        path: &str,
        f: F,
        opts: impl Into<RouteOptions>,
    ) -> Result<&mut Self, RouteError>
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, Result<(), Error>> + Send + Sync + 'static,
    {
        let path = format!("{}/{path}", self.scope.prefix);
        let opts = opts.into().with_group(self.scope.name.clone());
        self.app.add_route(methods, &path, handler::boxed(f), opts)?;
        Ok(self)
    }

    /// Registers a route with a name; any group in `opts` is overridden.
    pub fn route<F>(
        &mut self,
        method: Method,
        path: &str,
        f: F,
        opts: impl Into<RouteOptions>,
    ) -> Result<&mut Self, RouteError>
    where
        F: for<'c> Fn(&'c mut Context) -> BoxFuture<'c, Result<(), Error>> + Send + Sync + 'static,
    {
        self.map(&[method], path, f, opts)
    }

    /// Stages `mid` for this group.
    pub fn use_mid(&mut self, mid: impl Middleware, opts: impl Into<MidOptions>) -> &mut Self {
        let opts = opts.into().group(self.scope.name.clone());
        self.app.stage(MidSource::Direct(Arc::new(mid)), opts);
        self
    }

    /// Runs `mid` before body ingestion for this group.
    pub fn pre(&mut self, mid: impl Middleware, opts: impl Into<MidOptions>) -> &mut Self {
        let opts = opts.into().group(self.scope.name.clone());
        self.app.pre.push((MidSource::Direct(Arc::new(mid)), opts));
        self
    }

    /// Opens a nested group named `<this>/<name>`. It inherits this group's
    /// middleware.
    pub fn group<F>(&mut self, name: &str, prefix: bool, f: F) -> Result<&mut Self, RouteError>
    where
        F: FnOnce(&mut Group<'_>) -> Result<(), RouteError>,
    {
        let scope = Scope::open(self.app, Some(&self.scope), name, prefix, Vec::new())?;
        f(&mut Group { app: &mut *self.app, scope })?;
        Ok(self)
    }

    pub fn middleware(&mut self, mids: Vec<BoxedMiddleware>, opts: impl Into<MidOptions>) -> MiddlewareGroup<'_> {
        let opts = opts.into();
        MiddlewareGroup {
            app: &mut *self.app,
            parent: Some(self.scope.clone()),
            mids: mids.into_iter().map(|m| (m, opts.clone())).collect(),
        }
    }
}

/// Returned by `middleware(..)`; the middleware applies to the group it opens.
pub struct MiddlewareGroup<'a> {
    app: &'a mut App,
    parent: Option<Scope>,
    mids: ScopedMids,
}

impl MiddlewareGroup<'_> {
    pub fn group<F>(self, name: &str, prefix: bool, f: F) -> Result<(), RouteError>
    where
        F: FnOnce(&mut Group<'_>) -> Result<(), RouteError>,
    {
        let scope = Scope::open(self.app, self.parent.as_ref(), name, prefix, self.mids)?;
        f(&mut Group { app: self.app, scope })
    }
}
