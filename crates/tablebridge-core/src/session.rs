//! Session lifecycle.
//!
//! A [`Session`] owns (or wraps) one authenticated connection to the remote
//! service. Connection details are resolved in priority order:
//!
//! 1. an externally supplied client,
//! 2. a session key,
//! 3. a username and password,
//! 4. a stored user token (looked up once, at construction),
//! 5. an interactive [`CredentialPrompter`].
//!
//! Sessions created here close their server-side session on
//! [`Session::shutdown`] or drop. Sessions wrapping an external client never
//! close it. Every session is registered, weakly, in a process-wide registry
//! so [`cleanup_sessions`] can close whatever is still open at exit.

mod credentials;
mod error;
mod heartbeat;
mod registry;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, error, info, warn};
use snafu::prelude::*;

pub use credentials::{
    CredentialPrompter, Credentials, PromptOutcome, StaticPrompter, TokenError, TokenSource,
    UserToken, UserTokenFile,
};
pub use error::SessionError;
pub use registry::{cleanup_sessions, live_session_count};

use crate::{
    config::{ConnectionConfig, DEFAULT_PORT},
    remote::{ServiceClient, ServiceConnector},
};
use error::{
    ConfigurationSnafu, InsufficientCredentialsSnafu, RemoteSnafu, SessionEstablishmentSnafu,
};
use heartbeat::Heartbeat;
use registry::SessionRegistry;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live client.
    Disconnected,
    /// A create/join call is in flight.
    Connecting,
    /// A live client is available.
    Connected,
    /// Shut down. A later `connect` may reopen it.
    Closed,
}

struct Inner {
    state: SessionState,
    server: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    session_key: Option<String>,
    client: Option<Arc<dyn ServiceClient>>,
    heartbeat: Option<Heartbeat>,
}

impl Inner {
    fn needs_connection_details(&self) -> bool {
        if self.client.is_some() {
            return false;
        }
        if self.server.is_none() {
            return true;
        }
        self.session_key.is_none() && (self.username.is_none() || self.password.is_none())
    }

    fn missing_details(&self) -> String {
        if self.server.is_none() {
            "no server address".to_string()
        } else {
            "need a session key or a username and password".to_string()
        }
    }

    fn prompt_defaults(&self) -> Credentials {
        Credentials {
            server: self.server.clone(),
            port: Some(self.port),
            username: self.username.clone(),
            password: None,
        }
    }

    fn apply(&mut self, answer: Credentials) {
        if answer.server.is_some() {
            self.server = answer.server;
        }
        if let Some(port) = answer.port {
            self.port = port;
        }
        if answer.username.is_some() {
            self.username = answer.username;
        }
        if answer.password.is_some() {
            self.password = answer.password;
        }
    }
}

enum Login {
    Join(String),
    Password(String, String),
}

pub(crate) struct SessionShared {
    inner: Mutex<Inner>,
    external: bool,
    connector: Option<Arc<dyn ServiceConnector>>,
    prompter: Option<Arc<dyn CredentialPrompter>>,
    keep_alive: Duration,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_external(&self) -> bool {
        self.external
    }

    /// Release the client. Returns whether there was one.
    pub(crate) fn shutdown(&self) -> bool {
        let (client, heartbeat) = {
            let mut inner = self.lock();
            inner.state = SessionState::Closed;
            (inner.client.take(), inner.heartbeat.take())
        };
        if let Some(beat) = heartbeat {
            beat.stop();
        }
        match client {
            Some(client) => {
                if !self.external {
                    debug!("Closing session {}", client.session_id());
                    client.close_session();
                }
                true
            }
            None => false,
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for [`Session`].
#[derive(Default)]
pub struct SessionBuilder {
    server: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    session_key: Option<String>,
    client: Option<Arc<dyn ServiceClient>>,
    allow_token: bool,
    token_source: Option<Box<dyn TokenSource>>,
    prompter: Option<Arc<dyn CredentialPrompter>>,
    connector: Option<Arc<dyn ServiceConnector>>,
    keep_alive: Option<Duration>,
}

impl SessionBuilder {
    /// Start from connection settings.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            server: config.server.clone(),
            port: Some(config.port),
            username: config.username.clone(),
            password: config.password.clone(),
            session_key: config.session_key.clone(),
            allow_token: config.allow_token,
            keep_alive: config.keep_alive(),
            ..Self::default()
        }
    }

    /// Server host.
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    /// Server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Username and password for a new session.
    pub fn login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Username alone; the password may come from a prompt.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Join an existing session instead of logging in.
    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    /// Wrap a client connected elsewhere. The session will never close it.
    pub fn client(mut self, client: Arc<dyn ServiceClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Look for a stored user token when details are missing.
    pub fn allow_token(mut self, allow: bool) -> Self {
        self.allow_token = allow;
        self
    }

    /// Where to look for a stored user token. Defaults to
    /// [`UserTokenFile::default_location`].
    pub fn token_source(mut self, source: impl TokenSource + 'static) -> Self {
        self.token_source = Some(Box::new(source));
        self
    }

    /// Prompt used by interactive connects.
    pub fn prompter(mut self, prompter: Arc<dyn CredentialPrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// How new sessions are created.
    pub fn connector(mut self, connector: Arc<dyn ServiceConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Heartbeat interval; `None` disables it.
    pub fn keep_alive(mut self, interval: Option<Duration>) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Build the session. Never touches the network; a stored token may be
    /// read from disk.
    pub fn build(self) -> Session {
        let external = self.client.is_some();
        let mut server = self.server;
        let mut port = self.port.unwrap_or(DEFAULT_PORT);

        if let Some(client) = &self.client {
            match (client.host(), server.take()) {
                (Some(host), Some(requested)) if host != requested => {
                    warn!("Host already set to '{host}' in provided client, '{requested}' will be ignored");
                    server = Some(host);
                }
                (Some(host), _) => server = Some(host),
                (None, requested) => server = requested,
            }
            if server.is_none() {
                error!("Unknown host for provided client");
            }
            port = client.port().unwrap_or(port);
        }

        let mut inner = Inner {
            state: if external {
                SessionState::Connected
            } else {
                SessionState::Disconnected
            },
            server,
            port,
            username: self.username,
            password: self.password,
            session_key: self.session_key,
            client: self.client,
            heartbeat: None,
        };

        if self.allow_token && inner.needs_connection_details() {
            let source = self
                .token_source
                .or_else(|| UserTokenFile::default_location().map(|f| Box::new(f) as Box<dyn TokenSource>));
            apply_user_token(&mut inner, source.as_deref());
        }

        let shared = Arc::new(SessionShared {
            inner: Mutex::new(inner),
            external,
            connector: self.connector,
            prompter: self.prompter,
            keep_alive: self.keep_alive.unwrap_or(Duration::ZERO),
        });
        SessionRegistry::global().register(&shared);
        Session { shared }
    }
}

fn apply_user_token(inner: &mut Inner, source: Option<&dyn TokenSource>) {
    if inner.server.is_some() || inner.username.is_some() {
        info!("Server or user details already provided, skipping token check");
        return;
    }
    let Some(source) = source else {
        info!("No user token location available");
        return;
    };
    match source.get_token() {
        Ok(Some(token)) => {
            info!("Found token for connection to {}:{}", token.host, token.port);
            inner.server = Some(token.host);
            inner.port = token.port;
            inner.session_key = Some(token.session_key);
        }
        Ok(None) => info!("No user token found"),
        Err(e) => error!("Failed to process user token: {e}"),
    }
}

/// A connection to the remote service. See the module docs.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("Session")
            .field("state", &inner.state)
            .field("server", &inner.server)
            .field("port", &inner.port)
            .field("external", &self.shared.external)
            .finish()
    }
}

impl Session {
    /// Start building a session.
    pub fn builder() -> SessionBuilder {
        SessionBuilder {
            allow_token: true,
            keep_alive: Some(Duration::from_secs(60)),
            ..SessionBuilder::default()
        }
    }

    /// Wrap a client connected elsewhere.
    pub fn from_client(client: Arc<dyn ServiceClient>) -> Session {
        Session::builder().client(client).allow_token(false).build()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// True when a live client is available.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().client.is_some()
    }

    /// True when the session wraps an externally supplied client.
    pub fn is_external(&self) -> bool {
        self.shared.external
    }

    /// Server host, if known.
    pub fn server(&self) -> Option<String> {
        self.shared.lock().server.clone()
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.shared.lock().port
    }

    /// Server-side id of the live session.
    pub fn session_id(&self) -> Option<String> {
        self.shared.lock().client.as_ref().map(|c| c.session_id())
    }

    /// The live client, or [`SessionError::NotConnected`].
    pub fn client(&self) -> Result<Arc<dyn ServiceClient>, SessionError> {
        self.shared.lock().client.clone().context(error::NotConnectedSnafu)
    }

    /// Whether more details are needed before a connection can be attempted.
    pub fn needs_connection_details(&self) -> bool {
        self.shared.lock().needs_connection_details()
    }

    /// Connect if not already connected.
    ///
    /// With `interactive`, missing details are requested from the configured
    /// prompter first. With `keep_alive`, a heartbeat task pings the server
    /// at the configured interval.
    pub async fn connect(&self, interactive: bool, keep_alive: bool) -> Result<(), SessionError> {
        if self.needs_connection_details() {
            ensure!(
                interactive,
                InsufficientCredentialsSnafu {
                    missing: self.shared.lock().missing_details(),
                }
            );
            self.prompt()?;
        }

        let (server, port, login) = {
            let mut inner = self.shared.lock();
            if inner.client.is_some() {
                return Ok(());
            }
            ensure!(
                inner.state != SessionState::Connecting,
                ConfigurationSnafu {
                    message: "a connection attempt is already in progress",
                }
            );
            if inner.needs_connection_details() {
                return InsufficientCredentialsSnafu {
                    missing: inner.missing_details(),
                }
                .fail();
            }
            let server = inner.server.clone().unwrap_or_default();
            let login = match (&inner.session_key, &inner.username, &inner.password) {
                (Some(key), _, _) => Login::Join(key.clone()),
                (None, Some(user), Some(pass)) => Login::Password(user.clone(), pass.clone()),
                _ => {
                    return InsufficientCredentialsSnafu {
                        missing: inner.missing_details(),
                    }
                    .fail();
                }
            };
            inner.state = SessionState::Connecting;
            (server, inner.port, login)
        };

        let Some(connector) = self.shared.connector.clone() else {
            self.shared.lock().state = SessionState::Disconnected;
            return ConfigurationSnafu {
                message: "no service connector configured",
            }
            .fail();
        };

        let result = match &login {
            Login::Join(key) => connector.join_session(&server, port, key).await,
            Login::Password(user, pass) => connector.create_session(&server, port, user, pass).await,
        };

        let client = match result {
            Ok(client) => client,
            Err(source) => {
                self.shared.lock().state = SessionState::Disconnected;
                if matches!(login, Login::Join(_)) {
                    warn!("Failed to join session, token may have expired");
                }
                return Err(source).context(SessionEstablishmentSnafu { server });
            }
        };

        let heartbeat = (keep_alive && !self.shared.keep_alive.is_zero())
            .then(|| Heartbeat::start(client.clone(), self.shared.keep_alive))
            .flatten();

        let mut inner = self.shared.lock();
        inner.client = Some(client);
        inner.heartbeat = heartbeat;
        inner.state = SessionState::Connected;
        info!("Connected to {server}");
        Ok(())
    }

    fn prompt(&self) -> Result<(), SessionError> {
        let prompter = self.shared.prompter.clone().context(InsufficientCredentialsSnafu {
            missing: "no credential prompt available",
        })?;
        let defaults = self.shared.lock().prompt_defaults();
        match prompter.prompt_for_credentials(&defaults) {
            PromptOutcome::Prompted(answer) => {
                self.shared.lock().apply(answer);
                Ok(())
            }
            PromptOutcome::Cancelled => InsufficientCredentialsSnafu {
                missing: "credential prompt was cancelled",
            }
            .fail(),
        }
    }

    /// Ping the server once.
    pub async fn keep_alive(&self) -> Result<(), SessionError> {
        self.client()?.keep_alive().await.context(RemoteSnafu)
    }

    /// Close the session. Idempotent. Sessions wrapping an external client
    /// release it without closing it.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }

    /// Use the session for the duration of the returned scope.
    ///
    /// If there is no live client, a temporary one is created with a
    /// non-interactive connect and shut down when the scope ends. An existing
    /// client is left open.
    pub async fn enter(&self) -> Result<SessionScope<'_>, SessionError> {
        if self.is_connected() {
            return Ok(SessionScope {
                session: self,
                temporary: false,
            });
        }
        debug!("Creating temporary session");
        self.connect(false, true).await?;
        Ok(SessionScope {
            session: self,
            temporary: true,
        })
    }
}

/// Guard returned by [`Session::enter`].
pub struct SessionScope<'a> {
    session: &'a Session,
    temporary: bool,
}

impl SessionScope<'_> {
    /// The live client for this scope.
    pub fn client(&self) -> Result<Arc<dyn ServiceClient>, SessionError> {
        self.session.client()
    }

    /// The session this scope belongs to.
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Whether the scope opened the connection itself.
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

impl Drop for SessionScope<'_> {
    fn drop(&mut self) {
        if self.temporary {
            debug!("Exiting temporary session");
            self.session.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::InMemoryService;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    struct FixedToken(Option<&'static str>);

    impl TokenSource for FixedToken {
        fn get_token(&self) -> Result<Option<UserToken>, TokenError> {
            self.0.map(|t| t.parse()).transpose()
        }
    }

    fn service() -> InMemoryService {
        InMemoryService::new()
            .with_user("alice", "secret")
            .with_session_key("key-1")
    }

    fn builder(service: &InMemoryService) -> SessionBuilder {
        Session::builder()
            .connector(Arc::new(service.clone()))
            .token_source(FixedToken(None))
            .keep_alive(None)
    }

    #[tokio::test]
    async fn insufficient_details_fail_before_network() {
        let service = service();
        let session = builder(&service).server("localhost").username("alice").build();
        assert!(session.needs_connection_details());

        let err = session.connect(false, false).await.unwrap_err();
        assert!(matches!(err, SessionError::InsufficientCredentials { .. }));
        assert_eq!(service.stats().sessions_created, 0);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn session_key_takes_priority_over_password() -> TestResult {
        let service = service();
        let session = builder(&service)
            .server("localhost")
            .login("alice", "secret")
            .session_key("key-1")
            .build();
        session.connect(false, false).await?;

        let stats = service.stats();
        assert_eq!((stats.sessions_joined, stats.sessions_created), (1, 0));
        assert_eq!(session.state(), SessionState::Connected);
        Ok(())
    }

    #[tokio::test]
    async fn failed_login_resets_to_disconnected() {
        let service = service();
        let session = builder(&service).server("localhost").login("alice", "wrong").build();
        let err = session.connect(false, false).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionEstablishment { .. }));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.client().is_err());
    }

    #[tokio::test]
    async fn token_fills_missing_details() -> TestResult {
        let service = service();
        let session = builder(&service)
            .token_source(FixedToken(Some("key-1@tokenhost:4080")))
            .build();
        assert_eq!(session.server().as_deref(), Some("tokenhost"));
        assert_eq!(session.port(), 4080);

        session.connect(false, false).await?;
        assert_eq!(service.stats().sessions_joined, 1);
        Ok(())
    }

    #[tokio::test]
    async fn token_ignored_when_server_given() {
        let service = service();
        let session = builder(&service)
            .server("explicit")
            .token_source(FixedToken(Some("key-1@tokenhost:4080")))
            .build();
        assert_eq!(session.server().as_deref(), Some("explicit"));
        assert!(session.needs_connection_details());
    }

    #[tokio::test]
    async fn broken_token_is_not_fatal() {
        let service = service();
        let session = builder(&service)
            .token_source(FixedToken(Some("garbage")))
            .build();
        assert_eq!(session.server(), None);
    }

    #[tokio::test]
    async fn prompt_supplies_credentials() -> TestResult {
        let service = service();
        let answer = Credentials {
            server: Some("localhost".into()),
            username: Some("alice".into()),
            password: Some("secret".into()),
            ..Credentials::default()
        };
        let session = builder(&service)
            .prompter(Arc::new(StaticPrompter(PromptOutcome::Prompted(answer))))
            .build();
        session.connect(true, false).await?;
        assert!(session.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_prompt_is_insufficient_credentials() {
        let service = service();
        let session = builder(&service)
            .prompter(Arc::new(StaticPrompter(PromptOutcome::Cancelled)))
            .build();
        let err = session.connect(true, false).await.unwrap_err();
        assert!(matches!(err, SessionError::InsufficientCredentials { .. }));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() -> TestResult {
        let service = service();
        let session = builder(&service).server("localhost").login("alice", "secret").build();
        session.connect(false, false).await?;
        session.shutdown();
        session.shutdown();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(service.stats().sessions_closed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn temporary_scope_closes_on_exit() -> TestResult {
        let service = service();
        let session = builder(&service).server("localhost").login("alice", "secret").build();
        {
            let scope = session.enter().await?;
            assert!(scope.is_temporary());
            scope.client()?;
        }
        assert!(!session.is_connected());
        assert_eq!(service.stats().sessions_closed, 1);

        session.connect(false, false).await?;
        {
            let scope = session.enter().await?;
            assert!(!scope.is_temporary());
        }
        assert!(session.is_connected());
        Ok(())
    }

    #[tokio::test]
    async fn external_client_is_never_closed() -> TestResult {
        let service = service();
        let client = service.client("clienthost", 4064);
        {
            let session = Session::builder()
                .client(client.clone())
                .server("otherhost")
                .build();
            assert_eq!(session.server().as_deref(), Some("clienthost"));
            assert_eq!(session.state(), SessionState::Connected);
            let scope = session.enter().await?;
            assert!(!scope.is_temporary());
            drop(scope);
            session.shutdown();
        }
        assert_eq!(service.stats().sessions_closed, 0);
        client.keep_alive().await?;
        Ok(())
    }

    #[tokio::test]
    async fn dropping_owned_session_closes_it() -> TestResult {
        let service = service();
        let session = builder(&service).server("localhost").login("alice", "secret").build();
        session.connect(false, false).await?;
        drop(session);
        assert_eq!(service.stats().sessions_closed, 1);
        Ok(())
    }

    #[tokio::test]
    async fn sweep_closes_owned_sessions_and_skips_dead_ones() -> TestResult {
        let service = service();
        let registry = SessionRegistry::default();

        let owned = builder(&service).server("localhost").login("alice", "secret").build();
        owned.connect(false, false).await?;
        let external = Session::from_client(service.client("h", 1));
        let dropped = builder(&service).server("localhost").build();
        for s in [&owned, &external, &dropped] {
            registry.register(&s.shared);
        }
        drop(dropped);

        assert_eq!(registry.live_count(), 2);
        assert_eq!(registry.sweep(), 1);
        assert_eq!(owned.state(), SessionState::Closed);
        assert!(external.is_connected());
        assert_eq!(registry.sweep(), 0);
        Ok(())
    }
}
