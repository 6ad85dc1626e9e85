//! Controller facade.
//!
//! The only surface callers interact with: `connect`, `set_activity`,
//! `close`, plus observable state/error/activity streams. Composes the
//! gateway connection, the presence queue, and the artwork resolver; the
//! artwork cache is owned here and lives exactly as long as the
//! controller.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use lyrebird_artwork::{ArtworkCache, AssetResolver, ResolveError};
use lyrebird_protocol::presence::Presence;

use crate::connection::GatewayConnection;
use crate::error::GatewayError;
use crate::queue::{PresenceQueue, presence_worker};
use crate::socket::{Connector, WsConnector};
use crate::types::{ActivitySpec, ConnectionState, GatewayConfig};

/// Controller construction parameters.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Bearer token; never logged.
    pub token: String,
    /// Application id used for presence payloads and external-asset
    /// registration.
    pub application_id: Option<String>,
    /// Location of the persisted artwork index.
    pub cache_path: PathBuf,
    pub gateway: GatewayConfig,
}

impl ControllerConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            application_id: None,
            cache_path: std::env::temp_dir()
                .join("lyrebird")
                .join("artwork-index.json"),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Rich-presence controller.
pub struct RpcController<C: Connector = WsConnector> {
    conn: GatewayConnection<C>,
    queue: Arc<PresenceQueue>,
    resolver: Arc<AssetResolver>,
    cache: Arc<ArtworkCache>,
    application_id: Option<String>,
    activity_rx: watch::Receiver<Option<u64>>,
    cancel: CancellationToken,
}

impl RpcController<WsConnector> {
    /// Creates a controller that dials real gateway sockets.
    pub fn new(config: ControllerConfig) -> Result<Self, GatewayError> {
        Self::with_connector(WsConnector, config)
    }
}

impl<C: Connector> RpcController<C> {
    /// Creates a controller over the given transport.
    pub fn with_connector(connector: C, config: ControllerConfig) -> Result<Self, GatewayError> {
        if config.token.trim().is_empty() {
            return Err(GatewayError::EmptyToken);
        }
        let cache = Arc::new(ArtworkCache::new(config.cache_path.clone()));
        let resolver = AssetResolver::new(
            &config.token,
            config.application_id.clone(),
            cache.clone(),
        )
        .map_err(|e| match e {
            ResolveError::InvalidToken => GatewayError::InvalidToken,
            other => GatewayError::Resolver(other.to_string()),
        })?;
        Self::with_resolver(connector, config, cache, resolver)
    }

    /// Creates a controller with an externally built resolver/cache pair,
    /// so tests can point the resolver at a local endpoint.
    pub fn with_resolver(
        connector: C,
        config: ControllerConfig,
        cache: Arc<ArtworkCache>,
        resolver: AssetResolver,
    ) -> Result<Self, GatewayError> {
        if config.token.trim().is_empty() {
            return Err(GatewayError::EmptyToken);
        }

        let cancel = CancellationToken::new();
        let conn = GatewayConnection::new(
            connector,
            config.token.clone(),
            config.gateway,
            cancel.child_token(),
        );

        let queue = Arc::new(PresenceQueue::new());
        let (activity_tx, activity_rx) = watch::channel(None);
        tokio::spawn(presence_worker(
            conn.clone(),
            queue.clone(),
            Arc::new(activity_tx),
            cancel.child_token(),
        ));

        Ok(Self {
            conn,
            queue,
            resolver: Arc::new(resolver),
            cache,
            application_id: config.application_id,
            activity_rx,
            cancel,
        })
    }

    /// Starts the gateway connection. Idempotent; a no-op when already
    /// connecting, connected, or closed.
    pub async fn connect(&self) {
        if self.is_closed() {
            return;
        }
        self.conn.start().await;
    }

    /// Drops the current socket and dials again.
    pub async fn restart(&self) {
        if self.is_closed() {
            return;
        }
        self.conn.restart().await;
    }

    /// Resolves artwork, builds a presence, and queues it for delivery.
    ///
    /// Non-blocking beyond artwork resolution; delivery happens on the
    /// queue worker. A no-op after `close()`.
    pub async fn set_activity(&self, spec: ActivitySpec) {
        if self.is_closed() {
            return;
        }

        // Large and small artwork resolve in parallel; a failed
        // resolution drops that image, never the whole update.
        let (large, small) = tokio::join!(
            resolve_image(&self.resolver, spec.large_image.as_deref()),
            resolve_image(&self.resolver, spec.small_image.as_deref()),
        );

        let presence = build_presence(spec, large, small, self.application_id.clone());
        self.queue.push(presence);
    }

    /// Shuts everything down: queue worker, socket, reconnect loops, and
    /// the artwork cache. Idempotent and terminal.
    pub async fn close(&self) {
        let already_closed = self.is_closed();
        self.conn.shutdown().await;
        self.cancel.cancel();
        if !already_closed {
            self.cache.clear();
            debug!("controller closed");
        }
    }

    /// Observable connection-state stream.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.conn.subscribe_state()
    }

    /// Epoch-millisecond timestamp of the last delivered update.
    pub fn last_activity_at(&self) -> watch::Receiver<Option<u64>> {
        self.activity_rx.clone()
    }

    /// Most recent connection or delivery error.
    pub fn last_error(&self) -> watch::Receiver<Option<String>> {
        self.conn.subscribe_error()
    }

    fn is_closed(&self) -> bool {
        self.conn.shared.closing.load(Ordering::Relaxed)
    }
}

impl<C: Connector> Drop for RpcController<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn resolve_image(resolver: &AssetResolver, reference: Option<&str>) -> Option<String> {
    match reference {
        Some(r) => resolver.resolve(r).await,
        None => None,
    }
}

/// Maps a caller-supplied activity into an immutable presence snapshot.
fn build_presence(
    spec: ActivitySpec,
    large_image: Option<String>,
    small_image: Option<String>,
    default_application_id: Option<String>,
) -> Presence {
    let mut buttons = spec.buttons;
    buttons.truncate(2);

    Presence {
        name: spec.name,
        state: spec.state,
        details: spec.details,
        start: spec.start,
        end: spec.end,
        large_image,
        small_image,
        large_text: spec.large_text,
        small_text: spec.small_text,
        buttons,
        application_id: spec.application_id.or(default_application_id),
        activity_type: spec.activity_type,
        status: spec.status,
    }
}
