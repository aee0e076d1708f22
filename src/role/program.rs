//! In-process role programs
//!
//! An in-process role is assembled explicitly: a factory registered under an
//! executable name receives a [`RoleContext`], asks it for the publishers it
//! needs, and returns a [`RoleProgram`] declaring which keys it consumes and
//! what to do with each message.
//!
//! ```ignore
//! registry.register("doubler", |ctx: &RoleContext| {
//!     let out = ctx.publisher("doubled");
//!     Ok(RoleProgram::builder()
//!         .subscribe("numbers", move |msg| {
//!             let out = out.clone();
//!             async move { out.publish(double(msg)?).await.map_err(Into::into) }
//!         })
//!         .build())
//! });
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use bytes::Bytes;
use futures::StreamExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::platform::client::workload_key;
use crate::platform::{PlatformClient, PlatformResult};

/// Handler invoked for each message on a subscribed key
pub type MessageHandler =
    Arc<dyn Fn(Bytes) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Free-running part of a role; it must return once the token is cancelled
pub type RoleBody =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Builds a program for one role instance
pub type RoleFactory = Arc<dyn Fn(&RoleContext) -> anyhow::Result<RoleProgram> + Send + Sync>;

/// Sends messages to one queue key
#[derive(Clone)]
pub struct Publisher {
    key: String,
    client: Arc<dyn PlatformClient>,
}

impl Publisher {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn publish(&self, value: Bytes) -> PlatformResult<()> {
        self.client.publish(&self.key, value).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(&self, value: &T) -> PlatformResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.publish(Bytes::from(bytes)).await
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher").field("key", &self.key).finish()
    }
}

/// Everything a role instance gets from the device that runs it
#[derive(Clone)]
pub struct RoleContext {
    role_id: String,
    hostname: String,
    client: Arc<dyn PlatformClient>,
}

impl RoleContext {
    pub fn new(
        role_id: impl Into<String>,
        hostname: impl Into<String>,
        client: Arc<dyn PlatformClient>,
    ) -> Self {
        Self {
            role_id: role_id.into(),
            hostname: hostname.into(),
            client,
        }
    }

    pub fn role_id(&self) -> &str {
        &self.role_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Publisher bound to `key`
    pub fn publisher(&self, key: impl Into<String>) -> Publisher {
        Publisher {
            key: key.into(),
            client: Arc::clone(&self.client),
        }
    }

    /// Direct access to kv, metrics and queues
    pub fn client(&self) -> &Arc<dyn PlatformClient> {
        &self.client
    }

    /// Execution counter the lazy stop pass looks at
    pub fn workload_key(&self) -> String {
        workload_key(&self.hostname, &self.role_id)
    }
}

impl fmt::Debug for RoleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleContext")
            .field("role_id", &self.role_id)
            .field("hostname", &self.hostname)
            .finish()
    }
}

/// Declared behavior of an in-process role
pub struct RoleProgram {
    subscriptions: Vec<(String, MessageHandler)>,
    body: Option<RoleBody>,
}

impl fmt::Debug for RoleProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.subscriptions.iter().map(|(key, _)| key.as_str()).collect();
        f.debug_struct("RoleProgram")
            .field("subscriptions", &keys)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl RoleProgram {
    pub fn builder() -> RoleProgramBuilder {
        RoleProgramBuilder {
            subscriptions: Vec::new(),
            body: None,
        }
    }

    /// Keys this program consumes
    pub fn subscription_keys(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.iter().map(|(key, _)| key.as_str())
    }

    /// Run until every subscription and the body finish, the token is
    /// cancelled, or any part fails
    ///
    /// Each handled message adds 1 to the role's execution counter.
    pub async fn run(self, context: RoleContext, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tasks = JoinSet::new();

        for (key, handler) in self.subscriptions {
            let context = context.clone();
            let cancel = cancel.clone();
            tasks.spawn(consume(key, handler, context, cancel));
        }

        if let Some(body) = self.body {
            tasks.spawn(body(cancel.clone()));
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| anyhow!("role task panicked: {e}"))
                .and_then(|result| result);

            if let Err(e) = outcome {
                cancel.cancel();
                tasks.abort_all();
                return Err(e);
            }
        }

        Ok(())
    }
}

async fn consume(
    key: String,
    handler: MessageHandler,
    context: RoleContext,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut stream = context
        .client
        .subscribe(&key)
        .await
        .with_context(|| format!("failed to subscribe to '{key}'"))?;
    let counter = context.workload_key();
    debug!(role = %context.role_id, %key, "consuming");

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                return Err(e).with_context(|| format!("subscription to '{key}' failed"));
            }
            None => {
                debug!(role = %context.role_id, %key, "subscription ended");
                break;
            }
        };

        trace!(role = %context.role_id, %key, len = message.len(), "handling message");
        handler(message)
            .await
            .with_context(|| format!("handler for '{key}' failed"))?;

        if let Err(e) = context.client.store_metric(&counter, 1.0, None).await {
            warn!("failed to record execution of {}: {e}", context.role_id);
        }
    }

    Ok(())
}

/// Builder returned by [`RoleProgram::builder`]
pub struct RoleProgramBuilder {
    subscriptions: Vec<(String, MessageHandler)>,
    body: Option<RoleBody>,
}

impl RoleProgramBuilder {
    /// Handle every message routed to this device on `key`
    pub fn subscribe<F, Fut>(mut self, key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: MessageHandler = Arc::new(move |message| Box::pin(handler(message)));
        self.subscriptions.push((key.into(), handler));
        self
    }

    /// Run `body` alongside the subscriptions
    pub fn body<F, Fut>(mut self, body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.body = Some(Box::new(move |cancel| Box::pin(body(cancel))));
        self
    }

    pub fn build(self) -> RoleProgram {
        RoleProgram {
            subscriptions: self.subscriptions,
            body: self.body,
        }
    }
}

/// Executable names a device knows how to run in-process
#[derive(Default, Clone)]
pub struct RoleRegistry {
    factories: HashMap<String, RoleFactory>,
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleRegistry")
            .field("executables", &self.names())
            .finish()
    }
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the factory for `executable`
    pub fn register<F>(&mut self, executable: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&RoleContext) -> anyhow::Result<RoleProgram> + Send + Sync + 'static,
    {
        self.factories.insert(executable.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, executable: &str) -> bool {
        self.factories.contains_key(executable)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the program for one role instance
    pub fn instantiate(
        &self,
        executable: &str,
        context: &RoleContext,
    ) -> anyhow::Result<RoleProgram> {
        let factory = self
            .factories
            .get(executable)
            .ok_or_else(|| anyhow!("no in-process executable named '{executable}'"))?;
        factory(context).with_context(|| format!("failed to instantiate '{executable}'"))
    }
}
