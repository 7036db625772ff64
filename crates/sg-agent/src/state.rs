//! Per-account runtime
//!
//! One account owns one connection, one session registry, one dispatcher
//! task and one sweeper task. Accounts share nothing, so several can run
//! in the same process.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sg_core::config::AccountConfig;
use sg_core::{AccountId, Clock, SgError, SystemClock};

use crate::connection::ConnectionManager;
use crate::dispatch::{InboundDispatcher, ReplyPipeline};
use crate::stream::SessionRegistry;

/// Connection events buffered between the socket and the dispatcher
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything running for one account
pub struct AccountRuntime {
    account_id: AccountId,
    manager: ConnectionManager,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl AccountRuntime {
    /// Validate `config`, wire up the account and start connecting.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: AccountConfig, pipeline: Arc<dyn ReplyPipeline>) -> Result<Self, SgError> {
        Self::start_with_clock(config, pipeline, Arc::new(SystemClock))
    }

    /// Like [`start`](Self::start) with a custom clock for deadlines
    pub fn start_with_clock(
        config: AccountConfig,
        pipeline: Arc<dyn ReplyPipeline>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SgError> {
        config.validate()?;
        let credential = config.resolve_credential()?;
        let account_id = config.account_id.clone();
        let stream_config = config.stream.clone();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let manager =
            ConnectionManager::with_clock(config, credential, events_tx, Arc::clone(&clock));
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(manager.clone()),
            clock,
            &stream_config,
        ));

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(
            InboundDispatcher::new(Arc::clone(&registry), pipeline)
                .run(events_rx, cancel.child_token()),
        );
        let sweeper = registry.spawn_sweeper(stream_config.sweep_interval, cancel.child_token());

        manager.connect();
        tracing::info!("Account {} started", account_id);

        Ok(Self {
            account_id,
            manager,
            registry,
            cancel,
            dispatcher,
            sweeper,
        })
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// The account's connection
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// The account's live streams
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Close the connection and stop every task of this account
    pub async fn shutdown(self) {
        self.manager.disconnect();
        self.cancel.cancel();
        if let Err(e) = self.dispatcher.await {
            tracing::warn!("Account {}: dispatcher ended abnormally: {}", self.account_id, e);
        }
        if let Err(e) = self.sweeper.await {
            tracing::warn!("Account {}: sweeper ended abnormally: {}", self.account_id, e);
        }
        tracing::info!("Account {} stopped", self.account_id);
    }
}
