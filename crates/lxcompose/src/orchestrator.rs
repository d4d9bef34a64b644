//! Container lifecycle orchestration.

use std::net::Ipv4Addr;
use std::time::Duration;

use lxcompose_common::{LxcError, LxcResult};
use lxcompose_net::{ContainerStatus, NetworkIdentityStore, SetupRequest};

use crate::spec::{ComposeFile, ContainerSpec};

/// How long `up` waits for a started container to obtain its address.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of bringing one container up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpResult {
    /// Container name.
    pub name: String,
    /// Its address.
    pub ip: Ipv4Addr,
    /// Whether the container was created by this run.
    pub created: bool,
}

/// Drives the containers of one compose file.
pub struct Orchestrator {
    compose: ComposeFile,
    store: NetworkIdentityStore,
    wait_timeout: Duration,
}

impl Orchestrator {
    /// Create a new orchestrator.
    #[must_use]
    pub const fn new(compose: ComposeFile, store: NetworkIdentityStore) -> Self {
        Self {
            compose,
            store,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Override how long to wait for addresses.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// The compose file being driven.
    #[must_use]
    pub const fn compose(&self) -> &ComposeFile {
        &self.compose
    }

    /// Create, start and set up every container, dependencies first.
    ///
    /// Stops at the first container that fails; containers already up stay
    /// up.
    ///
    /// # Errors
    ///
    /// Returns the first failure, after the failing container's network
    /// state has been rolled back.
    pub async fn up(&self) -> LxcResult<Vec<UpResult>> {
        self.prune();

        let order = self.compose.dependency_order()?;
        tracing::debug!(order = ?order.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(), "Resolved dependency order");

        let mut results = Vec::with_capacity(order.len());
        for spec in order {
            results.push(self.up_container(spec).await?);
        }
        Ok(results)
    }

    async fn up_container(&self, spec: &ContainerSpec) -> LxcResult<UpResult> {
        let name = spec.name.as_str();
        let executor = self.store.executor();

        let Some(existing) = executor.container(name)? else {
            let ip = self.create(spec).await?;
            return Ok(UpResult {
                name: name.to_string(),
                ip,
                created: true,
            });
        };

        // A container we never allocated for belongs to someone else
        if self.store.allocator().get(name)?.is_none() {
            return Err(LxcError::name_conflict(name));
        }

        if existing.status == ContainerStatus::Running {
            tracing::info!(container = %name, "Container already running, refreshing network setup");
        } else {
            tracing::info!(container = %name, "Starting container");
            executor.start_container(name)?;
        }
        self.wait_for_address(name).await?;

        self.store.forwards().update_ip(name)?;
        let ip = self.store.provisioner().setup(&setup_request(spec))?;
        Ok(UpResult {
            name: name.to_string(),
            ip,
            created: false,
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> LxcResult<Ipv4Addr> {
        let name = spec.name.as_str();
        self.store.reconciler().ensure_name_available(name)?;

        tracing::info!(container = %name, image = %spec.image, "Creating container");
        self.store.executor().create_container(name, &spec.image)?;

        match self.launch(spec).await {
            Ok(ip) => Ok(ip),
            Err(e) => {
                self.store.reconciler().teardown_on_failure(name);
                self.discard(name);
                Err(e)
            }
        }
    }

    async fn launch(&self, spec: &ContainerSpec) -> LxcResult<Ipv4Addr> {
        let name = spec.name.as_str();
        let executor = self.store.executor();

        let ip = self.store.allocator().allocate(name)?;
        executor.pin_ipv4(name, ip)?;

        tracing::info!(container = %name, %ip, "Starting container");
        executor.start_container(name)?;

        let live = self.wait_for_address(name).await?;
        if live != ip {
            tracing::warn!(container = %name, allocated = %ip, live = %live, "Container did not take its allocated address");
        }

        self.store.provisioner().setup(&setup_request(spec))
    }

    fn discard(&self, name: &str) {
        let executor = self.store.executor();
        if let Err(e) = executor.stop_container(name) {
            tracing::debug!(container = %name, error = %e, "Failed to stop container");
        }
        match executor.delete_container(name) {
            Ok(()) => tracing::info!(container = %name, "Deleted partially created container"),
            Err(e) => tracing::warn!(container = %name, error = %e, "Failed to delete container"),
        }
    }

    /// Poll until `name` reports a live address.
    ///
    /// # Errors
    ///
    /// Returns [`LxcError::Timeout`] when the wait runs out, or
    /// [`LxcError::Interrupted`] on Ctrl-C.
    pub async fn wait_for_address(&self, name: &str) -> LxcResult<Ipv4Addr> {
        let operation = format!("waiting for {name} to obtain an address");
        let deadline = tokio::time::sleep(self.wait_timeout);
        tokio::pin!(deadline);

        loop {
            let live = self
                .store
                .executor()
                .container(name)?
                .and_then(|c| c.live_ip());
            if let Some(ip) = live {
                return Ok(ip);
            }
            tracing::debug!(container = %name, "Waiting for address");

            tokio::select! {
                () = &mut deadline => {
                    return Err(LxcError::Timeout {
                        operation,
                        seconds: self.wait_timeout.as_secs(),
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    return Err(LxcError::Interrupted { operation });
                }
                () = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Stop every running container, dependents first. Network state is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried or a stop fails.
    pub fn down(&self) -> LxcResult<()> {
        let executor = self.store.executor();
        for spec in self.compose.dependency_order()?.into_iter().rev() {
            let name = spec.name.as_str();
            match executor.container(name)? {
                Some(c) if c.status == ContainerStatus::Running => {
                    tracing::info!(container = %name, "Stopping container");
                    executor.stop_container(name)?;
                }
                Some(_) => tracing::debug!(container = %name, "Container already stopped"),
                None => tracing::warn!(container = %name, "Container does not exist"),
            }
        }
        Ok(())
    }

    /// Stop and delete every container and drop all of its network state.
    ///
    /// Keeps going after a failure; the first error is returned at the end.
    ///
    /// # Errors
    ///
    /// Returns the first teardown or delete failure.
    pub fn destroy(&self) -> LxcResult<()> {
        let executor = self.store.executor();
        let mut first_error = None;

        for spec in self.compose.dependency_order()?.into_iter().rev() {
            let name = spec.name.as_str();
            let existing = executor.container(name)?;

            if existing.as_ref().is_some_and(|c| c.status == ContainerStatus::Running) {
                tracing::info!(container = %name, "Stopping container");
                if let Err(e) = executor.stop_container(name) {
                    tracing::warn!(container = %name, error = %e, "Failed to stop container");
                }
            }

            if let Err(e) = self.store.reconciler().teardown(name) {
                first_error.get_or_insert(e);
            }

            if existing.is_some() {
                tracing::info!(container = %name, "Deleting container");
                if let Err(e) = executor.delete_container(name) {
                    tracing::warn!(container = %name, error = %e, "Failed to delete container");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn prune(&self) {
        match self.store.reconciler().sync_with_reality() {
            Ok(pruned) if !pruned.is_empty() => {
                tracing::info!(count = pruned.len(), "Cleaned up state of removed containers");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Could not reconcile with the runtime"),
        }
    }
}

fn setup_request(spec: &ContainerSpec) -> SetupRequest {
    spec.forwards().into_iter().fold(
        SetupRequest::new(spec.name.clone()).with_exposed_ports(spec.exposed_ports.iter().copied()),
        SetupRequest::with_forward,
    )
}
