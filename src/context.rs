//! Process-wide wiring: one runner, one backend, one diagnostic queue.

use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{self, Backend};
use crate::config::Config;
use crate::connection::{Orchestrator, PollSettings};
use crate::diagnostics::DiagnosticQueue;
use crate::error::{NetError, Result};
use crate::exec::{CommandRunner, SystemRunner};
use crate::hotspot::{HotspotManager, RecordStore};
use crate::nat::NatReconciler;
use crate::status::StatusDetector;

/// Shared handles every operation is built from.
///
/// The backend is selected once, here, and never selected again.
#[derive(Clone)]
pub struct NetContext {
    runner: Arc<dyn CommandRunner>,
    backend: Arc<dyn Backend>,
    queue: Arc<DiagnosticQueue>,
    settings: PollSettings,
    interface: Option<String>,
    hotspot_dir: PathBuf,
}

impl NetContext {
    /// Looks for a running control plane on the host.
    pub fn detect(config: &Config) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());
        let backend = backend::select(backend::known_backends(
            Arc::clone(&runner),
            config.interface.clone(),
        ))?;
        Self::with_backend(runner, backend, config)
    }

    /// Builds a context around an already chosen backend.
    pub fn with_backend(
        runner: Arc<dyn CommandRunner>,
        backend: Arc<dyn Backend>,
        config: &Config,
    ) -> Result<Self> {
        let hotspot_dir = config
            .hotspot_dir()
            .map_err(|e| NetError::Record(format!("{:#}", e)))?;
        Ok(Self {
            runner,
            backend,
            queue: Arc::new(DiagnosticQueue::active(config.diagnostics_capacity)),
            settings: config.poll_settings(),
            interface: config.interface.clone(),
            hotspot_dir,
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    pub fn queue(&self) -> &Arc<DiagnosticQueue> {
        &self.queue
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.runner),
            Arc::clone(&self.queue),
            self.settings,
        )
        .with_interface(self.interface.clone())
    }

    pub fn detector(&self) -> StatusDetector {
        StatusDetector::new(Arc::clone(&self.backend), Arc::clone(&self.runner))
            .with_interface(self.interface.clone())
    }

    pub fn nat(&self) -> NatReconciler {
        NatReconciler::new(Arc::clone(&self.runner), Arc::clone(&self.queue))
    }

    /// A hotspot manager over the persisted records.
    pub fn hotspots(&self) -> Result<HotspotManager> {
        Ok(HotspotManager::load(
            Arc::clone(&self.backend),
            Arc::clone(&self.runner),
            Arc::clone(&self.queue),
            RecordStore::new(self.hotspot_dir.clone()),
        )?
        .with_nat(self.nat())
        .with_settle(self.settings.settle))
    }
}
