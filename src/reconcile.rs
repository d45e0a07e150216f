//! The reconciliation engine: diffs on-disk version folders against the
//! persisted meta state and drives the allocator, supervisor, and nginx
//! configurator.
//!
//! The pipeline is a fixed sequence of fallible stages on the locked state;
//! the first fatal error short-circuits the rest. There is no rollback:
//! each stage's writes are final once performed, so a failed pass can leave
//! meta and proxy config mixed but individually consistent. That matches
//! the documented persistence model and is not corrected here.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::meta::{Instance, MetaState, CURRENT_FILE, META_FILE};
use crate::nginx::NginxConfigurator;
use crate::ports;
use crate::supervisor::{RespawnEvent, Supervisor};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Owns the meta state and runs reconciliation passes against it.
///
/// The state sits behind a `tokio::sync::Mutex`, so concurrent reload
/// requests queue instead of interleaving partial pipelines, and respawn
/// bookkeeping serializes with in-flight passes.
pub struct Reconciler {
    config: Config,
    state: Mutex<MetaState>,
    supervisor: Arc<Supervisor>,
    nginx: NginxConfigurator,
}

impl Reconciler {
    /// Load persisted state (empty on first run) and set up the configurator
    pub fn new(config: Config, supervisor: Arc<Supervisor>) -> Result<Self> {
        let meta_path = config.path.join(META_FILE);
        let state = MetaState::load(&meta_path)?;
        if !state.instances.is_empty() {
            info!(
                instances = state.instances.len(),
                "Loaded persisted meta state"
            );
        }
        let nginx = NginxConfigurator::new(config.proxy.clone())?;
        Ok(Self {
            config,
            state: Mutex::new(state),
            supervisor,
            nginx,
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    fn meta_path(&self) -> PathBuf {
        self.config.path.join(META_FILE)
    }

    fn current_path(&self) -> PathBuf {
        self.config.path.join(CURRENT_FILE)
    }

    /// Write the pinned-version marker file; the next pass picks it up
    pub fn pin_current_version(&self, version: &str) -> Result<()> {
        let path = self.current_path();
        std::fs::write(&path, version).map_err(|e| Error::fs(&path, e))?;
        info!(version, "Pinned current version");
        Ok(())
    }

    /// Snapshot of the instance map for the admin API
    pub async fn instances(&self) -> BTreeMap<String, Instance> {
        self.state.lock().await.instances.clone()
    }

    /// Run one reconciliation pass and return the resulting instance map.
    ///
    /// Stage order follows the pipeline contract: discover, diff obsolete,
    /// diff new, allocate, spawn, generate config, persist, signal reload.
    pub async fn reconcile(&self) -> Result<BTreeMap<String, Instance>> {
        let mut meta = self.state.lock().await;
        info!(root = %self.config.path.display(), "Reconciliation started");

        let folders = self.discover()?;
        self.remove_obsolete(&mut meta, &folders);
        self.add_new(&mut meta, &folders);
        self.allocate_ports(&mut meta);
        self.spawn_missing(&mut meta);

        meta.current_version = self.read_current_version()?;
        if meta.current_version.is_some() {
            meta.default_instance = meta.current_version.clone();
        }
        self.write_proxy_config(&mut meta)?;

        meta.save(&self.meta_path())?;
        self.nginx.signal_reload();

        info!(instances = meta.instances.len(), "Reconciliation complete");
        Ok(meta.instances.clone())
    }

    /// Stage 1: list version folders under the managed root.
    /// Plain files (the meta and current markers live here too) are skipped.
    fn discover(&self) -> Result<Vec<String>> {
        let root = &self.config.path;
        let entries = std::fs::read_dir(root).map_err(|e| Error::fs(root, e))?;

        let mut folders = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::fs(root, e))?;
            let file_type = entry.file_type().map_err(|e| Error::fs(entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                folders.push(name.to_string());
            }
        }
        folders.sort();
        debug!(count = folders.len(), "Discovered version folders");
        Ok(folders)
    }

    /// Stage 3: tear down instances whose folder disappeared. Termination is
    /// fire-and-forget; the record itself is discarded by the exit handler.
    fn remove_obsolete(&self, meta: &mut MetaState, folders: &[String]) {
        let gone: Vec<String> = meta
            .instances
            .keys()
            .filter(|name| !folders.contains(name))
            .cloned()
            .collect();

        for name in gone {
            self.supervisor.terminate(&name, true);
            if let Some(instance) = meta.instances.remove(&name) {
                if let Some(conf) = instance.nginx_conf {
                    self.nginx.remove_location_config(&conf);
                }
            }
            info!(%name, "Removed obsolete version");
        }
    }

    /// Stage 4: register folders that have no meta entry yet
    fn add_new(&self, meta: &mut MetaState, folders: &[String]) {
        for name in folders {
            if !meta.instances.contains_key(name) {
                let path = self.config.path.join(name);
                meta.instances
                    .insert(name.clone(), Instance::new(name.clone(), path));
                info!(%name, "Discovered new version");
            }
        }
    }

    /// Stage 5: hand out ports to instances that have none. Exhaustion only
    /// skips the affected instance; the rest of the pass continues.
    fn allocate_ports(&self, meta: &mut MetaState) {
        let mut used = meta.used_ports();
        let unallocated: Vec<String> = meta
            .instances
            .values()
            .filter(|i| i.port == 0)
            .map(|i| i.name.clone())
            .collect();

        for name in unallocated {
            match ports::allocate(&used, self.config.port_range) {
                Ok(port) => {
                    used.insert(port);
                    if let Some(instance) = meta.instances.get_mut(&name) {
                        instance.port = port;
                        info!(%name, port, "Port allocated");
                    }
                }
                Err(e) => {
                    warn!(%name, error = %e, "No port available, version skipped this pass");
                }
            }
        }
    }

    /// Stage 6: spawn a worker for every allocated instance without a live
    /// record. Spawn failures are per-instance and retried next pass.
    fn spawn_missing(&self, meta: &mut MetaState) {
        for instance in meta.instances.values_mut() {
            if instance.port == 0 {
                continue;
            }
            if self.supervisor.has_live_record(&instance.name) {
                continue;
            }
            match self.supervisor.spawn(instance) {
                Ok(Some(pid)) => instance.last_pid = Some(pid),
                Ok(None) => {}
                Err(e) => {
                    warn!(name = %instance.name, error = %e, "Spawn failed, will retry next pass");
                }
            }
        }
    }

    /// Read the `current` marker file, if present
    fn read_current_version(&self) -> Result<Option<String>> {
        let path = self.current_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path).map_err(|e| Error::fs(&path, e))?;
        let trimmed = content.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }

    /// Stage 7: regenerate the server block, one location block per live
    /// instance, and the catch-all route for the pinned version
    fn write_proxy_config(&self, meta: &mut MetaState) -> Result<()> {
        self.nginx
            .write_server_config(meta.default_instance.as_deref())?;

        for instance in meta.instances.values_mut() {
            if instance.port == 0 || instance.nginx_conf.is_some() {
                continue;
            }
            let path = self.nginx.write_location_config(instance)?;
            instance.nginx_conf = Some(path);
        }

        if let Some(current) = meta.current_version.clone() {
            match meta.instances.get(&current) {
                Some(instance) if instance.port != 0 => {
                    self.nginx.write_default_config(&current, instance)?;
                }
                _ => {
                    warn!(%current, "Pinned current version has no live instance");
                }
            }
        }
        Ok(())
    }

    /// Keep the persisted pid in sync when the supervisor respawns a worker
    pub async fn run_respawn_loop(
        self: Arc<Self>,
        mut respawns: mpsc::UnboundedReceiver<RespawnEvent>,
    ) {
        while let Some(event) = respawns.recv().await {
            let mut meta = self.state.lock().await;
            if let Some(instance) = meta.instances.get_mut(&event.name) {
                instance.last_pid = Some(event.pid);
                if let Err(e) = meta.save(&self.meta_path()) {
                    warn!(name = %event.name, error = %e, "Failed to persist respawn pid");
                }
            }
        }
    }
}
