//! Owner of every [`LoaderManager`] in one component tree.

use std::{collections::BTreeMap, sync::Arc};

use futures::future::select_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::LoaderManager;
use crate::executor::Executor;

/// Scope name of the host's own manager.
pub const ROOT_WHO: &str = "(root)";

/// Managers carried from one host to the next across a reconfiguration.
pub struct RetainedManagers<D> {
  origin: Uuid,
  managers: BTreeMap<String, LoaderManager<D>>,
}

impl<D> RetainedManagers<D> {
  /// Instance id of the host the managers were retained from.
  pub fn origin(&self) -> Uuid {
    self.origin
  }

  pub fn len(&self) -> usize {
    self.managers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.managers.is_empty()
  }

  pub fn who(&self) -> impl Iterator<Item = &str> {
    self.managers.keys().map(String::as_str)
  }
}

/// Drives a set of named managers from the owner's lifecycle.
///
/// The root manager (`"(root)"`) follows [`do_loader_start`](Self::do_loader_start)
/// and [`do_loader_stop`](Self::do_loader_stop) directly. Child managers are
/// created on demand by [`get_loader_manager`](Self::get_loader_manager) and
/// driven by their own scope.
pub struct LoaderManagerHost<D> {
  instance: Uuid,
  executor: Arc<dyn Executor>,
  managers: BTreeMap<String, LoaderManager<D>>,
  root_attached: bool,
  loaders_started: bool,
  retain_loaders: bool,
  checked_for_manager: bool,
}

impl<D: PartialEq + Send + 'static> LoaderManagerHost<D> {
  pub fn new(executor: Arc<dyn Executor>) -> Self {
    let instance = Uuid::now_v7();
    debug!(%instance, "Created loader manager host");
    Self {
      instance,
      executor,
      managers: BTreeMap::new(),
      root_attached: false,
      loaders_started: false,
      retain_loaders: false,
      checked_for_manager: false,
    }
  }

  pub fn instance(&self) -> Uuid {
    self.instance
  }

  pub fn loaders_started(&self) -> bool {
    self.loaders_started
  }

  pub fn retain_loaders(&self) -> bool {
    self.retain_loaders
  }

  pub fn manager_count(&self) -> usize {
    self.managers.len()
  }

  /// Look up the manager for `who`, creating it if `create` is set.
  pub fn get_loader_manager(&mut self, who: &str, started: bool, create: bool) -> Option<&mut LoaderManager<D>> {
    if !self.managers.contains_key(who) {
      if !create {
        return None;
      }
      debug!(instance = %self.instance, who, started, "Creating loader manager");
      self
        .managers
        .insert(who.to_string(), LoaderManager::new(who, started, self.executor.clone()));
    }
    self.managers.get_mut(who)
  }

  /// The host's own manager, created on first use.
  pub fn root_manager(&mut self) -> &mut LoaderManager<D> {
    self.checked_for_manager = true;
    self.root_attached = true;
    let started = self.loaders_started;
    let executor = self.executor.clone();
    self
      .managers
      .entry(ROOT_WHO.to_string())
      .or_insert_with(|| LoaderManager::new(ROOT_WHO, started, executor))
  }

  fn attached_root(&mut self) -> Option<&mut LoaderManager<D>> {
    if !self.root_attached {
      return None;
    }
    self.managers.get_mut(ROOT_WHO)
  }

  pub fn do_loader_start(&mut self) {
    if self.loaders_started {
      return;
    }
    self.loaders_started = true;

    if let Some(root) = self.attached_root() {
      if let Err(error) = root.do_start() {
        warn!(%error, "Root loader manager did not start");
      }
    } else if !self.checked_for_manager && self.managers.contains_key(ROOT_WHO) {
      // A root manager carried over from a previous host.
      self.root_attached = true;
      if let Some(root) = self.managers.get_mut(ROOT_WHO)
        && !root.is_started()
        && let Err(error) = root.do_start()
      {
        warn!(%error, "Restored root loader manager did not start");
      }
    }
    self.checked_for_manager = true;
  }

  /// Stop the root manager, or retain it if `retain` is set.
  pub fn do_loader_stop(&mut self, retain: bool) {
    self.retain_loaders = retain;
    if !self.loaders_started || !self.root_attached {
      return;
    }
    self.loaders_started = false;
    let Some(root) = self.attached_root() else {
      return;
    };
    let result = if retain { root.do_retain() } else { root.do_stop() };
    if let Err(error) = result {
      warn!(%error, retain, "Root loader manager did not stop");
    }
  }

  pub fn do_loader_retain(&mut self) {
    if let Some(root) = self.attached_root()
      && let Err(error) = root.do_retain()
    {
      warn!(%error, "Root loader manager did not retain");
    }
  }

  pub fn do_loader_destroy(&mut self) {
    if let Some(root) = self.attached_root() {
      root.do_destroy();
    }
  }

  /// Destroy and drop the manager for `who` unless it is being retained.
  pub fn inactivate_state(&mut self, who: &str) {
    let Some(manager) = self.managers.get_mut(who) else {
      return;
    };
    if manager.is_retaining() {
      return;
    }
    manager.do_destroy();
    self.managers.remove(who);
    if who == ROOT_WHO {
      self.root_attached = false;
    }
  }

  /// Finish any retain and report the start to every manager.
  pub fn report_loader_start(&mut self) {
    for manager in self.managers.values_mut().rev() {
      manager.finish_retain();
      manager.do_report_start();
    }
  }

  /// Hand every manager that should survive a reconfiguration to the next
  /// host. Managers that are not retained are destroyed.
  ///
  /// Returns `None` when nothing was retained.
  pub fn retain_loader_non_config(&mut self) -> Option<RetainedManagers<D>> {
    let retain = self.retain_loaders;
    let mut retained = BTreeMap::new();

    for (who, mut manager) in std::mem::take(&mut self.managers).into_iter().rev() {
      if !manager.is_retaining() && retain {
        if !manager.is_started()
          && let Err(error) = manager.do_start()
        {
          warn!(%error, who = %who, "Could not start manager before retaining");
        }
        if let Err(error) = manager.do_retain() {
          warn!(%error, who = %who, "Could not retain manager");
        }
      }
      if manager.is_retaining() {
        retained.insert(who, manager);
      } else {
        debug!(who = %who, "Destroying manager that is not retained");
        manager.do_destroy();
      }
    }
    self.root_attached = false;

    if retained.is_empty() {
      return None;
    }
    info!(instance = %self.instance, managers = retained.len(), "Retaining loader managers");
    Some(RetainedManagers {
      origin: self.instance,
      managers: retained,
    })
  }

  /// Adopt managers retained by a previous host.
  pub fn restore_loader_non_config(&mut self, retained: RetainedManagers<D>) {
    info!(
      instance = %self.instance,
      origin = %retained.origin,
      managers = retained.managers.len(),
      "Restoring loader managers"
    );
    for (who, mut manager) in std::mem::replace(&mut self.managers, retained.managers) {
      debug!(who = %who, "Dropping manager replaced by restore");
      manager.do_destroy();
    }
    self.root_attached = false;
    self.checked_for_manager = false;
  }

  /// Wait until any manager has work, then dispatch all of them. Returns the
  /// number of messages handled.
  pub async fn turn(&mut self) -> usize {
    if self.managers.is_empty() {
      return 0;
    }
    let _ = select_all(self.managers.values_mut().map(|m| Box::pin(m.wait_ready()))).await;
    self.managers.values_mut().map(LoaderManager::dispatch_pending).sum()
  }

  /// True when no manager has background work, timers or messages left.
  pub fn is_idle(&mut self) -> bool {
    self.managers.values_mut().all(|m| m.is_idle())
  }

  /// Keep turning until every manager is idle.
  pub async fn run_until_idle(&mut self) {
    while !self.is_idle() {
      self.turn().await;
    }
  }
}

impl<D> std::fmt::Debug for LoaderManagerHost<D> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LoaderManagerHost")
      .field("instance", &self.instance)
      .field("managers", &self.managers.keys().collect::<Vec<_>>())
      .field("loaders_started", &self.loaders_started)
      .field("retain_loaders", &self.retain_loaders)
      .finish_non_exhaustive()
  }
}
