//! Host-level lifecycle: root manager, child managers, retain across hosts.

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use pretty_assertions::assert_eq;

  use crate::{
    LoaderId, LoaderManagerHost, ManualExecutor, ROOT_WHO,
    manager::__tests__::helpers::{EventLog, Recorder, finished, reset},
  };

  const ID: LoaderId = LoaderId(1);

  fn host() -> (Arc<ManualExecutor>, LoaderManagerHost<u32>) {
    let executor = Arc::new(ManualExecutor::new());
    (executor.clone(), LoaderManagerHost::new(executor))
  }

  #[tokio::test]
  async fn test_root_manager_follows_host_start() {
    let (executor, mut host) = host();
    let log = EventLog::default();
    host.do_loader_start();
    assert!(host.loaders_started());

    let root = host.root_manager();
    assert_eq!(root.who(), ROOT_WHO);
    assert!(root.is_started(), "root created after start is started");
    root.init_loader(ID, None, Recorder::new(100, log.clone())).unwrap();

    executor.run_all();
    assert_eq!(host.turn().await, 1);
    assert_eq!(*log.borrow(), vec![finished(1, 101)]);
    assert!(host.is_idle());

    host.do_loader_stop(false);
    assert!(!host.loaders_started());
    assert!(!host.root_manager().is_started());
    // A second stop is a no-op.
    host.do_loader_stop(false);
  }

  #[tokio::test]
  async fn test_turn_without_managers_returns_immediately() {
    let (_, mut host) = host();
    assert_eq!(host.turn().await, 0);
  }

  #[test]
  fn test_child_managers_are_created_on_demand() {
    let (_, mut host) = host();
    assert!(host.get_loader_manager("child", false, false).is_none());
    let child = host.get_loader_manager("child", true, true).expect("created");
    assert!(child.is_started());
    assert_eq!(host.manager_count(), 1);

    host.inactivate_state("child");
    assert_eq!(host.manager_count(), 0);
  }

  #[test]
  fn test_inactivate_state_skips_retained_manager() {
    let (_, mut host) = host();
    let child = host.get_loader_manager("child", true, true).unwrap();
    child.do_retain().unwrap();

    host.inactivate_state("child");
    assert_eq!(host.manager_count(), 1);
  }

  #[test]
  fn test_retain_and_restore_across_hosts() {
    let (executor, mut first) = host();
    let log = EventLog::default();
    let rec = Recorder::new(100, log.clone());

    first.do_loader_start();
    let root = first.root_manager();
    root.init_loader(ID, None, rec.clone()).unwrap();
    executor.run_all();
    root.dispatch_pending();
    assert_eq!(log.borrow_mut().drain(..).collect::<Vec<_>>(), vec![finished(1, 101)]);

    // A child that was never started is started and retained as well.
    first.get_loader_manager("child", false, true).unwrap();

    first.do_loader_stop(true);
    assert!(first.retain_loaders());
    let retained = first.retain_loader_non_config().expect("managers retained");
    assert_eq!(retained.origin(), first.instance());
    assert_eq!(retained.who().collect::<Vec<_>>(), vec![ROOT_WHO, "child"]);
    assert_eq!(first.manager_count(), 0);

    let (_, mut second) = host();
    second.restore_loader_non_config(retained);
    second.do_loader_start();
    second.report_loader_start();

    let root = second.root_manager();
    assert!(root.is_started());
    assert!(!root.is_retaining());
    let handle = root.handle(ID).expect("handle survived");
    assert!(handle.is_started());
    assert!(handle.loader().is_started());

    // The new owner re-attaches and gets the data without a new load.
    root.init_loader(ID, None, rec.clone()).unwrap();
    assert_eq!(rec.creates.get(), 1);
    assert_eq!(executor.pending(), 0);
    assert_eq!(*log.borrow(), vec![finished(1, 101)]);
  }

  #[test]
  fn test_loader_retain_keeps_root_running() {
    let (executor, mut host) = host();
    let log = EventLog::default();
    host.do_loader_start();
    let root = host.root_manager();
    root.init_loader(ID, None, Recorder::new(100, log.clone())).unwrap();
    executor.run_all();
    root.dispatch_pending();

    host.do_loader_retain();
    let root = host.root_manager();
    assert!(root.is_retaining());
    assert!(!root.is_started());
    assert!(root.handle(ID).unwrap().loader().is_started());

    // Retaining twice is rejected by the manager and leaves it retained.
    host.do_loader_retain();
    assert!(host.root_manager().is_retaining());
  }

  #[test]
  fn test_retain_without_flag_destroys_managers() {
    let (executor, mut host) = host();
    let log = EventLog::default();
    host.do_loader_start();
    let root = host.root_manager();
    root.init_loader(ID, None, Recorder::new(100, log.clone())).unwrap();
    executor.run_all();
    root.dispatch_pending();

    host.do_loader_stop(false);
    assert!(host.retain_loader_non_config().is_none());
    assert_eq!(host.manager_count(), 0);
    assert_eq!(*log.borrow(), vec![finished(1, 101), reset(1)]);
  }
}
