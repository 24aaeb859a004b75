//! Manager-wide start/stop/retain/destroy transitions and owner-thread dispatch.

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use crate::{
    LoaderError, LoaderId,
    manager::__tests__::helpers::{Rig, finished, reset},
  };

  const ID: LoaderId = LoaderId(1);

  // ==========================================================================
  // Invalid transitions
  // ==========================================================================

  #[test]
  fn test_invalid_transitions_are_rejected_without_state_change() {
    let mut rig = Rig::new(false);
    assert!(matches!(rig.manager.do_stop(), Err(LoaderError::InvalidState(_))));
    assert!(matches!(rig.manager.do_retain(), Err(LoaderError::InvalidState(_))));
    assert!(!rig.manager.is_started());
    assert!(!rig.manager.is_retaining());

    rig.manager.do_start().unwrap();
    assert!(matches!(rig.manager.do_start(), Err(LoaderError::InvalidState(_))));
    assert!(rig.manager.is_started());

    // Still usable afterwards.
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 101)]);
  }

  // ==========================================================================
  // Start / stop
  // ==========================================================================

  #[test]
  fn test_stop_then_start_reuses_cached_result() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.events();

    rig.manager.do_stop().unwrap();
    let handle = rig.manager.handle(ID).unwrap();
    assert!(!handle.is_started());
    assert!(!handle.is_listener_registered());
    assert!(!handle.loader().is_started());

    rig.manager.do_start().unwrap();
    rig.settle();
    // Same data comes back from the cache, so it is not delivered again.
    assert!(rig.events().is_empty());
    assert!(rig.manager.handle(ID).unwrap().loader().is_started());
  }

  #[test]
  fn test_report_start_delivers_deferred_data_once() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.events();

    rig.manager.do_stop().unwrap();
    rig.manager.do_report_next_start();
    rig.manager.do_start().unwrap();
    rig.settle();
    assert!(rig.events().is_empty());

    rig.manager.do_report_start();
    rig.manager.do_report_start();
    assert_eq!(rig.events(), vec![finished(1, 101)]);
  }

  // ==========================================================================
  // Retain
  // ==========================================================================

  #[test]
  fn test_retain_then_start_keeps_loader_running() {
    let mut rig = Rig::new(true);
    let rec = rig.recorder(100);
    rig.manager.init_loader(ID, None, rec.clone()).unwrap();
    rig.settle();
    rig.events();

    rig.manager.do_retain().unwrap();
    assert!(rig.manager.is_retaining());
    let handle = rig.manager.handle(ID).unwrap();
    assert!(handle.is_retaining());
    assert!(!handle.is_started());
    // Retaining does not stop the underlying loader.
    assert!(handle.loader().is_started());
    assert!(handle.is_listener_registered());

    rig.manager.do_start().unwrap();
    rig.manager.finish_retain();
    let handle = rig.manager.handle(ID).unwrap();
    assert!(handle.is_started());
    assert!(!handle.is_retaining());
    assert!(handle.loader().is_started());
    assert_eq!(rec.creates.get(), 1);
    assert_eq!(rig.executor.pending(), 0);

    // Callbacks were detached by the retain; the new owner re-attaches them.
    assert!(rig.events().is_empty());
    rig.manager.init_loader(ID, None, rec.clone()).unwrap();
    assert_eq!(rig.events(), vec![finished(1, 101)]);
    assert_eq!(rec.creates.get(), 1);
  }

  #[test]
  fn test_finish_retain_without_restart_stops_loader() {
    let mut rig = Rig::new(true);
    let rec = rig.recorder(100);
    rig.manager.init_loader(ID, None, rec.clone()).unwrap();
    rig.settle();

    rig.manager.do_retain().unwrap();
    rig.manager.finish_retain();
    let handle = rig.manager.handle(ID).unwrap();
    assert!(!handle.is_started());
    assert!(!handle.is_listener_registered());
    assert!(!handle.loader().is_started());
    assert!(handle.has_data());
    assert_eq!(rec.creates.get(), 1);
  }

  #[test]
  fn test_destroy_while_retaining_keeps_active_handles() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.manager.restart_loader(ID, None, rig.recorder(200)).unwrap();
    rig.events();

    rig.manager.do_retain().unwrap();
    rig.manager.do_destroy();
    assert!(rig.manager.handle(ID).is_some());
    assert!(rig.manager.inactive_handle(ID).is_none());
  }

  #[test]
  fn test_destroy_resets_everything() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.manager.init_loader(LoaderId(2), None, rig.recorder(200)).unwrap();
    rig.settle();
    rig.events();

    rig.manager.do_destroy();
    assert!(rig.manager.is_empty());
    // Highest id first.
    assert_eq!(rig.events(), vec![reset(2), reset(1)]);
  }

  // ==========================================================================
  // Dispatch
  // ==========================================================================

  #[test]
  fn test_consumer_panic_is_contained() {
    let mut rig = Rig::new(true);
    let rec = rig.recorder(100);
    rec.panic_on_finish.set(true);
    rig.manager.init_loader(ID, None, rec.clone()).unwrap();
    rig.settle();

    let handle = rig.manager.handle(ID).unwrap();
    assert!(handle.has_data());
    assert!(!handle.delivered_data());
    assert!(rig.manager.has_running_loaders());

    rec.panic_on_finish.set(false);
    rig.manager.restart_loader(ID, None, rec.clone()).unwrap();
    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 101)]);
  }

  #[test]
  fn test_reset_panic_still_tears_down() {
    let mut rig = Rig::new(true);
    let rec = rig.recorder(100);
    rig.manager.init_loader(ID, None, rec.clone()).unwrap();
    rig.manager.init_loader(LoaderId(2), None, rig.recorder(200)).unwrap();
    rig.settle();
    rig.events();

    rec.panic_on_reset.set(true);
    rig.manager.destroy_loader(ID);
    assert!(rig.manager.handle(ID).is_none());
    assert!(rig.events().is_empty());

    // Other loaders are unaffected.
    rig.manager.do_destroy();
    assert_eq!(rig.events(), vec![reset(2)]);
  }

  #[test]
  fn test_content_change_reloads_started_loader() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.events();

    let observer = rig.manager.content_observer(ID).expect("loader exists");
    assert_eq!(observer.loader_id(), ID);
    assert!(observer.notify_change());
    assert!(!observer.notify_change(), "second signal folds into the first");

    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 102)]);
    assert!(observer.notify_change());
  }

  #[test]
  fn test_content_change_while_stopped_reloads_on_start() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.events();
    let observer = rig.manager.content_observer(ID).unwrap();

    rig.manager.do_stop().unwrap();
    observer.notify_change();
    rig.settle();
    assert_eq!(rig.executor.pending(), 0);

    rig.manager.do_start().unwrap();
    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 102)]);
  }

  #[tokio::test]
  async fn test_run_until_idle_with_inline_executor() {
    let executor = std::sync::Arc::new(crate::InlineExecutor);
    let mut manager = crate::LoaderManager::new("inline", true, executor);
    let rig = Rig::new(false);
    manager.init_loader(ID, None, rig.recorder(100)).unwrap();

    manager.run_until_idle().await;
    assert!(manager.is_idle());
    assert_eq!(rig.events(), vec![finished(1, 101)]);
  }
}
