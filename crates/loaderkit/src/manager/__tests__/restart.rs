//! init/restart/destroy scenarios, including the pending-replacement path.

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use crate::{
    LoaderError, LoaderId,
    manager::__tests__::helpers::{Rig, finished, reset},
  };

  const ID: LoaderId = LoaderId(1);

  #[test]
  fn test_init_delivers_once() {
    let mut rig = Rig::new(true);
    let rec = rig.recorder(100);

    rig.manager.init_loader(ID, None, rec.clone()).unwrap();
    assert!(rig.manager.has_running_loaders());
    rig.settle();

    assert_eq!(rig.events(), vec![finished(1, 101)]);
    assert!(!rig.manager.has_running_loaders());
    assert_eq!(rec.creates.get(), 1);
  }

  #[test]
  fn test_init_existing_reuses_loader_and_redelivers() {
    let mut rig = Rig::new(true);
    let rec = rig.recorder(100);
    let first = rig.manager.init_loader(ID, None, rec.clone()).unwrap().key();
    rig.settle();
    rig.events();

    let second = rig.manager.init_loader(ID, None, rec.clone()).unwrap().key();
    assert_eq!(first, second);
    assert_eq!(rec.creates.get(), 1);
    assert_eq!(rig.events(), vec![finished(1, 101)]);
    assert_eq!(rig.executor.pending(), 0);
  }

  #[test]
  fn test_init_on_stopped_manager_does_not_start() {
    let mut rig = Rig::new(false);
    let rec = rig.recorder(100);
    let loader = rig.manager.init_loader(ID, None, rec).unwrap();
    assert!(!loader.is_started());
    assert_eq!(rig.executor.pending(), 0);

    rig.manager.do_start().unwrap();
    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 101)]);
  }

  #[test]
  fn test_restart_with_data_keeps_old_handle_inactive() {
    let mut rig = Rig::new(true);
    let first = rig.recorder(100);
    let second = rig.recorder(200);
    let old_key = rig.manager.init_loader(ID, None, first).unwrap().key();
    rig.settle();
    rig.events();

    let new_key = rig.manager.restart_loader(ID, None, second).unwrap().key();
    assert_ne!(old_key, new_key);

    let inactive = rig.manager.inactive_handle(ID).expect("old handle kept");
    assert_eq!(inactive.loader().key(), old_key);
    assert!(inactive.loader().is_abandoned());
    assert_eq!(inactive.data(), Some(&101));
    assert_eq!(rig.manager.handle(ID).map(|h| h.loader().key()), Some(new_key));

    // The new result retires the inactive handle without a reset callback.
    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 201)]);
    assert!(rig.manager.inactive_handle(ID).is_none());
  }

  #[test]
  fn test_restart_while_running_queues_pending_until_cancelled() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 101)]);

    // Second loader starts running; the first sits in the inactive slot.
    rig.manager.restart_loader(ID, None, rig.recorder(200)).unwrap();
    assert_eq!(rig.executor.pending(), 1);

    // Third restart before the second delivers: cancel it, queue a pending handle.
    let third = rig.recorder(300);
    let pending_key = rig.manager.restart_loader(ID, None, third.clone()).unwrap().key();
    let active = rig.manager.handle(ID).unwrap();
    let pending = active.pending().expect("pending handle queued");
    assert_eq!(pending.loader().key(), pending_key);
    assert!(!pending.is_started());
    assert_eq!(rig.manager.get_loader(ID).map(|l| l.key()), Some(pending_key));

    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 301)]);
    assert_eq!(rig.manager.handle(ID).map(|h| h.loader().key()), Some(pending_key));
    assert!(rig.manager.inactive_handle(ID).is_none());
    assert_eq!(third.creates.get(), 1);
  }

  #[test]
  fn test_stale_result_never_reaches_consumer() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.events();

    rig.manager.restart_loader(ID, None, rig.recorder(200)).unwrap();
    // The second load completes on the worker, but the owner has not seen it.
    rig.executor.run_all();

    rig.manager.restart_loader(ID, None, rig.recorder(300)).unwrap();
    rig.settle();

    assert_eq!(rig.events(), vec![finished(1, 301)]);
  }

  #[test]
  fn test_refused_cancel_replaces_handle_and_its_pending() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.manager.restart_loader(ID, None, rig.recorder(200)).unwrap();
    rig.manager.restart_loader(ID, None, rig.recorder(300)).unwrap();
    rig.events();

    // The running loader is already cancelling, so this one is refused and
    // the active handle is replaced outright.
    let key = rig.manager.restart_loader(ID, None, rig.recorder(400)).unwrap().key();
    assert_eq!(rig.manager.handle(ID).map(|h| h.loader().key()), Some(key));
    assert!(rig.manager.handle(ID).unwrap().pending().is_none());

    rig.settle();
    assert_eq!(rig.events(), vec![finished(1, 401)]);
  }

  #[test]
  fn test_restart_on_stopped_manager_replaces_directly() {
    let mut rig = Rig::new(false);
    let first = rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap().key();
    let second = rig.manager.restart_loader(ID, None, rig.recorder(200)).unwrap().key();
    assert_eq!(rig.manager.inactive_handle(ID).map(|h| h.loader().key()), Some(first));

    // Not started, so the cancel is refused and the current handle goes away.
    let third = rig.manager.restart_loader(ID, None, rig.recorder(300)).unwrap().key();
    assert_ne!(second, third);
    assert_eq!(rig.manager.handle(ID).map(|h| h.loader().key()), Some(third));
    assert_eq!(rig.manager.inactive_handle(ID).map(|h| h.loader().key()), Some(first));
    assert_eq!(rig.manager.len(), 1);
  }

  #[test]
  fn test_restart_sequences_keep_single_active_handle() {
    let mut rig = Rig::new(true);
    for round in 0..6u32 {
      let rec = rig.recorder(round * 100);
      if round % 2 == 0 {
        rig.manager.restart_loader(ID, None, rec).unwrap();
      } else {
        rig.manager.init_loader(ID, None, rec).unwrap();
      }
      if round % 3 == 2 {
        rig.step();
      }
      assert_eq!(rig.manager.len(), 1);
    }
    rig.settle();
    assert_eq!(rig.manager.len(), 1);
    assert!(rig.manager.handle(ID).unwrap().has_data());
  }

  #[test]
  fn test_factory_error_leaves_manager_untouched() {
    let mut rig = Rig::new(true);
    let key = rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap().key();
    rig.settle();

    let broken = rig.recorder(200);
    broken.fail_create.set(true);
    let err = rig.manager.restart_loader(ID, None, broken).unwrap_err();
    assert_eq!(err, LoaderError::factory(ID, "factory refused"));
    assert_eq!(rig.manager.handle(ID).map(|h| h.loader().key()), Some(key));
    assert!(rig.manager.inactive_handle(ID).is_none());
  }

  #[test]
  fn test_destroy_loader_resets_delivered_data() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.events();

    rig.manager.destroy_loader(ID);
    assert_eq!(rig.events(), vec![reset(1)]);
    assert!(rig.manager.handle(ID).is_none());
    assert!(rig.manager.get_loader(ID).is_none());
  }

  #[test]
  fn test_destroy_loader_removes_inactive_too() {
    let mut rig = Rig::new(true);
    rig.manager.init_loader(ID, None, rig.recorder(100)).unwrap();
    rig.settle();
    rig.manager.restart_loader(ID, None, rig.recorder(200)).unwrap();
    rig.events();

    rig.manager.destroy_loader(ID);
    assert!(rig.manager.handle(ID).is_none());
    assert!(rig.manager.inactive_handle(ID).is_none());
    // The in-flight load finishes after its loader is gone.
    rig.settle();
    assert_eq!(rig.events(), vec![reset(1)]);
  }
}
