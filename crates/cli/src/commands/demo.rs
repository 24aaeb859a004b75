//! Simulated owner lifecycle: a producer thread keeps changing a feed while
//! a throttled loader reloads it, then the owner is torn down and rebuilt
//! with its loaders retained.

use std::{
  rc::Rc,
  sync::{Arc, Mutex},
  time::Duration,
};

use anyhow::{Context, Result};
use loaderkit::{
  BlockingPoolExecutor, ContentObservable, LoadError, Loader, LoaderArgs, LoaderCallbacks, LoaderError, LoaderId,
  LoaderManagerHost, ROOT_WHO, Throttle, ThrottledLoader, config::Config,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const FEED: LoaderId = LoaderId(1);
const SIDEBAR: LoaderId = LoaderId(2);
const SIDEBAR_WHO: &str = "sidebar";
const LOAD_LATENCY: Duration = Duration::from_millis(25);
const PRODUCE_EVERY: Duration = Duration::from_millis(15);

type Entries = Vec<String>;

/// Data source shared between the producer thread and background loads.
#[derive(Default)]
struct Feed {
  entries: Mutex<Entries>,
  observable: ContentObservable,
}

impl Feed {
  fn push(&self, entry: String) {
    self.lock().push(entry);
    let notified = self.observable.notify_change();
    debug!(notified, "Feed changed");
  }

  fn snapshot(&self, limit: Option<usize>) -> Entries {
    let entries = self.lock();
    let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
    entries[skip..].to_vec()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
    self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Factory and consumer for loaders over the feed. `limit` in the loader
/// args keeps only the newest entries.
struct FeedCallbacks {
  who: &'static str,
  feed: Arc<Feed>,
  throttle: Throttle,
}

impl LoaderCallbacks<Entries> for FeedCallbacks {
  fn on_create_loader(&self, id: LoaderId, args: Option<&LoaderArgs>) -> Result<Loader<Entries>, LoaderError> {
    let limit = match args.map(|a| (a.get("limit"), a.get_u64("limit"))) {
      Some((Some(_), None)) => return Err(LoaderError::factory(id, "limit must be a non-negative integer")),
      Some((_, limit)) => limit.map(|n| n as usize),
      None => None,
    };
    let feed = self.feed.clone();
    let work = move |cancel: &CancellationToken| -> Result<Entries, LoadError> {
      std::thread::sleep(LOAD_LATENCY);
      if cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
      }
      Ok(feed.snapshot(limit))
    };
    Ok(ThrottledLoader::new(work).with_throttle(self.throttle).into_loader(id))
  }

  fn on_load_finished(&self, loader: &Loader<Entries>, data: &Entries) {
    info!(who = self.who, loader_id = %loader.id(), entries = data.len(), "Load finished");
    println!(
      "[{}] loader {}: {} entries, newest {:?}",
      self.who,
      loader.id(),
      data.len(),
      data.last().map(String::as_str).unwrap_or("-")
    );
  }

  fn on_loader_reset(&self, loader: &Loader<Entries>) {
    println!("[{}] loader {}: reset", self.who, loader.id());
  }
}

/// Replace the feed's observers with one for the current feed loader.
fn observe(host: &mut LoaderManagerHost<Entries>, feed: &Feed) -> Result<()> {
  let observer = host
    .root_manager()
    .content_observer(FEED)
    .context("Feed loader is not registered")?;
  feed.observable.unregister_all();
  feed.observable.register(&observer)?;
  Ok(())
}

pub async fn cmd_demo(config: &Config, throttle_ms: Option<u64>, loads: u32) -> Result<()> {
  let throttle = throttle_ms.map_or_else(|| config.loader.throttle(), Throttle::from_millis);
  info!(throttle = ?throttle.min_interval(), loads, "Starting demo");

  let feed = Arc::new(Feed::default());
  let root_callbacks = Rc::new(FeedCallbacks {
    who: ROOT_WHO,
    feed: feed.clone(),
    throttle,
  });
  let executor = Arc::new(BlockingPoolExecutor::current());

  // ==========================================================================
  // First owner: start, load, follow changes
  // ==========================================================================

  let mut host = LoaderManagerHost::new(executor.clone());
  host.do_loader_start();
  host.root_manager().init_loader(FEED, None, root_callbacks.clone())?;
  host.run_until_idle().await;
  observe(&mut host, &feed)?;

  let sidebar_callbacks = Rc::new(FeedCallbacks {
    who: SIDEBAR_WHO,
    feed: feed.clone(),
    throttle,
  });
  host
    .get_loader_manager(SIDEBAR_WHO, true, true)
    .context("Sidebar manager was not created")?
    .init_loader(SIDEBAR, Some(LoaderArgs::new().with("limit", 1)), sidebar_callbacks)?;

  let mut producer = {
    let feed = feed.clone();
    tokio::task::spawn_blocking(move || {
      for n in 1..=loads {
        feed.push(format!("entry {n}"));
        std::thread::sleep(PRODUCE_EVERY);
      }
    })
  };
  loop {
    tokio::select! {
      joined = &mut producer => {
        joined.context("Producer thread failed")?;
        break;
      }
      _ = host.turn() => {}
    }
  }
  host.run_until_idle().await;

  // ==========================================================================
  // Reconfiguration: retain loaders and hand them to a new owner
  // ==========================================================================

  println!("-- reconfiguring owner --");
  host.inactivate_state(SIDEBAR_WHO);
  host.do_loader_stop(true);
  let retained = host
    .retain_loader_non_config()
    .context("Root manager was not retained")?;
  info!(origin = %retained.origin(), managers = retained.len(), "Retained loader managers");

  let mut host = LoaderManagerHost::new(executor);
  host.restore_loader_non_config(retained);
  host.do_loader_start();
  host.report_loader_start();
  host.root_manager().init_loader(FEED, None, root_callbacks.clone())?;
  observe(&mut host, &feed)?;

  // ==========================================================================
  // Restart with new arguments, then tear down
  // ==========================================================================

  println!("-- restarting with limit=3 --");
  let args = LoaderArgs::new().with("limit", 3);
  host.root_manager().restart_loader(FEED, Some(args), root_callbacks)?;
  observe(&mut host, &feed)?;
  host.run_until_idle().await;

  feed.push("late entry".to_string());
  host.run_until_idle().await;

  println!("-- destroying owner --");
  host.do_loader_stop(false);
  host.do_loader_destroy();
  feed.observable.unregister_all();
  info!("Demo finished");
  Ok(())
}
