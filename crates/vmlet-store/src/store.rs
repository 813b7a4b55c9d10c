//! The file-per-object store.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vmlet_api::StoreObject;

use crate::error::{Result, StoreError};
use crate::lock::KeyLocks;

/// Suffix of in-flight writes; leftovers are swept at startup.
const SWAP_SUFFIX: &str = ".swp";

/// Events a subscriber's buffer can hold before the store starts dropping
/// events for it.
const WATCH_BUFFER_SIZE: usize = 10;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Created,
    Updated,
    Deleted,
}

/// One change notification.
#[derive(Debug, Clone)]
pub struct WatchEvent<T> {
    pub event_type: WatchEventType,
    pub object: T,
}

/// Subscriber handle. Dropping it unsubscribes.
pub struct Watch<T> {
    receiver: mpsc::Receiver<WatchEvent<T>>,
}

impl<T> Watch<T> {
    /// Next event, or `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<WatchEvent<T>> {
        self.receiver.recv().await
    }

    /// Non-blocking variant for synchronous callers.
    pub fn try_recv(&mut self) -> Option<WatchEvent<T>> {
        self.receiver.try_recv().ok()
    }

    /// Stops the subscription.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Construction options for a [`Store`].
pub struct StoreOptions<T> {
    pub dir: PathBuf,
    /// Hook run on a record immediately before it is first written.
    pub prepare_for_create: Option<Box<dyn Fn(&mut T) + Send + Sync>>,
}

impl<T> StoreOptions<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            prepare_for_create: None,
        }
    }
}

/// Durable map from ID to record, one JSON file per object.
///
/// Writes go to `<id>.swp` first and are renamed into place after an
/// fsync, so a crash can leave stale swap files but never a torn record.
/// Operations on one ID are serialised; different IDs run in parallel.
pub struct Store<T: StoreObject> {
    dir: PathBuf,
    locks: KeyLocks,
    prepare_for_create: Option<Box<dyn Fn(&mut T) + Send + Sync>>,
    watchers: Mutex<Vec<mpsc::Sender<WatchEvent<T>>>>,
}

impl<T: StoreObject> Store<T> {
    /// Opens (and creates if necessary) the store directory.
    pub fn new(options: StoreOptions<T>) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;
        Ok(Self {
            dir: options.dir,
            locks: KeyLocks::default(),
            prepare_for_create: options.prepare_for_create,
            watchers: Mutex::new(Vec::new()),
        })
    }

    /// Removes swap files left behind by writes interrupted by a crash.
    /// Call once at startup, before the first List.
    pub fn sweep_swap_files(&self) -> Result<usize> {
        let mut swept = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(SWAP_SUFFIX) || !entry.file_type()?.is_file() {
                continue;
            }
            fs::remove_file(entry.path())?;
            warn!(file = %name, "removed stale swap file");
            swept += 1;
        }
        Ok(swept)
    }

    /// Persists a new object. The record gets `created_at = now` and
    /// resource version 1.
    pub fn create(&self, mut object: T) -> Result<T> {
        let id = object.id().to_string();
        let _guard = self.locks.lock(&id)?;

        match self.read(&id) {
            Ok(_) => return Err(StoreError::AlreadyExists(id)),
            Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }

        if let Some(prepare) = &self.prepare_for_create {
            prepare(&mut object);
        }
        object.set_created_at(Utc::now());
        object.bump_resource_version();

        self.write(&object)?;
        debug!(id = %id, "object created");
        self.publish(WatchEvent {
            event_type: WatchEventType::Created,
            object: object.clone(),
        });
        Ok(object)
    }

    /// Reads one object.
    pub fn get(&self, id: &str) -> Result<T> {
        let _guard = self.locks.lock(id)?;
        self.read(id)
    }

    /// Compare-and-swap update.
    ///
    /// The update only applies if `object` carries the latest resource
    /// version. A soft-deleted record whose last finalizer was removed is
    /// hard-deleted here instead. An update that changes nothing is a
    /// no-op and does not bump the version.
    pub fn update(&self, mut object: T) -> Result<T> {
        let id = object.id().to_string();
        let _guard = self.locks.lock(&id)?;

        let current = self.read(&id)?;

        if object.deleted_at().is_some() && object.finalizers().is_empty() {
            self.remove_file(&id)?;
            debug!(id = %id, "object hard-deleted after final finalizer removal");
            return Ok(object);
        }

        if current.resource_version() != object.resource_version() {
            return Err(StoreError::ResourceVersionNotLatest(id));
        }

        if serde_json::to_vec(&current)? == serde_json::to_vec(&object)? {
            return Ok(object);
        }

        object.bump_resource_version();
        self.write(&object)?;
        self.publish(WatchEvent {
            event_type: WatchEventType::Updated,
            object: object.clone(),
        });
        Ok(object)
    }

    /// Deletes an object. With finalizers present this only stamps
    /// `deleted_at` (idempotently); the file disappears once the last
    /// finalizer is removed through [`Store::update`].
    pub fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id)?;

        let mut object = self.read(id)?;

        if object.finalizers().is_empty() {
            return self.remove_file(id);
        }

        if object.deleted_at().is_some() {
            return Ok(());
        }

        object.set_deleted_at(Utc::now());
        object.bump_resource_version();
        self.write(&object)?;
        debug!(id = %id, "object soft-deleted");
        self.publish(WatchEvent {
            event_type: WatchEventType::Deleted,
            object,
        });
        Ok(())
    }

    /// Reads every object in the store. Subdirectories and in-flight swap
    /// files are skipped.
    pub fn list(&self) -> Result<Vec<T>> {
        let mut objects = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(SWAP_SUFFIX) {
                continue;
            }
            objects.push(self.get(&name)?);
        }
        Ok(objects)
    }

    /// Subscribes to change events.
    ///
    /// Delivery is best-effort: each subscriber has a bounded buffer and
    /// events are dropped for a subscriber that does not keep up. Anyone
    /// needing a lossless view must reconcile via [`Store::list`].
    pub fn watch(&self) -> Result<Watch<T>> {
        let (sender, receiver) = mpsc::channel(WATCH_BUFFER_SIZE);
        self.watchers
            .lock()
            .map_err(|_| StoreError::LockPoisoned)?
            .push(sender);
        Ok(Watch { receiver })
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    fn read(&self, id: &str) -> Result<T> {
        let path = self.object_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(err) => return Err(err.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }

    /// Crash-safe write: encode into `<id>.swp`, fsync, rename over the
    /// real file.
    fn write(&self, object: &T) -> Result<()> {
        let path = self.object_path(object.id());
        let swap_path = swap_path(&path);

        let mut file = fs::File::create(&swap_path)?;
        if let Err(err) = self.encode_into(&mut file, object) {
            let _ = fs::remove_file(&swap_path);
            return Err(err);
        }
        if let Err(err) = fs::rename(&swap_path, &path) {
            let _ = fs::remove_file(&swap_path);
            return Err(err.into());
        }
        Ok(())
    }

    fn encode_into(&self, file: &mut fs::File, object: &T) -> Result<()> {
        let data = serde_json::to_vec(object)?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(())
    }

    fn remove_file(&self, id: &str) -> Result<()> {
        fs::remove_file(self.object_path(id))?;
        Ok(())
    }

    /// Fan-out to all live subscribers. Never blocks: a full subscriber
    /// buffer drops the event for that subscriber only.
    fn publish(&self, event: WatchEvent<T>) {
        let Ok(mut watchers) = self.watchers.lock() else {
            return;
        };
        watchers.retain(|w| !w.is_closed());
        for watcher in watchers.iter() {
            if watcher.try_send(event.clone()).is_err() {
                debug!("watch subscriber buffer full, event dropped");
            }
        }
    }
}

fn swap_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(SWAP_SUFFIX);
    PathBuf::from(name)
}
