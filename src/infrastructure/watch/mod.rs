mod watcher;

pub use watcher::{WatchError, Watcher, WatcherSettings};
