pub mod service_watcher;
