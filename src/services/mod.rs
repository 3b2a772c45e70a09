pub mod asset_resolver;
pub(crate) mod coordinator;
pub mod executor;
pub mod notifier;
pub mod object_store;
pub(crate) mod registry;
pub mod state_sink;
pub mod upload_queue;
