pub mod aws;
pub mod credentials;
pub mod manifest_store;
pub mod notifier;
pub mod object_store;
