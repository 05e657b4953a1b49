pub mod event_client;
pub mod events;
pub mod persister;
pub mod processor;
