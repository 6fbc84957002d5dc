pub mod controller;
mod k8s_events;

pub use k8s_events::publish_event;
