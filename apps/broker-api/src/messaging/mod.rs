//! Publish/subscribe: subscriptions, their per-destination manager, the
//! messaging service, and the subtopic, selector and throttle machinery
//! they are built on.

pub mod manager;
pub mod selector;
pub mod service;
pub mod subscription;
pub mod subtopic;
pub mod throttle;
