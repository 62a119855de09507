//! Message rate limiting: policies, sliding frequency windows, and the
//! destination-level and per-client-queue throttle managers.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// What happens to a message that exceeds a configured frequency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThrottlePolicy {
    #[default]
    None,
    /// Reject the message with an error (inbound only).
    Error,
    /// Drop the message silently.
    Ignore,
    /// Hold the message and release it when the rate allows (outbound only).
    Buffer,
    /// Replace the newest pending message of the same subscriber (outbound only).
    Conflate,
}

/// Per-destination throttle configuration. Frequencies are messages per second, 0 disables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ThrottleSettings {
    pub inbound_policy: ThrottlePolicy,
    pub outbound_policy: ThrottlePolicy,
    pub max_incoming_destination_frequency: u32,
    pub max_incoming_client_frequency: u32,
    pub max_outgoing_destination_frequency: u32,
    pub max_outgoing_client_frequency: u32,
}

impl ThrottleSettings {
    pub fn is_inbound_destination_throttle_enabled(&self) -> bool {
        self.inbound_policy != ThrottlePolicy::None && self.max_incoming_destination_frequency > 0
    }

    pub fn is_inbound_client_throttle_enabled(&self) -> bool {
        self.inbound_policy != ThrottlePolicy::None && self.max_incoming_client_frequency > 0
    }

    pub fn is_outbound_destination_throttle_enabled(&self) -> bool {
        self.outbound_policy != ThrottlePolicy::None && self.max_outgoing_destination_frequency > 0
    }

    pub fn is_outbound_client_throttle_enabled(&self) -> bool {
        self.outbound_policy != ThrottlePolicy::None && self.max_outgoing_client_frequency > 0
    }

    /// Reject policy/frequency combinations that make no sense for a destination.
    pub fn validate(&self, destination_id: &str) -> Result<(), BrokerError> {
        if matches!(
            self.inbound_policy,
            ThrottlePolicy::Buffer | ThrottlePolicy::Conflate
        ) {
            return Err(BrokerError::configuration(format!(
                "destination '{destination_id}': inbound throttle policy must be none, error or ignore"
            )));
        }
        if self.outbound_policy == ThrottlePolicy::Error {
            return Err(BrokerError::configuration(format!(
                "destination '{destination_id}': outbound throttle policy cannot be error"
            )));
        }
        if self.max_incoming_destination_frequency > 0
            && self.max_incoming_client_frequency > self.max_incoming_destination_frequency
        {
            return Err(BrokerError::configuration(format!(
                "destination '{destination_id}': max incoming client frequency exceeds the destination frequency"
            )));
        }
        if self.max_outgoing_destination_frequency > 0
            && self.max_outgoing_client_frequency > self.max_outgoing_destination_frequency
        {
            return Err(BrokerError::configuration(format!(
                "destination '{destination_id}': max outgoing client frequency exceeds the destination frequency"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Frequency window
// ---------------------------------------------------------------------------

/// Sliding record of the last N message timestamps, N being the max frequency.
#[derive(Debug)]
pub struct MessageFrequency {
    stamps: VecDeque<i64>,
    capacity: usize,
}

impl MessageFrequency {
    pub fn new(max_frequency: u32) -> Self {
        Self {
            stamps: VecDeque::new(),
            capacity: max_frequency.max(1) as usize,
        }
    }

    /// Whether one more message at `now_ms` would exceed `max_frequency` per second.
    pub fn is_over_limit(&self, now_ms: i64, max_frequency: u32) -> bool {
        if max_frequency == 0 || self.stamps.len() < self.capacity {
            return false;
        }
        let Some(oldest) = self.stamps.front() else {
            return false;
        };
        let window_ms = now_ms - oldest;
        let rate = if window_ms <= 0 {
            f64::from(max_frequency) + 1.0
        } else {
            self.stamps.len() as f64 * 1000.0 / window_ms as f64
        };
        rate > f64::from(max_frequency)
    }

    pub fn record(&mut self, now_ms: i64) {
        if self.stamps.len() == self.capacity {
            self.stamps.pop_front();
        }
        self.stamps.push_back(now_ms);
    }

    /// Check and record in one step. Returns `true` when the message may pass.
    pub fn admit(&mut self, now_ms: i64, max_frequency: u32) -> bool {
        if self.is_over_limit(now_ms, max_frequency) {
            return false;
        }
        self.record(now_ms);
        true
    }

    /// Resize the window when the effective limit changes.
    pub fn set_max_frequency(&mut self, max_frequency: u32) {
        self.capacity = max_frequency.max(1) as usize;
        while self.stamps.len() > self.capacity {
            self.stamps.pop_front();
        }
    }
}

/// Outcome of a throttle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleResult {
    Ok,
    /// Drop, or for inbound `error` policy, fail the request.
    Rejected(ThrottlePolicy),
    Buffer,
    Conflate,
}

// ---------------------------------------------------------------------------
// Destination-level manager
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DestinationMarks {
    incoming: Option<MessageFrequency>,
    outgoing: Option<MessageFrequency>,
    incoming_clients: HashMap<String, MessageFrequency>,
}

/// Tracks inbound (destination and per-client) and outbound destination rates.
pub struct ThrottleManager {
    destination_id: String,
    settings: ThrottleSettings,
    marks: Mutex<DestinationMarks>,
}

impl ThrottleManager {
    pub fn new(destination_id: impl Into<String>, settings: ThrottleSettings) -> Self {
        Self {
            destination_id: destination_id.into(),
            settings,
            marks: Mutex::new(DestinationMarks::default()),
        }
    }

    pub fn settings(&self) -> &ThrottleSettings {
        &self.settings
    }

    /// Apply inbound throttling to a message published by `client_id`.
    ///
    /// Returns `Ok(true)` when the message may proceed, `Ok(false)` when it is
    /// dropped under the `ignore` policy, and an error under the `error` policy.
    pub fn throttle_incoming(&self, client_id: Option<&str>, now_ms: i64) -> Result<bool, BrokerError> {
        let s = &self.settings;
        if s.inbound_policy == ThrottlePolicy::None {
            return Ok(true);
        }

        let mut marks = self.marks.lock();
        if s.is_inbound_destination_throttle_enabled() {
            let freq = marks
                .incoming
                .get_or_insert_with(|| MessageFrequency::new(s.max_incoming_destination_frequency));
            if !freq.admit(now_ms, s.max_incoming_destination_frequency) {
                drop(marks);
                return self.reject_incoming(format!(
                    "destination '{}' exceeded its max incoming frequency of {}",
                    self.destination_id, s.max_incoming_destination_frequency
                ));
            }
        }
        if let (true, Some(client_id)) = (s.is_inbound_client_throttle_enabled(), client_id) {
            let freq = marks
                .incoming_clients
                .entry(client_id.to_string())
                .or_insert_with(|| MessageFrequency::new(s.max_incoming_client_frequency));
            if !freq.admit(now_ms, s.max_incoming_client_frequency) {
                drop(marks);
                return self.reject_incoming(format!(
                    "client '{client_id}' exceeded the max incoming client frequency of {} for destination '{}'",
                    s.max_incoming_client_frequency, self.destination_id
                ));
            }
        }
        Ok(true)
    }

    fn reject_incoming(&self, reason: String) -> Result<bool, BrokerError> {
        match self.settings.inbound_policy {
            ThrottlePolicy::Error => Err(BrokerError::Throttled(reason)),
            _ => {
                tracing::info!(destination = %self.destination_id, %reason, "inbound message ignored");
                Ok(false)
            }
        }
    }

    /// Apply the outbound destination frequency to a message about to fan out.
    pub fn throttle_outgoing(&self, now_ms: i64) -> ThrottleResult {
        let s = &self.settings;
        if !s.is_outbound_destination_throttle_enabled() {
            return ThrottleResult::Ok;
        }
        let mut marks = self.marks.lock();
        let freq = marks
            .outgoing
            .get_or_insert_with(|| MessageFrequency::new(s.max_outgoing_destination_frequency));
        if freq.admit(now_ms, s.max_outgoing_destination_frequency) {
            ThrottleResult::Ok
        } else {
            tracing::info!(destination = %self.destination_id, "outbound message dropped by destination frequency");
            ThrottleResult::Rejected(s.outbound_policy)
        }
    }

    /// Forget the inbound mark of a client whose subscription went away.
    pub fn remove_client(&self, client_id: &str) {
        self.marks.lock().incoming_clients.remove(client_id);
    }
}

// ---------------------------------------------------------------------------
// Per-queue manager
// ---------------------------------------------------------------------------

struct SubscriberLimit {
    policy: ThrottlePolicy,
    max_frequency: u32,
    frequency: MessageFrequency,
    /// Effective frequency of each registered tuple, keyed by its criteria.
    tuples: HashMap<String, u32>,
}

impl SubscriberLimit {
    /// Tighten or relax the window to the smallest remaining tuple limit.
    fn recompute(&mut self) {
        if let Some(min) = self.tuples.values().copied().min() {
            if min != self.max_frequency {
                self.max_frequency = min;
                self.frequency.set_max_frequency(min);
            }
        }
    }
}

/// Outbound throttling for one client's endpoint queue, keyed by subscriber id.
#[derive(Default)]
pub struct OutboundQueueThrottle {
    limits: HashMap<String, SubscriberLimit>,
}

impl OutboundQueueThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one subscription tuple of a subscriber. The tuple's limit is
    /// the smaller non-zero value of the destination client frequency and
    /// `max_frequency`; the subscriber is held to the smallest tuple limit.
    /// Returns `false` when the tuple carries no limit and nothing was recorded.
    pub fn register(
        &mut self,
        subscriber_id: &str,
        tuple: &str,
        settings: &ThrottleSettings,
        max_frequency: u32,
    ) -> bool {
        let effective = effective_client_frequency(settings.max_outgoing_client_frequency, max_frequency);
        if effective == 0 {
            return false;
        }
        let entry = self
            .limits
            .entry(subscriber_id.to_string())
            .or_insert_with(|| SubscriberLimit {
                policy: settings.outbound_policy,
                max_frequency: effective,
                frequency: MessageFrequency::new(effective),
                tuples: HashMap::new(),
            });
        entry.tuples.insert(tuple.to_string(), effective);
        entry.recompute();
        true
    }

    /// Drop one tuple's registration. Tuples that never registered are
    /// ignored; the limit goes away with the last registered tuple.
    pub fn unregister(&mut self, subscriber_id: &str, tuple: &str) {
        let Some(entry) = self.limits.get_mut(subscriber_id) else {
            return;
        };
        if entry.tuples.remove(tuple).is_none() {
            return;
        }
        if entry.tuples.is_empty() {
            self.limits.remove(subscriber_id);
        } else {
            entry.recompute();
        }
    }

    /// Remove every mark of a subscriber at once.
    pub fn remove(&mut self, subscriber_id: &str) {
        self.limits.remove(subscriber_id);
    }

    pub fn is_registered(&self, subscriber_id: &str) -> bool {
        self.limits.contains_key(subscriber_id)
    }

    /// Current effective frequency of a subscriber, if it is throttled.
    pub fn max_frequency(&self, subscriber_id: &str) -> Option<u32> {
        self.limits.get(subscriber_id).map(|e| e.max_frequency)
    }

    pub fn throttle(&mut self, subscriber_id: &str, now_ms: i64) -> ThrottleResult {
        let Some(entry) = self.limits.get_mut(subscriber_id) else {
            return ThrottleResult::Ok;
        };
        if entry.frequency.admit(now_ms, entry.max_frequency) {
            return ThrottleResult::Ok;
        }
        match entry.policy {
            ThrottlePolicy::Buffer => ThrottleResult::Buffer,
            ThrottlePolicy::Conflate => ThrottleResult::Conflate,
            policy => ThrottleResult::Rejected(policy),
        }
    }

    /// Cap applied to deferred messages of one subscriber.
    pub fn buffer_capacity(&self, subscriber_id: &str) -> usize {
        self.limits
            .get(subscriber_id)
            .map(|e| e.max_frequency as usize)
            .unwrap_or(0)
    }
}

/// Ceiling on a client-requested `maxFrequency` when the destination sets no
/// client frequency of its own.
pub const MAX_REQUESTED_FREQUENCY: u32 = 1_000;

fn effective_client_frequency(destination_client: u32, requested: u32) -> u32 {
    match (destination_client, requested) {
        (0, r) => r.min(MAX_REQUESTED_FREQUENCY),
        (d, 0) => d,
        (d, r) => d.min(r),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound(policy: ThrottlePolicy, client: u32) -> ThrottleSettings {
        ThrottleSettings {
            outbound_policy: policy,
            max_outgoing_client_frequency: client,
            ..Default::default()
        }
    }

    #[test]
    fn frequency_admits_up_to_capacity_then_blocks_burst() {
        let mut freq = MessageFrequency::new(5);
        let admitted = (0..10).filter(|_| freq.admit(1_000, 5)).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn frequency_recovers_after_window() {
        let mut freq = MessageFrequency::new(2);
        assert!(freq.admit(0, 2));
        assert!(freq.admit(10, 2));
        assert!(!freq.admit(20, 2));
        // Two messages over five seconds is well under 2/s.
        assert!(freq.admit(5_000, 2));
    }

    #[test]
    fn validate_rejects_outbound_error_and_client_over_destination() {
        let s = ThrottleSettings {
            outbound_policy: ThrottlePolicy::Error,
            ..Default::default()
        };
        assert!(s.validate("d").is_err());

        let s = ThrottleSettings {
            inbound_policy: ThrottlePolicy::Ignore,
            max_incoming_destination_frequency: 5,
            max_incoming_client_frequency: 10,
            ..Default::default()
        };
        assert!(s.validate("d").is_err());

        let s = ThrottleSettings {
            inbound_policy: ThrottlePolicy::Conflate,
            ..Default::default()
        };
        assert!(s.validate("d").is_err());
    }

    #[test]
    fn inbound_error_policy_fails_request() {
        let mgr = ThrottleManager::new(
            "d",
            ThrottleSettings {
                inbound_policy: ThrottlePolicy::Error,
                max_incoming_destination_frequency: 1,
                ..Default::default()
            },
        );
        assert!(mgr.throttle_incoming(Some("c"), 0).unwrap());
        let err = mgr.throttle_incoming(Some("c"), 0).unwrap_err();
        assert_eq!(err.code(), crate::error::THROTTLED);
    }

    #[test]
    fn inbound_ignore_policy_drops_per_client() {
        let mgr = ThrottleManager::new(
            "d",
            ThrottleSettings {
                inbound_policy: ThrottlePolicy::Ignore,
                max_incoming_client_frequency: 1,
                ..Default::default()
            },
        );
        assert!(mgr.throttle_incoming(Some("a"), 0).unwrap());
        assert!(!mgr.throttle_incoming(Some("a"), 0).unwrap());
        // Another client has its own window.
        assert!(mgr.throttle_incoming(Some("b"), 0).unwrap());
    }

    #[test]
    fn queue_throttle_uses_smaller_limit() {
        let mut t = OutboundQueueThrottle::new();
        t.register("sub", "a", &outbound(ThrottlePolicy::Ignore, 10), 3);
        let passed = (0..10)
            .filter(|_| t.throttle("sub", 0) == ThrottleResult::Ok)
            .count();
        assert_eq!(passed, 3);
    }

    #[test]
    fn queue_throttle_reports_policy_and_unregisters() {
        let mut t = OutboundQueueThrottle::new();
        t.register("sub", "a", &outbound(ThrottlePolicy::Conflate, 1), 0);
        t.register("sub", "b", &outbound(ThrottlePolicy::Conflate, 1), 0);
        assert_eq!(t.throttle("sub", 0), ThrottleResult::Ok);
        assert_eq!(t.throttle("sub", 0), ThrottleResult::Conflate);

        t.unregister("sub", "a");
        assert!(t.is_registered("sub"));
        t.unregister("sub", "b");
        assert!(!t.is_registered("sub"));
        assert_eq!(t.throttle("sub", 0), ThrottleResult::Ok);
    }

    #[test]
    fn unthrottled_subscriber_is_not_registered() {
        let mut t = OutboundQueueThrottle::new();
        assert!(!t.register("sub", "a", &outbound(ThrottlePolicy::Ignore, 0), 0));
        assert!(!t.is_registered("sub"));
    }

    #[test]
    fn removing_unthrottled_tuple_keeps_remaining_limit() {
        let mut t = OutboundQueueThrottle::new();
        let settings = outbound(ThrottlePolicy::Ignore, 0);
        assert!(t.register("sub", "a", &settings, 3));
        assert!(!t.register("sub", "b", &settings, 0));

        t.unregister("sub", "b");
        let passed = (0..10)
            .filter(|_| t.throttle("sub", 0) == ThrottleResult::Ok)
            .count();
        assert_eq!(passed, 3);
    }

    #[test]
    fn limit_relaxes_when_tightest_tuple_leaves() {
        let mut t = OutboundQueueThrottle::new();
        let settings = outbound(ThrottlePolicy::Ignore, 0);
        t.register("sub", "a", &settings, 10);
        t.register("sub", "b", &settings, 2);
        assert_eq!(t.max_frequency("sub"), Some(2));

        t.unregister("sub", "b");
        assert_eq!(t.max_frequency("sub"), Some(10));
        let passed = (0..20)
            .filter(|_| t.throttle("sub", 0) == ThrottleResult::Ok)
            .count();
        assert_eq!(passed, 10);
    }

    #[test]
    fn requested_frequency_is_clamped() {
        let mut t = OutboundQueueThrottle::new();
        t.register("sub", "a", &outbound(ThrottlePolicy::Ignore, 0), u32::MAX);
        assert_eq!(t.max_frequency("sub"), Some(MAX_REQUESTED_FREQUENCY));

        // A destination client frequency still wins over the request.
        t.register("other", "a", &outbound(ThrottlePolicy::Ignore, 20), u32::MAX);
        assert_eq!(t.max_frequency("other"), Some(20));
    }

    #[test]
    fn huge_window_does_not_preallocate() {
        let mut freq = MessageFrequency::new(u32::MAX);
        assert!(freq.admit(0, u32::MAX));
        assert!(freq.stamps.capacity() < 1_024);
    }
}
