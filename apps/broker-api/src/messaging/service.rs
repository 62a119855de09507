//! Publish/subscribe service: inbound publishing with destination throttling,
//! fan-out to matching subscriptions, and the subscription commands.

use std::sync::Arc;

use serde_json::Value;

use crate::broker::context::RequestContext;
use crate::broker::destination::Destination;
use crate::broker::service::{Reply, Service, ServiceCore};
use crate::broker::MessageBroker;
use crate::client::ClientIdentity;
use crate::error::BrokerError;
use crate::message::{headers, CommandOperation, Message};
use crate::messaging::throttle::ThrottleResult;

/// Splits the `subtopic`, `selector` and `maxFrequency` parts of a
/// multi-subscribe entry.
pub const SUBSCRIPTION_SEPARATOR: &str = "_;_";

pub struct MessageService {
    core: ServiceCore,
}

impl MessageService {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            core: ServiceCore::new(id),
        }
    }

    fn destination_for(&self, message: &Message) -> Result<Arc<Destination>, BrokerError> {
        let id = message
            .destination
            .as_deref()
            .ok_or_else(|| BrokerError::routing("message has no destination"))?;
        self.destination(id).ok_or_else(|| {
            BrokerError::routing(format!("service '{}' has no destination '{id}'", self.id()))
        })
    }

    /// Deliver `message` to every matching subscription of `destination`.
    /// Returns the number of subscriptions it was queued for.
    pub fn push_to_subscribers(
        &self,
        broker: &MessageBroker,
        destination: &Destination,
        message: &Message,
        evaluate_selector: bool,
    ) -> usize {
        let mut delivered = 0;
        for subscription in destination
            .subscriptions()
            .matching_subscriptions(message, evaluate_selector)
        {
            let mut outbound = message.clone();
            outbound.client_id = Some(subscription.client_id().to_string());
            match broker.route_message_to_message_client(outbound, &subscription) {
                Ok(_) => {
                    subscription.touch();
                    delivered += 1;
                }
                Err(err) => tracing::debug!(
                    subscription = %subscription.key(),
                    error = %err,
                    "push to subscriber failed"
                ),
            }
        }
        delivered
    }

    /// The identity a command acts for: the request's, or the one named by
    /// the command's client id.
    fn requesting_client(
        broker: &MessageBroker,
        ctx: &mut RequestContext,
        command: &Message,
    ) -> Result<Arc<ClientIdentity>, BrokerError> {
        if let Some(client) = &ctx.client {
            return Ok(Arc::clone(client));
        }
        let client = broker.clients().get_or_create(command.client_id.as_deref())?;
        if let Some(session) = &ctx.session {
            client.register_session(session)?;
        }
        ctx.client = Some(Arc::clone(&client));
        Ok(client)
    }

    fn subscribe(
        &self,
        broker: &MessageBroker,
        ctx: &mut RequestContext,
        destination: &Destination,
        command: &Message,
    ) -> Result<Reply, BrokerError> {
        let client = Self::requesting_client(broker, ctx, command)?;
        let endpoint_id = command
            .endpoint_id()
            .map(str::to_string)
            .or_else(|| ctx.endpoint_id().map(str::to_string));
        destination.subscriptions().add_subscriber(
            ctx,
            client.id(),
            command.header_str(headers::SELECTOR),
            command.subtopic(),
            endpoint_id.as_deref(),
            max_frequency(command),
        )?;
        Ok(Reply::Empty)
    }

    fn unsubscribe(&self, ctx: &RequestContext, destination: &Destination, command: &Message) -> Reply {
        if let Some(client_id) = acting_client_id(ctx, command) {
            destination.subscriptions().remove_subscriber(
                &client_id,
                command.header_str(headers::SELECTOR),
                command.subtopic(),
            );
        }
        Reply::Empty
    }

    fn multi_subscribe(
        &self,
        broker: &MessageBroker,
        ctx: &mut RequestContext,
        destination: &Destination,
        command: &Message,
    ) -> Result<Reply, BrokerError> {
        let client = Self::requesting_client(broker, ctx, command)?;
        let endpoint_id = command
            .endpoint_id()
            .map(str::to_string)
            .or_else(|| ctx.endpoint_id().map(str::to_string));
        let default_frequency = max_frequency(command);
        let manager = destination.subscriptions();

        for entry in string_entries(command.header(headers::ADD_SUBSCRIPTIONS)) {
            let Some(parsed) = MultiSubscribeEntry::parse(entry) else {
                continue;
            };
            let frequency = match (default_frequency, parsed.max_frequency) {
                (f, None) => f,
                (0, Some(f)) => f,
                (a, Some(b)) => a.min(b),
            };
            manager.add_subscriber(
                ctx,
                client.id(),
                parsed.selector,
                parsed.subtopic,
                endpoint_id.as_deref(),
                frequency,
            )?;
        }
        for entry in string_entries(command.header(headers::REMOVE_SUBSCRIPTIONS)) {
            if let Some(parsed) = MultiSubscribeEntry::parse(entry) {
                manager.remove_subscriber(client.id(), parsed.selector, parsed.subtopic);
            }
        }
        Ok(Reply::Empty)
    }

    /// Messages queued for the requesting client on this destination, without waiting.
    fn poll(&self, ctx: &RequestContext, destination: &Destination, command: &Message) -> Result<Reply, BrokerError> {
        let client_id = acting_client_id(ctx, command).unwrap_or_default();
        let subscription = destination.subscriptions().subscription(&client_id).ok_or_else(|| {
            BrokerError::service(self.id(), format!("not subscribed to destination '{}'", destination.id()))
        })?;
        let client = ctx
            .client
            .clone()
            .filter(|c| c.id() == client_id)
            .ok_or(BrokerError::Invalidated("client"))?;
        let endpoint_id = subscription
            .endpoint_id()
            .ok_or_else(|| BrokerError::routing("subscription has no endpoint"))?;
        let messages = client.poll_destination(&endpoint_id, destination.id())?;
        if messages.is_empty() {
            return Ok(Reply::Empty);
        }
        let mut sync = Message::command(CommandOperation::ClientSync);
        sync.body = serde_json::to_value(messages)?;
        Ok(Reply::Message(sync))
    }
}

impl Service for MessageService {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    fn service_message(
        &self,
        broker: &MessageBroker,
        ctx: &mut RequestContext,
        message: &Message,
    ) -> Result<Reply, BrokerError> {
        let destination = self.destination_for(message)?;
        let now = chrono::Utc::now().timestamp_millis();
        let publisher = message
            .client_id
            .clone()
            .or_else(|| ctx.client.as_ref().map(|c| c.id().to_string()));

        if !destination
            .throttle()
            .throttle_incoming(publisher.as_deref(), now)?
        {
            return Ok(Reply::Empty);
        }
        if let ThrottleResult::Rejected(_) = destination.throttle().throttle_outgoing(now) {
            return Ok(Reply::Empty);
        }

        let delivered = self.push_to_subscribers(broker, &destination, message, true);
        tracing::debug!(
            destination = %destination.id(),
            message_id = ?message.message_id,
            delivered,
            "message published"
        );
        Ok(Reply::Empty)
    }

    fn service_command(
        &self,
        broker: &MessageBroker,
        ctx: &mut RequestContext,
        command: &Message,
    ) -> Result<Reply, BrokerError> {
        let destination = self.destination_for(command)?;
        match command.operation() {
            CommandOperation::Subscribe => {
                broker.inspect_channel(command, &destination)?;
                self.subscribe(broker, ctx, &destination, command)
            }
            CommandOperation::Unsubscribe => Ok(self.unsubscribe(ctx, &destination, command)),
            CommandOperation::MultiSubscribe => {
                broker.inspect_channel(command, &destination)?;
                self.multi_subscribe(broker, ctx, &destination, command)
            }
            CommandOperation::Poll => self.poll(ctx, &destination, command),
            CommandOperation::ClientPing => Ok(Reply::Empty),
            other => Err(BrokerError::Unsupported(format!(
                "service '{}' does not handle command operation {}",
                self.id(),
                other.code()
            ))),
        }
    }
}

/// The bound identity wins over the id carried by the command; commands
/// issued by the broker itself have no bound identity.
fn acting_client_id(ctx: &RequestContext, command: &Message) -> Option<String> {
    ctx.client
        .as_ref()
        .map(|c| c.id().to_string())
        .or_else(|| command.client_id.clone())
}

fn max_frequency(command: &Message) -> u32 {
    match command.header(headers::MAX_FREQUENCY) {
        Some(Value::Number(n)) => n.as_u64().map_or(0, |v| v.min(u32::MAX as u64) as u32),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn string_entries(value: Option<&Value>) -> impl Iterator<Item = &str> {
    value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

/// One `subtopic _;_ selector [_;_ maxFrequency]` entry. Empty parts mean none.
#[derive(Debug, PartialEq, Eq)]
struct MultiSubscribeEntry<'a> {
    subtopic: Option<&'a str>,
    selector: Option<&'a str>,
    max_frequency: Option<u32>,
}

impl<'a> MultiSubscribeEntry<'a> {
    fn parse(entry: &'a str) -> Option<Self> {
        let (subtopic, rest) = entry.split_once(SUBSCRIPTION_SEPARATOR)?;
        let (selector, frequency) = match rest.split_once(SUBSCRIPTION_SEPARATOR) {
            Some((selector, frequency)) => (selector, Some(frequency)),
            None => (rest, None),
        };
        Some(Self {
            subtopic: Some(subtopic).filter(|s| !s.is_empty()),
            selector: Some(selector).filter(|s| !s.is_empty()),
            max_frequency: frequency.and_then(|f| f.trim().parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::throttle::ThrottlePolicy;
    use crate::session::provider::POLLING;
    use crate::settings::DestinationSettings;
    use serde_json::json;

    fn setup() -> (Arc<MessageBroker>, RequestContext) {
        setup_with(vec![DestinationSettings::new("chat")])
    }

    fn setup_with(destinations: Vec<DestinationSettings>) -> (Arc<MessageBroker>, RequestContext) {
        let broker = MessageBroker::new();
        broker
            .add_service(Arc::new(MessageService::new("messaging-service")))
            .unwrap();
        for settings in destinations {
            broker.create_destination("messaging-service", settings).unwrap();
        }
        broker.start().unwrap();
        let session = broker.sessions().create_session(POLLING).unwrap();
        let client = broker.clients().get_or_create(None).unwrap();
        client.register_session(&session).unwrap();
        (broker, RequestContext::new(Some(session), Some(client), None))
    }

    fn subscribe(subtopic: Option<&str>) -> Message {
        let mut cmd = Message::command(CommandOperation::Subscribe)
            .with_destination("chat")
            .with_header(headers::ENDPOINT, "poll");
        if let Some(subtopic) = subtopic {
            cmd.set_header(headers::SUBTOPIC, subtopic);
        }
        cmd
    }

    /// `chat` with an outbound ignore policy and no destination client frequency.
    fn throttled_chat() -> DestinationSettings {
        let mut settings = DestinationSettings::new("chat");
        settings.throttle.outbound_policy = ThrottlePolicy::Ignore;
        settings
    }

    fn publish_burst(broker: &MessageBroker, subtopic: &str, count: usize) {
        for n in 0..count {
            let msg = Message::data("chat", json!(n)).with_header(headers::SUBTOPIC, subtopic);
            broker
                .route_message_to_service(&mut RequestContext::default(), msg)
                .unwrap();
        }
    }

    #[test]
    fn multi_subscribe_entries_parse() {
        assert_eq!(
            MultiSubscribeEntry::parse("sports.*_;_price > 1_;_5"),
            Some(MultiSubscribeEntry {
                subtopic: Some("sports.*"),
                selector: Some("price > 1"),
                max_frequency: Some(5),
            })
        );
        assert_eq!(
            MultiSubscribeEntry::parse("_;_"),
            Some(MultiSubscribeEntry {
                subtopic: None,
                selector: None,
                max_frequency: None,
            })
        );
        assert!(MultiSubscribeEntry::parse("no separator").is_none());
    }

    #[test]
    fn publish_reaches_matching_subscribers_only() {
        let (broker, mut ctx) = setup();
        broker
            .route_command_to_service(&mut ctx, subscribe(Some("sports.*")))
            .unwrap();
        let client = ctx.client.clone().unwrap();

        let hit = Message::data("chat", json!("goal")).with_header(headers::SUBTOPIC, "sports.football");
        let miss = Message::data("chat", json!("dow")).with_header(headers::SUBTOPIC, "finance.stocks");
        broker.route_message_to_service(&mut ctx.clone(), hit).unwrap();
        broker.route_message_to_service(&mut ctx.clone(), miss).unwrap();

        let queued = client.poll("poll").unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].body, json!("goal"));
        assert_eq!(queued[0].client_id.as_deref(), Some(client.id()));
    }

    #[test]
    fn unsubscribe_last_tuple_removes_subscription() {
        let (broker, mut ctx) = setup();
        broker.route_command_to_service(&mut ctx, subscribe(None)).unwrap();
        let dest = broker.destination("chat").unwrap();
        assert_eq!(dest.subscriptions().len(), 1);

        let unsub = Message::command(CommandOperation::Unsubscribe).with_destination("chat");
        broker.route_command_to_service(&mut ctx, unsub).unwrap();
        assert!(dest.subscriptions().is_empty());
    }

    #[test]
    fn multi_subscribe_adds_and_removes() {
        let (broker, mut ctx) = setup();
        let cmd = Message::command(CommandOperation::MultiSubscribe)
            .with_destination("chat")
            .with_header(headers::ENDPOINT, "poll")
            .with_header(headers::ADD_SUBSCRIPTIONS, json!(["a_;_", "b_;_x = 1"]));
        broker.route_command_to_service(&mut ctx, cmd).unwrap();
        let client_id = ctx.client.as_ref().unwrap().id().to_string();
        let sub = broker
            .destination("chat")
            .unwrap()
            .subscriptions()
            .subscription(&client_id)
            .unwrap();
        assert_eq!(sub.subscription_count(), 2);

        let cmd = Message::command(CommandOperation::MultiSubscribe)
            .with_destination("chat")
            .with_header(headers::REMOVE_SUBSCRIPTIONS, json!(["a_;_"]));
        broker.route_command_to_service(&mut ctx, cmd).unwrap();
        assert_eq!(sub.subscription_count(), 1);
    }

    #[test]
    fn poll_returns_client_sync() {
        let (broker, mut ctx) = setup();
        broker.route_command_to_service(&mut ctx, subscribe(None)).unwrap();
        broker
            .route_message_to_service(&mut ctx.clone(), Message::data("chat", json!(1)))
            .unwrap();

        let poll = Message::command(CommandOperation::Poll).with_destination("chat");
        let reply = broker.route_command_to_service(&mut ctx, poll).unwrap();
        assert_eq!(reply.operation(), CommandOperation::ClientSync);
        assert_eq!(reply.body.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn poll_only_drains_the_polled_destination() {
        let (broker, mut ctx) = setup_with(vec![
            DestinationSettings::new("chat"),
            DestinationSettings::new("news"),
        ]);
        for destination in ["chat", "news"] {
            let cmd = Message::command(CommandOperation::Subscribe)
                .with_destination(destination)
                .with_header(headers::ENDPOINT, "poll");
            broker.route_command_to_service(&mut ctx, cmd).unwrap();
        }
        broker
            .route_message_to_service(&mut ctx.clone(), Message::data("chat", json!("c")))
            .unwrap();
        broker
            .route_message_to_service(&mut ctx.clone(), Message::data("news", json!("n")))
            .unwrap();

        let poll = Message::command(CommandOperation::Poll).with_destination("chat");
        let reply = broker.route_command_to_service(&mut ctx, poll).unwrap();
        assert_eq!(reply.body.as_array().map(Vec::len), Some(1));
        assert_eq!(reply.body[0]["destination"], "chat");

        let rest = ctx.client.as_ref().unwrap().poll("poll").unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].destination.as_deref(), Some("news"));
    }

    #[test]
    fn subscriber_max_frequency_limits_delivery() {
        let (broker, mut ctx) = setup_with(vec![throttled_chat()]);
        let cmd = subscribe(Some("a")).with_header(headers::MAX_FREQUENCY, 3);
        broker.route_command_to_service(&mut ctx, cmd).unwrap();

        publish_burst(&broker, "a", 10);
        assert_eq!(ctx.client.as_ref().unwrap().poll("poll").unwrap().len(), 3);
    }

    #[test]
    fn unsubscribing_unthrottled_tuple_keeps_remaining_limit() {
        let (broker, mut ctx) = setup_with(vec![throttled_chat()]);
        let limited = subscribe(Some("a")).with_header(headers::MAX_FREQUENCY, 3);
        broker.route_command_to_service(&mut ctx, limited).unwrap();
        broker.route_command_to_service(&mut ctx, subscribe(Some("b"))).unwrap();

        let unsub = Message::command(CommandOperation::Unsubscribe)
            .with_destination("chat")
            .with_header(headers::SUBTOPIC, "b");
        broker.route_command_to_service(&mut ctx, unsub).unwrap();

        publish_burst(&broker, "a", 10);
        assert_eq!(ctx.client.as_ref().unwrap().poll("poll").unwrap().len(), 3);
    }

    #[test]
    fn oversized_max_frequency_is_clamped() {
        let (broker, mut ctx) = setup_with(vec![throttled_chat()]);
        let cmd = subscribe(Some("a")).with_header(headers::MAX_FREQUENCY, u64::from(u32::MAX));
        let reply = broker.route_command_to_service(&mut ctx, cmd).unwrap();
        assert!(reply.is_acknowledge());

        publish_burst(&broker, "a", 5);
        assert_eq!(ctx.client.as_ref().unwrap().poll("poll").unwrap().len(), 5);
    }

    #[test]
    fn inbound_error_policy_rejects_burst() {
        let broker = MessageBroker::new();
        broker
            .add_service(Arc::new(MessageService::new("messaging-service")))
            .unwrap();
        let mut settings = DestinationSettings::new("chat");
        settings.throttle.inbound_policy = ThrottlePolicy::Error;
        settings.throttle.max_incoming_destination_frequency = 2;
        broker.create_destination("messaging-service", settings).unwrap();
        broker.start().unwrap();

        let results: Vec<_> = (0..5)
            .map(|n| {
                broker.route_message_to_service(&mut RequestContext::default(), Message::data("chat", json!(n)))
            })
            .collect();
        let rejected = results.iter().filter(|r| r.is_err()).count();
        assert!(rejected >= 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.code() == crate::error::THROTTLED));
    }
}
