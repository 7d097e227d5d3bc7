//! # Dispatch Engine
//!
//! Routes broker messages to actor callbacks.
//!
//! Every registered actor type contributes one [`Route`] for its command
//! topic and, when device-info fetching is enabled, one for its
//! request-device-info topic. The [`Dispatcher`] subscribes to each route's
//! wildcard filter and consumes the resulting stream in its own task:
//!
//! - messages of one stream are handled strictly one after the other;
//! - different streams run concurrently;
//! - sessions against the same device are still serialized by
//!   [`DeviceLocks`](super::DeviceLocks), whatever stream they arrive on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info};

use super::core::{command_callback, device_info_update_callback, Actor, ActorKind, DispatchContext};
use crate::button_actor::ButtonAutomator;
use crate::curtain_actor::CurtainMotor;
use crate::mqtt::{Broker, BrokerError, InboundMessage, MessageStream};
use crate::topic::{describe_template, join_topic, TopicTemplate, SINGLE_LEVEL_WILDCARD};

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Monomorphized callback for one actor type.
pub type Handler = for<'a> fn(&'a DispatchContext, InboundMessage) -> HandlerFuture<'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutePurpose {
    Command,
    DeviceInfoUpdate,
}

/// One subscription: a topic template and the callback handling it.
#[derive(Clone, Copy)]
pub struct Route {
    pub kind: ActorKind,
    pub purpose: RoutePurpose,
    pub template: TopicTemplate,
    handler: Handler,
}

impl Route {
    pub fn filter(&self, topic_prefix: &str) -> String {
        join_topic(topic_prefix, self.template, SINGLE_LEVEL_WILDCARD)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("kind", &self.kind)
            .field("purpose", &self.purpose)
            .field("template", &describe_template(self.template))
            .finish()
    }
}

fn command_handler<A: Actor>(ctx: &DispatchContext, message: InboundMessage) -> HandlerFuture<'_> {
    Box::pin(command_callback::<A>(ctx, message))
}

fn device_info_handler<A: Actor>(ctx: &DispatchContext, message: InboundMessage) -> HandlerFuture<'_> {
    Box::pin(device_info_update_callback::<A>(ctx, message))
}

/// The set of actor types the bridge serves.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    actors: Vec<[Route; 2]>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Actor>(mut self) -> Self {
        self.actors.push([
            Route {
                kind: A::KIND,
                purpose: RoutePurpose::Command,
                template: A::COMMAND_TOPIC,
                handler: command_handler::<A>,
            },
            Route {
                kind: A::KIND,
                purpose: RoutePurpose::DeviceInfoUpdate,
                template: A::REQUEST_DEVICE_INFO_TOPIC,
                handler: device_info_handler::<A>,
            },
        ]);
        self
    }

    /// Routes to subscribe. Device-info routes only when `fetch_device_info`.
    pub fn routes(&self, fetch_device_info: bool) -> Vec<Route> {
        self.actors
            .iter()
            .flatten()
            .filter(|route| fetch_device_info || route.purpose == RoutePurpose::Command)
            .copied()
            .collect()
    }
}

/// Button and curtain.
pub fn default_registry() -> Registry {
    Registry::new()
        .register::<ButtonAutomator>()
        .register::<CurtainMotor>()
}

/// Subscribes every route and runs its stream until the broker closes it.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    ctx: DispatchContext,
    registry: Registry,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, ctx: DispatchContext, registry: Registry) -> Self {
        Self {
            broker,
            ctx,
            registry,
        }
    }

    /// Subscribes all routes, then consumes their streams concurrently.
    ///
    /// Returns once every stream has ended. A subscribe failure aborts
    /// before any stream is consumed.
    pub async fn run(self) -> Result<(), BrokerError> {
        let settings = self.ctx.settings();
        let routes = self.registry.routes(settings.fetch_device_info());

        let mut streams = Vec::with_capacity(routes.len());
        for route in routes {
            let filter = route.filter(settings.topic_prefix());
            let stream = self.broker.subscribe(&filter).await?;
            info!(kind = %route.kind, purpose = ?route.purpose, %filter, "Subscribed");
            streams.push((route, stream));
        }

        let mut tasks = JoinSet::new();
        for (route, stream) in streams {
            tasks.spawn(consume(route, stream, self.ctx.clone()));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Stream task failed");
            }
        }
        Ok(())
    }
}

async fn consume(route: Route, mut stream: MessageStream, ctx: DispatchContext) {
    while let Some(message) = stream.recv().await {
        (route.handler)(&ctx, message).await;
    }
    debug!(kind = %route.kind, purpose = ?route.purpose, "Stream ended");
}
