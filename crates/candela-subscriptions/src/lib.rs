//! Subscription topics, trigger evaluation and event generation.

pub mod engine;
pub mod subscription;
pub mod topic;
pub mod tracker;

pub use engine::{
    CompiledExpression, EmptyIncludeResolver, IncludeResolver, NotificationEvent,
    NotificationSink, NullSink, PathExpressionEngine, SubscriptionEngine, UnsupportedPathEngine,
};
pub use subscription::{ChannelInfo, ContentLevel, ParsedSubscription, SubscriptionStatus};
pub use topic::{
    AllowedFilter, NotificationShape, ParsedTopic, ResourceTrigger, is_topic_basic,
};
pub use tracker::{ReceivedNotification, ReceivedNotificationTracker};
