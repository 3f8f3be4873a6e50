pub mod adapter;
pub mod backoff;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod errors;
pub mod memory_source;
pub mod notification;
pub mod object;
pub mod queue;
pub mod source;
pub mod store;
pub mod worker;

pub use adapter::{InformerAdapter, Observation, SourceAdapter, SourceHealth, SourceKind};
pub use config::{BackoffConfig, InformerConfig, RateLimiterConfig};
pub use controller::Informer;
pub use dispatcher::{Dispatcher, Registration};
pub use memory_source::MemorySource;
pub use notification::{
    ChangeKind, ChangeNotification, DeliveryMode, EventHandler, HandlerError, HandlerId,
    HandlerResult, WorkKey,
};
pub use object::{ObjectKey, WatchedObject};
pub use queue::WorkQueue;
pub use source::{ListResult, Lister, PollingSource, Selector, WatchEvent, WatchSource, WatchStream};
pub use store::{IndexFn, NAMESPACE_INDEX, Store, label_index};
pub use worker::{Processor, WorkerPool};
