pub mod analytics;
pub mod automation;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod error;
pub mod governor;
pub mod metrics;
pub mod model;
pub mod output;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod selector;
pub mod service;
pub mod store;
pub mod worker;

pub use automation::{Automation, AutomationFailure, AutomationOutput, HttpAutomation};
pub use broadcast::{Broadcaster, Event};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use governor::{GovernorConfig, RateGovernor};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use registry::SelectorRegistry;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use service::{HealthSnapshot, JobService};
pub use store::{MemoryStore, SqliteStore, Store};
pub use worker::{Disposition, Engine, EngineParts, EngineState, WorkerSettings};
