//! Trading Engine
//!
//! Opportunity scoring, portfolio allocation and the position lifecycle for
//! leveraged futures, plus the per-user sessions and scheduler that drive them.

pub mod allocator;
pub mod engine;
pub mod events;
pub mod guard;
pub mod lifecycle;
pub mod report;
pub mod scheduler;
pub mod scorer;
pub mod sentiment;
pub mod session;

pub use engine::{Engine, ScanOutcome};
pub use events::{event_channel, EventSink, TradingEvent};
pub use guard::{InFlight, InFlightGuard};
pub use lifecycle::TrailingBook;
pub use report::DailyReport;
pub use scheduler::{Scheduler, TaskKind};
pub use scorer::Opportunity;
pub use sentiment::{CachedSentiment, NeutralSentiment, SentimentProvider, StaticSentiment};
pub use session::{SessionManager, UserSession};
