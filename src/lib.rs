#![doc = include_str!("../README.md")]

pub use classifier::{DeliveryError, ErrorClassifier, ErrorClassifiers, Severity};
pub use config::{Settings, StrategyKind};
pub use delivery::{DeliveryTask, DeliveryTaskBuilder};
pub use message::{LogSource, Message, Origin};
pub use sink::{Sink, SinkResult, TcpSink, TcpSinkBuilder};
pub use statistics::{
    DeliveryEvent, LatencySnapshot, LatencyStats, LatencyTracker, StatisticsTask,
    StatisticsTaskBuilder, stats_channel,
};
pub use strategies::{
    BatchStrategy, BatchStrategyBuilder, DeliveryReport, SendStrategies, SendStrategy, StopReason,
    StreamStrategy, StreamStrategyBuilder,
};

mod classifier;
mod config;
mod delivery;
mod message;
mod sink;
mod statistics;
mod strategies;

/// Main library module
pub mod pipeline;
