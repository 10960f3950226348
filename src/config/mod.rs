use std::{net::SocketAddr, time::Duration};

use anyhow::{Context, Result, bail};
use envconfig::Envconfig;
use kanal::AsyncSender;
use log::info;
use strum::{Display, EnumString};

use crate::{
    classifier::ErrorClassifiers,
    sink::{TcpSink, TcpSinkBuilder},
    statistics::DeliveryEvent,
    strategies::{BatchStrategyBuilder, SendStrategies, StreamStrategyBuilder},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StrategyKind {
    Stream,
    Batch,
}

/// Delivery stage settings, read from `COURIER_*` environment variables
#[derive(Envconfig, Debug)]
pub struct Settings {
    #[envconfig(from = "COURIER_STRATEGY", default = "stream")]
    pub strategy: StrategyKind,

    #[envconfig(from = "COURIER_CLASSIFIER", default = "stop_on_cancel")]
    pub classifier: ErrorClassifiers,

    #[envconfig(from = "COURIER_BATCH_MAX_MESSAGES", default = "100")]
    pub batch_max_messages: usize,

    #[envconfig(from = "COURIER_BATCH_MAX_BYTES", default = "1048576")]
    pub batch_max_bytes: usize,

    #[envconfig(from = "COURIER_FLUSH_INTERVAL_MS", default = "1000")]
    pub flush_interval_ms: u64,

    #[envconfig(from = "COURIER_CHANNEL_CAPACITY", default = "1024")]
    pub channel_capacity: usize,

    #[envconfig(from = "COURIER_STATS_INTERVAL", default = "10")]
    pub stats_interval: u64,

    #[envconfig(from = "COURIER_TCP_TARGET", default = "127.0.0.1:10514")]
    pub tcp_target: String,

    #[envconfig(from = "COURIER_TCP_WRITE_TIMEOUT_MS", default = "5000")]
    pub tcp_write_timeout_ms: u64,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let settings = Settings::init_from_env().context("Invalid COURIER_* environment")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_max_messages == 0 {
            bail!("COURIER_BATCH_MAX_MESSAGES must be greater than 0");
        }
        if self.batch_max_bytes == 0 {
            bail!("COURIER_BATCH_MAX_BYTES must be greater than 0");
        }
        if self.flush_interval_ms == 0 {
            bail!("COURIER_FLUSH_INTERVAL_MS must be greater than 0");
        }
        if self.stats_interval == 0 {
            bail!("COURIER_STATS_INTERVAL must be greater than 0");
        }
        Ok(())
    }

    pub fn strategy(&self, stats_tx: Option<AsyncSender<DeliveryEvent>>) -> Result<SendStrategies> {
        info!("Selected Send Strategy: {} (classifier: {})", self.strategy, self.classifier);

        let strategy: SendStrategies = match self.strategy {
            StrategyKind::Stream => {
                let mut builder = StreamStrategyBuilder::default().classifier(self.classifier);
                if let Some(tx) = stats_tx {
                    builder = builder.stats_tx(tx);
                }
                builder.build()?.into()
            }
            StrategyKind::Batch => {
                let mut builder = BatchStrategyBuilder::default()
                    .classifier(self.classifier)
                    .max_messages(self.batch_max_messages)
                    .max_bytes(self.batch_max_bytes)
                    .flush_interval(Duration::from_millis(self.flush_interval_ms));
                if let Some(tx) = stats_tx {
                    builder = builder.stats_tx(tx);
                }
                builder.build()?.into()
            }
        };
        Ok(strategy)
    }

    pub fn tcp_sink(&self) -> Result<TcpSink> {
        let addr: SocketAddr = self
            .tcp_target
            .parse()
            .with_context(|| format!("Invalid COURIER_TCP_TARGET {}", self.tcp_target))?;

        let sink = TcpSinkBuilder::default()
            .addr(addr)
            .write_timeout(Duration::from_millis(self.tcp_write_timeout_ms))
            .build()?;
        Ok(sink)
    }
}
