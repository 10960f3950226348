use std::{future::IntoFuture, sync::Arc, time::Duration};

use log::{LevelFilter, error, info};
use mimalloc::MiMalloc;
use simple_logger::SimpleLogger;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Builder,
    select, signal,
};

use crab_courier::{
    LatencyTracker, LogSource, Message, Origin, Settings, pipeline::PipelineBuilder, stats_channel,
};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> anyhow::Result<()> {
    //Init logger
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;

    //Load env variables
    let settings = Settings::load()?;

    Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(settings))
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let (input_tx, input_rx) = kanal::bounded_async(settings.channel_capacity);
    let (output_tx, output_rx) = kanal::bounded_async(settings.channel_capacity);
    let (stats_tx, stats_rx) = stats_channel(settings.channel_capacity);

    let pipeline = PipelineBuilder::default()
        .strategy(settings.strategy(Some(stats_tx))?)
        .sink(settings.tcp_sink()?)
        .input(input_rx)
        .output(output_tx)
        .stats_rx(stats_rx)
        .stats_interval(settings.stats_interval)
        .build()?;
    let handle = pipeline.shutdown_handle();
    let pipeline = tokio::spawn(pipeline.into_future());

    let latency = Arc::new(LatencyTracker::default());
    let source = Arc::new(LogSource::new("stdin", latency.clone()));

    //Producer: one message per stdin line. Dropping input_tx closes the pipeline input
    let mut producer = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if input_tx.send(Message::new(line, Some(Origin::new(&source)))).await.is_err() {
                break;
            }
        }
    });

    //Acknowledger: delivered messages end up here
    let acknowledger = tokio::spawn(async move {
        let mut acked = 0usize;
        while output_rx.recv().await.is_ok() {
            acked += 1;
        }
        acked
    });

    select! {
        _ = signal::ctrl_c() => {
            info!("Received CTRL-C signal");
            handle.flush_and_shutdown(Duration::from_secs(5)).await;
            producer.abort();
        }
        res = &mut producer => {
            if let Err(err) = res {
                error!("Producer failed: {}", err);
            }
        }
    }

    let report = pipeline.await??;
    let acked = acknowledger.await?;
    info!("Delivered {} messages, dropped {}, acknowledged {}", report.delivered, report.dropped, acked);
    if let Some(snapshot) = latency.snapshot() {
        info!(
            "stdin latency: <min: {}, max: {}, average: {}> ms",
            snapshot.min.as_millis(),
            snapshot.max.as_millis(),
            snapshot.average.as_millis()
        );
    }

    Ok(())
}
