use chrono::{Duration, Utc};
use vpin_data::{
    BacktestReplayer, EngineConfig, backtest::history::BinanceHistory,
};

#[tokio::main]
async fn main() {
    // Initialise INFO Tracing log subscriber
    init_logging();

    let symbol = std::env::var("VPIN_BACKTEST_SYMBOL").unwrap_or_else(|_| "BTCUSDT".to_string());
    let hours = std::env::var("VPIN_BACKTEST_HOURS")
        .ok()
        .and_then(|hours| hours.parse::<i64>().ok())
        .unwrap_or(6);

    let config = match EngineConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid engine configuration: {}", e);
            return;
        }
    };

    let replayer = match BacktestReplayer::new(config) {
        Ok(replayer) => replayer,
        Err(e) => {
            eprintln!("Failed to construct replayer: {}", e);
            return;
        }
    };

    let end = Utc::now();
    let start = end - Duration::hours(hours);

    println!("\n════════════════════════════════════════════════════════════");
    println!("VPIN BACKTEST");
    println!("════════════════════════════════════════════════════════════");
    println!("Symbol:        {}", symbol);
    println!("Window:        {} -> {}", start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M"));
    println!("Bucket volume: {}", replayer.config().bucket_volume);
    println!("Window size:   {} buckets", replayer.config().window_size);
    println!("════════════════════════════════════════════════════════════\n");

    let trades = match BinanceHistory::default().fetch(&symbol, start, end).await {
        Ok(trades) => trades,
        Err(e) => {
            eprintln!("Failed to fetch historical trades: {}", e);
            return;
        }
    };

    let result = replayer.run(&trades);
    let summary = &result.summary;

    println!("Trades replayed: {}", summary.trades);
    println!("Buckets closed:  {}", summary.buckets_closed);
    println!("VPIN samples:    {}", summary.samples);
    println!("Escalations:     {}", summary.escalations);

    match (summary.peak_vpin, summary.peak_at) {
        (Some(vpin), Some(at)) => println!("Peak VPIN:       {:.4} at {}", vpin, at),
        _ => println!("Peak VPIN:       n/a (rolling window never filled)"),
    }

    match (summary.first_alert_vpin, summary.first_alert_at) {
        (Some(vpin), Some(at)) => println!("First alert:     {:.4} at {}", vpin, at),
        _ => println!("First alert:     none"),
    }

    if let Some(last) = result.samples.last() {
        println!(
            "Latest sample:   {:.4} {} (bucket {}, price {})",
            last.vpin, last.alert_level, last.bucket_id, last.latest_price
        );
    }
}

// Initialise an INFO `Subscriber` for `Tracing` logs
fn init_logging() {
    tracing_subscriber::fmt()
        // Filter messages based on the INFO level
        .with_env_filter(
            tracing_subscriber::filter::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init()
}
