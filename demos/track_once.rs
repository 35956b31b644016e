use std::sync::Arc;

use tower::Service;
use tracker_service::{
    ChromiumEngine, ScrapeRequest, StatusScraper, TrackerConfig, TrackerService,
};

#[tokio::main]
async fn main() {
    // ログ設定
    tracing_subscriber::fmt()
        .with_env_filter("info,tracker_service=debug")
        .init();

    let tracking_number = std::env::var("TRACKING_NUMBER")
        .expect("TRACKING_NUMBER environment variable not set");

    let config = TrackerConfig::default().with_debug(true);
    let scraper = StatusScraper::new(Arc::new(ChromiumEngine::new(config.headless)), config);
    let mut service = TrackerService::new(Arc::new(scraper));

    println!("=== Tracking Scrape Test ===");

    match service.call(ScrapeRequest::new(&tracking_number)).await {
        Ok(result) => {
            println!("成功! {} 件のステータス履歴:", result.entries.len());
            for entry in &result.entries {
                println!("  {} | {}", entry.timestamp, entry.status_code);
            }
        }
        Err(e) => {
            eprintln!("エラー: {}", e);
        }
    }
}
