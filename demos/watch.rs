//! 常駐構成のデモ
//!
//! SQLiteストア + ハブ + スケジューラを組み上げ、環境変数で渡された
//! クライアントを登録して Ctrl-C まで周期スクレイプを回す。
//! プッシュトランスポートの代わりにログへ出力するパブリッシャを使う。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracker_service::{
    ChromiumEngine, PollScheduler, SqliteStore, StatusHistoryEntry, StatusScraper,
    SubscriptionStore, TrackerConfig, TrackerError, TrackerHub, UpdatePublisher,
};

/// Updateイベントを標準出力へ流すだけのパブリッシャ
struct LogPublisher;

#[async_trait]
impl UpdatePublisher for LogPublisher {
    async fn publish_update(
        &self,
        connection_id: &str,
        entries: &[StatusHistoryEntry],
    ) -> Result<(), TrackerError> {
        println!("--- Update for connection {} ---", connection_id);
        for entry in entries {
            println!("  {} | {}", entry.timestamp, entry.status_code);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter("info,tracker_service=debug")
        .init();

    let client_name = std::env::var("CLIENT_NAME").unwrap_or_else(|_| "demo".to_string());
    let tracking_number = std::env::var("TRACKING_NUMBER")
        .expect("TRACKING_NUMBER environment variable not set");

    let config = TrackerConfig::default().with_poll_interval(Duration::from_secs(60));

    let store = Arc::new(SqliteStore::new(&config.db_path));
    store.init_schema().await.expect("schema init failed");

    let scraper = StatusScraper::new(
        Arc::new(ChromiumEngine::new(config.headless)),
        config.clone(),
    );
    let hub = Arc::new(TrackerHub::new(
        store.clone(),
        Arc::new(LogPublisher),
        Arc::new(scraper),
    ));

    hub.register_tracking_number("demo-connection", &client_name, &tracking_number)
        .await
        .expect("registration failed");

    let shutdown = CancellationToken::new();
    let handle = PollScheduler::new(store, hub, config, shutdown.clone()).spawn();

    tokio::signal::ctrl_c().await.expect("ctrl-c handler");
    println!("停止シグナル受信、スケジューラを終了します...");
    shutdown.cancel();
    let _ = handle.await;
}
