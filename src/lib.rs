//! 貨物追跡スクレイパーサービス
//!
//! APIを公開しない追跡ポータルをヘッドレスブラウザで定期的に照会し、
//! ステータス履歴の更新を登録済みクライアントのライブ接続へプッシュする。
//!
//! - 取得パイプライン: 1追跡番号につき1ブラウザセッションでポータルUIを操作
//! - ポーリングスケジューラ: 全購読を周期的に順次処理（失敗は件単位で隔離）
//! - ディスパッチゲートウェイ: 接続登録・即時更新要求・Updateイベント配信
//! - 購読ストア: SQLiteによるクライアント/追跡番号の永続化
//!
//! # 単発スクレイプ使用例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tower::Service;
//! use tracker_service::{
//!     ChromiumEngine, ScrapeRequest, StatusScraper, TrackerConfig, TrackerService,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TrackerConfig::default();
//!     let scraper = StatusScraper::new(Arc::new(ChromiumEngine::new(true)), config);
//!     let mut service = TrackerService::new(Arc::new(scraper));
//!
//!     let result = service.call(ScrapeRequest::new("TN123")).await.unwrap();
//!     println!("Entries: {:?}", result.entries);
//! }
//! ```
//!
//! # 常駐サービス使用例
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tracker_service::{
//!     ChromiumEngine, PollScheduler, SqliteStore, StatusScraper, SubscriptionStore,
//!     TrackerConfig, TrackerHub,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TrackerConfig::default();
//!     let store = Arc::new(SqliteStore::new(&config.db_path));
//!     store.init_schema().await.unwrap();
//!
//!     let scraper = StatusScraper::new(
//!         Arc::new(ChromiumEngine::new(config.headless)),
//!         config.clone(),
//!     );
//!     let hub = Arc::new(TrackerHub::new(store.clone(), publisher, Arc::new(scraper)));
//!
//!     let shutdown = CancellationToken::new();
//!     PollScheduler::new(store, hub, config, shutdown.clone()).spawn();
//! }
//! ```

pub mod browser;
pub mod config;
pub mod error;
pub mod hub;
pub mod scheduler;
pub mod scraper;
pub mod service;
pub mod store;
pub mod traits;
pub mod types;

// 主要な型をリエクスポート
pub use browser::{AutomationError, BrowserEngine, ChromiumEngine, PortalSession, PortalWindow};
pub use config::TrackerConfig;
pub use error::TrackerError;
pub use hub::{TrackerHub, UpdatePublisher};
pub use scheduler::PollScheduler;
pub use scraper::StatusScraper;
pub use service::{ScrapeRequest, ScrapeResult, TrackerService};
pub use store::{SqliteStore, SubscriptionStore};
pub use traits::StatusSource;
pub use types::{ClientKey, StatusHistoryEntry};
