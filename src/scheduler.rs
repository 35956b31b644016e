//! ポーリングスケジューラ
//!
//! 固定周期で全 (クライアント, 追跡番号) を列挙し、1件ずつ順番に
//! 取得パイプラインを回す。並列化はしない（ブラウザは常に1セッション、
//! ポータルへの同時アクセスも避ける）。1件の失敗は次の件に波及しない。

use std::sync::Arc;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::TrackerConfig;
use crate::hub::TrackerHub;
use crate::store::SubscriptionStore;

pub struct PollScheduler {
    store: Arc<dyn SubscriptionStore>,
    hub: Arc<TrackerHub>,
    config: TrackerConfig,
    shutdown: CancellationToken,
}

impl PollScheduler {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        hub: Arc<TrackerHub>,
        config: TrackerConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            hub,
            config,
            shutdown,
        }
    }

    /// バックグラウンドタスクとして起動する
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 停止シグナルが来るまでループする
    pub async fn run(self) {
        info!(
            "ポーリングスケジューラ開始 (周期: {:?})",
            self.config.poll_interval
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.sweep().await;

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.config.poll_interval) => {}
            }
        }

        info!("ポーリングスケジューラ停止");
    }

    /// 全購読を1周する
    ///
    /// スナップショット読み取りに失敗した周は何もしない（アイドル周回に
    /// 退化するだけで落ちない）。
    async fn sweep(&self) {
        let snapshot = match self.store.list_all().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("購読スナップショットの読み取りに失敗: {}", e);
                return;
            }
        };

        let mut items = 0usize;
        let mut failures = 0usize;

        for (key, tracking_numbers) in snapshot {
            for tracking_number in tracking_numbers {
                if self.shutdown.is_cancelled() {
                    info!("停止要求を受信、スイープを中断します");
                    return;
                }

                items += 1;
                // 停止時は実行中のスクレイプを待たずに打ち切る
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        info!("停止要求を受信、実行中のスクレイプを放棄します");
                        return;
                    }
                    result = self.hub.fetch_and_dispatch(&key.name, &tracking_number) => {
                        if result.is_err() {
                            failures += 1;
                        }
                    }
                }
            }
        }

        info!("スイープ完了: {} 件処理, {} 件失敗", items, failures);
    }
}
