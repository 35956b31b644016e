use async_trait::async_trait;

use crate::error::TrackerError;
use crate::types::StatusHistoryEntry;

/// 1つの追跡番号についてステータス履歴を取得する能力
///
/// 本番実装は [`crate::scraper::StatusScraper`]。スケジューラとゲートウェイは
/// このトレイト越しにのみパイプラインを呼ぶため、テストでは差し替え可能。
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// ポータルから追跡番号のステータス履歴を取得する
    ///
    /// 空の履歴は正常（`Ok(vec![])`）。失敗理由は [`TrackerError`] で返す。
    async fn fetch_status_history(
        &self,
        tracking_number: &str,
    ) -> Result<Vec<StatusHistoryEntry>, TrackerError>;
}
