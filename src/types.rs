//! 追跡関連の型定義

use serde::{Deserialize, Serialize};

/// ステータス履歴の1行
///
/// タイムスタンプはポータル表記のまま保持する（パース・正規化しない）。
/// 順序はポータルのテーブルが返した順序をそのまま引き継ぐ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub timestamp: String,
    pub status_code: String,
}

impl StatusHistoryEntry {
    pub fn new(timestamp: impl Into<String>, status_code: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            status_code: status_code.into(),
        }
    }
}

/// 購読スナップショットのキー
///
/// `name` がクライアントの識別子。`connection_id` はその名前に
/// 最後に紐付いた接続ハンドル（再接続のたびに付け替わる）。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub connection_id: String,
    pub name: String,
}
