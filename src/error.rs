use thiserror::Error;

/// スクレイプ・配信パイプラインの失敗理由
///
/// 自動化エンジン側の例外型に依存せず、検出箇所ごとに明示的にマップする。
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("ナビゲーションタイムアウト: {0}秒以内にページが読み込まれませんでした")]
    NavigationTimeout(u64),

    #[error("追跡番号の入力欄が見つかりません")]
    InputFieldNotFound,

    #[error("ポップアップタイムアウト: {0}秒以内に新しいウィンドウが開きませんでした")]
    PopupTimeout(u64),

    #[error("セクションが見つかりません: {0}")]
    SectionNotFound(String),

    #[error("自動化エンジンエラー: {0}")]
    Automation(String),

    #[error("不正な引数: {0}")]
    InvalidArgument(String),

    #[error("永続化エラー: {0}")]
    Persistence(String),
}

impl From<rusqlite::Error> for TrackerError {
    fn from(e: rusqlite::Error) -> Self {
        TrackerError::Persistence(e.to_string())
    }
}
