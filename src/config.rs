use std::path::PathBuf;
use std::time::Duration;

/// GRG追跡ポータルのトレースページ
pub const DEFAULT_PORTAL_URL: &str = "https://grguweb.tmwcloud.com/trace/external.msw";

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// 追跡ポータルURL
    pub portal_url: String,
    /// ナビゲーション（ネットワークアイドルまで）のタイムアウト
    pub navigation_timeout: Duration,
    /// 送信後にポップアップが開くまでのタイムアウト
    pub popup_timeout: Duration,
    /// ステータス履歴セクション出現までのタイムアウト
    pub section_timeout: Duration,
    /// ポーリング周期（全購読を1周した後のスリープ）
    pub poll_interval: Duration,
    /// 購読ストアのSQLiteファイル
    pub db_path: PathBuf,
    /// ヘッドレスモード
    pub headless: bool,
    /// デバッグモード（失敗時にスクリーンショットをログ出力）
    pub debug: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            portal_url: DEFAULT_PORTAL_URL.to_string(),
            navigation_timeout: Duration::from_secs(60),
            popup_timeout: Duration::from_secs(30),
            section_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5 * 60),
            db_path: PathBuf::from("tracking.db"),
            headless: true,
            debug: false,
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_portal_url(mut self, url: impl Into<String>) -> Self {
        self.portal_url = url.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}
