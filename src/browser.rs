//! ブラウザ自動化エンジンの境界
//!
//! 取得パイプラインはこのモジュールのトレイト越しにしかブラウザに触れない。
//! 本番実装は chromiumoxide ベースの [`ChromiumEngine`]。

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

/// ネットワークアイドル判定のインターバル（ミリ秒）
const NETWORK_IDLE_CHECK_INTERVAL_MS: u64 = 500;
/// 連続アイドル判定の必要回数
const REQUIRED_IDLE_CHECKS: u32 = 3;
/// ポップアップ検出のポーリング間隔（ミリ秒）
const POPUP_POLL_INTERVAL_MS: u64 = 250;
/// セクション出現待機のポーリング間隔（ミリ秒）
const SECTION_POLL_INTERVAL_MS: u64 = 500;

/// 自動化エンジン境界のエラー
///
/// タイムアウトとそれ以外のみを区別する。パイプライン側が検出箇所ごとに
/// [`crate::TrackerError`] の具体的な失敗理由へマップする。
#[derive(Error, Debug)]
pub enum AutomationError {
    #[error("タイムアウト: {0}")]
    Timeout(String),

    #[error("{0}")]
    Engine(String),
}

/// ブラウザセッションの供給源
///
/// 1回の取得につき1セッション。呼び出しごとに独立したコンテキストを
/// 返すこと（追跡番号間で状態を共有しない）。
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn PortalSession>, AutomationError>;
}

/// 1回の取得が占有するブラウザセッション（メインウィンドウ）
#[async_trait]
pub trait PortalSession: Send {
    /// URLへ遷移し、ネットワークアイドルまで待機する
    async fn navigate_idle(&mut self, url: &str, timeout: Duration) -> Result<(), AutomationError>;

    /// セレクタに一致する最初の要素へ入力する。一致要素なしなら `false`
    async fn fill_first(&mut self, selector: &str, value: &str)
        -> Result<bool, AutomationError>;

    /// ポップアップ待ちを登録してからクリックし、開いたウィンドウを返す
    ///
    /// 待機の登録はクリックより先に行うこと。クリック直後にポップアップが
    /// 開いても取りこぼさない。
    async fn click_expect_popup(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Box<dyn PortalWindow>, AutomationError>;

    /// デバッグ用スクリーンショット（未対応のエンジンはエラーでよい）
    async fn screenshot(&mut self) -> Result<Vec<u8>, AutomationError> {
        Err(AutomationError::Engine(
            "スクリーンショット未対応".to_string(),
        ))
    }

    /// セッション解放。すべての終了パスで必ず呼ぶ
    async fn close(&mut self);
}

/// 送信の副作用で開いたポップアップウィンドウ
///
/// セレクタとラベルは任意の文字列でよい。スクリプトへ埋め込む実装は
/// 引用符を含む入力でも壊れないようエスケープすること。
#[async_trait]
pub trait PortalWindow: Send {
    /// セレクタ一致要素の現在のテキスト一覧（診断ログ用）
    async fn section_titles(&mut self, selector: &str) -> Result<Vec<String>, AutomationError>;

    /// ラベル文字列を含む要素が出現するまで待機する。期限内に現れなければ `false`
    async fn wait_for_labeled_section(
        &mut self,
        selector: &str,
        label: &str,
        timeout: Duration,
    ) -> Result<bool, AutomationError>;

    /// ラベル区画の最近接コンテナ内のテーブル行を、行ごとのセル文字列として返す
    async fn rows_near_label(
        &mut self,
        section_selector: &str,
        label: &str,
        ancestor_selector: &str,
        row_selector: &str,
    ) -> Result<Vec<Vec<String>>, AutomationError>;

    /// ポップアップを閉じる
    async fn close(&mut self);
}

/// chromiumoxide ベースのエンジン
///
/// セッションごとにブラウザプロセスを起動・破棄する（プールしない）。
#[derive(Debug, Clone)]
pub struct ChromiumEngine {
    headless: bool,
}

impl ChromiumEngine {
    pub fn new(headless: bool) -> Self {
        Self { headless }
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn open_session(&self) -> Result<Box<dyn PortalSession>, AutomationError> {
        // ユニークなユーザーデータディレクトリを生成（セッション間の分離）
        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("tracker-{}", unique_id));

        // Chrome パスを取得
        let chrome_path = std::env::var("CHROME_PATH")
            .or_else(|_| std::env::var("CHROMIUM_PATH"))
            .unwrap_or_else(|_| "chromium".to_string());

        let mut builder = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .user_data_dir(&user_data_dir)
            .window_size(1280, 800);

        if !self.headless {
            builder = builder.with_head();
        }

        builder = builder
            .no_sandbox()
            .request_timeout(Duration::from_secs(60))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        let browser_config = builder
            .build()
            .map_err(|e| AutomationError::Engine(format!("ブラウザ設定エラー: {}", e)))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))?;

        // ブラウザイベントハンドラをバックグラウンドで実行
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                debug!("ブラウザイベント: {:?}", event);
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))?;

        Ok(Box::new(ChromiumSession {
            browser: Some(browser),
            page,
        }))
    }
}

struct ChromiumSession {
    browser: Option<Browser>,
    page: Page,
}

impl ChromiumSession {
    /// ネットワークがアイドル状態になるまで待機する
    ///
    /// Performance API で直近のリソース取得を監視し、連続3回アイドルなら
    /// 完了とみなす。期限超過はエラー。
    async fn wait_request_idle(
        &self,
        deadline: std::time::Instant,
        timeout: Duration,
    ) -> Result<(), AutomationError> {
        let mut idle_count = 0;

        while std::time::Instant::now() < deadline {
            let result = self
                .page
                .evaluate(
                    r#"
                    (function() {
                        var entries = performance.getEntriesByType('resource');
                        var now = performance.now();
                        var recent = entries.filter(function(e) {
                            return (now - e.startTime) < 500 && e.duration === 0;
                        });
                        return recent.length === 0;
                    })()
                    "#,
                )
                .await;

            match result {
                Ok(val) => {
                    if val.into_value::<bool>().unwrap_or(false) {
                        idle_count += 1;
                        if idle_count >= REQUIRED_IDLE_CHECKS {
                            debug!("ネットワークアイドル確認 ({} 回連続)", idle_count);
                            return Ok(());
                        }
                    } else {
                        idle_count = 0;
                    }
                }
                Err(e) => {
                    debug!("ネットワークアイドル確認エラー: {}", e);
                    idle_count = 0;
                }
            }

            sleep(Duration::from_millis(NETWORK_IDLE_CHECK_INTERVAL_MS)).await;
        }

        Err(AutomationError::Timeout(format!(
            "ネットワークアイドル待機が{}秒以内に完了しませんでした",
            timeout.as_secs()
        )))
    }
}

#[async_trait]
impl PortalSession for ChromiumSession {
    async fn navigate_idle(&mut self, url: &str, timeout: Duration) -> Result<(), AutomationError> {
        let deadline = std::time::Instant::now() + timeout;

        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .map_err(|_| {
                AutomationError::Timeout(format!(
                    "ページ読み込みが{}秒以内に完了しませんでした",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| AutomationError::Engine(e.to_string()))?;

        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        tokio::time::timeout(remaining, self.page.wait_for_navigation())
            .await
            .map_err(|_| {
                AutomationError::Timeout(format!(
                    "ナビゲーション完了が{}秒以内に確認できませんでした",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| AutomationError::Engine(e.to_string()))?;

        self.wait_request_idle(deadline, timeout).await
    }

    async fn fill_first(
        &mut self,
        selector: &str,
        value: &str,
    ) -> Result<bool, AutomationError> {
        let elements = self
            .page
            .find_elements(selector)
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))?;

        let Some(first) = elements.into_iter().next() else {
            return Ok(false);
        };

        first
            .click()
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))?;
        first
            .type_str(value)
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))?;

        Ok(true)
    }

    async fn click_expect_popup(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<Box<dyn PortalWindow>, AutomationError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| AutomationError::Engine("セッションは解放済みです".to_string()))?;

        // クリック前に既存ターゲットを記録しておく。クリック直後に開いた
        // ポップアップもターゲット一覧に残るため取りこぼさない。
        let before: Vec<_> = browser
            .pages()
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))?
            .iter()
            .map(|p| p.target_id().clone())
            .collect();

        self.page
            .find_element(selector)
            .await
            .map_err(|e| AutomationError::Engine(format!("送信ボタン: {}", e)))?
            .click()
            .await
            .map_err(|e| AutomationError::Engine(format!("送信クリック: {}", e)))?;

        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            let pages = browser
                .pages()
                .await
                .map_err(|e| AutomationError::Engine(e.to_string()))?;

            if let Some(popup) = pages
                .into_iter()
                .find(|p| !before.contains(p.target_id()))
            {
                return Ok(Box::new(ChromiumWindow { page: Some(popup) }));
            }

            sleep(Duration::from_millis(POPUP_POLL_INTERVAL_MS)).await;
        }

        Err(AutomationError::Timeout(format!(
            "ポップアップが{}秒以内に開きませんでした",
            timeout.as_secs()
        )))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, AutomationError> {
        self.page
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                debug!("ブラウザのクローズに失敗: {}", e);
            }
        }
    }
}

/// JS文字列リテラルとして安全に埋め込むためのクォート
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

struct ChromiumWindow {
    page: Option<Page>,
}

impl ChromiumWindow {
    fn page(&self) -> Result<&Page, AutomationError> {
        self.page
            .as_ref()
            .ok_or_else(|| AutomationError::Engine("ポップアップは解放済みです".to_string()))
    }
}

#[async_trait]
impl PortalWindow for ChromiumWindow {
    async fn section_titles(&mut self, selector: &str) -> Result<Vec<String>, AutomationError> {
        let script = format!(
            r#"
            (function() {{
                var nodes = document.querySelectorAll({});
                var texts = [];
                for (var i = 0; i < nodes.length; i++) {{
                    texts.push(nodes[i].textContent.trim());
                }}
                return JSON.stringify(texts);
            }})()
            "#,
            js_string(selector)
        );

        let result = self
            .page()?
            .evaluate(script.as_str())
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))?;

        let json_str = result.into_value::<String>().unwrap_or_default();
        serde_json::from_str(&json_str).map_err(|e| AutomationError::Engine(e.to_string()))
    }

    async fn wait_for_labeled_section(
        &mut self,
        selector: &str,
        label: &str,
        timeout: Duration,
    ) -> Result<bool, AutomationError> {
        let script = format!(
            r#"
            (function() {{
                var nodes = document.querySelectorAll({});
                for (var i = 0; i < nodes.length; i++) {{
                    if (nodes[i].textContent.indexOf({}) >= 0) {{
                        return true;
                    }}
                }}
                return false;
            }})()
            "#,
            js_string(selector),
            js_string(label)
        );

        let deadline = std::time::Instant::now() + timeout;
        loop {
            let result = self
                .page()?
                .evaluate(script.as_str())
                .await
                .map_err(|e| AutomationError::Engine(e.to_string()))?;

            if result.into_value::<bool>().unwrap_or(false) {
                return Ok(true);
            }

            if std::time::Instant::now() >= deadline {
                return Ok(false);
            }

            sleep(Duration::from_millis(SECTION_POLL_INTERVAL_MS)).await;
        }
    }

    async fn rows_near_label(
        &mut self,
        section_selector: &str,
        label: &str,
        ancestor_selector: &str,
        row_selector: &str,
    ) -> Result<Vec<Vec<String>>, AutomationError> {
        let script = format!(
            r#"
            (function() {{
                var nodes = document.querySelectorAll({});
                for (var i = 0; i < nodes.length; i++) {{
                    if (nodes[i].textContent.indexOf({}) < 0) {{
                        continue;
                    }}
                    var container = nodes[i].closest({});
                    if (!container) {{
                        return "[]";
                    }}
                    var rows = container.querySelectorAll({});
                    var out = [];
                    for (var r = 0; r < rows.length; r++) {{
                        var cells = rows[r].querySelectorAll("td");
                        var texts = [];
                        for (var c = 0; c < cells.length; c++) {{
                            texts.push(cells[c].innerText.trim());
                        }}
                        out.push(texts);
                    }}
                    return JSON.stringify(out);
                }}
                return "[]";
            }})()
            "#,
            js_string(section_selector),
            js_string(label),
            js_string(ancestor_selector),
            js_string(row_selector)
        );

        let result = self
            .page()?
            .evaluate(script.as_str())
            .await
            .map_err(|e| AutomationError::Engine(e.to_string()))?;

        let json_str = result.into_value::<String>().unwrap_or_default();
        serde_json::from_str(&json_str).map_err(|e| AutomationError::Engine(e.to_string()))
    }

    async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                warn!("ポップアップウィンドウのクローズに失敗: {}", e);
            }
        }
    }
}
