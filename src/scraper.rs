//! 取得パイプライン
//!
//! 1つの追跡番号につき1ブラウザセッションでポータルUIを操作し、
//! ステータス履歴テーブルを抽出する。状態遷移は直線的:
//! セッション確保 → ページ読み込み → 照会送信 → ポップアップ →
//! セクション特定 → 行抽出 → 解放。どの段階で失敗しても
//! セッションは必ず解放する。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::browser::{AutomationError, BrowserEngine, PortalSession, PortalWindow};
use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::traits::StatusSource;
use crate::types::StatusHistoryEntry;

/// 追跡番号の入力欄
const TRACKING_INPUT_SELECTOR: &str = "input[name='search_value[]']";
/// 照会の送信ボタン（クリックでポップアップが開く）
const SUBMIT_SELECTOR: &str = "input[name='Submit']";
/// セクション見出し要素。ラベル文字列で特定する（レイアウト変更に強い）
const SECTION_SELECTOR: &str = "div.tmw_section";
/// ステータス履歴セクションのラベル
const STATUS_SECTION_LABEL: &str = "Historique du Status";
/// 見出しから遡る最近接の構造コンテナ
const SECTION_CONTAINER_SELECTOR: &str = "div.k-widget";
/// コンテナ内のステータス行
const STATUS_ROW_SELECTOR: &str = "div.k-grid-content tbody tr";

/// ポータルを相手にするステータス履歴スクレイパー
pub struct StatusScraper {
    engine: Arc<dyn BrowserEngine>,
    config: TrackerConfig,
}

impl StatusScraper {
    pub fn new(engine: Arc<dyn BrowserEngine>, config: TrackerConfig) -> Self {
        Self { engine, config }
    }

    /// セッション確保済みの状態で全ステップを実行する
    async fn run(
        &self,
        session: &mut dyn PortalSession,
        tracking_number: &str,
    ) -> Result<Vec<StatusHistoryEntry>, TrackerError> {
        info!("追跡ポータルへ移動: {}", self.config.portal_url);
        session
            .navigate_idle(&self.config.portal_url, self.config.navigation_timeout)
            .await
            .map_err(|e| match e {
                AutomationError::Timeout(_) => {
                    TrackerError::NavigationTimeout(self.config.navigation_timeout.as_secs())
                }
                AutomationError::Engine(msg) => TrackerError::Automation(msg),
            })?;

        info!("追跡番号を入力: {}", tracking_number);
        let filled = session
            .fill_first(TRACKING_INPUT_SELECTOR, tracking_number)
            .await
            .map_err(automation)?;
        if !filled {
            // 入力欄ゼロはポータルのマークアップ変更か読み込み失敗
            return Err(TrackerError::InputFieldNotFound);
        }

        info!("照会を送信、ポップアップウィンドウを待機中...");
        let mut popup = session
            .click_expect_popup(SUBMIT_SELECTOR, self.config.popup_timeout)
            .await
            .map_err(|e| match e {
                AutomationError::Timeout(_) => {
                    TrackerError::PopupTimeout(self.config.popup_timeout.as_secs())
                }
                AutomationError::Engine(msg) => TrackerError::Automation(msg),
            })?;

        let result = self.extract_from_popup(popup.as_mut()).await;
        popup.close().await;
        result
    }

    /// ポップアップ内でセクションを特定し、行を抽出する
    async fn extract_from_popup(
        &self,
        popup: &mut dyn PortalWindow,
    ) -> Result<Vec<StatusHistoryEntry>, TrackerError> {
        // 診断用: 現時点で見えているセクション見出しを出力
        if let Ok(titles) = popup.section_titles(SECTION_SELECTOR).await {
            for title in &titles {
                debug!("セクション見出しを検出: \"{}\"", title);
            }
        }

        info!("'{}' セクションの読み込みを待機中...", STATUS_SECTION_LABEL);
        let located = popup
            .wait_for_labeled_section(
                SECTION_SELECTOR,
                STATUS_SECTION_LABEL,
                self.config.section_timeout,
            )
            .await
            .map_err(automation)?;
        if !located {
            return Err(TrackerError::SectionNotFound(
                STATUS_SECTION_LABEL.to_string(),
            ));
        }

        let rows = popup
            .rows_near_label(
                SECTION_SELECTOR,
                STATUS_SECTION_LABEL,
                SECTION_CONTAINER_SELECTOR,
                STATUS_ROW_SELECTOR,
            )
            .await
            .map_err(automation)?;

        // セルが2つ未満の行は読み飛ばす。セル0=タイムスタンプ、セル1=ステータス
        let mut entries = Vec::new();
        for cells in rows {
            if cells.len() < 2 {
                debug!("セル数 {} の不正な行をスキップ", cells.len());
                continue;
            }
            let entry = StatusHistoryEntry::new(cells[0].clone(), cells[1].clone());
            info!("行: {} | {}", entry.timestamp, entry.status_code);
            entries.push(entry);
        }

        if entries.is_empty() {
            // 行ゼロはエラーではない（「読み込めたが空」のシグナル）
            warn!("テーブルは読み込めましたが、ステータス行がありません");
        } else {
            info!("{} 件のステータス履歴を抽出しました", entries.len());
        }

        Ok(entries)
    }
}

fn automation(e: AutomationError) -> TrackerError {
    TrackerError::Automation(e.to_string())
}

#[async_trait]
impl StatusSource for StatusScraper {
    async fn fetch_status_history(
        &self,
        tracking_number: &str,
    ) -> Result<Vec<StatusHistoryEntry>, TrackerError> {
        info!("ブラウザセッションを起動中...");
        let mut session = self
            .engine
            .open_session()
            .await
            .map_err(|e| TrackerError::Automation(e.to_string()))?;

        let result = self.run(session.as_mut(), tracking_number).await;

        if result.is_err() && self.config.debug {
            // デバッグスクリーンショット
            if let Ok(bytes) = session.screenshot().await {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                debug!("失敗時スクリーンショット: data:image/png;base64,{}", encoded);
            }
        }

        session.close().await;
        result
    }
}
