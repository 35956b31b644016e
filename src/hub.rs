//! ディスパッチゲートウェイ
//!
//! クライアント接続と購読ストア・スクレイプ結果の橋渡し。
//! 「どの接続が今クライアント名Xに届くか」はここのレジストリだけが管理する。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::TrackerError;
use crate::store::SubscriptionStore;
use crate::traits::StatusSource;
use crate::types::StatusHistoryEntry;

/// プッシュトランスポートの境界: 「接続Cへメッセージを送る」
#[async_trait]
pub trait UpdatePublisher: Send + Sync {
    /// `Update` イベントを1接続へ送信する
    async fn publish_update(
        &self,
        connection_id: &str,
        entries: &[StatusHistoryEntry],
    ) -> Result<(), TrackerError>;
}

/// ライブ接続の双方向インデックス
///
/// 接続ID→名前と名前→接続ID集合を同一ロック下で更新する。
#[derive(Debug, Default)]
struct ConnectionRegistry {
    name_by_connection: HashMap<String, String>,
    connections_by_name: HashMap<String, HashSet<String>>,
}

impl ConnectionRegistry {
    fn bind(&mut self, connection_id: &str, name: &str) {
        // 同じ接続が別名に付いていたら外す
        if let Some(old_name) = self
            .name_by_connection
            .insert(connection_id.to_string(), name.to_string())
        {
            if old_name != name {
                if let Some(set) = self.connections_by_name.get_mut(&old_name) {
                    set.remove(connection_id);
                    if set.is_empty() {
                        self.connections_by_name.remove(&old_name);
                    }
                }
            }
        }

        self.connections_by_name
            .entry(name.to_string())
            .or_default()
            .insert(connection_id.to_string());
    }

    fn unbind(&mut self, connection_id: &str) {
        if let Some(name) = self.name_by_connection.remove(connection_id) {
            if let Some(set) = self.connections_by_name.get_mut(&name) {
                set.remove(connection_id);
                if set.is_empty() {
                    self.connections_by_name.remove(&name);
                }
            }
        }
    }

    fn connections_for(&self, name: &str) -> Vec<String> {
        self.connections_by_name
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// 追跡ハブ
pub struct TrackerHub {
    store: Arc<dyn SubscriptionStore>,
    publisher: Arc<dyn UpdatePublisher>,
    source: Arc<dyn StatusSource>,
    registry: RwLock<ConnectionRegistry>,
}

impl TrackerHub {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        publisher: Arc<dyn UpdatePublisher>,
        source: Arc<dyn StatusSource>,
    ) -> Self {
        Self {
            store,
            publisher,
            source,
            registry: RwLock::new(ConnectionRegistry::default()),
        }
    }

    /// クライアントが追跡番号の監視を登録する
    ///
    /// 空白のみの引数は `InvalidArgument`。ストアは変更しない。
    pub async fn register_tracking_number(
        &self,
        connection_id: &str,
        client_name: &str,
        tracking_number: &str,
    ) -> Result<(), TrackerError> {
        if client_name.trim().is_empty() || tracking_number.trim().is_empty() {
            return Err(TrackerError::InvalidArgument(
                "クライアント名と追跡番号は空にできません".to_string(),
            ));
        }

        self.store.upsert_client(connection_id, client_name).await?;
        self.store
            .add_subscription(connection_id, tracking_number)
            .await?;

        self.registry.write().await.bind(connection_id, client_name);

        info!(
            "クライアント {} ({}) が追跡番号の監視を登録: {}",
            client_name, connection_id, tracking_number
        );
        Ok(())
    }

    /// スケジューラの周期を待たずに1件を即時取得して配信する
    ///
    /// クライアントがその番号を購読していなければログだけ残して何もしない。
    pub async fn request_status_refresh(
        &self,
        connection_id: &str,
        client_name: &str,
        tracking_number: &str,
    ) -> Result<(), TrackerError> {
        let subscriptions = match self.store.tracking_numbers(client_name).await {
            Ok(numbers) => numbers,
            Err(e) => {
                // 読み取り失敗は「購読なし」として扱う
                warn!("{} の購読読み取りに失敗: {}", client_name, e);
                Vec::new()
            }
        };

        if !subscriptions.iter().any(|n| n == tracking_number) {
            warn!(
                "クライアント {} ({}) は追跡番号 {} を購読していません",
                client_name, connection_id, tracking_number
            );
            return Ok(());
        }

        info!(
            "クライアント {} ({}) が {} の即時更新を要求",
            client_name, connection_id, tracking_number
        );
        let _ = self.fetch_and_dispatch(client_name, tracking_number).await;
        Ok(())
    }

    /// 1 (クライアント, 追跡番号) の取得と配信
    ///
    /// スケジューラとオンデマンド更新の共通経路。スクレイプ失敗は
    /// ここでログに落とし、接続側には何も届かない。
    pub async fn fetch_and_dispatch(
        &self,
        client_name: &str,
        tracking_number: &str,
    ) -> Result<(), TrackerError> {
        match self.source.fetch_status_history(tracking_number).await {
            Ok(entries) => {
                self.dispatch_update(client_name, &entries).await;
                Ok(())
            }
            Err(e) => {
                warn!(
                    "スクレイプ失敗 (クライアント {}, 追跡番号 {}): {}",
                    client_name, tracking_number, e
                );
                Err(e)
            }
        }
    }

    /// `Update` イベントを名前に紐付く全ライブ接続へ送る
    ///
    /// ライブ接続がなければ破棄する（オフライン配送はしない）。
    pub async fn dispatch_update(&self, client_name: &str, entries: &[StatusHistoryEntry]) {
        let connections = self.registry.read().await.connections_for(client_name);

        if connections.is_empty() {
            debug!(
                "クライアント {} のライブ接続なし、{} 件を破棄",
                client_name,
                entries.len()
            );
            return;
        }

        for connection_id in connections {
            if let Err(e) = self.publisher.publish_update(&connection_id, entries).await {
                warn!("接続 {} への更新送信に失敗: {}", connection_id, e);
            }
        }
    }

    /// 接続断。レジストリからのみ外す（ストアのクライアント行は残す）
    pub async fn on_disconnect(&self, connection_id: &str) {
        self.registry.write().await.unbind(connection_id);
        debug!("接続 {} の紐付けを解除", connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use crate::types::ClientKey;
    use tokio::sync::Mutex;

    /// 送信済みイベントを記録するだけのパブリッシャ
    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, Vec<StatusHistoryEntry>)>>,
    }

    #[async_trait]
    impl UpdatePublisher for RecordingPublisher {
        async fn publish_update(
            &self,
            connection_id: &str,
            entries: &[StatusHistoryEntry],
        ) -> Result<(), TrackerError> {
            self.sent
                .lock()
                .await
                .push((connection_id.to_string(), entries.to_vec()));
            Ok(())
        }
    }

    /// 追跡番号ごとに固定の履歴を返すソース
    struct FixedSource {
        entries: Vec<StatusHistoryEntry>,
    }

    #[async_trait]
    impl StatusSource for FixedSource {
        async fn fetch_status_history(
            &self,
            _tracking_number: &str,
        ) -> Result<Vec<StatusHistoryEntry>, TrackerError> {
            Ok(self.entries.clone())
        }
    }

    /// 全操作が永続化エラーになるストア
    struct FailingStore;

    #[async_trait]
    impl SubscriptionStore for FailingStore {
        async fn init_schema(&self) -> Result<(), TrackerError> {
            Err(TrackerError::Persistence("database is locked".to_string()))
        }

        async fn upsert_client(&self, _id: &str, _name: &str) -> Result<(), TrackerError> {
            Err(TrackerError::Persistence("database is locked".to_string()))
        }

        async fn add_subscription(&self, _id: &str, _number: &str) -> Result<(), TrackerError> {
            Err(TrackerError::Persistence("database is locked".to_string()))
        }

        async fn list_all(&self) -> Result<HashMap<ClientKey, Vec<String>>, TrackerError> {
            Err(TrackerError::Persistence("database is locked".to_string()))
        }

        async fn remove_client(&self, _name: &str) -> Result<(), TrackerError> {
            Err(TrackerError::Persistence("database is locked".to_string()))
        }

        async fn client_name(&self, _id: &str) -> Result<Option<String>, TrackerError> {
            Err(TrackerError::Persistence("database is locked".to_string()))
        }

        async fn tracking_numbers(&self, _name: &str) -> Result<Vec<String>, TrackerError> {
            Err(TrackerError::Persistence("database is locked".to_string()))
        }
    }

    async fn hub_with_entries(
        entries: Vec<StatusHistoryEntry>,
    ) -> (Arc<TrackerHub>, Arc<RecordingPublisher>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::new(dir.path().join("tracking.db")));
        store.init_schema().await.unwrap();
        let publisher = Arc::new(RecordingPublisher::default());
        let hub = Arc::new(TrackerHub::new(
            store,
            publisher.clone(),
            Arc::new(FixedSource { entries }),
        ));
        (hub, publisher, dir)
    }

    #[tokio::test]
    async fn test_blank_arguments_are_rejected_without_mutation() {
        let (hub, _publisher, _dir) = hub_with_entries(Vec::new()).await;

        for (name, number) in [("", "TN123"), ("   ", "TN123"), ("Bob", ""), ("Bob", "  ")] {
            let err = hub
                .register_tracking_number("conn-1", name, number)
                .await
                .unwrap_err();
            assert!(matches!(err, TrackerError::InvalidArgument(_)));
        }

        assert!(hub.store.list_all().await.unwrap().is_empty());
        assert_eq!(hub.store.client_name("conn-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_register_twice_keeps_single_subscription() {
        let (hub, _publisher, _dir) = hub_with_entries(Vec::new()).await;
        hub.register_tracking_number("conn-1", "Acme", "TN123")
            .await
            .unwrap();
        hub.register_tracking_number("conn-1", "Acme", "TN123")
            .await
            .unwrap();

        assert_eq!(
            hub.store.tracking_numbers("Acme").await.unwrap(),
            vec!["TN123".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reconnect_routes_to_new_connection_only() {
        let entries = vec![StatusHistoryEntry::new("2024-01-01 10:00", "Picked Up")];
        let (hub, publisher, _dir) = hub_with_entries(entries.clone()).await;

        hub.register_tracking_number("conn-a", "Acme", "TN123")
            .await
            .unwrap();
        hub.on_disconnect("conn-a").await;
        hub.register_tracking_number("conn-b", "Acme", "TN123")
            .await
            .unwrap();

        hub.fetch_and_dispatch("Acme", "TN123").await.unwrap();

        let sent = publisher.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "conn-b");
        assert_eq!(sent[0].1, entries);
    }

    #[tokio::test]
    async fn test_end_to_end_update_reaches_only_subscriber() {
        let entries = vec![
            StatusHistoryEntry::new("2024-01-01 10:00", "Picked Up"),
            StatusHistoryEntry::new("2024-01-02 09:00", "Delivered"),
        ];
        let (hub, publisher, _dir) = hub_with_entries(entries.clone()).await;

        hub.register_tracking_number("conn-bob", "Bob", "TN123")
            .await
            .unwrap();
        hub.register_tracking_number("conn-carol", "Carol", "TN999")
            .await
            .unwrap();

        hub.fetch_and_dispatch("Bob", "TN123").await.unwrap();

        let sent = publisher.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "conn-bob");
        assert_eq!(sent[0].1, entries);
    }

    #[tokio::test]
    async fn test_update_dropped_without_live_connection() {
        let entries = vec![StatusHistoryEntry::new("2024-01-01 10:00", "Picked Up")];
        let (hub, publisher, _dir) = hub_with_entries(entries).await;

        hub.register_tracking_number("conn-1", "Acme", "TN123")
            .await
            .unwrap();
        hub.on_disconnect("conn-1").await;

        hub.fetch_and_dispatch("Acme", "TN123").await.unwrap();
        assert!(publisher.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_without_subscription_is_noop() {
        let entries = vec![StatusHistoryEntry::new("2024-01-01 10:00", "Picked Up")];
        let (hub, publisher, _dir) = hub_with_entries(entries).await;

        hub.register_tracking_number("conn-1", "Acme", "TN123")
            .await
            .unwrap();

        // 購読していない番号の更新要求は握りつぶされる
        hub.request_status_refresh("conn-1", "Acme", "TN999")
            .await
            .unwrap();
        assert!(publisher.sent.lock().await.is_empty());

        // 購読済みの番号なら配信される
        hub.request_status_refresh("conn-1", "Acme", "TN123")
            .await
            .unwrap();
        assert_eq!(publisher.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_treats_store_read_failure_as_no_subscriptions() {
        let entries = vec![StatusHistoryEntry::new("2024-01-01 10:00", "Picked Up")];
        let publisher = Arc::new(RecordingPublisher::default());
        let hub = TrackerHub::new(
            Arc::new(FailingStore),
            publisher.clone(),
            Arc::new(FixedSource { entries }),
        );

        // 購読読み取りが落ちても呼び出しは成功し、何も配信されない
        hub.request_status_refresh("conn-1", "Acme", "TN123")
            .await
            .unwrap();
        assert!(publisher.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_history_still_dispatches_one_update() {
        let (hub, publisher, _dir) = hub_with_entries(Vec::new()).await;

        hub.register_tracking_number("conn-1", "Acme", "TN123")
            .await
            .unwrap();
        hub.fetch_and_dispatch("Acme", "TN123").await.unwrap();

        let sent = publisher.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.is_empty());
    }
}
