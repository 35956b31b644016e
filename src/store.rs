//! 購読ストア
//!
//! クライアントと追跡番号の対応を保持するCRUDインターフェース。
//! SQLite実装は操作ごとに接続を開いて閉じる（短命トランザクション）。
//! 接続を保持しないため、スケジューラとゲートウェイから並行に呼べる。

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::TrackerError;
use crate::types::ClientKey;

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// テーブルを作成する（存在すれば何もしない）
    async fn init_schema(&self) -> Result<(), TrackerError>;

    /// クライアントを登録する。同名が既にあれば接続IDを付け替える
    async fn upsert_client(&self, connection_id: &str, name: &str) -> Result<(), TrackerError>;

    /// 接続IDを名前に解決してから購読行を追加する
    ///
    /// 接続がまだクライアントとして登録されていなければ何もしない
    /// （クライアント登録が先、という呼び出し側の契約）。
    async fn add_subscription(
        &self,
        connection_id: &str,
        tracking_number: &str,
    ) -> Result<(), TrackerError>;

    /// 全購読のスナップショット
    async fn list_all(&self) -> Result<HashMap<ClientKey, Vec<String>>, TrackerError>;

    /// クライアントを削除する。購読行もカスケード削除する
    async fn remove_client(&self, name: &str) -> Result<(), TrackerError>;

    /// 接続IDからクライアント名を引く
    async fn client_name(&self, connection_id: &str) -> Result<Option<String>, TrackerError>;

    /// クライアント名で購読中の追跡番号を引く
    async fn tracking_numbers(&self, name: &str) -> Result<Vec<String>, TrackerError>;
}

/// SQLiteベースの購読ストア
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// 接続を開いて1操作を実行し、閉じる
    async fn with_conn<T, F>(&self, op: F) -> Result<T, TrackerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| TrackerError::Persistence(e.to_string()))?
        .map_err(TrackerError::from)
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn init_schema(&self) -> Result<(), TrackerError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS Clients (
                    ClientId TEXT NOT NULL,
                    Name TEXT PRIMARY KEY NOT NULL
                );

                CREATE TABLE IF NOT EXISTS TrackingNumbers (
                    ClientName TEXT NOT NULL,
                    TrackingNumber TEXT NOT NULL,
                    PRIMARY KEY (ClientName, TrackingNumber),
                    FOREIGN KEY (ClientName) REFERENCES Clients(Name)
                );
                ",
            )
        })
        .await
    }

    async fn upsert_client(&self, connection_id: &str, name: &str) -> Result<(), TrackerError> {
        let connection_id = connection_id.to_string();
        let name = name.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO Clients (ClientId, Name) VALUES (?1, ?2)
                 ON CONFLICT(Name) DO UPDATE SET ClientId = excluded.ClientId",
                params![connection_id, name],
            )?;
            Ok(())
        })
        .await
    }

    async fn add_subscription(
        &self,
        connection_id: &str,
        tracking_number: &str,
    ) -> Result<(), TrackerError> {
        let connection_id = connection_id.to_string();
        let tracking_number = tracking_number.to_string();
        self.with_conn(move |conn| {
            let client_name: Option<String> = conn
                .query_row(
                    "SELECT Name FROM Clients WHERE ClientId = ?1",
                    params![connection_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(client_name) = client_name else {
                debug!(
                    "接続 {} は未登録クライアントのため購読をスキップ",
                    connection_id
                );
                return Ok(());
            };

            conn.execute(
                "INSERT INTO TrackingNumbers (ClientName, TrackingNumber) VALUES (?1, ?2)
                 ON CONFLICT(ClientName, TrackingNumber) DO NOTHING",
                params![client_name, tracking_number],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_all(&self) -> Result<HashMap<ClientKey, Vec<String>>, TrackerError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.ClientId, t.ClientName, t.TrackingNumber
                 FROM TrackingNumbers t
                 JOIN Clients c ON c.Name = t.ClientName",
            )?;

            let mut snapshot: HashMap<ClientKey, Vec<String>> = HashMap::new();
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            for row in rows {
                let (connection_id, name, tracking_number) = row?;
                snapshot
                    .entry(ClientKey {
                        connection_id,
                        name,
                    })
                    .or_default()
                    .push(tracking_number);
            }

            Ok(snapshot)
        })
        .await
    }

    async fn remove_client(&self, name: &str) -> Result<(), TrackerError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM TrackingNumbers WHERE ClientName = ?1",
                params![name],
            )?;
            tx.execute("DELETE FROM Clients WHERE Name = ?1", params![name])?;
            tx.commit()
        })
        .await
    }

    async fn client_name(&self, connection_id: &str) -> Result<Option<String>, TrackerError> {
        let connection_id = connection_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT Name FROM Clients WHERE ClientId = ?1",
                params![connection_id],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn tracking_numbers(&self, name: &str) -> Result<Vec<String>, TrackerError> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT TrackingNumber FROM TrackingNumbers WHERE ClientName = ?1",
            )?;
            let numbers = stmt
                .query_map(params![name], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(numbers)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (SqliteStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("tracking.db"));
        store.init_schema().await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (store, _dir) = open_store().await;
        store.upsert_client("conn-1", "Acme").await.unwrap();
        store.add_subscription("conn-1", "TN123").await.unwrap();
        store.add_subscription("conn-1", "TN123").await.unwrap();

        let numbers = store.tracking_numbers("Acme").await.unwrap();
        assert_eq!(numbers, vec!["TN123".to_string()]);
    }

    #[tokio::test]
    async fn test_reconnect_rebinds_connection_id() {
        let (store, _dir) = open_store().await;
        store.upsert_client("conn-a", "Acme").await.unwrap();
        store.add_subscription("conn-a", "TN123").await.unwrap();

        // 同名クライアントが別接続から再登録
        store.upsert_client("conn-b", "Acme").await.unwrap();

        assert_eq!(
            store.client_name("conn-b").await.unwrap(),
            Some("Acme".to_string())
        );
        assert_eq!(store.client_name("conn-a").await.unwrap(), None);

        // 購読は温存される
        let numbers = store.tracking_numbers("Acme").await.unwrap();
        assert_eq!(numbers, vec!["TN123".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_client_cascades() {
        let (store, _dir) = open_store().await;
        store.upsert_client("conn-1", "Acme").await.unwrap();
        store.add_subscription("conn-1", "TN123").await.unwrap();
        store.add_subscription("conn-1", "TN456").await.unwrap();

        store.remove_client("Acme").await.unwrap();

        assert!(store.tracking_numbers("Acme").await.unwrap().is_empty());
        assert_eq!(store.client_name("conn-1").await.unwrap(), None);
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_without_client_is_noop() {
        let (store, _dir) = open_store().await;
        store.add_subscription("ghost-conn", "TN123").await.unwrap();
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_all_groups_by_client() {
        let (store, _dir) = open_store().await;
        store.upsert_client("conn-1", "Acme").await.unwrap();
        store.add_subscription("conn-1", "TN123").await.unwrap();
        store.add_subscription("conn-1", "TN456").await.unwrap();
        store.upsert_client("conn-2", "Globex").await.unwrap();
        store.add_subscription("conn-2", "TN789").await.unwrap();

        let snapshot = store.list_all().await.unwrap();
        assert_eq!(snapshot.len(), 2);

        let acme = ClientKey {
            connection_id: "conn-1".to_string(),
            name: "Acme".to_string(),
        };
        let mut acme_numbers = snapshot.get(&acme).unwrap().clone();
        acme_numbers.sort();
        assert_eq!(acme_numbers, vec!["TN123".to_string(), "TN456".to_string()]);
    }

    #[tokio::test]
    async fn test_same_number_watched_by_two_clients() {
        let (store, _dir) = open_store().await;
        store.upsert_client("conn-1", "Acme").await.unwrap();
        store.add_subscription("conn-1", "TN123").await.unwrap();
        store.upsert_client("conn-2", "Globex").await.unwrap();
        store.add_subscription("conn-2", "TN123").await.unwrap();

        assert_eq!(
            store.tracking_numbers("Acme").await.unwrap(),
            vec!["TN123".to_string()]
        );
        assert_eq!(
            store.tracking_numbers("Globex").await.unwrap(),
            vec!["TN123".to_string()]
        );
    }
}
