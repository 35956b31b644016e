use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;
use tracing::info;

use crate::error::TrackerError;
use crate::traits::StatusSource;
use crate::types::StatusHistoryEntry;

/// 単発スクレイプのリクエスト
#[derive(Debug, Clone)]
pub struct ScrapeRequest {
    pub tracking_number: String,
}

impl ScrapeRequest {
    pub fn new(tracking_number: impl Into<String>) -> Self {
        Self {
            tracking_number: tracking_number.into(),
        }
    }
}

/// 単発スクレイプの結果
#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub tracking_number: String,
    pub entries: Vec<StatusHistoryEntry>,
}

/// tower::Serviceを実装したスクレイパーサービス
///
/// 組み込み先でレートリミットやタイムアウトのレイヤを重ねられる。
#[derive(Clone)]
pub struct TrackerService {
    source: Arc<dyn StatusSource>,
}

impl TrackerService {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self { source }
    }
}

impl Service<ScrapeRequest> for TrackerService {
    type Response = ScrapeResult;
    type Error = TrackerError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: ScrapeRequest) -> Self::Future {
        if req.tracking_number.trim().is_empty() {
            return Box::pin(async {
                Err(TrackerError::InvalidArgument(
                    "追跡番号は空にできません".to_string(),
                ))
            });
        }

        info!(
            "スクレイピングリクエスト受信: tracking_number={}",
            req.tracking_number
        );
        let source = self.source.clone();

        Box::pin(async move {
            let entries = source.fetch_status_history(&req.tracking_number).await?;

            info!(
                "スクレイピング完了: tracking_number={}, entries={}",
                req.tracking_number,
                entries.len()
            );

            Ok(ScrapeResult {
                tracking_number: req.tracking_number,
                entries,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubSource;

    #[async_trait]
    impl StatusSource for StubSource {
        async fn fetch_status_history(
            &self,
            _tracking_number: &str,
        ) -> Result<Vec<StatusHistoryEntry>, TrackerError> {
            Ok(vec![StatusHistoryEntry::new("2024-01-01 10:00", "Picked Up")])
        }
    }

    #[tokio::test]
    async fn test_service_forwards_to_source() {
        let mut service = TrackerService::new(Arc::new(StubSource));
        let result = service.call(ScrapeRequest::new("TN123")).await.unwrap();
        assert_eq!(result.tracking_number, "TN123");
        assert_eq!(result.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_blank_tracking_number_is_rejected() {
        let mut service = TrackerService::new(Arc::new(StubSource));
        let err = service.call(ScrapeRequest::new("   ")).await.unwrap_err();
        assert!(matches!(err, TrackerError::InvalidArgument(_)));
    }
}
