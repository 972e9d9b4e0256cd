//! Release trigger handed to the file-generation collaborator
//!
//! When a bucket enters GENERATING the lifecycle manager builds a
//! `ReleaseNotice` and hands it to a `ReleaseSink`. The collaborator later
//! reports back through `LifecycleManager::complete_generation` or
//! `LifecycleManager::fail_generation`.

use super::types::ReleaseNotice;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error("release channel closed")]
    ChannelClosed,
    #[error("release channel full ({0} slots)")]
    ChannelFull(usize),
}

#[async_trait]
pub trait ReleaseSink: Send + Sync {
    async fn release(&self, notice: ReleaseNotice) -> Result<(), ReleaseError>;
}

/// Forwards notices to an in-process consumer over a bounded channel
///
/// Never waits for a free slot: a full channel is a delivery failure, and
/// the lifecycle manager fails the bucket so an operator can redrive it.
pub struct ChannelReleaseSink {
    tx: mpsc::Sender<ReleaseNotice>,
}

impl ChannelReleaseSink {
    pub fn new(tx: mpsc::Sender<ReleaseNotice>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end, with `buffer` slots
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ReleaseNotice>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl ReleaseSink for ChannelReleaseSink {
    async fn release(&self, notice: ReleaseNotice) -> Result<(), ReleaseError> {
        let capacity = self.tx.capacity();
        let max_capacity = self.tx.max_capacity();
        if capacity < max_capacity / 10 {
            log::warn!(
                "⚠️  Release channel nearly full: {}/{} slots free",
                capacity,
                max_capacity
            );
        }

        self.tx.try_send(notice).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ReleaseError::ChannelFull(max_capacity),
            mpsc::error::TrySendError::Closed(_) => ReleaseError::ChannelClosed,
        })
    }
}

/// Logs notices; used where nothing consumes them in-process (operator CLI)
pub struct LogReleaseSink;

#[async_trait]
impl ReleaseSink for LogReleaseSink {
    async fn release(&self, notice: ReleaseNotice) -> Result<(), ReleaseError> {
        log::info!(
            "📤 Bucket {} ready for release: {} claims, total {} (payer {}, payee {})",
            notice.bucket_id,
            notice.claim_count,
            notice.total_amount,
            notice.payer_key,
            notice.payee_key
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn notice(bucket_id: i64) -> ReleaseNotice {
        ReleaseNotice {
            bucket_id,
            rule_id: 1,
            payer_key: "P1".to_string(),
            payee_key: "PE1".to_string(),
            bin_number: None,
            pcn: None,
            claim_count: 2,
            total_amount: Decimal::from(100),
            claim_ids: vec!["C1".to_string(), "C2".to_string()],
            released_at: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelReleaseSink::channel(4);
        sink.release(notice(7)).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.bucket_id, 7);
        assert_eq!(received.claim_ids.len(), 2);
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed_receiver() {
        let (sink, rx) = ChannelReleaseSink::channel(4);
        drop(rx);
        assert!(matches!(
            sink.release(notice(1)).await,
            Err(ReleaseError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_channel_sink_reports_full_channel_without_waiting() {
        let (sink, mut rx) = ChannelReleaseSink::channel(1);
        sink.release(notice(1)).await.unwrap();

        let second = tokio::time::timeout(std::time::Duration::from_secs(1), sink.release(notice(2)))
            .await
            .unwrap();
        assert!(matches!(second, Err(ReleaseError::ChannelFull(1))));

        assert_eq!(rx.recv().await.unwrap().bucket_id, 1);
        sink.release(notice(3)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().bucket_id, 3);
    }
}
