//! Lifecycle controller for the background extraction loop.

use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::worker::{extraction_loop, FrameCapture, PipelineContext};

pub struct ExtractionController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
    drain_tx: Option<watch::Sender<bool>>,
}

impl ExtractionController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            drain_tx: None,
        }
    }

    /// Spawns the extraction loop over an externally fed frame channel.
    /// `activity_rx` carries the host's foreground-activity signal;
    /// extraction pauses while it reads `true`.
    pub fn start(
        &mut self,
        ctx: PipelineContext,
        frames: mpsc::Receiver<FrameCapture>,
        activity_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("extraction already active");
        }

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();

        // Drain channel: false = normal operation, true = finish the
        // in-flight frame, then exit.
        let (drain_tx, drain_rx) = watch::channel(false);

        let handle = tokio::spawn(extraction_loop(
            ctx,
            frames,
            activity_rx,
            token_clone,
            drain_rx,
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.drain_tx = Some(drain_tx);
        Ok(())
    }

    /// Finish the current frame but accept no more.
    pub fn drain(&mut self) {
        if let Some(tx) = &self.drain_tx {
            let _ = tx.send(true);
            info!("Drain signal sent to extraction loop");
        }
    }

    /// Abandons in-flight model calls; partial results for the current
    /// frame are discarded, not persisted.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("extraction loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for ExtractionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtractionConfig;
    use crate::db::Database;
    use crate::ocr::NullOcr;
    use crate::vision::mock::ScriptedBackend;
    use std::sync::Arc;

    fn test_context() -> PipelineContext {
        PipelineContext::new(
            Arc::new(ScriptedBackend::unreachable()),
            Arc::new(NullOcr),
            Database::open_in_memory().unwrap(),
            ExtractionConfig {
                parse_retry_cap: 0,
                retry_backoff_base_ms: 1,
                ..ExtractionConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let mut controller = ExtractionController::new();
        let (_frame_tx, frame_rx) = mpsc::channel(4);
        let (_frame_tx2, frame_rx2) = mpsc::channel(4);
        let (_activity_tx, activity_rx) = watch::channel(false);

        controller
            .start(test_context(), frame_rx, activity_rx.clone())
            .unwrap();
        assert!(controller
            .start(test_context(), frame_rx2, activity_rx)
            .is_err());
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let mut controller = ExtractionController::new();
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_stops_loop_promptly() {
        let mut controller = ExtractionController::new();
        let (_frame_tx, frame_rx) = mpsc::channel::<FrameCapture>(4);
        // Host reports active use the whole time; the loop must still
        // shut down on cancel.
        let (_activity_tx, activity_rx) = watch::channel(true);

        controller
            .start(test_context(), frame_rx, activity_rx)
            .unwrap();
        controller.stop().await.unwrap();
    }
}
