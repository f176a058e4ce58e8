//! The per-slot execution state machine.
//!
//! Each slot bucket runs as its own task: acquire a connection, write the
//! pipeline, await the responses, and either finish, redirect, or retry.
//! `attempt` is an explicit counter driven by the loop; redirects re-enter
//! at the same count, timeouts consume it.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use log::trace;
use tokio::{
    sync::oneshot,
    time::{sleep_until, timeout, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::{CommandFrame, NodeConnection},
    errors::{ErrorKind, KvError},
    routing::{NodeSource, Redirect, Router},
    types::KvResult,
};

use super::{BatchContext, SlotBucket};

/// Completion of the whole batch: resolved once, by the last slot to
/// succeed or the first to fail. Failing also cancels the token so peer
/// slots abort at their next checkpoint.
pub(super) struct Joined {
    sender: Mutex<Option<oneshot::Sender<KvResult<()>>>>,
    pub(super) token: CancellationToken,
}

impl Joined {
    pub(super) fn new(token: CancellationToken) -> (Arc<Self>, oneshot::Receiver<KvResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let joined = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            token,
        });
        (joined, rx)
    }

    pub(super) fn complete(&self) {
        if let Some(tx) = self.sender.lock().unwrap().take() {
            let _ = tx.send(Ok(()));
        }
    }

    pub(super) fn fail(&self, err: KvError) {
        if let Some(tx) = self.sender.lock().unwrap().take() {
            let _ = tx.send(Err(err));
        }
        self.token.cancel();
    }
}

#[derive(Debug)]
enum AttemptOutcome {
    /// Every command in the pipeline has its response.
    Success,
    /// The server pointed elsewhere; re-dispatch there at the same
    /// attempt count.
    Redirected(NodeSource),
    /// The server is warming up; re-dispatch to the same source at the
    /// same attempt count.
    Loading,
    /// The attempt failed in a way that consumes retry budget.
    Retryable(KvError),
    /// The attempt failed the whole batch.
    Fatal(KvError),
}

/// Drives one slot bucket to completion.
pub(super) async fn run_slot<R: Router>(
    ctx: Arc<BatchContext<R>>,
    bucket: Arc<SlotBucket>,
    mut source: NodeSource,
    joined: Arc<Joined>,
    remaining: Arc<AtomicUsize>,
) {
    let mut attempt: u32 = 0;
    loop {
        if joined.token.is_cancelled() {
            return;
        }
        let Some(_permit) = ctx.latch.acquire() else {
            joined.fail((ErrorKind::Shutdown, "client is shutting down").into());
            return;
        };
        let outcome = tokio::select! {
            _ = joined.token.cancelled() => return,
            outcome = run_attempt(&ctx, &bucket, &source) => outcome,
        };
        match outcome {
            AttemptOutcome::Success => {
                trace!("slot {} pipeline completed", source.slot());
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    joined.complete();
                }
                return;
            }
            AttemptOutcome::Redirected(next) => {
                trace!("slot {} redirected to {:?}", source.slot(), next.address());
                bucket.clear_errors();
                source = next;
            }
            AttemptOutcome::Loading => {
                trace!("slot {} target is loading, repeating", source.slot());
                bucket.clear_errors();
            }
            AttemptOutcome::Retryable(cause) => {
                if attempt >= ctx.params.retry_attempts {
                    joined.fail(exhausted(cause));
                    return;
                }
                attempt = attempt.saturating_add(1);
            }
            AttemptOutcome::Fatal(err) => {
                joined.fail(err);
                return;
            }
        }
    }
}

/// One (acquire, write, await) triple.
///
/// The retry window gates everything up to the write flush; acquisition
/// and write failures record their cause but still wait the window out, so
/// retries stay paced. Once the write flushed, the response timeout takes
/// over — a connection that stalls between acquire and write is bounded by
/// the window alone.
async fn run_attempt<R: Router>(
    ctx: &BatchContext<R>,
    bucket: &SlotBucket,
    source: &NodeSource,
) -> AttemptOutcome {
    let deadline = Instant::now() + ctx.params.retry_window();
    let completion = match timeout_at(deadline, acquire_and_send(ctx, bucket, source)).await {
        Err(_) => {
            return AttemptOutcome::Retryable(
                (
                    ErrorKind::OperationTimeout,
                    "batch command execution timed out",
                )
                    .into(),
            )
        }
        Ok(Err(cause)) => {
            sleep_until(deadline).await;
            return AttemptOutcome::Retryable(cause);
        }
        Ok(Ok(completion)) => completion,
    };
    match timeout(ctx.params.response_timeout, completion).await {
        Err(_) => AttemptOutcome::Retryable(
            (
                ErrorKind::ResponseTimeout,
                "no response to command batch within the response timeout",
            )
                .into(),
        ),
        Ok(Err(_dropped)) => AttemptOutcome::Retryable(
            (
                ErrorKind::WriteFailed,
                "connection dropped the command frame",
            )
                .into(),
        ),
        Ok(Ok(Ok(()))) => AttemptOutcome::Success,
        Ok(Ok(Err(err))) => classify(err),
    }
}

/// Acquires a connection (replica for read-only buckets, master
/// otherwise), writes the pipeline as one frame, and releases the
/// connection. Returns the frame-completion receiver.
async fn acquire_and_send<R: Router>(
    ctx: &BatchContext<R>,
    bucket: &SlotBucket,
    source: &NodeSource,
) -> KvResult<oneshot::Receiver<KvResult<()>>> {
    let conn = if bucket.is_read_only() {
        ctx.router.acquire_read(source).await?
    } else {
        ctx.router.acquire_write(source).await?
    };
    let (tx, rx) = oneshot::channel();
    let frame = CommandFrame {
        commands: bucket.unfinished(),
        asking: source.is_ask(),
        completion: tx,
    };
    conn.send_frame(frame).await.map_err(|err| -> KvError {
        if err.kind() == ErrorKind::WriteFailed {
            err
        } else {
            (
                ErrorKind::WriteFailed,
                "failed writing command batch to connection",
                err.to_string(),
            )
                .into()
        }
    })?;
    // Responses arrive on the channel independent of pool occupancy, so
    // the connection goes back to its entry right after the flush.
    drop(conn);
    Ok(rx)
}

fn classify(err: KvError) -> AttemptOutcome {
    let node = err
        .redirect_node()
        .map(|(addr, slot)| (addr.to_string(), slot));
    match err.kind() {
        ErrorKind::Moved => match node {
            Some((addr, slot)) => {
                AttemptOutcome::Redirected(NodeSource::redirected(slot, Redirect::Moved(addr)))
            }
            None => AttemptOutcome::Fatal(err),
        },
        ErrorKind::Ask => match node {
            Some((addr, slot)) => {
                AttemptOutcome::Redirected(NodeSource::redirected(slot, Redirect::Ask(addr)))
            }
            None => AttemptOutcome::Fatal(err),
        },
        ErrorKind::BusyLoading => AttemptOutcome::Loading,
        _ if err.is_retryable() => AttemptOutcome::Retryable(err),
        _ => AttemptOutcome::Fatal(err),
    }
}

/// The error surfaced when the retry budget runs out. Suppressed replies
/// surface as an operation timeout; other captured causes pass through.
fn exhausted(last_cause: KvError) -> KvError {
    if last_cause.kind() == ErrorKind::ResponseTimeout {
        (
            ErrorKind::OperationTimeout,
            "batch command execution timed out",
            last_cause.to_string(),
        )
            .into()
    } else {
        last_cause
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_turns_redirects_into_new_sources() {
        let outcome = classify(KvError::moved(100, "x:6379"));
        match outcome {
            AttemptOutcome::Redirected(source) => {
                assert_eq!(source.slot(), 100);
                assert_eq!(source.address(), Some("x:6379"));
                assert!(!source.is_ask());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let outcome = classify(KvError::ask(42, "y:6379"));
        match outcome {
            AttemptOutcome::Redirected(source) => assert!(source.is_ask()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn classify_recognizes_loading_and_fatal() {
        assert!(matches!(
            classify((ErrorKind::BusyLoading, "loading").into()),
            AttemptOutcome::Loading
        ));
        assert!(matches!(
            classify((ErrorKind::ResponseError, "wrong type").into()),
            AttemptOutcome::Fatal(_)
        ));
        assert!(matches!(
            classify((ErrorKind::WriteFailed, "broken pipe").into()),
            AttemptOutcome::Retryable(_)
        ));
    }

    #[test]
    fn exhaustion_surfaces_operation_timeout_for_suppressed_replies() {
        let err = exhausted((ErrorKind::ResponseTimeout, "late").into());
        assert_eq!(err.kind(), ErrorKind::OperationTimeout);

        let err = exhausted(KvError::pool_exhausted(vec![], vec![]));
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
    }
}
