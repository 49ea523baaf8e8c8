/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use log::{trace, warn};

use super::{DirectionOutcome, StreamShared};
use crate::native::{NativeRecvStream, NativeSendStream, NativeStreamError};
use crate::pipe::{PipeError, PipeReader, PipeWriter};
use crate::{ErrorCode, StreamError};

enum RecvStep {
    Cancelled,
    Read(Result<Option<usize>, NativeStreamError>),
}

/// Copy data from the native receive side into the input pipe.
///
/// The scratch buffer is handed back so that it can be reused.
pub(super) async fn recv_loop<R: NativeRecvStream>(
    mut recv: R,
    mut input: PipeWriter,
    shared: Arc<StreamShared>,
    mut buf: Vec<u8>,
) -> Vec<u8> {
    let token = shared.read_token.clone();

    let outcome = loop {
        let step = tokio::select! {
            biased;

            _ = token.cancelled() => RecvStep::Cancelled,
            r = recv.read(&mut buf) => RecvStep::Read(r),
        };

        let n = match step {
            RecvStep::Cancelled => {
                let (code, reason) = shared.read_abort_reason();
                recv.stop(code);
                input.complete(Some(reason));
                break DirectionOutcome::Aborted;
            }
            RecvStep::Read(Ok(Some(n))) => n,
            RecvStep::Read(Ok(None)) => {
                shared.set_read_eos();
                input.complete(None);
                break DirectionOutcome::Graceful;
            }
            RecvStep::Read(Err(e)) => {
                trace!("MUX[{}] stream read failed: {e}", shared.log_id());
                input.complete(Some(StreamError::from(e)));
                break DirectionOutcome::Aborted;
            }
        };
        if n == 0 {
            continue;
        }

        let flush = tokio::select! {
            biased;

            _ = token.cancelled() => None,
            r = input.write(&buf[..n]) => Some(r),
        };
        match flush {
            Some(Ok(r)) if !r.completed => {}
            Some(Ok(_)) | Some(Err(PipeError::Failed(_))) => {
                // the application stopped reading before the end of stream
                recv.stop(shared.error_code());
                break DirectionOutcome::Aborted;
            }
            Some(Err(e)) => {
                warn!("MUX[{}] input pipe unusable: {e}", shared.log_id());
                recv.stop(shared.error_code());
                break DirectionOutcome::Aborted;
            }
            None => {
                let (code, reason) = shared.read_abort_reason();
                recv.stop(code);
                input.complete(Some(reason));
                break DirectionOutcome::Aborted;
            }
        }
    };

    trace!("MUX[{}] recv loop exit: {outcome:?}", shared.log_id());
    shared.finish_read(outcome);
    buf
}

/// Copy data from the output pipe to the native send side.
pub(super) async fn send_loop<S: NativeSendStream>(
    mut send: S,
    mut output: PipeReader,
    shared: Arc<StreamShared>,
) {
    let token = shared.write_token.clone();

    let outcome = loop {
        let r = tokio::select! {
            biased;

            _ = token.cancelled() => None,
            r = output.read() => Some(r),
        };

        let result = match r {
            Some(Ok(result)) => result,
            Some(Err(PipeError::Failed(e))) => {
                trace!("MUX[{}] output completed with error: {e}", shared.log_id());
                send.reset(e.reset_code().unwrap_or_else(|| shared.error_code()));
                break DirectionOutcome::Aborted;
            }
            Some(Err(e)) => {
                warn!("MUX[{}] output pipe unusable: {e}", shared.log_id());
                send.reset(shared.error_code());
                break DirectionOutcome::Aborted;
            }
            None => {
                abort_send(&mut send, &mut output, &shared);
                break DirectionOutcome::Aborted;
            }
        };

        let len = result.data.len();
        if len > 0 {
            let r = tokio::select! {
                biased;

                _ = token.cancelled() => None,
                r = send.write_all(&result.data) => Some(r),
            };
            match r {
                Some(Ok(_)) => output.advance(len),
                Some(Err(e)) => {
                    trace!("MUX[{}] stream write failed: {e}", shared.log_id());
                    output.complete(Some(StreamError::from(e)));
                    break DirectionOutcome::Aborted;
                }
                None => {
                    abort_send(&mut send, &mut output, &shared);
                    break DirectionOutcome::Aborted;
                }
            }
        }

        if result.completed {
            match send.finish() {
                Ok(_) => break DirectionOutcome::Graceful,
                Err(e) => {
                    trace!("MUX[{}] stream finish failed: {e}", shared.log_id());
                    break DirectionOutcome::Aborted;
                }
            }
        }
    };

    trace!("MUX[{}] send loop exit: {outcome:?}", shared.log_id());
    shared.finish_write(outcome);
}

fn abort_send<S: NativeSendStream>(send: &mut S, output: &mut PipeReader, shared: &StreamShared) {
    let (code, reason): (ErrorCode, StreamError) = shared.write_abort_reason();
    send.reset(code);
    output.complete(Some(reason));
}
