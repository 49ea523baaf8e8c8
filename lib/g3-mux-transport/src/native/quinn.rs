/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::sync::Arc;

use async_trait::async_trait;
use quinn::{Connection, ConnectionError, Endpoint, ReadError, RecvStream, SendStream, VarInt, WriteError};

use super::{
    NativeConnection, NativeConnectionError, NativeListener, NativeRecvStream, NativeSendStream,
    NativeStream, NativeStreamError, StreamDirection,
};
use crate::ErrorCode;

fn to_var_int(code: ErrorCode) -> VarInt {
    VarInt::from_u64(code.into_inner()).unwrap_or(VarInt::MAX)
}

fn from_var_int(v: VarInt) -> ErrorCode {
    ErrorCode::new(v.into_inner()).unwrap_or(ErrorCode::MAX)
}

fn map_connection_error(e: ConnectionError) -> NativeConnectionError {
    match e {
        ConnectionError::ApplicationClosed(close) => {
            NativeConnectionError::ApplicationClosed(from_var_int(close.error_code))
        }
        ConnectionError::LocallyClosed => NativeConnectionError::LocallyClosed,
        ConnectionError::Reset => NativeConnectionError::Reset,
        ConnectionError::TimedOut => NativeConnectionError::TimedOut,
        e => NativeConnectionError::Other(Arc::from(e.to_string())),
    }
}

#[async_trait]
impl NativeRecvStream for RecvStream {
    async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, NativeStreamError> {
        RecvStream::read(self, buf).await.map_err(|e| match e {
            ReadError::Reset(code) => NativeStreamError::Reset(from_var_int(code)),
            ReadError::ConnectionLost(e) => {
                NativeStreamError::ConnectionLost(map_connection_error(e))
            }
            ReadError::ClosedStream => NativeStreamError::Closed,
            e => NativeStreamError::Other(Arc::from(e.to_string())),
        })
    }

    fn stop(&mut self, code: ErrorCode) {
        let _ = RecvStream::stop(self, to_var_int(code));
    }
}

#[async_trait]
impl NativeSendStream for SendStream {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), NativeStreamError> {
        SendStream::write_all(self, buf).await.map_err(|e| match e {
            WriteError::Stopped(code) => NativeStreamError::Stopped(from_var_int(code)),
            WriteError::ConnectionLost(e) => {
                NativeStreamError::ConnectionLost(map_connection_error(e))
            }
            WriteError::ClosedStream => NativeStreamError::Closed,
            e => NativeStreamError::Other(Arc::from(e.to_string())),
        })
    }

    fn finish(&mut self) -> Result<(), NativeStreamError> {
        SendStream::finish(self).map_err(|_| NativeStreamError::Closed)
    }

    fn reset(&mut self, code: ErrorCode) {
        let _ = SendStream::reset(self, to_var_int(code));
    }
}

pub type QuinnStream = NativeStream<SendStream, RecvStream>;

#[async_trait]
impl NativeConnection for Connection {
    type SendStream = SendStream;
    type RecvStream = RecvStream;

    fn id(&self) -> u64 {
        self.stable_id() as u64
    }

    async fn accept_stream(&self) -> Result<QuinnStream, NativeConnectionError> {
        tokio::select! {
            r = self.accept_bi() => {
                let (send, recv) = r.map_err(map_connection_error)?;
                let id = VarInt::from(recv.id()).into_inner();
                Ok(NativeStream::new(id, Some(send), Some(recv)))
            }
            r = self.accept_uni() => {
                let recv = r.map_err(map_connection_error)?;
                let id = VarInt::from(recv.id()).into_inner();
                Ok(NativeStream::new(id, None, Some(recv)))
            }
        }
    }

    async fn open_stream(
        &self,
        direction: StreamDirection,
    ) -> Result<QuinnStream, NativeConnectionError> {
        match direction {
            StreamDirection::Bidirectional => {
                let (send, recv) = self.open_bi().await.map_err(map_connection_error)?;
                let id = VarInt::from(send.id()).into_inner();
                Ok(NativeStream::new(id, Some(send), Some(recv)))
            }
            StreamDirection::Unidirectional => {
                let send = self.open_uni().await.map_err(map_connection_error)?;
                let id = VarInt::from(send.id()).into_inner();
                Ok(NativeStream::new(id, Some(send), None))
            }
        }
    }

    fn close(&self, code: ErrorCode, reason: &[u8]) {
        Connection::close(self, to_var_int(code), reason);
    }

    async fn closed(&self) -> NativeConnectionError {
        map_connection_error(Connection::closed(self).await)
    }
}

#[async_trait]
impl NativeListener for Endpoint {
    type Connection = Connection;

    async fn accept(&self) -> Option<Result<Connection, NativeConnectionError>> {
        let incoming = Endpoint::accept(self).await?;
        Some(incoming.await.map_err(map_connection_error))
    }

    fn close(&self) {
        Endpoint::close(self, VarInt::from_u32(0), b"");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int() {
        let code = ErrorCode::from_u32(0x10c);
        assert_eq!(from_var_int(to_var_int(code)), code);
        assert_eq!(to_var_int(ErrorCode::MAX), VarInt::MAX);
    }

    #[test]
    fn connection_error() {
        assert_eq!(
            map_connection_error(ConnectionError::TimedOut),
            NativeConnectionError::TimedOut
        );
        assert_eq!(
            map_connection_error(ConnectionError::LocallyClosed),
            NativeConnectionError::LocallyClosed
        );
        assert!(matches!(
            map_connection_error(ConnectionError::CidsExhausted),
            NativeConnectionError::Other(_)
        ));
    }
}
