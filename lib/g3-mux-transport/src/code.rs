/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use std::fmt;

use thiserror::Error;

/// Largest value representable as a QUIC variable-length integer.
pub const MAX_ERROR_CODE: u64 = (1 << 62) - 1;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid error code {0}, the valid range is 0..=2^62-1")]
pub struct InvalidErrorCode(pub i128);

/// Application protocol error code carried by stream resets and connection closes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ErrorCode(u64);

impl ErrorCode {
    pub const ZERO: ErrorCode = ErrorCode(0);
    pub const MAX: ErrorCode = ErrorCode(MAX_ERROR_CODE);

    pub fn new(code: u64) -> Result<Self, InvalidErrorCode> {
        if code > MAX_ERROR_CODE {
            Err(InvalidErrorCode(code as i128))
        } else {
            Ok(ErrorCode(code))
        }
    }

    #[inline]
    pub const fn from_u32(code: u32) -> Self {
        ErrorCode(code as u64)
    }

    #[inline]
    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        ErrorCode::from_u32(code)
    }
}

impl TryFrom<u64> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        ErrorCode::new(code)
    }
}

impl TryFrom<i64> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match u64::try_from(code) {
            Ok(v) => ErrorCode::new(v),
            Err(_) => Err(InvalidErrorCode(code as i128)),
        }
    }
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range() {
        assert_eq!(ErrorCode::new(0).unwrap(), ErrorCode::ZERO);
        assert_eq!(ErrorCode::new(MAX_ERROR_CODE).unwrap(), ErrorCode::MAX);
        assert_eq!(
            ErrorCode::new(MAX_ERROR_CODE + 1).unwrap_err(),
            InvalidErrorCode(1 << 62)
        );
        assert!(ErrorCode::new(u64::MAX).is_err());
    }

    #[test]
    fn from_signed() {
        assert_eq!(ErrorCode::try_from(258i64).unwrap().into_inner(), 258);
        assert_eq!(
            ErrorCode::try_from(-1i64).unwrap_err(),
            InvalidErrorCode(-1)
        );
        assert!(ErrorCode::try_from(1i64 << 62).is_err());
        assert!(ErrorCode::try_from(i64::MIN).is_err());
    }

    #[test]
    fn display() {
        assert_eq!(ErrorCode::from_u32(0x10c).to_string(), "0x10c");
        assert_eq!(u64::from(ErrorCode::from(7u32)), 7);
    }
}
