// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Fibonacci

use thiserror::Error;

/// Largest `n` whose Fibonacci number fits in a `u64`.
pub const MAX_FIBONACCI_INPUT: u32 = 93;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibonacciError {
    #[error("fib({0}) overflows u64, the valid range is 0..={MAX_FIBONACCI_INPUT}")]
    OutOfRange(u32),
}

/// The `n`-th Fibonacci number, with `fib(0) = 0` and `fib(1) = 1`.
///
/// Iterative, constant stack; inputs above [`MAX_FIBONACCI_INPUT`] are rejected
/// rather than wrapped.
pub fn fibonacci(n: u32) -> Result<u64, FibonacciError> {
    if n > MAX_FIBONACCI_INPUT {
        return Err(FibonacciError::OutOfRange(n));
    }

    let (mut current, mut next) = (0u64, 1u64);
    for _ in 0..n {
        // the look-ahead term saturates on the last step of fib(93), it is never read
        (current, next) = (next, current.saturating_add(next));
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_terms() {
        let terms: Vec<u64> = (0..=10).map(|n| fibonacci(n).unwrap()).collect();
        assert_eq!(terms, vec![0, 1, 1, 2, 3, 5, 8, 13, 21, 34, 55]);
    }

    #[test]
    fn largest_valid_input() {
        assert_eq!(fibonacci(MAX_FIBONACCI_INPUT), Ok(12_200_160_415_121_876_738));
    }

    #[test]
    fn rejects_overflowing_input() {
        assert_eq!(fibonacci(94), Err(FibonacciError::OutOfRange(94)));
        assert_eq!(fibonacci(500), Err(FibonacciError::OutOfRange(500)));
    }
}
