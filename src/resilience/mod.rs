//! Resilience helpers shared by the Redis and SQL backends.

pub mod retry;
