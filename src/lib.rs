//! # Worker Pool
//!
//! A capacity-bounded pool of reusable worker threads. A submitted
//! task runs on the most recently idled worker when one exists, on a
//! freshly spawned worker while the pool is below capacity, and
//! otherwise the submitter blocks until a worker is returned to the
//! idle set. A background reclamation loop terminates workers that
//! stay idle past an expiry threshold, so a quiet pool shrinks back
//! to zero threads.
//!
//! # Build a pool
//!
//! [`Pool::new`] covers the common case; the [`PoolBuilder`] exposes
//! the full configuration.
//!
//! # Examples
//!
//! ```
//! use wpool::Pool;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pool = Pool::new(4).unwrap();
//!
//! let sum = Arc::new(AtomicUsize::new(0));
//! for _ in 0..10 {
//!     let sum = sum.clone();
//!     pool.submit(move || {
//!         sum.fetch_add(1, Ordering::SeqCst);
//!     }).unwrap();
//! }
//!
//! # std::thread::sleep(std::time::Duration::from_millis(300));
//! assert_eq!(10, sum.load(Ordering::SeqCst));
//! pool.release();
//! ```

mod builder;
mod pool;

pub(crate) mod worker;

pub use builder::*;
pub use pool::*;
