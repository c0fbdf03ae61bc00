//! Backend selection.
//!
//! ```text
//! (host, routepath) matched
//!     → Balancer::select            (pluggable; None = no opinion)
//!     → RoundRobin::next            (default, weighted)
//!     → failover                    (first alive candidate from there on)
//!     → Backend, or None → 503
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};

use super::backend::Backend;
use crate::context::Context;

/// Pluggable selection strategy.
pub trait Balancer: Send + Sync + 'static {
    /// Index into `backends`, or `None` to fall back to weighted round-robin.
    fn select(&self, ctx: &Context, backends: &[Arc<Backend>]) -> Option<usize>;
}

/// Weighted round-robin cursor for one `(host, routepath)` list.
///
/// A backend of weight `w` is picked `w` times in a row before the cursor
/// moves on, so weights 3 and 1 yield `A A A B A A A B ...`.
#[derive(Debug)]
pub struct RoundRobin {
    weights: Vec<u32>,
    cursor: Mutex<Cursor>,
}

#[derive(Debug, Default)]
struct Cursor {
    index: usize,
    served: u32,
}

impl RoundRobin {
    pub fn new(weights: Vec<u32>) -> Self {
        Self { weights, cursor: Mutex::new(Cursor::default()) }
    }

    pub fn next(&self) -> usize {
        let len = self.weights.len();
        if len <= 1 {
            return 0;
        }
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        if cursor.index >= len {
            cursor.index = 0;
        }
        let picked = cursor.index;
        cursor.served += 1;
        if cursor.served >= self.weights[picked].max(1) {
            cursor.served = 0;
            cursor.index += 1;
        }
        picked
    }
}

/// First index at or after `start` (wrapping) that `alive` accepts.
/// `on_dead` sees every rejected index.
pub(crate) fn failover(
    start: usize,
    len: usize,
    alive: impl Fn(usize) -> bool,
    mut on_dead: impl FnMut(usize),
) -> Option<usize> {
    for offset in 0..len {
        let i = (start + offset) % len;
        if alive(i) {
            return Some(i);
        }
        on_dead(i);
    }
    None
}

/// Rendezvous hashing on a caller-supplied identity.
///
/// The same identity lands on the same backend while the alive set is
/// unchanged. Requests without an identity fall back to round-robin.
pub struct ConsistentBalancer<F> {
    identity: F,
}

impl<F> ConsistentBalancer<F>
where
    F: Fn(&Context) -> Option<String> + Send + Sync + 'static,
{
    pub fn new(identity: F) -> Self {
        Self { identity }
    }
}

/// Keyed by peer address.
impl Default for ConsistentBalancer<fn(&Context) -> Option<String>> {
    fn default() -> Self {
        fn peer(c: &Context) -> Option<String> {
            (!c.ip.is_empty()).then(|| c.ip.clone())
        }
        Self { identity: peer }
    }
}

impl<F> Balancer for ConsistentBalancer<F>
where
    F: Fn(&Context) -> Option<String> + Send + Sync + 'static,
{
    fn select(&self, ctx: &Context, backends: &[Arc<Backend>]) -> Option<usize> {
        if backends.len() <= 1 {
            return None;
        }
        let identity = (self.identity)(ctx)?;
        let any_alive = backends.iter().any(|b| b.is_alive());
        backends
            .iter()
            .enumerate()
            .filter(|(_, b)| !any_alive || b.is_alive())
            .map(|(i, b)| (i, score(&identity, &b.url, b.weight)))
            .fold(None, |best: Option<(usize, u64)>, (i, s)| match best {
                Some((_, top)) if top >= s => best,
                _ => Some((i, s)),
            })
            .map(|(i, _)| i)
    }
}

fn score(identity: &str, url: &str, weight: u32) -> u64 {
    let digest = Sha256::new().chain_update(identity).chain_update(url).finalize();
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    u64::from(head) * u64::from(weight.max(1))
}
