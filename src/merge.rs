//! Fair two-source merge for the operator bridge (spec.md §4.5, §8 P6,
//! §9 "Async generators ... merge is a loop over two pending `next()`s
//! with first-ready selection").
//!
//! At any moment exactly one pending `next()` future exists per source
//! (`tokio::select!` polls both branches and re-creates the losing
//! branch's future on the following call, which is exactly the "re-arm on
//! completion" contract since both sources this crate merges — a bounded
//! channel receiver and a websocket stream — are cancel-safe to poll).
//! Either source's `None` ends the merge outright rather than continuing
//! with the survivor.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Which side of a merge produced a yielded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    A,
    B,
}

/// A value tagged by which source produced it.
pub enum Either<A, B> {
    A(A),
    B(B),
}

/// One side of a [`merge_next`] call. Implemented for the bounded pipes
/// and, by the operator bridge, for the websocket stream.
#[async_trait]
pub trait NextSource: Send {
    type Item: Send;

    async fn next(&mut self) -> Option<Self::Item>;
}

#[async_trait]
impl<T: Send> NextSource for mpsc::Receiver<T> {
    type Item = T;

    async fn next(&mut self) -> Option<T> {
        self.recv().await
    }
}

/// Poll both sources, returning whichever resolves first. `None` from
/// either side signals end-of-iteration and the caller should stop
/// calling `merge_next` (spec.md §4.5 merge contract).
pub async fn merge_next<A, B>(a: &mut A, b: &mut B) -> Option<(Source, Either<A::Item, B::Item>)>
where
    A: NextSource,
    B: NextSource,
{
    tokio::select! {
        v = a.next() => v.map(|x| (Source::A, Either::A(x))),
        v = b.next() => v.map(|x| (Source::B, Either::B(x))),
    }
}
