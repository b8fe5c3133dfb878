//! Ordered-stream algebra.
//!
//! Every combinator here consumes pull-based, fallible sources that are
//! strictly ascending under [`OrderKey`](crate::order::OrderKey) and returns a
//! stream with the same property.
//!
//! - A source is polled only when its next element is needed, so each source
//!   holds at most one pending element.
//! - Sources are owned by the combined stream; dropping it (including
//!   abandoning it part way) drops every source.
//! - The first error from any source is yielded and ends the stream.

use crate::order::Sequenced;
use async_stream::try_stream;
use futures::future::join_all;
use futures::pin_mut;
use futures::stream::{self, Stream, StreamExt};
use std::cmp::Ordering;

/// Stable merge of two ascending streams.
///
/// When neither head strictly precedes the other, `b`'s head is emitted and
/// only `b` advances: the second argument wins ties.
pub fn ordered_union<T, E, A, B>(a: A, b: B) -> impl Stream<Item = Result<T, E>>
where
    T: Sequenced,
    A: Stream<Item = Result<T, E>>,
    B: Stream<Item = Result<T, E>>,
{
    try_stream! {
        pin_mut!(a);
        pin_mut!(b);

        let (first_a, first_b) = futures::join!(a.next(), b.next());
        let mut head_a = first_a.transpose()?;
        let mut head_b = first_b.transpose()?;

        loop {
            match (head_a.take(), head_b.take()) {
                (Some(x), Some(y)) => {
                    if x.order_key() < y.order_key() {
                        yield x;
                        head_a = a.next().await.transpose()?;
                        head_b = Some(y);
                    } else {
                        yield y;
                        head_b = b.next().await.transpose()?;
                        head_a = Some(x);
                    }
                }
                (Some(x), None) => {
                    yield x;
                    while let Some(item) = a.next().await {
                        yield item?;
                    }
                    break;
                }
                (None, Some(y)) => {
                    yield y;
                    while let Some(item) = b.next().await {
                        yield item?;
                    }
                    break;
                }
                (None, None) => break,
            }
        }
    }
}

/// Elements of `a` without an equal-keyed counterpart in `b`.
///
/// Cancellation is 1:1: one element of `b` removes at most one element of
/// `a`. Elements of `b` that precede the head of `a` cancel nothing and are
/// discarded.
pub fn ordered_subtract<T, E, A, B>(a: A, b: B) -> impl Stream<Item = Result<T, E>>
where
    T: Sequenced,
    A: Stream<Item = Result<T, E>>,
    B: Stream<Item = Result<T, E>>,
{
    try_stream! {
        pin_mut!(a);
        pin_mut!(b);

        let mut head_b = b.next().await.transpose()?;

        while let Some(item) = a.next().await {
            let x = item?;
            loop {
                let ordering = head_b
                    .as_ref()
                    .map(|y| x.order_key().cmp(&y.order_key()));
                match ordering {
                    None | Some(Ordering::Less) => {
                        yield x;
                        break;
                    }
                    Some(Ordering::Greater) => {
                        head_b = b.next().await.transpose()?;
                    }
                    Some(Ordering::Equal) => {
                        head_b = b.next().await.transpose()?;
                        break;
                    }
                }
            }
        }
    }
}

/// N-way merge with deduplication.
///
/// At each step the minimal head under `lt` is emitted once (the copy held by
/// the lowest-indexed stream) and every stream whose head equals it advances.
/// Two heads are equal when neither is `lt` the other.
pub fn k_way_min_merge<T, E, S, F>(streams: Vec<S>, lt: F) -> impl Stream<Item = Result<T, E>>
where
    S: Stream<Item = Result<T, E>>,
    F: Fn(&T, &T) -> bool,
{
    try_stream! {
        let mut sources: Vec<_> = streams.into_iter().map(Box::pin).collect();

        let mut heads: Vec<Option<T>> = Vec::with_capacity(sources.len());
        for first in join_all(sources.iter_mut().map(|s| s.next())).await {
            heads.push(first.transpose()?);
        }

        loop {
            let mut min_idx: Option<usize> = None;
            for (idx, head) in heads.iter().enumerate() {
                if let Some(candidate) = head {
                    let smaller = match min_idx.and_then(|m| heads[m].as_ref()) {
                        Some(current) => lt(candidate, current),
                        None => true,
                    };
                    if smaller {
                        min_idx = Some(idx);
                    }
                }
            }

            let min_idx = match min_idx {
                Some(idx) => idx,
                None => break,
            };
            let min = match heads[min_idx].take() {
                Some(min) => min,
                None => break,
            };

            let mut advance = vec![min_idx];
            for (idx, head) in heads.iter().enumerate() {
                if let Some(other) = head {
                    if !lt(other, &min) && !lt(&min, other) {
                        advance.push(idx);
                    }
                }
            }

            yield min;

            for idx in advance {
                heads[idx] = sources[idx].next().await.transpose()?;
            }
        }
    }
}

/// The first `n` elements of `s`.
pub fn take<S: Stream>(n: usize, s: S) -> impl Stream<Item = S::Item> {
    s.take(n)
}

/// The elements of each stream in turn. A stream is opened only after the
/// previous one is exhausted.
pub fn concat<S, I>(streams: I) -> impl Stream<Item = S::Item>
where
    S: Stream,
    I: IntoIterator<Item = S>,
{
    stream::iter(streams).flatten()
}
