//! Source / Transform / Sink contract.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use ledgerbatch_core::ItemResult;

use crate::executor::StepExecutor;
use crate::fault::FaultPolicy;
use crate::partition::Partition;

/// Produces raw items, one at a time, until it returns `Ok(None)`.
///
/// Each executor owns its own source instance (built by a [`StepTemplate`]),
/// so a source never shares a cursor with another partition.
///
/// A failed `next` must leave the position unchanged, so that calling `next`
/// again retries the same read. The executor calls [`Source::skip_current`]
/// when the fault policy gives up on that position.
pub trait Source: Send {
    type Item;

    fn next(&mut self) -> ItemResult<Option<Self::Item>>;

    /// Move past the position whose read just failed.
    fn skip_current(&mut self) {}
}

/// Turns one input item into zero or more outputs.
///
/// Returning an empty vector filters the item; it is not a failure. The
/// executor may call `transform` again with the same item when the fault
/// policy decides to retry.
pub trait Transform: Send {
    type Input;
    type Output;

    fn transform(&mut self, item: &Self::Input) -> ItemResult<Vec<Self::Output>>;

    /// Called once after the source is exhausted. Transforms that aggregate
    /// across items emit their results here.
    fn finish(&mut self) -> ItemResult<Vec<Self::Output>> {
        Ok(Vec::new())
    }
}

/// Persists a non-empty batch atomically.
///
/// One sink is shared by every partition of a step, so `write` must be safe
/// to call concurrently. Its internal locking is the only serialization point
/// between partitions.
pub trait Sink: Send + Sync {
    type Item;

    fn write(&self, batch: &[Self::Item]) -> ItemResult<()>;
}

pub type BoxSource<I> = Box<dyn Source<Item = I>>;
pub type BoxTransform<I, O> = Box<dyn Transform<Input = I, Output = O>>;
pub type SharedSink<O> = Arc<dyn Sink<Item = O>>;

/// Builds a fresh source; `None` means "whole input" (plain step).
pub type SourceFactory<I> = Arc<dyn Fn(Option<&Partition>) -> ItemResult<BoxSource<I>> + Send + Sync>;

/// Builds a fresh transform instance (one per executor).
pub type TransformFactory<I, O> = Arc<dyn Fn() -> BoxTransform<I, O> + Send + Sync>;

/// Everything needed to build a [`StepExecutor`], any number of times.
///
/// Cloning is cheap (shared factories, shared sink, shared policy).
pub struct StepTemplate<I, O> {
    name: String,
    chunk_size: usize,
    source: SourceFactory<I>,
    transform: TransformFactory<I, O>,
    sink: SharedSink<O>,
    policy: Arc<FaultPolicy>,
}

impl<I, O> Clone for StepTemplate<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            chunk_size: self.chunk_size,
            source: self.source.clone(),
            transform: self.transform.clone(),
            sink: self.sink.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<I, O> std::fmt::Debug for StepTemplate<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepTemplate")
            .field("name", &self.name)
            .field("chunk_size", &self.chunk_size)
            .field("policy", &self.policy.name())
            .finish_non_exhaustive()
    }
}

impl<I, O> StepTemplate<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Chunk size 5 and the lenient policy unless overridden.
    pub fn new<S, T>(name: impl Into<String>, source: S, transform: T, sink: SharedSink<O>) -> Self
    where
        S: Fn(Option<&Partition>) -> ItemResult<BoxSource<I>> + Send + Sync + 'static,
        T: Fn() -> BoxTransform<I, O> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            chunk_size: 5,
            source: Arc::new(source),
            transform: Arc::new(transform),
            sink,
            policy: Arc::new(FaultPolicy::lenient()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn policy(&self) -> &FaultPolicy {
        &self.policy
    }

    /// Build an executor bound to `partition` (or to the whole input).
    ///
    /// Fails only when the source cannot be opened.
    pub fn executor_for(&self, partition: Option<&Partition>) -> ItemResult<StepExecutor<I, O>> {
        let source = (self.source)(partition)?;
        let transform = (self.transform)();
        let executor = StepExecutor::new(
            self.name.clone(),
            self.chunk_size,
            source,
            transform,
            self.sink.clone(),
            self.policy.clone(),
        );
        Ok(match partition {
            Some(p) => executor.for_partition(p.clone()),
            None => executor,
        })
    }
}

/// In-memory source over a prepared list of read results.
#[derive(Debug)]
pub struct IterSource<I> {
    items: VecDeque<ItemResult<I>>,
}

impl<I> IterSource<I> {
    pub fn from_items(items: Vec<I>) -> Self {
        Self::from_results(items.into_iter().map(Ok).collect())
    }

    /// An `Err` is a position that fails on every read until it is skipped.
    pub fn from_results(results: Vec<ItemResult<I>>) -> Self {
        Self {
            items: results.into(),
        }
    }
}

impl<I: Send> Source for IterSource<I> {
    type Item = I;

    fn next(&mut self) -> ItemResult<Option<I>> {
        if let Some(Err(err)) = self.items.front() {
            return Err(err.clone());
        }
        Ok(self.items.pop_front().and_then(Result::ok))
    }

    fn skip_current(&mut self) {
        if matches!(self.items.front(), Some(Err(_))) {
            self.items.pop_front();
        }
    }
}

/// Transform backed by a closure.
pub struct FnTransform<I, O, F> {
    f: F,
    _marker: PhantomData<fn(&I) -> O>,
}

impl<I, O, F> FnTransform<I, O, F>
where
    F: FnMut(&I) -> ItemResult<Vec<O>> + Send,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

impl<I, O, F> Transform for FnTransform<I, O, F>
where
    F: FnMut(&I) -> ItemResult<Vec<O>> + Send,
{
    type Input = I;
    type Output = O;

    fn transform(&mut self, item: &I) -> ItemResult<Vec<O>> {
        (self.f)(item)
    }
}

/// Feeds every output of `first` through `second`.
///
/// `finish` flushes `first` through `second` before finishing `second`, so
/// an aggregating second stage sees everything.
#[derive(Debug, Clone)]
pub struct Chain<A, B> {
    first: A,
    second: B,
}

impl<A, B> Chain<A, B>
where
    A: Transform,
    B: Transform<Input = A::Output>,
{
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }

    fn pass(&mut self, mids: Vec<A::Output>) -> ItemResult<Vec<B::Output>> {
        let mut out = Vec::new();
        for mid in &mids {
            out.extend(self.second.transform(mid)?);
        }
        Ok(out)
    }
}

impl<A, B> Transform for Chain<A, B>
where
    A: Transform,
    B: Transform<Input = A::Output>,
{
    type Input = A::Input;
    type Output = B::Output;

    fn transform(&mut self, item: &A::Input) -> ItemResult<Vec<B::Output>> {
        let mids = self.first.transform(item)?;
        self.pass(mids)
    }

    fn finish(&mut self) -> ItemResult<Vec<B::Output>> {
        let mids = self.first.finish()?;
        let mut out = self.pass(mids)?;
        out.extend(self.second.finish()?);
        Ok(out)
    }
}
