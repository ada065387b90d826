//! Work Composition
//!
//! Typed sequencing/forking combinators over tasks. A [`WorkBuilder`]
//! assembles steps into one function of `(TaskHandle, input)`; it carries
//! no state of its own. Each step runs under [`TaskHandle::wait_for`] with
//! its title as the sub-task label, and `finish()` forks the handle by the
//! number of sequential steps so every step contributes proportionally to
//! the overall progress number.

use std::future::Future;

use futures_util::future::{try_join_all, BoxFuture};
use futures_util::join;

use crate::error::TaskError;
use crate::scheduler::TaskHandle;

/// An assembled unit of work: callable once with a handle and an input.
pub type Work<I, O> = Box<dyn FnOnce(TaskHandle, I) -> BoxFuture<'static, Result<O, TaskError>> + Send>;

type Chain<I, O> = Box<dyn FnOnce(TaskHandle, I) -> BoxFuture<'static, Result<O, TaskError>> + Send>;

/// Start an empty builder whose output is its input.
pub fn begin<I>() -> WorkBuilder<I, I>
where
    I: Send + 'static,
{
    WorkBuilder {
        chain: Box::new(|_, input| Box::pin(async move { Ok(input) })),
        steps: 0,
    }
}

/// A typed pipeline under construction: input `I`, current output `O`.
pub struct WorkBuilder<I, O> {
    chain: Chain<I, O>,
    steps: usize,
}

impl<I, O> WorkBuilder<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Append a sequential step; its output replaces the pipeline output.
    pub fn then<U, F, Fut>(self, title: &str, step: F) -> WorkBuilder<I, U>
    where
        U: Send + 'static,
        F: FnOnce(O) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, TaskError>> + Send + 'static,
    {
        let title = title.to_string();
        let prev = self.chain;
        WorkBuilder {
            chain: Box::new(move |handle, input| {
                Box::pin(async move {
                    let out = prev(handle.clone(), input).await?;
                    handle.wait_for(step(out), &title).await?
                })
            }),
            steps: self.steps + 1,
        }
    }

    /// Append a sequential step, threading the previous output through
    /// alongside the new one.
    pub fn then_pass<U, F, Fut>(self, title: &str, step: F) -> WorkBuilder<I, (O, U)>
    where
        O: Clone,
        U: Send + 'static,
        F: FnOnce(O) -> Fut + Send + 'static,
        Fut: Future<Output = Result<U, TaskError>> + Send + 'static,
    {
        let title = title.to_string();
        let prev = self.chain;
        WorkBuilder {
            chain: Box::new(move |handle, input| {
                Box::pin(async move {
                    let out = prev(handle.clone(), input).await?;
                    let produced = handle.wait_for(step(out.clone()), &title).await??;
                    Ok((out, produced))
                })
            }),
            steps: self.steps + 1,
        }
    }

    /// Run two sibling steps in parallel over the same input, each under a
    /// half-weight fork, and pair their outputs.
    pub fn fork<A, B, FA, FutA, FB, FutB>(
        self,
        a_title: &str,
        a: FA,
        b_title: &str,
        b: FB,
    ) -> WorkBuilder<I, (A, B)>
    where
        O: Clone,
        A: Send + 'static,
        B: Send + 'static,
        FA: FnOnce(O) -> FutA + Send + 'static,
        FutA: Future<Output = Result<A, TaskError>> + Send + 'static,
        FB: FnOnce(O) -> FutB + Send + 'static,
        FutB: Future<Output = Result<B, TaskError>> + Send + 'static,
    {
        let a_title = a_title.to_string();
        let b_title = b_title.to_string();
        let prev = self.chain;
        WorkBuilder {
            chain: Box::new(move |handle, input| {
                Box::pin(async move {
                    let out = prev(handle.clone(), input).await?;
                    let forked = handle.fork(2);
                    let left = {
                        let h = forked.clone();
                        let out = out.clone();
                        async move { h.wait_for(a(out), &a_title).await? }
                    };
                    let right = async move { forked.wait_for(b(out), &b_title).await? };
                    let (ra, rb) = join!(left, right);
                    Ok((ra?, rb?))
                })
            }),
            steps: self.steps + 1,
        }
    }

    /// [`WorkBuilder::fork`] that also threads the previous output through.
    pub fn fork_pass<A, B, FA, FutA, FB, FutB>(
        self,
        a_title: &str,
        a: FA,
        b_title: &str,
        b: FB,
    ) -> WorkBuilder<I, (O, (A, B))>
    where
        O: Clone,
        A: Send + 'static,
        B: Send + 'static,
        FA: FnOnce(O) -> FutA + Send + 'static,
        FutA: Future<Output = Result<A, TaskError>> + Send + 'static,
        FB: FnOnce(O) -> FutB + Send + 'static,
        FutB: Future<Output = Result<B, TaskError>> + Send + 'static,
    {
        let a_title = a_title.to_string();
        let b_title = b_title.to_string();
        let prev = self.chain;
        WorkBuilder {
            chain: Box::new(move |handle, input| {
                Box::pin(async move {
                    let out = prev(handle.clone(), input).await?;
                    let forked = handle.fork(2);
                    let left = {
                        let h = forked.clone();
                        let out = out.clone();
                        async move { h.wait_for(a(out), &a_title).await? }
                    };
                    let right = {
                        let out = out.clone();
                        async move { forked.wait_for(b(out), &b_title).await? }
                    };
                    let (ra, rb) = join!(left, right);
                    Ok((out, (ra?, rb?)))
                })
            }),
            steps: self.steps + 1,
        }
    }

    /// Map a collection to parallel sub-tasks, each under a `1/len` fork;
    /// outputs are collected in item order. The previous pipeline output is
    /// consumed as a barrier only.
    pub fn fork_items<It, U, F, Fut>(
        self,
        items: Vec<It>,
        info: impl Fn(&It) -> String + Send + 'static,
        step: F,
    ) -> WorkBuilder<I, Vec<U>>
    where
        It: Send + 'static,
        U: Send + 'static,
        F: Fn(It) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, TaskError>> + Send + 'static,
    {
        let prev = self.chain;
        WorkBuilder {
            chain: Box::new(move |handle, input| {
                Box::pin(async move {
                    let _ = prev(handle.clone(), input).await?;
                    let forked = handle.fork(items.len());
                    let futs = items.into_iter().map(|item| {
                        let h = forked.clone();
                        let label = info(&item);
                        let fut = step(item);
                        async move { h.wait_for(fut, &label).await? }
                    });
                    try_join_all(futs).await
                })
            }),
            steps: self.steps + 1,
        }
    }

    /// Seal the pipeline. The returned work forks its handle by the number
    /// of sequential steps, so each step's `wait_for` advances one step's
    /// share of progress.
    pub fn finish(self) -> Work<I, O> {
        let steps = self.steps.max(1);
        let chain = self.chain;
        Box::new(move |handle, input| chain(handle.fork(steps), input))
    }
}
