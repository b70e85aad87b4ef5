//! Row collector
//!
//! Folds popped queue items into caller-visible callback events. A merge
//! opens in a counting phase: every producer is expected to announce its
//! row count once, and the collector sums them. When the last count lands,
//! or the first data row arrives early, the `{start, total}` event goes
//! out and the collector switches to row mode. A producer that fails
//! before announcing its count decrements the expectation instead.
//!
//! Skip and limit are applied here: skipped rows are consumed silently and
//! a limit of zero ends the merge exactly as if every producer had
//! finished.

use setview_core::{Error, Flow, MergeEvent, OnError, QueueItem, Result, RowCallback};

use crate::module::RowTransform;

/// What the coordinator should do after one folded item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Keep draining the queue
    Continue,
    /// Row budget exhausted (or `on_error = stop`); end the merge the same
    /// way a closed queue would, including the final `stop` event
    LimitReached,
    /// The callback ended the merge; its accumulator is the reply as-is
    Stopped,
}

struct Counting {
    /// Producers still expected to announce a count
    remaining: usize,
    total: u64,
}

pub struct RowCollector<'a, A> {
    counting: Option<Counting>,
    skip: u64,
    limit: u64,
    on_error: OnError,
    transform: Option<RowTransform>,
    callback: &'a mut RowCallback<A>,
    acc: Option<A>,
}

/// Saturating decrement; an expectation of zero stays zero.
pub(crate) fn dec_counter(n: u64) -> u64 {
    n.saturating_sub(1)
}

impl<'a, A> RowCollector<'a, A> {
    pub fn new(
        producers: usize,
        skip: u64,
        limit: u64,
        on_error: OnError,
        transform: Option<RowTransform>,
        callback: &'a mut RowCallback<A>,
        acc: A,
    ) -> Self {
        RowCollector {
            counting: Some(Counting {
                remaining: producers,
                total: 0,
            }),
            skip,
            limit,
            on_error,
            transform,
            callback,
            acc: Some(acc),
        }
    }

    /// Fold one item. Restart sentinels (`RevisionMismatch`,
    /// `SetViewOutdated`) never reach the collector; the coordinator
    /// intercepts them.
    pub fn on_item(&mut self, item: QueueItem) -> Result<Step> {
        match item {
            QueueItem::RowCount(n) => {
                if let Some(counting) = &mut self.counting {
                    counting.total += n;
                    counting.remaining = counting.remaining.saturating_sub(1);
                    if counting.remaining == 0 {
                        return self.emit_start();
                    }
                } else {
                    tracing::debug!(count = n, "row count after streaming started; ignored");
                }
                Ok(Step::Continue)
            }

            QueueItem::DebugInfo { source, value } => {
                self.deliver(MergeEvent::DebugInfo { source, value })
            }

            QueueItem::Error { source, reason } => {
                let step = self.deliver(MergeEvent::Error { source, reason })?;
                if step != Step::Continue {
                    return Ok(step);
                }
                // The failed producer will never announce a count.
                if let Some(counting) = &mut self.counting {
                    counting.remaining = counting.remaining.saturating_sub(1);
                    if counting.remaining == 0 {
                        let step = self.emit_start()?;
                        if step != Step::Continue {
                            return Ok(step);
                        }
                    }
                }
                if self.on_error == OnError::Stop {
                    return Ok(Step::LimitReached);
                }
                Ok(Step::Continue)
            }

            QueueItem::Row(row) => {
                let step = self.ensure_started()?;
                if step != Step::Continue {
                    return Ok(step);
                }
                if self.skip > 0 {
                    self.skip -= 1;
                    return Ok(Step::Continue);
                }
                if self.limit == 0 {
                    return Ok(Step::LimitReached);
                }
                let row = match &self.transform {
                    Some(transform) => transform(row),
                    None => row,
                };
                let step = self.deliver(MergeEvent::Row(row))?;
                if step != Step::Continue {
                    return Ok(step);
                }
                self.limit = dec_counter(self.limit);
                if self.limit == 0 {
                    return Ok(Step::LimitReached);
                }
                Ok(Step::Continue)
            }

            QueueItem::RevisionMismatch | QueueItem::SetViewOutdated => {
                debug_assert!(false, "restart sentinel reached the collector");
                Ok(Step::Continue)
            }
        }
    }

    /// Close the fold: emit `{start, total}` if still counting, then the
    /// final `stop` event. The returned accumulator is the query reply.
    pub fn finish(mut self) -> Result<A> {
        if self.counting.is_some() {
            if self.emit_start()? == Step::Stopped {
                return self.into_acc();
            }
        }
        let acc = self.take_acc()?;
        let acc = match (self.callback)(MergeEvent::Stop, acc)? {
            Flow::Continue(acc) | Flow::Stop(acc) => acc,
        };
        Ok(acc)
    }

    /// The accumulator as the callback last returned it, without a `stop`
    /// event. Used when the callback itself ended the merge.
    pub fn into_acc(mut self) -> Result<A> {
        self.take_acc()
    }

    fn ensure_started(&mut self) -> Result<Step> {
        if self.counting.is_some() {
            self.emit_start()
        } else {
            Ok(Step::Continue)
        }
    }

    fn emit_start(&mut self) -> Result<Step> {
        let total_rows = match self.counting.take() {
            Some(counting) => counting.total,
            None => return Ok(Step::Continue),
        };
        self.deliver(MergeEvent::Start { total_rows })
    }

    fn deliver(&mut self, event: MergeEvent) -> Result<Step> {
        let acc = self.take_acc()?;
        match (self.callback)(event, acc)? {
            Flow::Continue(acc) => {
                self.acc = Some(acc);
                Ok(Step::Continue)
            }
            Flow::Stop(acc) => {
                self.acc = Some(acc);
                Ok(Step::Stopped)
            }
        }
    }

    fn take_acc(&mut self) -> Result<A> {
        self.acc
            .take()
            .ok_or_else(|| Error::Callback("merge accumulator already consumed".into()))
    }
}
