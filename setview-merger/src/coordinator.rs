//! Merge coordinator
//!
//! Owns the lifecycle of one merge query: resolve the design document,
//! gate on its revision, spawn one folder worker per backing index, drain
//! the merge queue through the row collector, and tear everything down on
//! every control path. Revision drift under an `Auto` revision restarts
//! the whole attempt after a pause, bounded by `max_retries`.
//!
//! Teardown order matters: the queue shuts down first so parked producers
//! wake with `queue_shutdown`, then the cancel token fires, then the
//! coordinator waits for every worker to terminate. Workers observe
//! cancellation cooperatively so remote bodies get drained; if an attempt
//! future is dropped outright (watchdog), the `JoinSet` aborts whatever
//! is left.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use setview_core::{
    DdocRevision, DesignDoc, Error, IndexSpec, LocalSpec, MergeConfig, MergeRequest, QueueItem,
    RemoteSpec, Result,
};

use crate::collector::{RowCollector, Step};
use crate::module::{
    default_stream_event_map, DdocSource, EventMapper, IndexModule, MergeFuns, RowTransform,
};
use crate::queue::{MergeQueue, Popped};
use crate::stats::{NoopStats, QueryStats};
use crate::worker::{run_local, run_remote, RemoteJob};

enum AttemptOutcome<A> {
    Reply(A),
    /// Revision drifted under `Auto`; re-resolve and go again
    Retry,
}

/// The scatter/gather engine. One instance serves many queries and owns
/// the pooled HTTP client its remote workers share.
pub struct IndexMerger {
    http: reqwest::Client,
    ddocs: Arc<dyn DdocSource>,
    stats: Arc<dyn QueryStats>,
    config: MergeConfig,
}

impl IndexMerger {
    pub fn new(ddocs: Arc<dyn DdocSource>) -> Self {
        Self::with_config(ddocs, MergeConfig::default())
    }

    pub fn with_config(ddocs: Arc<dyn DdocSource>, config: MergeConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connection_timeout)
            .build()
            .expect("failed to create HTTP client");
        IndexMerger {
            http,
            ddocs,
            stats: Arc::new(NoopStats),
            config,
        }
    }

    /// Attach a timing observer.
    pub fn with_stats(mut self, stats: Arc<dyn QueryStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Run one merge query to completion and return the caller's reply.
    pub async fn query<A, M>(&self, module: &M, req: MergeRequest<A>) -> Result<A>
    where
        A: Clone + Send + 'static,
        M: IndexModule<A> + ?Sized,
    {
        let started = req.started_at.unwrap_or_else(Instant::now);
        let Some(local) = req.first_local_spec().cloned() else {
            return Err(Error::not_found("no local index specification in request"));
        };

        let result = self.dispatch(module, req, &local).await;
        self.stats
            .record(&local.ddoc_id, &local.view_name, started.elapsed());
        result
    }

    async fn dispatch<A, M>(
        &self,
        module: &M,
        mut req: MergeRequest<A>,
        local: &LocalSpec,
    ) -> Result<A>
    where
        A: Clone + Send + 'static,
        M: IndexModule<A> + ?Sized,
    {
        // A single local set-view needs none of the queue/worker
        // machinery; the module answers directly, still behind the
        // revision gate.
        if req.specs.len() == 1 && req.specs[0].as_local().is_some() {
            let ddoc = self.ddocs.get_ddoc(&local.set_name, &local.ddoc_id).await?;
            check_revision(&req.revision, &ddoc)?;
            let watchdog = req.watchdog;
            let answer = module.simple_set_view_query(req, &ddoc);
            return match watchdog {
                Some(limit) => tokio::time::timeout(limit, answer)
                    .await
                    .map_err(|_| Error::Timeout)?,
                None => answer.await,
            };
        }

        match req.watchdog {
            Some(limit) => tokio::time::timeout(limit, self.merge_loop(module, &mut req, local))
                .await
                .map_err(|_| Error::Timeout)?,
            None => self.merge_loop(module, &mut req, local).await,
        }
    }

    async fn merge_loop<A, M>(
        &self,
        module: &M,
        req: &mut MergeRequest<A>,
        local: &LocalSpec,
    ) -> Result<A>
    where
        A: Clone + Send + 'static,
        M: IndexModule<A> + ?Sized,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ddoc = self.ddocs.get_ddoc(&local.set_name, &local.ddoc_id).await?;
            check_revision(&req.revision, &ddoc)?;

            match self.run_attempt(module, req, local, &ddoc).await? {
                AttemptOutcome::Reply(reply) => return Ok(reply),
                AttemptOutcome::Retry => {
                    if attempt >= self.config.max_retries {
                        return Err(Error::RevisionSyncFailed(attempt));
                    }
                    tracing::info!(
                        attempt,
                        ddoc = %ddoc.id,
                        "design document revision drifted; retrying merge"
                    );
                    tokio::time::sleep(self.config.retry_interval).await;
                }
            }
        }
    }

    async fn run_attempt<A, M>(
        &self,
        module: &M,
        req: &mut MergeRequest<A>,
        local: &LocalSpec,
        ddoc: &DesignDoc,
    ) -> Result<AttemptOutcome<A>>
    where
        A: Clone + Send + 'static,
        M: IndexModule<A> + ?Sized,
    {
        let funs = module.make_funs(ddoc, &local.view_name, req)?;

        // Resolve every remote job up front so nothing fails once workers
        // exist.
        enum Plan {
            Local(LocalSpec),
            Remote(RemoteJob),
        }
        let mut plans = Vec::with_capacity(req.specs.len());
        for spec in &req.specs {
            plans.push(match spec {
                IndexSpec::Local(spec) => Plan::Local(spec.clone()),
                IndexSpec::Remote(spec) => {
                    Plan::Remote(self.remote_job(module, spec, &funs, req, ddoc)?)
                }
            });
        }

        let queue = Arc::new(MergeQueue::new(plans.len(), funs.less.clone()));
        let cancel = CancellationToken::new();
        let mapper: EventMapper = funs
            .event_map
            .clone()
            .unwrap_or_else(|| Arc::new(default_stream_event_map));

        let mut workers = JoinSet::new();
        for (i, plan) in plans.into_iter().enumerate() {
            let producer = queue.producer(i);
            match plan {
                Plan::Local(spec) => {
                    workers.spawn(run_local(
                        funs.fold.clone(),
                        spec,
                        producer,
                        cancel.clone(),
                    ));
                }
                Plan::Remote(job) => {
                    workers.spawn(run_remote(
                        self.http.clone(),
                        job,
                        mapper.clone(),
                        producer,
                        cancel.clone(),
                    ));
                }
            }
        }

        let outcome = drain(&queue, req, funs.transform.clone()).await;

        // Always tear down, whatever the drain decided: wake parked
        // producers, cancel the workers, and wait for each of them.
        queue.shutdown();
        cancel.cancel();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(error = %e, "folder worker terminated abnormally");
            }
        }

        outcome
    }

    fn remote_job<A, M>(
        &self,
        module: &M,
        spec: &RemoteSpec,
        funs: &MergeFuns,
        req: &MergeRequest<A>,
        ddoc: &DesignDoc,
    ) -> Result<RemoteJob>
    where
        A: Send + 'static,
        M: IndexModule<A> + ?Sized,
    {
        let mut body = spec.body.clone();
        if req.revision.checking_enabled() {
            body.ddoc_revision = Some(ddoc.rev.clone());
        }
        module.process_extra_params(funs.extra.as_ref(), &mut body);

        let qs = module.view_qs(&req.args);
        let url = if qs.is_empty() {
            spec.url.clone()
        } else if spec.url.contains('?') {
            format!("{}&{qs}", spec.url)
        } else {
            format!("{}?{qs}", spec.url)
        };

        Ok(RemoteJob {
            url,
            body: serde_json::to_string(&body)?,
            source: spec.url.clone(),
            ssl: spec.ssl.clone(),
            timeout: req.timeout,
            window: self.config.stream_window,
        })
    }
}

fn check_revision(want: &DdocRevision, ddoc: &DesignDoc) -> Result<()> {
    match want {
        DdocRevision::Exact(rev) if rev != &ddoc.rev => Err(Error::RevisionMismatch),
        _ => Ok(()),
    }
}

async fn drain<A>(
    queue: &MergeQueue,
    req: &mut MergeRequest<A>,
    transform: Option<RowTransform>,
) -> Result<AttemptOutcome<A>>
where
    A: Clone + Send + 'static,
{
    let producers = req.specs.len();
    let mut collector = RowCollector::new(
        producers,
        req.skip,
        req.limit,
        req.args.on_error,
        transform,
        &mut req.callback,
        req.acc.clone(),
    );

    loop {
        match queue.pop().await {
            Popped::Closed => return collector.finish().map(AttemptOutcome::Reply),
            Popped::Item { item, .. } => match item {
                QueueItem::RevisionMismatch => {
                    queue.flush();
                    return match req.revision {
                        DdocRevision::Auto => Ok(AttemptOutcome::Retry),
                        _ => Err(Error::RevisionMismatch),
                    };
                }
                QueueItem::SetViewOutdated => {
                    queue.flush();
                    return Err(Error::SetViewOutdated);
                }
                other => {
                    let step = collector.on_item(other);
                    queue.flush();
                    match step? {
                        Step::Continue => {}
                        Step::LimitReached => {
                            return collector.finish().map(AttemptOutcome::Reply)
                        }
                        Step::Stopped => return collector.into_acc().map(AttemptOutcome::Reply),
                    }
                }
            },
        }
    }
}
