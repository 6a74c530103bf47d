//! Virtual repositories: concurrent fan-out over member remotes.
//!
//! A refraction resolves an artifact with find-then-fetch: probe every
//! member concurrently, pick one winner, then download from that member
//! only.  Probe failures are ranked rather than merged: a 401/403 from one
//! mirror is a real answer the caller should see, a 404 only means "not on
//! this mirror", so denials outrank server faults and faults outrank plain
//! absence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::cache::BackedRemote;
use crate::error::ResolveError;
use crate::metrics::{Metrics, ProbeClass, ProbeLabels};
use crate::request::RequestContext;
use crate::storage::ArtifactStream;

// ---------------------------------------------------------------------------
// Probe ranking
// ---------------------------------------------------------------------------

fn classify(err: &ResolveError) -> ProbeClass {
    if err.is_absence() {
        return ProbeClass::Absent;
    }
    match err {
        ResolveError::PolicyBlocked => ProbeClass::Denied,
        ResolveError::UpstreamStatus(code) if (400..500).contains(code) => ProbeClass::Denied,
        _ => ProbeClass::Fault,
    }
}

/// Lower is better.  Within one rank the first arrival wins.
fn rank(class: &ProbeClass) -> u8 {
    match class {
        ProbeClass::Success => 0,
        ProbeClass::Denied => 1,
        ProbeClass::Fault => 2,
        ProbeClass::Absent => 3,
    }
}

// ---------------------------------------------------------------------------
// Refraction
// ---------------------------------------------------------------------------

pub struct Refraction {
    name: String,
    members: Vec<Arc<BackedRemote>>,
    probe_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Refraction {
    pub fn new(
        name: impl Into<String>,
        members: Vec<Arc<BackedRemote>>,
        probe_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            name: name.into(),
            members,
            probe_timeout,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[Arc<BackedRemote>] {
        &self.members
    }

    /// Resolve which member holds `path`.
    ///
    /// Launches one probe task per member under a shared child cancellation
    /// token and a shared deadline.  The first success short-circuits the
    /// rest; otherwise the best-ranked failure decides, with every
    /// absence-class outcome collapsing to [`ResolveError::NotFound`].
    #[instrument(skip(self, ctx), fields(refraction = %self.name))]
    pub async fn probe(
        &self,
        path: &str,
        ctx: &RequestContext,
    ) -> Result<Arc<BackedRemote>, ResolveError> {
        let shared = ctx.cancel.child_token();
        let (tx, mut rx) = mpsc::channel(self.members.len().max(1));

        for member in &self.members {
            let member = Arc::clone(member);
            let tx = tx.clone();
            let mut probe_ctx = ctx.clone();
            probe_ctx.cancel = shared.clone();
            let probe_path = path.to_string();
            tokio::spawn(async move {
                let result = member.exists(&probe_path, &mut probe_ctx).await;
                // A send failure means the fan-out already decided.
                let _ = tx.send((member, result)).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.probe_timeout);
        tokio::pin!(deadline);

        let mut best: Option<(ProbeClass, ResolveError)> = None;
        let mut pending = self.members.len();

        while pending > 0 {
            tokio::select! {
                () = ctx.cancel.cancelled() => {
                    shared.cancel();
                    return Err(ResolveError::Canceled);
                }
                () = &mut deadline => {
                    shared.cancel();
                    warn!(path = %path, timeout = ?self.probe_timeout, "existence fan-out timed out");
                    return Err(ResolveError::Timeout(self.probe_timeout));
                }
                received = rx.recv() => {
                    let Some((member, result)) = received else { break };
                    pending -= 1;
                    match result {
                        Ok(resolved) => {
                            self.count_probe(ProbeClass::Success);
                            debug!(member = %member.name(), uri = %resolved, "probe succeeded");
                            shared.cancel();
                            return Ok(member);
                        }
                        Err(err) => {
                            let class = classify(&err);
                            self.count_probe(class.clone());
                            debug!(member = %member.name(), error = %err, "probe failed");
                            if best.as_ref().is_none_or(|(b, _)| rank(&class) < rank(b)) {
                                best = Some((class, err));
                            }
                        }
                    }
                }
            }
        }

        shared.cancel();
        match best {
            Some((class, err)) if class != ProbeClass::Absent => Err(err),
            _ => Err(ResolveError::NotFound),
        }
    }

    /// Find-then-fetch: probe for the winning member, then download from
    /// that same member with the same request context.
    #[instrument(skip(self, ctx), fields(refraction = %self.name))]
    pub async fn download(
        &self,
        path: &str,
        ctx: &mut RequestContext,
    ) -> Result<ArtifactStream, ResolveError> {
        let winner = self.probe(path, ctx).await?;
        debug!(member = %winner.name(), "downloading from winning member");
        winner.download(path, ctx).await
    }

    fn count_probe(&self, class: ProbeClass) {
        self.metrics
            .probe_results
            .get_or_create(&ProbeLabels { class })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
