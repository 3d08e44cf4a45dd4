//! Running jobs: timers, execution, retries and the dependency cascade.
//!
//! A run goes `begin_run` (bails out if disabled) → attempts until success or
//! until retries/epsilon run out → commit stats → dependents in registration
//! order (on success) or the on-failure job (on failure) → write-through →
//! reschedule → publish the [`JobStat`].

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::cache::JobCache;
use crate::duration::IsoDuration;
use crate::error::{Result, SchedulerError};
use crate::job::{Job, RunPlan};
use crate::template::{self, TemplateContext};
use crate::types::{JobStat, JobType, RemoteProperties};

/// Arm `job` for its next run, replacing any pending timer.
///
/// The timer task only sleeps and then spawns the run, so cancelling it can
/// never cut a run short.
pub(crate) fn start_waiting(cache: &Arc<JobCache>, job: &Arc<Job>) {
    let clock = cache.clock();
    let now = clock.now();
    let weak = Arc::downgrade(cache);
    let target = Arc::clone(job);

    job.arm(now, move |wait| {
        tokio::spawn(async move {
            clock.sleep(wait).await;
            if let Some(cache) = weak.upgrade() {
                spawn_run(cache, target);
            }
        })
        .abort_handle()
    });
}

/// Run `job` on its own task.
pub(crate) fn spawn_run(cache: Arc<JobCache>, job: Arc<Job>) {
    tokio::spawn(async move {
        let id = job.id().to_string();
        if let Err(e) = run(cache, job).await {
            debug!(job_id = %id, error = %e, "run ended with error");
        }
    });
}

/// Execute one run of `job`, including its cascade.
///
/// Returns the run's stat, or the terminal error of a failed run. A disabled
/// job fails with [`SchedulerError::JobDisabled`] and records nothing.
pub(crate) fn run(cache: Arc<JobCache>, job: Arc<Job>) -> BoxFuture<'static, Result<JobStat>> {
    async move {
        let clock = cache.clock();
        let started = clock.now();
        let plan = match job.begin_run(started) {
            Ok(plan) => plan,
            Err(e) => {
                info!(job_id = %job.id(), "job tried to run, but it is disabled");
                return Err(e);
            }
        };
        info!(job_id = %plan.id, name = %plan.config.name, "job started");

        let retries = plan.config.retries;
        let mut remaining = retries;
        let outcome = loop {
            match execute(&cache, &plan).await {
                Ok(output) => break Ok(output),
                Err(e) => {
                    let now = clock.now();
                    job.record_failure(now);
                    if remaining > 0 && within_epsilon(plan.epsilon, started, now) {
                        warn!(job_id = %plan.id, error = %e, remaining, "job attempt failed, retrying");
                        remaining -= 1;
                        continue;
                    }
                    break Err(e);
                }
            }
        };

        let finished = clock.now();
        let stat = JobStat {
            job_id: plan.id.clone(),
            ran_at: started,
            number_of_retries: retries - remaining,
            success: outcome.is_ok(),
            execution_duration_ms: u64::try_from((finished - started).num_milliseconds())
                .unwrap_or(0),
        };
        job.finish_run(&stat, finished, cache.options().stats_retention);

        match &outcome {
            Ok(output) => {
                info!(job_id = %plan.id, retries = stat.number_of_retries, "job finished");
                debug!(job_id = %plan.id, %output, "job output");
                run_dependents(&cache, &job).await;
            }
            Err(e) => {
                error!(job_id = %plan.id, error = %e, "job failed");
                run_on_failure_job(&cache, &plan).await;
            }
        }

        reschedule(&cache, &job);
        if let Err(e) = cache.write_through(&job) {
            error!(job_id = %plan.id, error = %e, "job ran, but its results could not be persisted");
        }
        cache.publish(stat.clone());

        outcome.map(|_| stat)
    }
    .boxed()
}

/// True while a retry may still start. No epsilon means no limit.
fn within_epsilon(
    epsilon: Option<IsoDuration>,
    started: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    match epsilon {
        None => true,
        Some(e) if e.is_zero() => true,
        Some(e) => now - started < e.relative_to(started),
    }
}

fn reschedule(cache: &Arc<JobCache>, job: &Arc<Job>) {
    if !cache.is_cached(job) {
        warn!(job_id = %job.id(), "job ran, but was deleted from the cache; not rescheduling");
        job.disarm();
        return;
    }
    if job.should_start_waiting() {
        start_waiting(cache, job);
    } else {
        job.settle();
    }
}

async fn run_dependents(cache: &Arc<JobCache>, job: &Job) {
    for id in job.dependent_jobs() {
        match cache.get(&id) {
            Ok(child) => {
                if let Err(e) = run(Arc::clone(cache), child).await {
                    warn!(parent_id = %job.id(), job_id = %id, error = %e, "dependent job failed");
                }
            }
            Err(_) => error!(parent_id = %job.id(), job_id = %id, "dependent job not found"),
        }
    }
}

async fn run_on_failure_job(cache: &Arc<JobCache>, plan: &RunPlan) {
    let Some(id) = plan.config.on_failure_job.as_deref().filter(|id| !id.is_empty()) else {
        return;
    };
    if id == plan.id {
        warn!(job_id = %plan.id, "job names itself as its on-failure job; skipping");
        return;
    }
    match cache.get(id) {
        Ok(target) => {
            info!(job_id = %plan.id, on_failure_job = %id, "running on-failure job");
            if let Err(e) = run(Arc::clone(cache), target).await {
                warn!(job_id = %id, error = %e, "on-failure job failed");
            }
        }
        Err(_) => warn!(job_id = %plan.id, on_failure_job = %id, "on-failure job not found"),
    }
}

async fn execute(cache: &JobCache, plan: &RunPlan) -> Result<String> {
    let ctx = plan.template_context();
    let delimiters = &plan.config.template_delimiters;
    match plan.config.job_type {
        JobType::Local => {
            let command = template::render(&plan.config.command, delimiters, &ctx)?;
            run_local(&command).await
        }
        JobType::Remote => {
            let props = plan.config.remote_properties.as_ref().ok_or_else(|| {
                SchedulerError::InvalidJob("remote job has no remote_properties".to_string())
            })?;
            run_remote(
                cache.http(),
                props,
                delimiters,
                &ctx,
                cache.options().default_http_timeout,
            )
            .await
        }
    }
}

/// `sh -c <command>`; success is exit status 0. Returns trimmed stdout+stderr.
async fn run_local(command: &str) -> Result<String> {
    debug!("exec: {command}");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .output()
        .await?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    let text = text.trim().to_string();

    if output.status.success() {
        Ok(text)
    } else {
        Err(SchedulerError::CommandFailed {
            status: output.status.to_string(),
            output: text,
        })
    }
}

async fn run_remote(
    client: &reqwest::Client,
    props: &RemoteProperties,
    delimiters: &str,
    ctx: &TemplateContext,
    default_timeout: StdDuration,
) -> Result<String> {
    let url = template::render(&props.url, delimiters, ctx)?;
    let body = template::render(&props.body, delimiters, ctx)?;
    let method = reqwest::Method::from_bytes(props.method.to_uppercase().as_bytes())
        .map_err(|_| SchedulerError::InvalidJob(format!("bad HTTP method {:?}", props.method)))?;
    let timeout = match props.timeout_secs {
        0 => default_timeout,
        secs => StdDuration::from_secs(secs),
    };

    let mut request = client.request(method, &url).timeout(timeout);
    let mut has_content_type = false;
    for (name, values) in &props.headers {
        has_content_type |= name.eq_ignore_ascii_case("content-type");
        for value in values {
            request = request.header(name.as_str(), value.as_str());
        }
    }
    if !has_content_type {
        request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
    }
    if !body.is_empty() {
        request = request.body(body);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    if props.is_expected(status) {
        Ok(text)
    } else {
        Err(SchedulerError::UnexpectedStatus { status, body: text })
    }
}
