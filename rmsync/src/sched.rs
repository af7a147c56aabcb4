use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use tokio::task::{JoinError, JoinSet};

use rmoci::error::{Error, Result};

use crate::config::{Config, DEFAULT_INTERVAL, SyncStep, parse_duration};
use crate::dispatch;
use crate::sync::{Action, Ctx};

/// Run every step once. Steps run as concurrent workers; the throttle in
/// `Ctx` bounds how many reconciliations do I/O at a time. An explicit
/// `parallel <= 0` keeps the legacy sequential behavior.
pub async fn run_once(ctx: &Arc<Ctx>, cfg: &Config, missing: bool) -> Result<()> {
    let action = if missing { Action::Missing } else { Action::Copy };
    run_steps(ctx, &cfg.sync, action, cfg.sequential()).await
}

/// Dry run: report what would change, never abort early.
pub async fn run_check(ctx: &Arc<Ctx>, cfg: &Config) -> Result<()> {
    let mut errs = Vec::new();
    for step in &cfg.sync {
        if let Err(e) = dispatch::run_step(ctx, step, Action::Check).await {
            errs.push(e);
        }
    }
    Error::join(errs)
}

/// Long-running mode: one immediate missing pass, then cron-driven copies
/// until the token cancels. A step whose previous run is still going is
/// skipped, not queued.
pub async fn run_server(ctx: &Arc<Ctx>, cfg: &Config) -> Result<()> {
    info!("running startup missing pass for {} steps", cfg.sync.len());
    // the startup pass is always concurrent; only cron handlers honor the
    // legacy sequential setting
    let init = run_steps(ctx, &cfg.sync, Action::Missing, false).await;
    if ctx.cancel.is_cancelled() {
        return init;
    }
    if let Err(e) = init {
        error!("startup missing pass: {e:?}");
    }

    let mut timers = Vec::with_capacity(cfg.sync.len());
    let now = Utc::now();
    for step in &cfg.sync {
        let mut timer = StepTimer {
            when: parse_schedule(step)?,
            next: now,
            running: Arc::new(tokio::sync::Mutex::new(())),
            step: step.clone(),
        };
        timer.advance(now);
        info!(
            "scheduled step source={} target={} next={}",
            step.source, step.target, timer.next
        );
        timers.push(timer);
    }

    let sequential = cfg.sequential();
    let mut handlers: JoinSet<Result<()>> = JoinSet::new();
    loop {
        while let Some(res) = handlers.try_join_next() {
            log_handler(ctx, res);
        }
        let Some(next) = timers.iter().map(|t| t.next).min() else {
            // nothing scheduled; wait for shutdown
            ctx.cancel.cancelled().await;
            break;
        };
        let dur = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(dur) => {}
        }
        let now = Utc::now();
        for timer in timers.iter_mut() {
            if timer.next > now {
                continue;
            }
            timer.advance(now);
            let lock = timer.running.clone();
            let step = timer.step.clone();
            let ctx2 = ctx.clone();
            let fut = async move {
                let Ok(_guard) = lock.try_lock() else {
                    warn!("step still running, skipping source={}", step.source);
                    return Ok(());
                };
                dispatch::run_step(&ctx2, &step, Action::Copy).await
            };
            if sequential {
                let res = fut.await;
                log_handler(ctx, Ok(res));
            } else {
                handlers.spawn(fut);
            }
        }
    }

    info!("waiting for in-flight steps");
    while let Some(res) = handlers.join_next().await {
        log_handler(ctx, res);
    }
    Ok(())
}

async fn run_steps(
    ctx: &Arc<Ctx>,
    steps: &[SyncStep],
    action: Action,
    sequential: bool,
) -> Result<()> {
    let mut errs = Vec::new();
    if sequential {
        for step in steps {
            if ctx.cancel.is_cancelled() {
                errs.push(Error::Canceled);
                break;
            }
            if let Err(e) = dispatch::run_step(ctx, step, action).await {
                note_err(ctx, &mut errs, e);
            }
        }
    } else {
        let mut set = JoinSet::new();
        for step in steps.iter().cloned() {
            let ctx = ctx.clone();
            set.spawn(async move { dispatch::run_step(&ctx, &step, action).await });
        }
        while let Some(next) = set.join_next().await {
            match next {
                Ok(Ok(())) => {}
                Ok(Err(e)) => note_err(ctx, &mut errs, e),
                Err(e) => {
                    error!("step task failed: {e:?}");
                    errs.push(Error::Canceled);
                }
            }
        }
    }
    Error::join(errs)
}

// a cancellation is the shutdown in progress, never a reason to abort
fn note_err(ctx: &Ctx, errs: &mut Vec<Error>, e: Error) {
    let canceled = e.is_canceled();
    errs.push(e);
    if ctx.abort_on_error && !canceled {
        ctx.cancel.cancel();
    }
}

fn log_handler(ctx: &Ctx, res: Result<Result<()>, JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_canceled() => {}
        Ok(Err(e)) => {
            error!("step failed: {e:?}");
            if ctx.abort_on_error {
                ctx.cancel.cancel();
            }
        }
        Err(e) => error!("step task did not finish: {e:?}"),
    }
}

enum When {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

struct StepTimer {
    step: SyncStep,
    when: When,
    next: DateTime<Utc>,
    running: Arc<tokio::sync::Mutex<()>>,
}

impl StepTimer {
    fn advance(&mut self, now: DateTime<Utc>) {
        self.next = match &self.when {
            When::Cron(schedule) => schedule
                .after(&now)
                .next()
                .unwrap_or_else(|| now + chrono::Duration::hours(1)),
            When::Every(d) => {
                now + chrono::Duration::from_std(*d).unwrap_or_else(|_| chrono::Duration::hours(1))
            }
        };
    }
}

/// `schedule` wins over `interval`; `@every <duration>` is sugar for an
/// interval. Five-field cron expressions get a seconds column prepended.
fn parse_schedule(step: &SyncStep) -> Result<When> {
    if let Some(s) = step.schedule.as_deref() {
        if let Some(rest) = s.strip_prefix("@every ") {
            return Ok(When::Every(parse_duration(rest.trim())?));
        }
        let parsed = cron::Schedule::from_str(s)
            .or_else(|_| cron::Schedule::from_str(&format!("0 {s}")))
            .map_err(|e| Error::InvalidInput(format!("bad schedule {s}: {e}")))?;
        return Ok(When::Cron(Box::new(parsed)));
    }
    Ok(When::Every(step.interval.unwrap_or(DEFAULT_INTERVAL)))
}
