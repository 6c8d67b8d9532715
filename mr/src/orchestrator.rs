//! The word-count control-flow.
//!
//! `orchestrate` may be replayed from the start at any time, so every
//! decision in it depends only on the request and on activity results
//! handed back by the host. It reads no clock, draws no randomness and does
//! no I/O of its own.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::activity::{Activity, ActivityOutput};
use crate::error::{MrError, Result};
use crate::host::OrchestrationContext;
use crate::types::{
    GroupedEntry, InputRecord, JobRequest, MapperOutput, ReducedEntry, RunResult, TOP_N,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    ResolveInput,
    Mapping,
    MapBarrier,
    Shuffling,
    Reducing,
    ReduceBarrier,
    Aggregating,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }
}

fn unexpected(activity: &str, output: &ActivityOutput) -> MrError {
    MrError::fatal(activity, format!("unexpected {} output", output.kind()))
}

fn enter(ctx: &OrchestrationContext, phase: Phase) -> Result<()> {
    ctx.check_cancelled()?;
    ctx.set_phase(phase);
    Ok(())
}

pub async fn orchestrate(ctx: &OrchestrationContext, request: &JobRequest) -> Result<RunResult> {
    enter(ctx, Phase::ResolveInput)?;
    let records: Vec<InputRecord> = match request {
        JobRequest::Inline { lines } => lines
            .iter()
            .enumerate()
            .map(|(i, line)| InputRecord::new(i as u64, line.as_str()))
            .collect(),
        JobRequest::Store { container, blobs } => {
            let resolve = Activity::ResolveInput {
                container: container.clone(),
                blobs: blobs.clone(),
            };
            match ctx.call_activity(resolve).await? {
                ActivityOutput::Input(records) => records,
                other => return Err(unexpected("GetInputData", &other)),
            }
        }
    };
    let input_count = records.len() as u64;

    enter(ctx, Phase::Mapping)?;
    if !ctx.is_replaying() {
        info!("run {}: mapping {} input lines", ctx.run_id(), input_count);
    }
    let map_tasks = records
        .into_iter()
        .map(|record| ctx.call_activity(Activity::Map(record)))
        .collect();

    enter(ctx, Phase::MapBarrier)?;
    let map_results = ctx
        .task_all(map_tasks)
        .await?
        .into_iter()
        .map(|output| match output {
            ActivityOutput::Mapped(pairs) => Ok(pairs),
            other => Err(unexpected("Mapper", &other)),
        })
        .collect::<Result<Vec<MapperOutput>>>()?;

    enter(ctx, Phase::Shuffling)?;
    let grouped: Vec<GroupedEntry> = match ctx.call_activity(Activity::Shuffle(map_results)).await? {
        ActivityOutput::Shuffled(grouped) => grouped,
        other => return Err(unexpected("Shuffler", &other)),
    };

    enter(ctx, Phase::Reducing)?;
    if !ctx.is_replaying() {
        info!("run {}: reducing {} distinct words", ctx.run_id(), grouped.len());
    }
    let reduce_tasks = grouped
        .into_iter()
        .map(|entry| ctx.call_activity(Activity::Reduce(entry)))
        .collect();

    enter(ctx, Phase::ReduceBarrier)?;
    let reduced = ctx
        .task_all(reduce_tasks)
        .await?
        .into_iter()
        .map(|output| match output {
            ActivityOutput::Reduced(entry) => Ok(entry),
            other => Err(unexpected("Reducer", &other)),
        })
        .collect::<Result<Vec<ReducedEntry>>>()?;

    enter(ctx, Phase::Aggregating)?;
    Ok(aggregate(input_count, reduced))
}

/// Builds the final summary. `top_30` is ordered by descending total, then
/// ascending word.
pub fn aggregate(input_count: u64, reduced: Vec<ReducedEntry>) -> RunResult {
    let mut ranked: Vec<(String, u64)> = reduced.into_iter().map(|e| (e.word, e.total)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let all_counts = ranked.iter().cloned().collect();
    let unique_words = ranked.len() as u64;
    ranked.truncate(TOP_N);
    RunResult {
        input_count,
        unique_words,
        top_30: ranked,
        all_counts,
    }
}
