use std::collections::BTreeMap;

use serde::Serialize;
use tokstep_core::config::DecoderKind;
use tokstep_core::decoder::{build_decoder, Decoder, NativeDecoder};
use tokstep_core::executor::{Executor, ModelExecutor, StepStats};
use tokstep_core::native::ReferenceNativeEngine;
use tokstep_core::request::{FinishReason, LlmRequest, RequestId};
use tokstep_core::scheduler::FcfsScheduler;
use tracing::info;

use crate::config::DriverConfig;
use crate::model::SyntheticModel;

#[derive(Debug, Serialize)]
pub struct RequestSummary {
    pub id: RequestId,
    pub generated_tokens: usize,
    pub tokens: Vec<u32>,
    pub finish_reason: FinishReason,
    pub accepted_draft_tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub decoder: String,
    pub overlap: bool,
    pub steps: usize,
    pub total_rows: usize,
    pub committed_tokens: usize,
    pub finish_reasons: BTreeMap<String, usize>,
    pub requests: Vec<RequestSummary>,
}

fn build(config: &DriverConfig) -> anyhow::Result<Box<dyn Decoder>> {
    let decoder = &config.decoder;
    if decoder.kind != DecoderKind::Native {
        return Ok(build_decoder(decoder)?);
    }
    let slots = decoder.max_batch_size.max(config.scheduler.max_batch_size);
    let engine = ReferenceNativeEngine::new(slots, decoder.max_beam_width, decoder.max_seq_len);
    Ok(Box::new(NativeDecoder::new(engine, decoder)?))
}

fn workload(config: &DriverConfig) -> Vec<LlmRequest> {
    let w = &config.workload;
    (0..w.requests as RequestId)
        .map(|id| {
            let prompt = (0..w.prompt_len)
                .map(|i| ((id as usize + i) % w.vocab_size) as u32)
                .collect();
            let request = LlmRequest::new(id, prompt, w.max_new_tokens, w.sampling.clone());
            match w.end_id {
                Some(end_id) => request.with_end_id(end_id),
                None => request,
            }
        })
        .collect()
}

/// Run the configured workload to completion.
pub fn run(config: &DriverConfig) -> anyhow::Result<RunSummary> {
    let model = SyntheticModel::new(config.workload.vocab_size, config.decoder.seed)
        .with_rows_per_beam(config.decoder.kind == DecoderKind::Native);
    run_with(config, model)
}

/// Run the configured workload against `model`.
pub fn run_with<M: ModelExecutor>(config: &DriverConfig, model: M) -> anyhow::Result<RunSummary> {
    config.decoder.validate()?;
    anyhow::ensure!(
        config.workload.vocab_size > 0,
        "vocab_size must be > 0"
    );
    let decoder = build(config)?;
    let scheduler = FcfsScheduler::new(config.scheduler);
    let mut executor = Executor::new(decoder, model, scheduler, config.decoder.overlap);
    for request in workload(config) {
        executor.add_request(request);
    }

    let w = &config.workload;
    // Every step either prefills or commits, so this bound is never reached
    // by a healthy run.
    let max_steps = w.requests.max(1) * (w.prompt_len + w.max_new_tokens + 2);
    let stats = executor.run_until_idle(max_steps)?;
    anyhow::ensure!(executor.is_idle(), "workload unfinished after {max_steps} steps");

    let mut finished = executor.take_finished();
    finished.sort_by_key(|r| r.id);
    let summary = summarize(config, &stats, &finished);
    info!(
        decoder = %summary.decoder,
        steps = summary.steps,
        tokens = summary.committed_tokens,
        "simulation complete"
    );
    Ok(summary)
}

fn summarize(config: &DriverConfig, stats: &[StepStats], finished: &[LlmRequest]) -> RunSummary {
    let mut finish_reasons = BTreeMap::new();
    let requests = finished
        .iter()
        .map(|request| {
            let reason = request.finished_reason(0);
            let key = serde_json::to_value(reason)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| format!("{reason:?}"));
            *finish_reasons.entry(key).or_insert(0) += 1;
            RequestSummary {
                id: request.id,
                generated_tokens: request.generated_tokens(0).len(),
                tokens: request.generated_tokens(0).to_vec(),
                finish_reason: reason,
                accepted_draft_tokens: request.num_accepted_draft_tokens,
            }
        })
        .collect();
    RunSummary {
        decoder: config.decoder.kind.to_string(),
        overlap: config.decoder.overlap,
        steps: stats.len(),
        total_rows: stats.iter().map(|s| s.rows).sum(),
        committed_tokens: stats.iter().map(|s| s.committed_tokens).sum(),
        finish_reasons,
        requests,
    }
}
