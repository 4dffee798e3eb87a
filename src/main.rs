use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use inflight_batcher::{
    EngineConfig, GenerationRequest, LLMEngine, PreemptionMode, RequestStatus, Result,
    SchedulerStats, SyntheticEngine,
};

#[derive(Parser, Debug)]
#[command(name = "inflight-batcher")]
#[command(about = "Drive a synthetic workload through the continuous batching scheduler")]
struct Args {
    /// JSON engine configuration; the flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tokens per KV cache block
    #[arg(long)]
    block_size: Option<usize>,

    /// Device blocks in the pool
    #[arg(long)]
    num_blocks: Option<usize>,

    /// Host blocks for swap preemption
    #[arg(long)]
    num_host_blocks: Option<usize>,

    /// Maximum sequences per step
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Maximum tokens per step
    #[arg(long)]
    max_aggregate_tokens: Option<usize>,

    /// Preemption policy
    #[arg(long, value_enum)]
    preemption_mode: Option<Mode>,

    /// Share full prompt blocks between requests
    #[arg(long)]
    prefix_caching: bool,

    /// End-of-sequence token
    #[arg(long)]
    eos_token_id: Option<u32>,

    /// Probability that a sampled token is EOS
    #[arg(long, default_value = "0.0")]
    eos_probability: f64,

    /// Number of requests to generate
    #[arg(short = 'n', long, default_value = "64")]
    num_requests: usize,

    #[arg(long, default_value = "8")]
    min_prompt_len: usize,

    #[arg(long, default_value = "128")]
    max_prompt_len: usize,

    /// Maximum tokens to generate per sample
    #[arg(long, default_value = "64")]
    max_new_tokens: usize,

    /// Priorities are drawn from 0..=max_priority
    #[arg(long, default_value = "0")]
    max_priority: i32,

    /// Parallel samples per request
    #[arg(long, default_value = "1")]
    num_samples: usize,

    /// Leading tokens common to every prompt
    #[arg(long, default_value = "0")]
    shared_prefix_len: usize,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Recompute,
    Swap,
}

impl From<Mode> for PreemptionMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Recompute => PreemptionMode::Recompute,
            Mode::Swap => PreemptionMode::Swap,
        }
    }
}

#[derive(Serialize)]
struct Summary {
    num_requests: usize,
    statuses: BTreeMap<&'static str, usize>,
    generated_tokens: usize,
    num_preempted_requests: usize,
    elapsed_ms: u128,
    stats: SchedulerStats,
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(block_size) = args.block_size {
        config.cache.block_size = block_size;
    }
    if let Some(num_blocks) = args.num_blocks {
        config.cache.num_blocks = num_blocks;
    }
    if let Some(num_host_blocks) = args.num_host_blocks {
        config.cache.num_host_blocks = num_host_blocks;
    }
    if let Some(max_batch_size) = args.max_batch_size {
        config.scheduler.max_batch_size = max_batch_size;
    }
    if let Some(max_aggregate_tokens) = args.max_aggregate_tokens {
        config.scheduler.max_aggregate_tokens = max_aggregate_tokens;
    }
    if let Some(mode) = args.preemption_mode {
        config.scheduler.preemption_mode = mode.into();
    }
    if args.prefix_caching {
        config.cache.enable_prefix_caching = true;
    }
    if args.eos_token_id.is_some() {
        config.eos_token_id = args.eos_token_id;
    }
    config.validate()?;
    Ok(config)
}

fn workload(args: &Args, rng: &mut StdRng) -> Vec<GenerationRequest> {
    let min_len = args.min_prompt_len.max(1);
    let max_len = args.max_prompt_len.max(min_len);
    let prefix: Vec<u32> = (1..=args.shared_prefix_len as u32).collect();

    (0..args.num_requests)
        .map(|_| {
            let len = rng.gen_range(min_len..=max_len);
            let mut prompt = prefix.clone();
            let start = prompt.len();
            prompt.extend((start..len.max(start + 1)).map(|_| rng.gen_range(1..32_000u32)));
            GenerationRequest::new(prompt)
                .max_new_tokens(args.max_new_tokens)
                .num_samples(args.num_samples)
                .priority(rng.gen_range(0..=args.max_priority.max(0)))
        })
        .collect()
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = build_config(&args)?;
    info!(?config, "starting simulation");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let executor = SyntheticEngine::new(&config, args.seed).with_eos_probability(args.eos_probability);
    let mut engine = LLMEngine::new(config, executor)?;

    let mut statuses: BTreeMap<&'static str, usize> = BTreeMap::new();
    for request in workload(&args, &mut rng) {
        if let Err(e) = engine.add_request(request) {
            warn!(error = %e, "request rejected");
            *statuses.entry("rejected").or_default() += 1;
        }
    }

    let start = Instant::now();
    let outputs = engine.generate()?;
    let elapsed_ms = start.elapsed().as_millis();

    let mut generated_tokens = 0;
    let mut num_preempted_requests = 0;
    for output in &outputs {
        let status = match output.status {
            RequestStatus::Finished => "finished",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Errored(_) => "errored",
            RequestStatus::ResourceExhausted => "resource_exhausted",
        };
        *statuses.entry(status).or_default() += 1;
        generated_tokens += output
            .outputs
            .iter()
            .map(|o| o.token_ids.len())
            .sum::<usize>();
        if output.num_preemptions > 0 {
            num_preempted_requests += 1;
        }
    }

    let summary = Summary {
        num_requests: args.num_requests,
        statuses,
        generated_tokens,
        num_preempted_requests,
        elapsed_ms,
        stats: engine.stats(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
