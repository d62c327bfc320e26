use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nano_serve::{
    CacheConfig, DataType, Engine, EngineConfig, GenerationRequest, LogitsSampler, ModelContext,
    StaticWeights, SyntheticRuntime,
};

#[derive(Parser, Debug)]
#[command(name = "nano-serve")]
#[command(about = "Drive the continuous-batching core with a synthetic runtime")]
struct Args {
    /// Engine config JSON (defaults to a small CPU cache)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of requests to submit
    #[arg(short = 'n', long, default_value = "8")]
    num_requests: usize,

    /// Prompt length in tokens
    #[arg(long, default_value = "24")]
    prompt_len: usize,

    /// Maximum tokens to generate per request
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// Vocabulary size of the synthetic runtime
    #[arg(long, default_value = "1024")]
    vocab_size: usize,

    /// Sampling seed
    #[arg(long, default_value = "0")]
    seed: u64,
}

fn demo_config() -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            block_size: 16,
            num_device_blocks: 64,
            num_host_blocks: 64,
            num_layers: 2,
            num_kv_heads: 2,
            head_dim: 8,
            data_type: DataType::Float32,
            enable_prefix_caching: true,
        },
        ..EngineConfig::default()
    }
}

fn main() -> nano_serve::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nano_serve=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => demo_config(),
    };

    let context = ModelContext::init(StaticWeights::new(
        config.cache.num_layers,
        config.cache.data_type,
    ))?;
    let engine = Engine::new(
        config,
        context.clone(),
        SyntheticRuntime::new(args.vocab_size),
        LogitsSampler::with_seed(args.seed),
    )?;
    let handle = engine.start()?;

    // Requests share a prompt prefix so prefix caching has something to hit.
    let shared_prefix: Vec<u32> = (1..=args.prompt_len as u32 / 2).collect();
    let mut requests = Vec::with_capacity(args.num_requests);
    for i in 0..args.num_requests {
        let mut prompt = shared_prefix.clone();
        prompt.extend((0..args.prompt_len - shared_prefix.len()).map(|t| (100 * i + t) as u32));
        let request = GenerationRequest::new(prompt)
            .max_new_tokens(args.max_tokens)
            .temperature(0.0)
            .priority(i as i32 % 3);
        requests.push(handle.enqueue(request)?);
    }

    // Stream the first request, wait for the rest.
    let mut requests = requests.into_iter();
    if let Some(mut first) = requests.next() {
        let mut streamed = 0;
        while let Some(tokens) = first.next_step(Duration::from_secs(10)) {
            if tokens.is_empty() {
                break;
            }
            streamed += tokens.len();
            info!(request_id = first.id(), new_tokens = ?tokens, "streamed");
        }
        info!(request_id = first.id(), streamed, reason = ?first.finish_reason(), "stream done");
    }
    for request in requests {
        let output = request.wait();
        println!(
            "request {}: {} tokens ({})",
            output.request_id,
            output.output_tokens.len(),
            output.finish_reason.as_str()
        );
    }

    handle.stop();
    context.teardown();
    Ok(())
}
