//! Integration tests for Engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use candle_core::IndexOp;
use nano_serve::config::{CacheConfig, DataType, EngineConfig, SchedulerConfig};
use nano_serve::core::request::FinishReason;
use nano_serve::engine::{
    Engine, GenerationRequest, LogitsSampler, ModelContext, StaticWeights, SyntheticRuntime,
};
use nano_serve::Error;

const WAIT: Duration = Duration::from_secs(10);

fn test_config(device_blocks: usize) -> EngineConfig {
    EngineConfig {
        cache: CacheConfig {
            block_size: 4,
            num_device_blocks: device_blocks,
            num_host_blocks: 32,
            num_layers: 2,
            num_kv_heads: 1,
            head_dim: 2,
            data_type: DataType::Float32,
            enable_prefix_caching: true,
        },
        idle_wait_ms: 1,
        ..EngineConfig::default()
    }
}

fn test_engine_with(config: EngineConfig, runtime: SyntheticRuntime) -> Engine {
    let context = ModelContext::init(StaticWeights::new(
        config.cache.num_layers,
        config.cache.data_type,
    ))
    .unwrap();
    Engine::new(config, context, runtime, LogitsSampler::with_seed(0)).unwrap()
}

fn test_engine(device_blocks: usize) -> Engine {
    test_engine_with(test_config(device_blocks), SyntheticRuntime::new(64))
}

fn greedy(prompt: Vec<u32>, max_new_tokens: usize) -> GenerationRequest {
    GenerationRequest::new(prompt)
        .max_new_tokens(max_new_tokens)
        .temperature(0.0)
}

#[test]
fn test_generates_until_max_tokens() {
    let mut engine = test_engine(16);
    let handle = engine.submitter().enqueue(greedy(vec![1, 2, 3], 5)).unwrap();

    let finished = engine.run_until_idle().unwrap();
    assert_eq!(finished, vec![(handle.id(), FinishReason::MaxTokens)]);

    let output = handle.wait();
    assert_eq!(output.output_tokens, vec![4, 5, 6, 7, 8]);
    assert_eq!(output.finish_reason, FinishReason::MaxTokens);
    assert_eq!(engine.block_manager().num_free_blocks(0).unwrap(), 16);
    assert!(!engine.has_unfinished_requests());
}

#[test]
fn test_stop_token_ends_generation() {
    let mut engine = test_engine(16);
    let handle = engine
        .submitter()
        .enqueue(greedy(vec![1, 2, 3], 10).stop_token_ids(vec![6]))
        .unwrap();
    engine.run_until_idle().unwrap();

    let output = handle.wait_timeout(WAIT).unwrap();
    assert_eq!(output.output_tokens, vec![4, 5, 6]);
    assert_eq!(output.finish_reason, FinishReason::EndOfSequence);
}

#[test]
fn test_kv_written_for_forwarded_tokens() {
    let mut engine = test_engine(16);
    let handle = engine.submitter().enqueue(greedy(vec![7, 8, 9], 4)).unwrap();

    let outcome = engine.step().unwrap();
    assert_eq!(outcome.scheduled.context_decode, vec![handle.id()]);
    assert_eq!(outcome.scheduled.num_context_tokens, 3);

    let request = engine.scheduler().request(handle.id()).unwrap();
    let block = request.block_table(0).unwrap().ids()[0];
    let data = engine.block_manager().read_block(0, block).unwrap();
    for layer in 0..2 {
        for (offset, token) in [7f32, 8., 9.].iter().enumerate() {
            let key: Vec<f32> = data
                .i((layer, 0, offset))
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            let value: Vec<f32> = data
                .i((layer, 1, offset))
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            assert_eq!(key, vec![*token; 2]);
            assert_eq!(value, vec![-*token; 2]);
        }
    }

    // The decode step writes the first generated token at position 3
    engine.step().unwrap();
    let data = engine.block_manager().read_block(0, block).unwrap();
    let key: Vec<f32> = data.i((0, 0, 3)).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(key, vec![10.0; 2]);
}

#[test]
fn test_batches_multiple_requests() {
    let mut engine = test_engine(16);
    let submitter = engine.submitter();
    let handles: Vec<_> = (0..4)
        .map(|i| submitter.enqueue(greedy(vec![10 * i + 1, 10 * i + 2], 3)).unwrap())
        .collect();

    let outcome = engine.step().unwrap();
    assert_eq!(outcome.scheduled.context_decode.len(), 4);
    let outcome = engine.step().unwrap();
    assert_eq!(outcome.scheduled.decode.len(), 4);
    engine.run_until_idle().unwrap();

    for (i, handle) in handles.iter().enumerate() {
        let base = 10 * i as u32 + 2;
        assert_eq!(handle.wait().output_tokens, vec![base + 1, base + 2, base + 3]);
    }
}

#[test]
fn test_preemption_preserves_outputs() {
    // Six requests of up to 3 blocks each on a 6-block pool
    let mut engine = test_engine(6);
    let submitter = engine.submitter();
    let handles: Vec<_> = (0..6)
        .map(|i| submitter.enqueue(greedy(vec![i, i + 1, i + 2], 8)).unwrap())
        .collect();

    let mut preempted = 0;
    for _ in 0..500 {
        let outcome = engine.step().unwrap();
        preempted += outcome.scheduled.preempted.len();
        if !engine.has_unfinished_requests() {
            break;
        }
    }
    assert!(preempted > 0);
    for (i, handle) in handles.iter().enumerate() {
        let last = i as u32 + 2;
        let expected: Vec<u32> = (last + 1..=last + 8).collect();
        assert_eq!(handle.wait_timeout(WAIT).unwrap().output_tokens, expected);
    }
    assert_eq!(engine.block_manager().num_free_blocks(0).unwrap(), 6);
    assert_eq!(engine.block_manager().num_free_host_blocks(0).unwrap(), 32);
}

#[test]
fn test_recompute_preserves_outputs_without_host_pool() {
    let mut config = test_config(2);
    config.cache.num_host_blocks = 0;
    let mut engine = test_engine_with(config, SyntheticRuntime::new(64));
    let submitter = engine.submitter();
    let first = submitter.enqueue(greedy(vec![1, 2, 3], 4)).unwrap();
    let second = submitter.enqueue(greedy(vec![11, 12, 13], 4)).unwrap();

    let finished = engine.run_until_idle().unwrap();
    assert_eq!(finished.len(), 2);
    assert_eq!(first.wait_timeout(WAIT).unwrap().output_tokens, vec![4, 5, 6, 7]);
    assert_eq!(second.wait_timeout(WAIT).unwrap().output_tokens, vec![14, 15, 16, 17]);
    assert_eq!(engine.block_manager().num_free_blocks(0).unwrap(), 2);
}

#[test]
fn test_prefix_reuse_across_requests() {
    let mut engine = test_engine(16);
    let submitter = engine.submitter();
    let prompt: Vec<u32> = (20..28).collect();
    let first = submitter.enqueue(greedy(prompt.clone(), 6)).unwrap();
    engine.step().unwrap();

    let second = submitter.enqueue(greedy(prompt, 6)).unwrap();
    let outcome = engine.step().unwrap();
    assert_eq!(outcome.scheduled.admitted, vec![second.id()]);
    let request = engine.scheduler().request(second.id()).unwrap();
    assert_eq!(request.prefix_cached_tokens(), 4);

    engine.run_until_idle().unwrap();
    assert_eq!(first.wait().output_tokens, second.wait().output_tokens);
    assert_eq!(engine.block_manager().num_free_blocks(0).unwrap(), 16);
    assert_eq!(engine.block_manager().num_cached_prefixes(0).unwrap(), 0);
}

#[test]
fn test_cancel_waiting_request() {
    let engine = test_engine(16);
    let submitter = engine.submitter();
    let handle = submitter.enqueue(greedy(vec![1, 2], 4)).unwrap();

    submitter.cancel(handle.id()).unwrap();
    let output = handle.wait_timeout(WAIT).unwrap();
    assert_eq!(output.finish_reason, FinishReason::Cancelled);
    assert!(output.output_tokens.is_empty());
    assert_eq!(engine.scheduler().num_waiting(), 0);

    assert!(matches!(submitter.cancel(999), Err(Error::RequestNotFound(999))));
}

#[test]
fn test_cancel_running_request() {
    let mut engine = test_engine(16);
    let submitter = engine.submitter();
    let handle = submitter.enqueue(greedy(vec![1, 2], 20)).unwrap();
    engine.step().unwrap();
    engine.step().unwrap();

    submitter.cancel(handle.id()).unwrap();
    let outcome = engine.step().unwrap();
    assert_eq!(outcome.scheduled.cancelled, vec![handle.id()]);

    let output = handle.wait_timeout(WAIT).unwrap();
    assert_eq!(output.finish_reason, FinishReason::Cancelled);
    assert_eq!(output.output_tokens, vec![3, 4]);
    assert_eq!(engine.block_manager().num_free_blocks(0).unwrap(), 16);
    assert_eq!(submitter.num_live_requests(), 0);
}

#[test]
fn test_enqueue_validation() {
    let engine = test_engine(4);
    let submitter = engine.submitter();

    assert!(matches!(
        submitter.enqueue(greedy(vec![], 4)),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        submitter.enqueue(greedy(vec![1], 4).top_p(0.0)),
        Err(Error::InvalidArgument(_))
    ));
    // 10 + 8 tokens need 5 blocks of a 4-block pool
    assert!(matches!(
        submitter.enqueue(greedy((0..10).collect(), 8)),
        Err(Error::InvalidArgument(_))
    ));

    submitter.enqueue(greedy(vec![1], 4).request_id(42)).unwrap();
    assert!(matches!(
        submitter.enqueue(greedy(vec![1], 4).request_id(42)),
        Err(Error::InvalidArgument(_))
    ));
    assert_eq!(engine.scheduler().num_waiting(), 1);
}

#[test]
fn test_step_budget_validation() {
    let config = EngineConfig {
        scheduler: SchedulerConfig {
            max_step_tokens: 8,
            ..SchedulerConfig::default()
        },
        ..test_config(16)
    };
    let engine = test_engine_with(config, SyntheticRuntime::new(64));
    assert!(matches!(
        engine.submitter().enqueue(greedy((0..9).collect(), 1)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_mismatched_model_context() {
    let context = ModelContext::init(StaticWeights::new(3, DataType::Float32)).unwrap();
    let result = Engine::new(
        test_config(16),
        context,
        SyntheticRuntime::new(64),
        LogitsSampler::new(),
    );
    assert!(matches!(result, Err(Error::Config(_))));

    let context = ModelContext::init(StaticWeights::new(2, DataType::BFloat16)).unwrap();
    let result = Engine::new(
        test_config(16),
        context,
        SyntheticRuntime::new(64),
        LogitsSampler::new(),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_engine_thread_serves_requests() {
    let handle = test_engine(16).start().unwrap();
    let requests: Vec<_> = (0..3)
        .map(|i| handle.enqueue(greedy(vec![i + 1], 4)).unwrap())
        .collect();

    for (i, request) in requests.iter().enumerate() {
        let output = request.wait_timeout(WAIT).unwrap();
        let first = i as u32 + 2;
        assert_eq!(output.output_tokens, vec![first, first + 1, first + 2, first + 3]);
    }
    assert!(handle.is_running());
    handle.stop();
}

#[test]
fn test_streaming_matches_final_output() {
    let handle = test_engine(16).start().unwrap();
    let mut request = handle.enqueue(greedy(vec![5, 6, 7], 6)).unwrap();

    let mut streamed = Vec::new();
    loop {
        let tokens = request.next_step(WAIT).unwrap();
        if tokens.is_empty() {
            break;
        }
        streamed.extend(tokens);
    }
    assert!(request.is_finished());
    assert_eq!(streamed, request.wait().output_tokens);
    assert_eq!(streamed, vec![8, 9, 10, 11, 12, 13]);
    handle.stop();
}

#[test]
fn test_stop_cancels_in_flight_requests() {
    let handle = test_engine(16).start().unwrap();
    let submitter = handle.submitter();
    let request = handle.enqueue(greedy(vec![1], 15)).unwrap();
    handle.stop();

    let output = request.wait_timeout(WAIT).unwrap();
    assert!(matches!(
        output.finish_reason,
        FinishReason::Cancelled | FinishReason::MaxTokens
    ));
    assert!(matches!(
        submitter.enqueue(greedy(vec![1], 1)),
        Err(Error::Stopped)
    ));
}

#[test]
fn test_requests_accepted_during_shutdown_finish() {
    let handle = test_engine(64).start().unwrap();
    let producers: Vec<_> = (0..4)
        .map(|_| {
            let submitter = handle.submitter();
            std::thread::spawn(move || {
                let mut accepted = Vec::new();
                while let Ok(request) = submitter.enqueue(greedy(vec![1, 2], 3)) {
                    accepted.push(request);
                }
                accepted
            })
        })
        .collect();

    std::thread::sleep(Duration::from_millis(20));
    handle.stop();

    for producer in producers {
        for request in producer.join().unwrap() {
            let output = request.wait_timeout(WAIT).unwrap();
            assert!(matches!(
                output.finish_reason,
                FinishReason::Cancelled | FinishReason::MaxTokens
            ));
        }
    }
}

#[test]
fn test_device_failure_invokes_fatal_handler() {
    let failed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&failed);
    let engine = test_engine_with(test_config(16), SyntheticRuntime::new(64).with_failure_at(0))
        .with_fatal_handler(move |e| {
            assert!(e.is_fatal());
            flag.store(true, Ordering::SeqCst);
        });
    let handle = engine.start().unwrap();
    let request = handle.enqueue(greedy(vec![1, 2], 4)).unwrap();

    let output = request.wait_timeout(WAIT).unwrap();
    assert_eq!(output.finish_reason, FinishReason::Cancelled);
    assert!(failed.load(Ordering::SeqCst));
    assert!(!handle.is_running());
    handle.stop();
}
