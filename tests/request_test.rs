//! Integration tests for Request.

use std::sync::Arc;
use std::time::Duration;

use nano_serve::config::{CacheConfig, DataType, SamplingConfig};
use nano_serve::core::block_manager::BlockManager;
use nano_serve::core::request::{FinishReason, Request, RequestState, Stage};
use nano_serve::core::waiter::Waiter;
use nano_serve::Error;

fn test_manager(block_size: usize, device_blocks: usize, devices: usize) -> Arc<BlockManager> {
    let cache = CacheConfig {
        block_size,
        num_device_blocks: device_blocks,
        num_host_blocks: device_blocks,
        num_layers: 1,
        num_kv_heads: 1,
        head_dim: 2,
        data_type: DataType::Float32,
        enable_prefix_caching: false,
    };
    Arc::new(BlockManager::new(&cache, devices).unwrap())
}

fn test_request(id: u64, prompt_len: usize, manager: &Arc<BlockManager>) -> Request {
    let tokens = (0..prompt_len as u32).collect();
    Request::new(id, tokens, SamplingConfig::default(), Arc::clone(manager))
}

#[test]
fn test_new_request() {
    let manager = test_manager(16, 8, 1);
    let request = test_request(7, 10, &manager);
    assert_eq!(request.id(), 7);
    assert_eq!(request.stage(), Stage::Waiting);
    assert_eq!(request.input_tokens().len(), 10);
    assert_eq!(request.output_tokens(), request.input_tokens());
    assert!(request.generated_tokens().is_empty());
    assert_eq!(request.current_block_count(), 0);
    assert!(!request.is_swapped());
}

#[test]
fn test_block_demand_across_block_boundary() {
    let manager = test_manager(16, 8, 1);
    let mut request = test_request(1, 10, &manager);

    // Prompt step: 10 prompt tokens + 1
    assert_eq!(request.step_token_count(), 11);
    assert_eq!(request.total_token_count(), 11);
    assert_eq!(request.total_block_count(), 1);
    assert_eq!(request.step_block_count(), 1);

    request.enter_context_decode().unwrap();
    request.allocate_step_blocks().unwrap();
    assert_eq!(request.current_block_count(), 1);
    assert_eq!(request.pending_block_count(), 0);

    request.append_token(100);
    request.reset_stage();
    assert_eq!(request.stage(), Stage::Decode);
    assert_eq!(request.step_token_count(), 1);

    // Outputs 11..=15 stay inside the first block
    for token in 101..=104 {
        assert_eq!(request.step_block_count(), 0);
        request.append_token(token);
    }
    assert_eq!(request.output_tokens().len(), 15);
    assert_eq!(request.total_token_count(), 16);
    assert_eq!(request.step_block_count(), 0);

    // The 17th token crosses into a second block
    request.append_token(105);
    assert_eq!(request.total_token_count(), 17);
    assert_eq!(request.total_block_count(), 2);
    assert_eq!(request.step_block_count(), 1);
    assert_eq!(request.pending_block_count(), 1);

    request.allocate_step_blocks().unwrap();
    assert_eq!(request.current_block_count(), 2);
    assert_eq!(manager.num_free_blocks(0).unwrap(), 6);
}

#[test]
fn test_invalid_stage_transitions() {
    let manager = test_manager(4, 8, 1);
    let mut request = test_request(1, 3, &manager);
    request.enter_context_decode().unwrap();
    assert!(matches!(
        request.enter_context_decode(),
        Err(Error::InvalidStageTransition { from: "ContextDecode", .. })
    ));

    // No token yet, so the stage stays
    request.reset_stage();
    assert_eq!(request.stage(), Stage::ContextDecode);
}

#[test]
fn test_allocation_failure_rolls_back_all_devices() {
    let manager = test_manager(4, 2, 2);
    // Device 1 is one block short of device 0
    let taken = manager.allocate_blocks(1, 1).unwrap();

    let mut request = test_request(1, 6, &manager);
    assert_eq!(request.total_block_count(), 2);
    let err = request.allocate_step_blocks().unwrap_err();
    assert!(err.is_resource_exhausted());
    assert_eq!(request.current_block_count(), 0);
    assert_eq!(manager.num_free_blocks(0).unwrap(), 2);
    assert_eq!(manager.num_free_blocks(1).unwrap(), 1);

    manager.free_blocks(&taken, 1).unwrap();
    request.allocate_step_blocks().unwrap();
    assert_eq!(manager.min_free_blocks(), 0);
}

#[test]
fn test_swap_out_and_in() {
    let manager = test_manager(4, 4, 2);
    let mut request = test_request(1, 6, &manager);
    request.allocate_step_blocks().unwrap();
    assert_eq!(manager.num_free_blocks(0).unwrap(), 2);

    request.swap_out_async().unwrap();
    assert!(request.is_swapped());
    assert_eq!(request.current_block_count(), 2);
    for device in 0..2 {
        assert_eq!(manager.num_free_blocks(device).unwrap(), 4);
        assert_eq!(manager.num_free_host_blocks(device).unwrap(), 2);
    }

    // Growing a swapped request is refused
    assert!(matches!(
        request.allocate_step_blocks(),
        Err(Error::InvalidArgument(_))
    ));

    request.swap_in_async().unwrap();
    assert!(!request.is_swapped());
    for device in 0..2 {
        assert_eq!(manager.num_free_blocks(device).unwrap(), 2);
        assert_eq!(manager.num_free_host_blocks(device).unwrap(), 4);
    }
}

#[test]
fn test_drop_swapped_releases_host_blocks() {
    let manager = test_manager(4, 4, 1);
    let mut request = test_request(1, 6, &manager);
    request.allocate_step_blocks().unwrap();
    request.swap_out_async().unwrap();

    request.drop_swapped_async().unwrap();
    assert!(!request.is_swapped());
    assert_eq!(request.current_block_count(), 0);
    assert_eq!(manager.num_free_host_blocks(0).unwrap(), 4);
    assert_eq!(manager.num_free_blocks(0).unwrap(), 4);
}

#[test]
fn test_finish_releases_blocks_and_publishes() {
    let manager = test_manager(4, 4, 1);
    let state = Arc::new(RequestState::new());
    let waiter = Arc::new(Waiter::new());
    let mut request = test_request(1, 3, &manager)
        .with_state(Arc::clone(&state))
        .with_waiter(Arc::clone(&waiter));
    request.allocate_step_blocks().unwrap();
    request.append_token(9);

    let seen = waiter.generation();
    request.finish(FinishReason::MaxTokens).unwrap();
    assert_eq!(request.stage(), Stage::Finished);
    assert_eq!(manager.num_free_blocks(0).unwrap(), 4);
    assert!(waiter.generation() > seen);
    assert!(state.is_finished());
    assert_eq!(state.finish_reason(), Some(FinishReason::MaxTokens));
    assert_eq!(state.generated_tokens(), vec![9]);

    // Finishing twice keeps the first reason
    request.finish(FinishReason::Cancelled).unwrap();
    assert_eq!(state.finish_reason(), Some(FinishReason::MaxTokens));
}

#[test]
fn test_step_notification_skips_completion_waiter() {
    let manager = test_manager(4, 4, 1);
    let waiter = Arc::new(Waiter::new());
    let step_waiter = Arc::new(Waiter::new());
    let request = test_request(1, 3, &manager)
        .with_waiter(Arc::clone(&waiter))
        .with_step_waiter(Arc::clone(&step_waiter));

    let done = waiter.generation();
    let step = step_waiter.generation();
    request.notify_step();
    assert_eq!(waiter.generation(), done);
    assert!(step_waiter.wait_timeout(step, Duration::from_millis(100)).is_some());

    request.notify();
    assert!(waiter.wait_timeout(done, Duration::from_millis(100)).is_some());
}

#[test]
fn test_notify_with_only_step_waiter() {
    let manager = test_manager(4, 4, 1);
    let step_waiter = Arc::new(Waiter::new());
    let mut request = test_request(1, 3, &manager).with_step_waiter(Arc::clone(&step_waiter));

    let seen = step_waiter.generation();
    request.notify_step();
    request.notify();
    request.finish(FinishReason::EndOfSequence).unwrap();
    assert!(step_waiter.generation() >= seen + 3);
}

#[test]
fn test_cancel_flag_is_shared() {
    let manager = test_manager(4, 4, 1);
    let state = Arc::new(RequestState::new());
    let request = test_request(1, 3, &manager).with_state(Arc::clone(&state));
    assert!(!request.is_cancelled());
    state.cancel();
    assert!(request.is_cancelled());
}

#[test]
fn test_prefix_reuse_leaves_last_token() {
    let manager = test_manager(4, 8, 1);

    let mut first = test_request(1, 8, &manager);
    first.enter_context_decode().unwrap();
    first.allocate_step_blocks().unwrap();
    first.register_prefix_blocks().unwrap();
    assert_eq!(manager.num_cached_prefixes(0).unwrap(), 2);

    // Same 8-token prompt: only the first block can be reused
    let mut second = test_request(2, 8, &manager);
    assert_eq!(second.reuse_cached_prefix().unwrap(), 4);
    assert_eq!(second.prefix_cached_tokens(), 4);
    assert_eq!(second.current_block_count(), 1);
    let shared = first.block_table(0).unwrap().ids()[0];
    assert_eq!(second.block_table(0).unwrap().ids()[0], shared);
    assert_eq!(manager.ref_count(shared, 0).unwrap(), Some(2));

    // Remaining demand excludes the reused block
    assert_eq!(second.pending_block_count(), second.total_block_count() - 1);

    second.release_cached_prefix().unwrap();
    assert_eq!(second.prefix_cached_tokens(), 0);
    assert_eq!(manager.ref_count(shared, 0).unwrap(), Some(1));
}

#[test]
fn test_drop_releases_blocks() {
    let manager = test_manager(4, 4, 1);
    {
        let mut request = test_request(1, 6, &manager);
        request.allocate_step_blocks().unwrap();
        assert_eq!(manager.num_free_blocks(0).unwrap(), 2);
    }
    assert_eq!(manager.num_free_blocks(0).unwrap(), 4);
}

#[test]
fn test_free_blocks_twice_is_noop() {
    let manager = test_manager(4, 4, 2);
    let mut request = test_request(1, 6, &manager);
    request.allocate_step_blocks().unwrap();

    request.free_blocks().unwrap();
    request.free_blocks().unwrap();
    for device in 0..2 {
        assert_eq!(manager.num_free_blocks(device).unwrap(), 4);
        assert_eq!(manager.num_used_blocks(device).unwrap(), 0);
    }
}

#[test]
fn test_reset_for_recompute() {
    let manager = test_manager(4, 4, 2);
    let mut request = test_request(1, 3, &manager);
    assert!(matches!(
        request.reset_for_recompute(),
        Err(Error::InvalidStageTransition { from: "Waiting", .. })
    ));

    request.enter_context_decode().unwrap();
    request.allocate_step_blocks().unwrap();
    request.append_token(50);
    request.reset_stage();
    request.allocate_step_blocks().unwrap();
    assert_eq!(request.current_block_count(), 2);

    request.reset_for_recompute().unwrap();
    assert_eq!(request.stage(), Stage::Waiting);
    assert_eq!(request.current_block_count(), 0);
    for device in 0..2 {
        assert_eq!(manager.num_free_blocks(device).unwrap(), 4);
    }

    // The next context step covers the prompt and the generated token.
    assert_eq!(request.input_tokens(), &[0, 1, 2, 50]);
    assert_eq!(request.generated_tokens(), &[50]);
    assert_eq!(request.step_token_count(), 5);
    assert_eq!(request.total_block_count(), 2);
    assert_eq!(request.step_block_count(), 2);
}
