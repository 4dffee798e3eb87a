//! Integration tests for the threaded engine front door.

use std::collections::HashSet;

use inflight_batcher::{
    spawn_engine, EngineConfig, Error, GenerationRequest, RequestStatus, SyntheticEngine,
};

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.cache.block_size = 4;
    config.cache.num_blocks = 64;
    config
}

#[tokio::test]
async fn test_submit_and_await() {
    let config = config();
    let executor = SyntheticEngine::new(&config, 1);
    let (handle, thread) = spawn_engine(config, executor).unwrap();

    let output = handle
        .generate(GenerationRequest::new(vec![1, 2, 3]).max_new_tokens(5))
        .await
        .unwrap();
    assert_eq!(output.status, RequestStatus::Finished);
    assert_eq!(output.prompt_len, 3);
    assert_eq!(output.outputs[0].token_ids.len(), 5);

    drop(handle);
    thread.join().unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submitters() {
    let config = config();
    let executor = SyntheticEngine::new(&config, 2);
    let (handle, thread) = spawn_engine(config, executor).unwrap();

    let mut tasks = Vec::new();
    for i in 0..16u32 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            let request = GenerationRequest::new(vec![i + 1; (i as usize % 5) + 1])
                .max_new_tokens(4)
                .priority((i % 3) as i32);
            handle.generate(request).await
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        let output = task.await.unwrap().unwrap();
        assert_eq!(output.status, RequestStatus::Finished);
        assert_eq!(output.outputs[0].token_ids.len(), 4);
        ids.insert(output.request_id);
    }
    assert_eq!(ids.len(), 16);

    drop(handle);
    thread.join().unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_resolves_waiter() {
    let config = config();
    let executor = SyntheticEngine::new(&config, 3);
    let (handle, thread) = spawn_engine(config, executor).unwrap();

    let (request_id, result) = handle
        .submit(GenerationRequest::new(vec![1]).max_new_tokens(200))
        .unwrap();
    let ack = handle.cancel(request_id).unwrap();

    assert!(ack.await.unwrap());
    let output = result.await.unwrap();
    assert_eq!(output.request_id, request_id);
    assert_eq!(output.status, RequestStatus::Cancelled);

    // Already delivered: a second cancel changes nothing
    assert!(!handle.cancel(request_id).unwrap().await.unwrap());
    assert!(!handle.cancel(12345).unwrap().await.unwrap());

    drop(handle);
    thread.join().unwrap().unwrap();
}

#[tokio::test]
async fn test_invalid_request_rejected_on_submit() {
    let config = config();
    let executor = SyntheticEngine::new(&config, 4);
    let (handle, thread) = spawn_engine(config, executor).unwrap();

    assert!(matches!(
        handle.submit(GenerationRequest::new(vec![])),
        Err(Error::InvalidRequest(_))
    ));

    drop(handle);
    thread.join().unwrap().unwrap();
}

#[test]
fn test_engine_exits_with_work_in_flight() {
    let config = config();
    let executor = SyntheticEngine::new(&config, 5);
    let (handle, thread) = spawn_engine(config, executor).unwrap();

    let submitter = handle.submitter().clone();
    for _ in 0..4 {
        submitter
            .submit(GenerationRequest::new(vec![1, 2]).max_new_tokens(8))
            .unwrap();
    }
    drop(submitter);
    drop(handle);

    // Accepted work is finished before the loop returns
    thread.join().unwrap().unwrap();
}
