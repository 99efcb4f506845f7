//! Integration tests for detached container lifecycles
//!
//! Every scenario checks that no started instance outlives `detach`.

use bench_harness::container::RuntimeError;
use bench_harness::wait::PollConfig;
use bench_harness::{ContainerHandle, ContainerParams, HarnessError, Machine};
use bench_harness_test_utils::{fake_machine, FakeRuntime};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;

fn machine(runtime: &Arc<FakeRuntime>) -> Machine {
    fake_machine("bench-host", "10.0.0.7", Arc::clone(runtime))
}

async fn crashing_driver() -> bench_harness::Result<()> {
    panic!("driver bug")
}

async fn handle(runtime: &Arc<FakeRuntime>, params: ContainerParams) -> ContainerHandle {
    machine(runtime)
        .container("bench/memcached", params)
        .await
        .unwrap()
        .with_readiness(PollConfig::fixed(Duration::from_millis(5)).with_timeout(Duration::from_secs(5)))
}

#[tokio::test]
async fn start_failure_kills_only_what_started() {
    let runtime = Arc::new(FakeRuntime::new("memcached").fail_start_at(1));
    let mut server = handle(&runtime, ContainerParams::default().with_count(3)).await;

    let err = server
        .detach(&[], |_| async { Ok(()) }.boxed())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Runtime(RuntimeError::Failed { .. })));
    assert_eq!(runtime.started(), ["memcached-0"]);
    assert_eq!(runtime.killed(), ["memcached-0"]);
    assert_eq!(server.get_names().count(), 0);
}

#[tokio::test]
async fn instances_are_killed_after_body_error() {
    let runtime = Arc::new(FakeRuntime::new("memcached"));
    let mut server = handle(&runtime, ContainerParams::default().with_count(2)).await;

    let err = server
        .detach(&[("threads", "4")], |server| {
            async move {
                assert_eq!(server.get_names().count(), 2);
                Err::<(), _>(HarnessError::Precondition("client crashed".into()))
            }
            .boxed()
        })
        .await
        .unwrap_err();

    assert!(err.is_precondition());
    assert_eq!(runtime.killed(), ["memcached-0", "memcached-1"]);
    assert!(runtime.live().is_empty());
}

#[tokio::test]
async fn instances_are_killed_after_body_panic() {
    let runtime = Arc::new(FakeRuntime::new("memcached"));
    let mut server = handle(&runtime, ContainerParams::default()).await;

    let task = tokio::spawn(async move {
        server
            .detach(&[], |_| crashing_driver().boxed())
            .await
    });

    let err = task.await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(runtime.killed(), ["memcached-0"]);
}

#[tokio::test]
async fn instances_are_killed_when_body_panics_before_returning_a_future() {
    let runtime = Arc::new(FakeRuntime::new("memcached"));
    let mut server = handle(&runtime, ContainerParams::default()).await;

    let task = tokio::spawn(async move {
        server
            .detach(&[], |_| {
                if !driver_setup_succeeds() {
                    panic!("setup bug");
                }
                async { Ok(()) }.boxed()
            })
            .await
    });

    let err = task.await.unwrap_err();
    assert!(err.is_panic());
    assert_eq!(runtime.killed(), ["memcached-0"]);
    assert!(runtime.live().is_empty());
}

fn driver_setup_succeeds() -> bool {
    false
}

#[tokio::test]
async fn instances_already_gone_are_not_an_error() {
    let runtime = Arc::new(FakeRuntime::new("memcached").kill_not_found());
    let mut server = handle(&runtime, ContainerParams::default().with_count(2)).await;

    let value = server
        .detach(&[], |_| async { Ok(42) }.boxed())
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(runtime.killed().len(), 2);
}

#[tokio::test]
async fn body_waits_until_every_instance_runs() {
    let runtime = Arc::new(FakeRuntime::new("memcached").running_after(3));
    let mut server = handle(&runtime, ContainerParams::default().with_count(2)).await;

    let observed = Arc::clone(&runtime);
    server
        .detach(&[], move |_| {
            async move {
                assert_eq!(observed.started().len(), 2);
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();
    assert!(runtime.live().is_empty());
}

#[tokio::test]
async fn readiness_timeout_cleans_up() {
    let runtime = Arc::new(FakeRuntime::new("memcached").running_after(usize::MAX));
    let mut server = machine(&runtime)
        .container("bench/memcached", ContainerParams::default())
        .await
        .unwrap()
        .with_readiness(PollConfig::fixed(Duration::from_millis(5)).with_timeout(Duration::from_millis(50)));

    let err = server
        .detach(&[], |_| async { Ok(()) }.boxed())
        .await
        .unwrap_err();

    assert!(matches!(err, HarnessError::Runtime(RuntimeError::Timeout(_))));
    assert_eq!(runtime.killed(), ["memcached-0"]);
}

#[tokio::test]
async fn address_reports_mapped_port() {
    let runtime = Arc::new(FakeRuntime::new("memcached").with_port(11211, 49153));
    let mut server = handle(&runtime, ContainerParams::default().with_port(11211)).await;

    assert!(server.address().await.unwrap_err().is_precondition());

    let address = server
        .detach(&[], |server| async move { server.address().await }.boxed())
        .await
        .unwrap();
    assert_eq!(address, ("10.0.0.7".to_string(), 49153));
}

#[tokio::test]
async fn address_needs_a_reserved_port_and_single_instance() {
    let runtime = Arc::new(FakeRuntime::new("memcached"));

    let mut unported = handle(&runtime, ContainerParams::default()).await;
    let err = unported
        .detach(&[], |server| async move { server.address().await }.boxed())
        .await
        .unwrap_err();
    assert!(err.is_precondition());

    let mut several = handle(&runtime, ContainerParams::default().with_count(2)).await;
    let err = several
        .detach(&[], |server| async move { server.address().await }.boxed())
        .await
        .unwrap_err();
    assert!(err.is_precondition());
    assert!(runtime.live().is_empty());
}

#[tokio::test]
async fn invalid_params_are_rejected_before_starting() {
    let runtime = Arc::new(FakeRuntime::new("memcached"));
    let machine = machine(&runtime);

    for params in [
        ContainerParams::default().with_count(0),
        ContainerParams::default().with_count(2).with_port(80),
    ] {
        let err = machine.container("bench/memcached", params).await.unwrap_err();
        assert!(err.is_precondition());
    }
    assert!(runtime.started().is_empty());
}

#[tokio::test]
async fn synchronous_run_passes_env_and_runtime() {
    let runtime = Arc::new(FakeRuntime::new("memcached").with_run_output("done\n"));
    let client = machine(&runtime)
        .container("bench/client", ContainerParams::default().with_runtime("runsc"))
        .await
        .unwrap();

    assert_eq!(client.run(&[("flags", "-n 10")]).await.unwrap(), "done\n");
    let runs = runtime.runs();
    assert_eq!(runs[0].runtime, "runsc");
    assert_eq!(runs[0].env, [("flags".to_string(), "-n 10".to_string())]);
    assert!(runtime.started().is_empty());
}
