//! End-to-end shutdown scenarios over the in-memory cluster.

use std::thread;
use std::time::{Duration, Instant};

use ringdown::test_utils::{init_test_logging, TestCluster};
use ringdown::types::RuntimeState;
use ringdown::LocalityId;
use ringdown::{assert_with_log, test_complete, test_phase};

fn init_test(name: &str) {
    init_test_logging();
    test_phase!(name);
}

#[test]
fn single_locality_happy_path() {
    init_test("single_locality_happy_path");

    let cluster = TestCluster::new(1);
    let mains = cluster.start_main_threads();

    let driver = {
        let server = cluster.servers[0].clone();
        thread::spawn(move || server.shutdown_all(10.0))
    };

    driver
        .join()
        .expect("driver panicked")
        .expect("shutdown_all failed");
    for main in mains {
        main.join().expect("main thread panicked");
    }

    let (stop_called, stop_done, terminated) = cluster.servers[0].stop_state();
    assert_with_log!(stop_called, "stop_called", true, stop_called);
    assert_with_log!(stop_done, "stop_done", true, stop_done);
    assert_with_log!(terminated, "terminated", true, terminated);

    // both hook phases were broadcast (even though no hooks are registered)
    let states = cluster.runtimes[0].states();
    assert!(states.contains(&RuntimeState::PreShutdown));
    assert!(states.contains(&RuntimeState::Shutdown));

    // the stop sequence unbound the fixed components and dropped the
    // locality from the partition table
    assert_eq!(cluster.agas[0].unbound().len(), 2);
    assert_eq!(cluster.agas[0].unregistered(), vec![LocalityId::CONSOLE]);

    // suspended workers were resumed, counters disabled
    assert!(cluster.threads[0].resume_calls() >= 1);
    assert!(cluster.runtimes[0].counters_disabled());

    // a clean stop never aborts
    assert_eq!(cluster.terminators[0].terminations(), 0);

    cluster.close();
    test_complete!("single_locality_happy_path");
}

#[test]
fn two_locality_black_then_white() {
    init_test("two_locality_black_then_white");

    let cluster = TestCluster::new(2);

    // locality 1 observed outgoing activity before the probe
    cluster.servers[1].dijkstra_make_black();

    let localities: Vec<LocalityId> = (0..2).map(LocalityId::from_raw).collect();
    let count = cluster.servers[0].dijkstra_termination_detection(&localities);

    // the first probe comes back black, a later one white
    assert_with_log!(count >= 2, "probe count", ">= 2", count);

    cluster.close();
    test_complete!("two_locality_black_then_white", probes = count);
}

#[test]
fn all_white_probe_completes_in_one_round() {
    init_test("all_white_probe_completes_in_one_round");

    let cluster = TestCluster::new(2);
    let localities: Vec<LocalityId> = (0..2).map(LocalityId::from_raw).collect();
    let count = cluster.servers[0].dijkstra_termination_detection(&localities);

    // nobody was black, so the very first probe returns white
    assert_with_log!(count == 1, "probe count", 1, count);

    cluster.close();
    test_complete!("all_white_probe_completes_in_one_round");
}

#[test]
fn full_cluster_shutdown_reaches_every_locality() {
    init_test("full_cluster_shutdown_reaches_every_locality");

    let cluster = TestCluster::new(3);
    let mains = cluster.start_main_threads();

    let driver = {
        let server = cluster.servers[0].clone();
        thread::spawn(move || server.shutdown_all(5.0))
    };

    driver
        .join()
        .expect("driver panicked")
        .expect("shutdown_all failed");
    for main in mains {
        main.join().expect("main thread panicked");
    }

    for (i, server) in cluster.servers.iter().enumerate() {
        let (stop_called, stop_done, terminated) = server.stop_state();
        assert_with_log!(
            stop_called && stop_done && terminated,
            "locality terminal state",
            (true, true, true),
            (stop_called, stop_done, terminated)
        );
        // each locality saw both shutdown hook phases
        let states = cluster.runtimes[i].states();
        assert!(states.contains(&RuntimeState::PreShutdown));
        assert!(states.contains(&RuntimeState::Shutdown));
        // and left the partition table
        assert_eq!(
            cluster.agas[i].unregistered(),
            vec![LocalityId::from_raw(u32::try_from(i).expect("small index"))]
        );
    }

    cluster.close();
    test_complete!("full_cluster_shutdown_reaches_every_locality");
}

#[test]
fn concurrent_shutdown_all_runs_exactly_once() {
    init_test("concurrent_shutdown_all_runs_exactly_once");

    let cluster = TestCluster::new(1);
    let mains = cluster.start_main_threads();

    let drivers: Vec<_> = (0..4)
        .map(|_| {
            let server = cluster.servers[0].clone();
            thread::spawn(move || server.shutdown_all(10.0))
        })
        .collect();

    for driver in drivers {
        driver
            .join()
            .expect("driver panicked")
            .expect("shutdown_all failed");
    }
    for main in mains {
        main.join().expect("main thread panicked");
    }

    // only the winner broadcast the hook phases
    let states = cluster.runtimes[0].states();
    let pre_shutdowns = states
        .iter()
        .filter(|s| **s == RuntimeState::PreShutdown)
        .count();
    assert_with_log!(pre_shutdowns == 1, "pre-shutdown broadcasts", 1, pre_shutdowns);

    cluster.close();
    test_complete!("concurrent_shutdown_all_runs_exactly_once");
}

#[test]
fn non_root_shutdown_all_is_rejected() {
    init_test("non_root_shutdown_all_is_rejected");

    let cluster = TestCluster::new(3);

    let err = cluster.servers[1]
        .shutdown_all(1.0)
        .expect_err("off-root must be rejected");
    assert_with_log!(
        err.kind() == ringdown::ErrorKind::InvalidStatus,
        "error kind",
        ringdown::ErrorKind::InvalidStatus,
        err.kind()
    );

    // global state is unchanged: nothing armed, nothing unregistered
    let (stop_called, _, _) = cluster.servers[1].stop_state();
    assert!(!stop_called);
    assert!(cluster.agas[1].unregistered().is_empty());

    // a subsequent call on the root succeeds
    let mains = cluster.start_main_threads();
    let driver = {
        let server = cluster.servers[0].clone();
        thread::spawn(move || server.shutdown_all(5.0))
    };
    driver
        .join()
        .expect("driver panicked")
        .expect("root shutdown_all failed");
    for main in mains {
        main.join().expect("main thread panicked");
    }

    cluster.close();
    test_complete!("non_root_shutdown_all_is_rejected");
}

#[test]
fn timeout_coercion_aborts_suspended_tasks() {
    init_test("timeout_coercion_aborts_suspended_tasks");

    let cluster = TestCluster::new(1);
    // ten indefinitely suspended tasks beyond the caller
    cluster.threads[0].set_live(11);
    cluster.threads[0].set_abort_releases(true);

    let mains = cluster.start_main_threads();
    let started = Instant::now();
    let driver = {
        let server = cluster.servers[0].clone();
        thread::spawn(move || server.stop(0.05, None, false))
    };

    driver.join().expect("stop panicked");
    for main in mains {
        main.join().expect("main thread panicked");
    }
    let elapsed = started.elapsed();

    assert_with_log!(
        cluster.threads[0].abort_calls() >= 1,
        "abort passes",
        ">= 1",
        cluster.threads[0].abort_calls()
    );
    let (_, stop_done, _) = cluster.servers[0].stop_state();
    assert!(stop_done);
    // generous bound: the budget is 50ms, coercion runs within a few of them
    assert_with_log!(
        elapsed < Duration::from_secs(2),
        "coercion latency",
        "< 2s",
        elapsed
    );

    cluster.close();
    test_complete!("timeout_coercion_aborts_suspended_tasks");
}

#[test]
fn stop_is_idempotent_across_threads() {
    init_test("stop_is_idempotent_across_threads");

    let cluster = TestCluster::new(1);
    let mains = cluster.start_main_threads();

    let drivers: Vec<_> = (0..2)
        .map(|_| {
            let server = cluster.servers[0].clone();
            thread::spawn(move || server.stop(1.0, None, false))
        })
        .collect();
    for driver in drivers {
        driver.join().expect("stop panicked");
    }
    for main in mains {
        main.join().expect("main thread panicked");
    }

    // the teardown ran once: two unbinds, one unregistration
    assert_eq!(cluster.agas[0].unbound().len(), 2);
    assert_eq!(cluster.agas[0].unregistered().len(), 1);

    cluster.close();
    test_complete!("stop_is_idempotent_across_threads");
}

#[test]
fn terminate_all_aborts_peers_then_self() {
    init_test("terminate_all_aborts_peers_then_self");

    let cluster = TestCluster::new(2);

    let driver = {
        let server = cluster.servers[0].clone();
        thread::spawn(move || server.terminate_all())
    };
    driver.join().expect("terminate_all panicked");

    // both localities aborted, logs were flushed first
    assert_eq!(cluster.terminators[0].terminations(), 1);
    assert_eq!(cluster.terminators[1].terminations(), 1);
    assert!(cluster.runtimes[0].log_flushes() >= 1);
    assert!(cluster.runtimes[1].log_flushes() >= 1);

    cluster.close();
    test_complete!("terminate_all_aborts_peers_then_self");
}

#[test]
fn notify_waiting_main_short_circuits() {
    init_test("notify_waiting_main_short_circuits");

    let cluster = TestCluster::new(1);
    let mains = cluster.start_main_threads();

    let notifier = {
        let server = cluster.servers[0].clone();
        thread::spawn(move || server.notify_waiting_main())
    };

    for main in mains {
        main.join().expect("main thread panicked");
    }
    notifier.join().expect("notifier panicked");

    let (stop_called, stop_done, terminated) = cluster.servers[0].stop_state();
    assert!(stop_called && stop_done && terminated);
    // the short circuit never touched the resolver
    assert!(cluster.agas[0].unregistered().is_empty());

    cluster.close();
    test_complete!("notify_waiting_main_short_circuits");
}
