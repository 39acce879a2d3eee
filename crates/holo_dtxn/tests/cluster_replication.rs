//! End-to-end replication tests over an in-process cluster.
//!
//! Test flow:
//! 1) Start sites (partitions x replicas) and initiators as tokio tasks.
//! 2) Submit single- and multi-partition procedures through initiators.
//! 3) Inspect client responses and each site's engine log.
//!
//! Failure model covered:
//! - Replica crash between transactions (k = 1).
//! - Multipartition coordinator crash while its transaction is in flight.
//! - Replica answering while recovering.
//! - Replicas disagreeing on a read result.
//!
//! Verification:
//! - Every live replica of a partition commits the same ids in the same order.
//! - A determinism violation stops the initiator with a fatal error.
//! - Losing any one replica with k = 1 still answers every client.

mod common;

use common::{decode, encode, ClusterOptions, TestCluster, CALL_TIMEOUT};
use holo_dtxn::dtxn::{ClientResponse, FatalError, Invocation, ResponseStatus, TxnTarget};

fn value(response: &ClientResponse) -> i64 {
    assert!(
        response.is_success(),
        "unexpected failure: {:?} {}",
        response.status,
        response.status_message
    );
    decode(response.results.first().expect("result table"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_partition_writes_commit_on_every_replica() {
    let cluster = TestCluster::start(ClusterOptions::new(2, 2));
    let p0 = TxnTarget::SinglePartition(0);

    for amount in [5, 7, 11] {
        cluster.call(0, "deposit", encode(amount), false, p0).await;
    }

    // Writes are only answered once every replica has run them.
    let first = cluster.log(1);
    let second = cluster.log(2);
    assert_eq!(first.committed.len(), 3);
    assert_eq!(first.committed, second.committed);
    assert_eq!(first.balance, 23);
    assert_eq!(second.balance, 23);
    assert!(cluster.log(3).committed.is_empty());
    assert!(cluster.log(4).committed.is_empty());

    let balance = cluster.call(0, "balance", Vec::new(), true, p0).await;
    assert_eq!(value(&balance), 23);

    for (site_id, result) in cluster.shutdown().await {
        assert!(result.is_ok(), "site {site_id} stopped with {result:?}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aborted_procedure_rolls_back_on_every_replica() {
    let cluster = TestCluster::start(ClusterOptions::new(1, 2));
    let p0 = TxnTarget::SinglePartition(0);

    cluster.call(0, "deposit", encode(10), false, p0).await;
    let overdraft = cluster.call(0, "withdraw", encode(25), false, p0).await;
    assert_eq!(overdraft.status, ResponseStatus::UserAbort);
    let withdrawn = cluster.call(0, "withdraw", encode(4), false, p0).await;
    assert_eq!(value(&withdrawn), 6);

    for site_id in [1, 2] {
        let log = cluster.log(site_id);
        assert_eq!(log.balance, 6);
        assert_eq!(log.rolled_back.len(), 1);
        assert_eq!(log.committed.len(), 2);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multipartition_read_sees_every_partition() {
    let cluster = TestCluster::start(ClusterOptions::new(3, 1));
    for (partition, amount) in [(0, 1), (1, 2), (2, 3)] {
        cluster
            .call(
                0,
                "deposit",
                encode(amount),
                false,
                TxnTarget::SinglePartition(partition),
            )
            .await;
    }

    let total = cluster
        .call(0, "total", Vec::new(), true, TxnTarget::MultiPartition)
        .await;
    assert_eq!(value(&total), 6);

    // Read-only work still ends on every site.
    for site_id in [1, 2, 3] {
        assert_eq!(cluster.log(site_id).committed.len(), 2);
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multipartition_write_commits_on_every_site() {
    let cluster = TestCluster::start(ClusterOptions::new(2, 2));

    let response = cluster
        .call(0, "deposit_all", encode(7), false, TxnTarget::MultiPartition)
        .await;
    // One result per partition; replicas of a partition collapse into one.
    assert_eq!(value(&response), 14);

    let reference = cluster.log(1).committed;
    assert_eq!(reference.len(), 1);
    for site_id in 1..=4 {
        let log = cluster.log(site_id);
        assert_eq!(log.balance, 7, "site {site_id}");
        assert_eq!(log.committed, reference, "site {site_id}");
    }

    let second = cluster
        .call(0, "deposit_all", encode(1), false, TxnTarget::MultiPartition)
        .await;
    assert_eq!(value(&second), 16);
    cluster.shutdown().await;
}

async fn concurrent_initiators_agree(use_safety_dance: bool) {
    let mut options = ClusterOptions::new(1, 2);
    options.initiators = 3;
    options.use_safety_dance = use_safety_dance;
    let cluster = TestCluster::start(options);

    let mut pending = Vec::new();
    for round in 0..10 {
        for (index, initiator) in cluster.initiators.iter().enumerate() {
            let amount = (round * 3 + index) as i64;
            let (txn_id, rx) = initiator
                .submit(
                    Invocation::new("deposit", encode(amount)),
                    false,
                    TxnTarget::SinglePartition(0),
                )
                .expect("submit");
            pending.push((txn_id, rx));
        }
    }
    for (txn_id, rx) in pending {
        let response = tokio::time::timeout(CALL_TIMEOUT, rx)
            .await
            .expect("call timed out")
            .expect("initiator dropped the call");
        assert!(response.is_success(), "txn {txn_id} failed");
    }

    let first = cluster.log(1);
    let second = cluster.log(2);
    assert_eq!(first.committed.len(), 30);
    assert_eq!(first.committed, second.committed);
    assert!(first.committed.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(first.balance, (0..30).sum::<i64>());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_initiators_commit_in_one_global_order() {
    concurrent_initiators_agree(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn safety_dance_still_commits_in_one_global_order() {
    concurrent_initiators_agree(true).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn divergent_read_results_halt_the_initiator() {
    let mut cluster = TestCluster::start(ClusterOptions::new(1, 2));

    // Read-only work is released on the first answer; the second answer
    // disagrees and must not be retried or ignored.
    let response = cluster
        .call(0, "whoami", Vec::new(), true, TxnTarget::SinglePartition(0))
        .await;
    assert!(response.is_success());

    let err = cluster
        .join_initiator(1)
        .await
        .expect_err("initiator should halt");
    assert!(err.is_fatal());
    assert!(matches!(
        err.as_fatal(),
        Some(FatalError::ReplicaMismatch { .. })
    ));
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn surviving_replica_keeps_answering() {
    let mut cluster = TestCluster::start(ClusterOptions::new(1, 2));
    let p0 = TxnTarget::SinglePartition(0);

    cluster.call(0, "deposit", encode(5), false, p0).await;
    cluster.fail_site(2).await;
    let response = cluster.call(0, "deposit", encode(5), false, p0).await;
    assert_eq!(value(&response), 10);
    assert_eq!(cluster.initiators[0].in_flight().expect("in flight"), 0);

    assert_eq!(cluster.log(1).committed.len(), 2);
    assert_eq!(cluster.log(2).committed.len(), 1);
    let results = cluster.shutdown().await;
    assert!(results.values().all(Result::is_ok));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovering_replica_answers_with_placeholder() {
    let mut options = ClusterOptions::new(1, 2);
    options.recovering_sites = vec![2];
    let cluster = TestCluster::start(options);

    let response = cluster
        .call(0, "deposit", encode(9), false, TxnTarget::SinglePartition(0))
        .await;
    assert_eq!(value(&response), 9);
    assert_eq!(cluster.log(1).committed.len(), 1);
    assert!(cluster.log(2).committed.is_empty());
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn coordinator_crash_mid_transaction_still_answers() {
    let mut cluster = TestCluster::start(ClusterOptions::new(2, 2));
    cluster
        .call(0, "deposit_all", encode(1), false, TxnTarget::MultiPartition)
        .await;

    // Partition 1 coordinates next; its first replica dies with the
    // transaction in flight.
    let (_, rx) = cluster.initiators[0]
        .submit(
            Invocation::new("deposit_all", encode(5)),
            false,
            TxnTarget::MultiPartition,
        )
        .expect("submit");
    cluster.fail_site(3).await;

    let response = tokio::time::timeout(CALL_TIMEOUT, rx)
        .await
        .expect("call timed out")
        .expect("initiator dropped the call");
    // Committed or rolled back, but answered either way.
    let committed = response.is_success();
    assert!(
        committed || response.status == ResponseStatus::GracefulFailure,
        "unexpected outcome: {:?} {}",
        response.status,
        response.status_message
    );
    assert_eq!(cluster.initiators[0].in_flight().expect("in flight"), 0);

    // Survivors agree with each other and with the answer.
    let expected = if committed { 6 } else { 1 };
    for site_id in [1, 2, 4] {
        assert_eq!(cluster.log(site_id).balance, expected, "site {site_id}");
    }
    assert_eq!(cluster.log(1).committed, cluster.log(2).committed);

    // The initiator keeps going.
    let total = cluster
        .call(0, "total", Vec::new(), true, TxnTarget::MultiPartition)
        .await;
    assert_eq!(value(&total), expected * 2);
    let results = cluster.shutdown().await;
    assert!(results.values().all(Result::is_ok));
}
