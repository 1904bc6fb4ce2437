// Read reconstruction integration tests.
//
// Point reads route to the natural partition with central as fallback; scans
// prefer central and fall back to a partition union de-duplicated by primary
// key. With nothing live, reads fail as unavailable.

use std::sync::Arc;

use shard_coordinator::config::CoordinatorConfig;
use shard_coordinator::shard::MemoryCluster;
use shard_coordinator::types::{row, Value};
use shard_coordinator::{CoordError, Coordinator};

fn coordinator(cluster: &Arc<MemoryCluster>) -> Coordinator {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Coordinator::new(CoordinatorConfig::default(), cluster.clone())
}

fn seed_shard(cluster: &Arc<MemoryCluster>, shard: u32, rows: &[(i64, f64)]) {
    for (trans_id, amount) in rows {
        cluster.shard(shard).unwrap().seed_trans(row(vec![
            ("trans_id", Value::Int(*trans_id)),
            ("account_id", Value::Int(*trans_id)),
            ("amount", Value::Float(*amount)),
        ]));
    }
}

const SCAN: &str = "SELECT * FROM trans LIMIT 50";

#[tokio::test]
async fn test_scan_prefers_central() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    seed_shard(&cluster, 1, &[(1, 10.0), (2, 20.0), (3, 30.0)]);
    seed_shard(&cluster, 2, &[(2, 20.0)]);
    seed_shard(&cluster, 3, &[(1, 10.0), (3, 30.0)]);

    let result = c.reader.fetch(SCAN, None, 50).await.unwrap();
    assert_eq!(result.shards_consulted, vec![1]);
    assert_eq!(result.rows.len(), 3);
    assert!(!result.partial);
}

// S6: central down, the scan is the partition union, de-duplicated by
// trans_id, sorted, and truncated to the limit.
#[tokio::test]
async fn test_scan_reconstructs_from_partitions() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    seed_shard(&cluster, 1, &[(1, 10.0), (2, 20.0), (3, 30.0), (4, 40.0)]);
    seed_shard(&cluster, 2, &[(2, 20.0), (4, 40.0)]);
    seed_shard(&cluster, 3, &[(1, 10.0), (3, 30.0)]);
    // an over-replicated row present on both partitions; the first consulted
    // shard's copy wins
    seed_shard(&cluster, 2, &[(5, 111.0)]);
    seed_shard(&cluster, 3, &[(5, 999.0)]);
    cluster.set_down(1, true);

    let result = c.reader.fetch(SCAN, None, 50).await.unwrap();
    assert_eq!(result.shards_consulted, vec![2, 3]);
    assert!(!result.partial);

    let ids: Vec<i64> = result
        .rows
        .iter()
        .map(|r| r.get("trans_id").unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5], "sorted by primary key");

    let dup = result
        .rows
        .iter()
        .find(|r| r.get("trans_id") == Some(&Value::Int(5)))
        .unwrap();
    assert_eq!(dup.get("amount"), Some(&Value::Float(111.0)));
}

#[tokio::test]
async fn test_scan_truncates_to_limit() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    seed_shard(&cluster, 2, &[(2, 1.0), (4, 1.0), (6, 1.0)]);
    seed_shard(&cluster, 3, &[(1, 1.0), (3, 1.0), (5, 1.0)]);
    cluster.set_down(1, true);

    let result = c
        .reader
        .fetch("SELECT * FROM trans", None, 4)
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 4);
    let ids: Vec<i64> = result
        .rows
        .iter()
        .map(|r| r.get("trans_id").unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

// Central down plus one partition down: the live partition's rows come back,
// flagged as a partial view.
#[tokio::test]
async fn test_scan_partial_view_with_one_partition() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    seed_shard(&cluster, 2, &[(2, 20.0), (4, 40.0)]);
    seed_shard(&cluster, 3, &[(1, 10.0), (3, 30.0)]);
    cluster.set_down(1, true);
    cluster.set_down(3, true);

    let result = c.reader.fetch(SCAN, None, 50).await.unwrap();
    assert_eq!(result.shards_consulted, vec![2]);
    assert!(result.partial);
    let ids: Vec<i64> = result
        .rows
        .iter()
        .map(|r| r.get("trans_id").unwrap().as_int().unwrap())
        .collect();
    assert_eq!(ids, vec![2, 4]);
}

#[tokio::test]
async fn test_scan_unavailable_when_everything_down() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    for shard in [1, 2, 3] {
        cluster.set_down(shard, true);
    }

    let err = c.reader.fetch(SCAN, None, 50).await.err().unwrap();
    assert!(matches!(err, CoordError::Unavailable));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn test_point_read_routes_to_natural_partition() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    seed_shard(&cluster, 1, &[(7, 70.0)]);
    seed_shard(&cluster, 3, &[(7, 70.0)]);

    let result = c
        .reader
        .fetch("SELECT * FROM trans WHERE trans_id = 7", Some(7), 10)
        .await
        .unwrap();
    assert_eq!(result.shards_consulted, vec![3]);
    assert_eq!(result.rows.len(), 1);
}

#[tokio::test]
async fn test_point_read_falls_back_to_central() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    seed_shard(&cluster, 1, &[(7, 70.0)]);
    seed_shard(&cluster, 3, &[(7, 70.0)]);
    cluster.set_down(3, true);

    let result = c
        .reader
        .fetch("SELECT * FROM trans WHERE trans_id = 7", Some(7), 10)
        .await
        .unwrap();
    assert_eq!(result.shards_consulted, vec![1]);
    assert_eq!(result.rows[0].get("amount"), Some(&Value::Float(70.0)));
}

#[tokio::test]
async fn test_point_read_unavailable() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    cluster.set_down(1, true);
    cluster.set_down(3, true);

    let err = c
        .reader
        .fetch("SELECT * FROM trans WHERE trans_id = 7", Some(7), 10)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, CoordError::Unavailable));
}

// A read issued right after a write observes it (the reader probes afresh
// instead of trusting a cached liveness view).
#[tokio::test]
async fn test_read_after_own_write() {
    let cluster = Arc::new(MemoryCluster::three_shards());
    let c = coordinator(&cluster);
    seed_shard(&cluster, 1, &[(1, 10.0)]);

    use shard_coordinator::pipeline::WriteRequest;
    let tx = c
        .writer
        .begin(WriteRequest::insert(
            "INSERT INTO trans (trans_id, account_id, amount) VALUES ({trans_id}, 4, 25.5)",
            4,
        ))
        .await
        .unwrap();
    c.writer.commit(tx).await.unwrap();

    let result = c.reader.fetch(SCAN, None, 50).await.unwrap();
    assert_eq!(result.rows.len(), 2);
    assert!(result
        .rows
        .iter()
        .any(|r| r.get("amount") == Some(&Value::Float(25.5))));
}
